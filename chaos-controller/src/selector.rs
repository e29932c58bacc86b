//! Target selection: filters over the pod inventory plus a sampling mode.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::cluster::Pod;
use crate::error::SelectorError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSelector {
    /// Empty means the resource's own namespace.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub label_selectors: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotation_selectors: BTreeMap<String, String>,
    /// Empty means `Running` only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_phase_selectors: Vec<String>,
    /// Empty means every container of a matched pod.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub container_names: Vec<String>,
    #[serde(default)]
    pub mode: SelectorMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectorMode {
    #[default]
    One,
    All,
    Fixed,
    FixedPercent,
    RandomMaxPercent,
}

impl SelectorMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SelectorMode::One => "one",
            SelectorMode::All => "all",
            SelectorMode::Fixed => "fixed",
            SelectorMode::FixedPercent => "fixed-percent",
            SelectorMode::RandomMaxPercent => "random-max-percent",
        }
    }
}

impl fmt::Display for SelectorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether targets are pods or the containers inside them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetLevel {
    Pod,
    Container,
}

/// Parsed form of `mode` + `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quota {
    One,
    All,
    Fixed(usize),
    FixedPercent(u8),
    RandomMaxPercent(u8),
}

/// Result of one selection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub targets: Vec<String>,
    /// Count to persist for `random-max-percent`.
    pub random_count: Option<usize>,
}

impl TargetSelector {
    pub fn namespaces_or(&self, default_namespace: &str) -> Vec<String> {
        if self.namespaces.is_empty() {
            vec![default_namespace.to_string()]
        } else {
            let mut namespaces = self.namespaces.clone();
            namespaces.sort();
            namespaces.dedup();
            namespaces
        }
    }

    /// Reject a mode/value pair that can never select anything.
    pub fn validate(&self) -> Result<(), SelectorError> {
        self.quota().map(|_| ())
    }

    fn quota(&self) -> Result<Quota, SelectorError> {
        let mode = self.mode;
        let raw = || {
            self.value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or(SelectorError::MissingValue(mode.as_str()))
        };
        let invalid = |value: &str, reason: String| SelectorError::InvalidValue {
            mode: mode.as_str(),
            value: value.to_string(),
            reason,
        };
        let percent = |value: &str| -> Result<u8, SelectorError> {
            let p: u8 = value.parse().map_err(|e| invalid(value, format!("{e}")))?;
            if p > 100 {
                return Err(invalid(value, "must be within 0..=100".into()));
            }
            Ok(p)
        };
        match mode {
            SelectorMode::One => Ok(Quota::One),
            SelectorMode::All => Ok(Quota::All),
            SelectorMode::Fixed => {
                let value = raw()?;
                let n = value
                    .parse::<usize>()
                    .map_err(|e| invalid(value, format!("{e}")))?;
                Ok(Quota::Fixed(n))
            }
            SelectorMode::FixedPercent => Ok(Quota::FixedPercent(percent(raw()?)?)),
            SelectorMode::RandomMaxPercent => Ok(Quota::RandomMaxPercent(percent(raw()?)?)),
        }
    }

    fn pod_matches(&self, pod: &Pod) -> bool {
        let phase_ok = if self.pod_phase_selectors.is_empty() {
            pod.phase == "Running"
        } else {
            self.pod_phase_selectors.iter().any(|p| *p == pod.phase)
        };
        phase_ok
            && subset(&self.label_selectors, &pod.labels)
            && subset(&self.annotation_selectors, &pod.annotations)
    }
}

fn subset(wanted: &BTreeMap<String, String>, have: &BTreeMap<String, String>) -> bool {
    wanted.iter().all(|(k, v)| have.get(k) == Some(v))
}

/// Ids of every target the filters match, sorted. Pods must already be
/// restricted to the selector's namespaces.
pub fn matching_targets(selector: &TargetSelector, pods: &[Pod], level: TargetLevel) -> Vec<String> {
    let mut ids = Vec::new();
    for pod in pods.iter().filter(|p| selector.pod_matches(p)) {
        match level {
            TargetLevel::Pod => ids.push(format!("{}/{}", pod.namespace, pod.name)),
            TargetLevel::Container => {
                for container in &pod.containers {
                    let wanted = selector.container_names.is_empty()
                        || selector.container_names.contains(&container.name);
                    if wanted && !container.container_id.is_empty() {
                        ids.push(format!("{}/{}/{}", pod.namespace, pod.name, container.name));
                    }
                }
            }
        }
    }
    ids.sort();
    ids.dedup();
    ids
}

/// Pick targets from `matches` with no prior state.
pub fn select<R: Rng + ?Sized>(
    selector: &TargetSelector,
    matches: &[String],
    rng: &mut R,
) -> Result<Selection, SelectorError> {
    select_sticky(selector, matches, &[], None, rng)
}

/// Pick targets, keeping `existing` ids that still match before sampling the
/// shortfall from the rest.
pub fn select_sticky<R: Rng + ?Sized>(
    selector: &TargetSelector,
    matches: &[String],
    existing: &[String],
    persisted_count: Option<usize>,
    rng: &mut R,
) -> Result<Selection, SelectorError> {
    let n = matches.len();
    let mut random_count = None;
    let wanted = match selector.quota()? {
        Quota::One => n.min(1),
        Quota::All | Quota::RandomMaxPercent(100) => n,
        Quota::Fixed(k) => {
            if k > n {
                return Err(SelectorError::NotEnoughTargets {
                    wanted: k,
                    available: n,
                });
            }
            k
        }
        Quota::FixedPercent(p) => (usize::from(p) * n + 50) / 100,
        Quota::RandomMaxPercent(p) => {
            let max = usize::from(p) * n / 100;
            let drawn = persisted_count.unwrap_or_else(|| rng.gen_range(0..=max));
            random_count = Some(drawn);
            drawn.min(max)
        }
    };

    let matched: HashSet<&str> = matches.iter().map(String::as_str).collect();
    let mut targets: Vec<String> = existing
        .iter()
        .filter(|id| matched.contains(id.as_str()))
        .take(wanted)
        .cloned()
        .collect();

    let shortfall = wanted - targets.len();
    if shortfall > 0 {
        let kept: HashSet<&str> = targets.iter().map(String::as_str).collect();
        let candidates: Vec<&String> = matches
            .iter()
            .filter(|id| !kept.contains(id.as_str()))
            .collect();
        let mut picked: Vec<String> = candidates
            .choose_multiple(rng, shortfall)
            .map(|id| (*id).clone())
            .collect();
        picked.sort();
        targets.extend(picked);
    }

    Ok(Selection {
        targets,
        random_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ContainerStatus;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pod(ns: &str, name: &str, app: &str) -> Pod {
        Pod {
            namespace: ns.into(),
            name: name.into(),
            labels: BTreeMap::from([("app".to_string(), app.to_string())]),
            annotations: BTreeMap::new(),
            phase: "Running".into(),
            node_name: "node-1".into(),
            containers: vec![
                ContainerStatus {
                    name: "main".into(),
                    container_id: format!("containerd://{name}-main"),
                },
                ContainerStatus {
                    name: "sidecar".into(),
                    container_id: format!("containerd://{name}-sidecar"),
                },
            ],
        }
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("ns/p{i}")).collect()
    }

    fn selector(mode: SelectorMode, value: Option<&str>) -> TargetSelector {
        TargetSelector {
            mode,
            value: value.map(String::from),
            ..Default::default()
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn filters_by_label_phase_and_container() {
        let mut pending = pod("ns", "c", "cart");
        pending.phase = "Pending".into();
        let pods = vec![pod("ns", "a", "cart"), pod("ns", "b", "web"), pending];

        let mut sel = TargetSelector::default();
        sel.label_selectors.insert("app".into(), "cart".into());
        assert_eq!(matching_targets(&sel, &pods, TargetLevel::Pod), vec!["ns/a"]);

        sel.pod_phase_selectors = vec!["Pending".into(), "Running".into()];
        assert_eq!(
            matching_targets(&sel, &pods, TargetLevel::Pod),
            vec!["ns/a", "ns/c"]
        );

        sel.container_names = vec!["sidecar".into()];
        assert_eq!(
            matching_targets(&sel, &pods, TargetLevel::Container),
            vec!["ns/a/sidecar", "ns/c/sidecar"]
        );
    }

    #[test]
    fn containers_without_id_are_skipped() {
        let mut p = pod("ns", "a", "cart");
        p.containers[1].container_id.clear();
        let sel = TargetSelector::default();
        assert_eq!(
            matching_targets(&sel, &[p], TargetLevel::Container),
            vec!["ns/a/main"]
        );
    }

    #[test]
    fn all_selects_every_match() {
        let s = select(&selector(SelectorMode::All, None), &ids(5), &mut rng()).unwrap();
        assert_eq!(s.targets, ids(5));
    }

    #[test]
    fn fixed_selects_exact_count_or_fails() {
        let matches = ids(5);
        let s = select(&selector(SelectorMode::Fixed, Some("2")), &matches, &mut rng()).unwrap();
        assert_eq!(s.targets.len(), 2);
        assert!(s.targets.iter().all(|t| matches.contains(t)));
        assert_ne!(s.targets[0], s.targets[1]);

        let err = select(&selector(SelectorMode::Fixed, Some("6")), &matches, &mut rng()).unwrap_err();
        assert!(matches!(
            err,
            SelectorError::NotEnoughTargets {
                wanted: 6,
                available: 5
            }
        ));
    }

    #[test]
    fn hundred_percent_is_all() {
        for mode in [SelectorMode::FixedPercent, SelectorMode::RandomMaxPercent] {
            let s = select(&selector(mode, Some("100")), &ids(7), &mut rng()).unwrap();
            assert_eq!(s.targets, ids(7), "{mode}");
        }
    }

    #[test]
    fn fixed_percent_rounds() {
        let s = select(&selector(SelectorMode::FixedPercent, Some("50")), &ids(5), &mut rng()).unwrap();
        assert_eq!(s.targets.len(), 3);
        let s = select(&selector(SelectorMode::FixedPercent, Some("10")), &ids(4), &mut rng()).unwrap();
        assert_eq!(s.targets.len(), 0);
    }

    #[test]
    fn random_max_percent_persists_and_clamps() {
        let sel = selector(SelectorMode::RandomMaxPercent, Some("50"));
        let first = select(&sel, &ids(10), &mut rng()).unwrap();
        let drawn = first.random_count.unwrap();
        assert!(drawn <= 5);
        assert_eq!(first.targets.len(), drawn);

        let again = select_sticky(&sel, &ids(10), &first.targets, Some(4), &mut rng()).unwrap();
        assert_eq!(again.targets.len(), 4);
        assert_eq!(again.random_count, Some(4));

        let shrunk = select_sticky(&sel, &ids(2), &[], Some(4), &mut rng()).unwrap();
        assert_eq!(shrunk.targets.len(), 1);
    }

    #[test]
    fn selection_is_deterministic_for_a_seed() {
        let sel = selector(SelectorMode::Fixed, Some("3"));
        let a = select(&sel, &ids(20), &mut StdRng::seed_from_u64(42)).unwrap();
        let b = select(&sel, &ids(20), &mut StdRng::seed_from_u64(42)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sticky_keeps_existing_and_fills_shortfall() {
        let sel = selector(SelectorMode::Fixed, Some("2"));
        let existing = vec!["ns/p3".to_string(), "ns/gone".to_string()];
        let s = select_sticky(&sel, &ids(5), &existing, None, &mut rng()).unwrap();
        assert_eq!(s.targets.len(), 2);
        assert_eq!(s.targets[0], "ns/p3");
        assert_ne!(s.targets[1], "ns/p3");
    }

    #[test]
    fn one_keeps_its_target_while_matched() {
        let sel = selector(SelectorMode::One, None);
        let existing = vec!["ns/p1".to_string()];
        for seed in 0..10 {
            let s = select_sticky(&sel, &ids(5), &existing, None, &mut StdRng::seed_from_u64(seed)).unwrap();
            assert_eq!(s.targets, existing);
        }
        let none = select(&sel, &[], &mut rng()).unwrap();
        assert!(none.targets.is_empty());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            selector(SelectorMode::Fixed, None).validate(),
            Err(SelectorError::MissingValue("fixed"))
        ));
        assert!(matches!(
            selector(SelectorMode::Fixed, Some("-1")).validate(),
            Err(SelectorError::InvalidValue { .. })
        ));
        assert!(matches!(
            selector(SelectorMode::FixedPercent, Some("101")).validate(),
            Err(SelectorError::InvalidValue { .. })
        ));
        assert!(selector(SelectorMode::All, None).validate().is_ok());
    }

    #[test]
    fn namespaces_default_to_resource_namespace() {
        let sel = TargetSelector::default();
        assert_eq!(sel.namespaces_or("shop"), vec!["shop"]);
        let sel = TargetSelector {
            namespaces: vec!["b".into(), "a".into(), "b".into()],
            ..Default::default()
        };
        assert_eq!(sel.namespaces_or("shop"), vec!["a", "b"]);
    }
}
