use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::impls::jvm_rule::JvmRuleSpec;
use crate::impls::proxy_fault::ProxyFaultSpec;
use crate::impls::runtime_mutator::RuntimeMutatorSpec;
use crate::selector::TargetSelector;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

/// A declared chaos experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosResource {
    pub metadata: ObjectMeta,
    pub spec: ChaosSpec,
    #[serde(default)]
    pub status: ChaosStatus,
}

impl ChaosResource {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn kind(&self) -> FaultKind {
        self.spec.fault.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosSpec {
    #[serde(default)]
    pub selector: TargetSelector,
    /// How long the fault stays injected, e.g. `"30s"` or `"2h45m"`. Absent
    /// means until the resource is deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    pub fault: FaultSpec,
}

/// Fault-kind specific configuration, tagged by `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "config", rename_all = "kebab-case")]
pub enum FaultSpec {
    RuntimeMutator(RuntimeMutatorSpec),
    JvmRule(JvmRuleSpec),
    ProxyFault(ProxyFaultSpec),
    FuseDevice,
}

impl FaultSpec {
    pub fn kind(&self) -> FaultKind {
        match self {
            FaultSpec::RuntimeMutator(_) => FaultKind::RuntimeMutator,
            FaultSpec::JvmRule(_) => FaultKind::JvmRule,
            FaultSpec::ProxyFault(_) => FaultKind::ProxyFault,
            FaultSpec::FuseDevice => FaultKind::FuseDevice,
        }
    }
}

/// Closed set of fault kinds the dispatcher must cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    RuntimeMutator,
    JvmRule,
    ProxyFault,
    FuseDevice,
}

impl FaultKind {
    pub const ALL: [FaultKind; 4] = [
        FaultKind::RuntimeMutator,
        FaultKind::JvmRule,
        FaultKind::ProxyFault,
        FaultKind::FuseDevice,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::RuntimeMutator => "runtime-mutator",
            FaultKind::JvmRule => "jvm-rule",
            FaultKind::ProxyFault => "proxy-fault",
            FaultKind::FuseDevice => "fuse-device",
        }
    }

    /// Singleton kinds act on one resource-level object instead of per target.
    pub fn is_singleton(self) -> bool {
        matches!(self, FaultKind::ProxyFault)
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    NotInjected,
    Injected,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::NotInjected => "NotInjected",
            Phase::Injected => "Injected",
        })
    }
}

/// Injection state of one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// `namespace/pod`, `namespace/pod/container`, or a singleton scope id.
    pub id: String,
    pub phase: Phase,
    /// Failed apply attempts since the last success.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            phase: Phase::NotInjected,
            attempts: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    Selected,
    AllInjected,
    AllRecovered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosStatus {
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Target count drawn for `random-max-percent`, reused on later passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_count: Option<usize>,
}

impl ChaosStatus {
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn set_condition(&mut self, type_: ConditionType, status: bool, message: Option<String>) {
        let condition = Condition {
            type_,
            status,
            message,
        };
        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_with_runtime_mutator_parses() {
        let yaml = r#"
metadata:
  name: cart-negate
  namespace: shop
spec:
  selector:
    labelSelectors:
      app: cart
    mode: fixed
    value: "2"
  duration: 30s
  fault:
    action: runtime-mutator
    config:
      action: operator
      class: com.example.Cart
      method: total
      strategy: negate
"#;
        let res: ChaosResource = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(res.key().to_string(), "shop/cart-negate");
        assert_eq!(res.kind(), FaultKind::RuntimeMutator);
        assert_eq!(res.spec.duration.as_deref(), Some("30s"));
        assert!(res.status.records.is_empty());
    }

    #[test]
    fn fuse_device_needs_no_config() {
        let yaml = r#"
metadata:
  name: fuse
spec:
  fault:
    action: fuse-device
"#;
        let res: ChaosResource = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(res.kind(), FaultKind::FuseDevice);
        assert_eq!(res.metadata.namespace, "default");
    }

    #[test]
    fn unknown_action_is_rejected_at_parse_time() {
        let yaml = r#"
metadata:
  name: x
spec:
  fault:
    action: kernel-panic
"#;
        assert!(serde_yaml::from_str::<ChaosResource>(yaml).is_err());
    }

    #[test]
    fn set_condition_replaces_in_place() {
        let mut status = ChaosStatus::default();
        status.set_condition(ConditionType::Failed, true, Some("boom".into()));
        status.set_condition(ConditionType::Failed, false, None);
        assert_eq!(status.conditions.len(), 1);
        assert!(!status.condition(ConditionType::Failed).unwrap().status);
    }
}
