//! Delay and abort faults injected by the service mesh proxy.
//!
//! The fault is expressed as one `CiliumEnvoyConfig` per resource, named
//! `chaos-<resource>`, holding a listener whose HTTP connection manager runs
//! the Envoy fault filter in front of the router.

use async_trait::async_trait;
use chaos_common::Logger;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::wrong_kind;
use crate::cluster::{DynamicMeta, DynamicObject, ObjectApi};
use crate::dispatch::ResourceImpl;
use crate::error::{ClusterError, ImplError, PhaseError};
use crate::resource::{ChaosResource, FaultKind, FaultSpec, Phase};
use crate::timer::parse_duration;

pub const API_VERSION: &str = "cilium.io/v2";
pub const KIND: &str = "CiliumEnvoyConfig";
pub const INJECTED_LABEL: &str = "chaos-mesh.org/injected";
pub const CHAOS_LABEL: &str = "chaos-mesh.org/chaos";

const LISTENER_TYPE: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
const HCM_FILTER: &str = "envoy.filters.network.http_connection_manager";
const HCM_TYPE: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const FAULT_FILTER: &str = "envoy.filters.http.fault";
const FAULT_TYPE: &str = "type.googleapis.com/envoy.extensions.filters.http.fault.v3.HTTPFault";
const ROUTER_FILTER: &str = "envoy.filters.http.router";
const REGEX_PREFIX: &str = "regex:";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyAction {
    #[default]
    Fault,
    Delay,
    Abort,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    #[default]
    Grpc,
    Http,
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProxyProtocol::Grpc => "grpc",
            ProxyProtocol::Http => "http",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelaySpec {
    /// Go-style duration such as `"300ms"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_delay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_status: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyFaultSpec {
    #[serde(default)]
    pub action: ProxyAction,
    #[serde(default)]
    pub protocol: ProxyProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DelaySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<AbortSpec>,
    /// Fallback for delay and abort when they carry no percentage of their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<i32>,
    /// Header name to value; values prefixed with `regex:` match as a regex.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub target_service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envoy_config_namespace: Option<String>,
}

fn check_percentage(problems: &mut Vec<String>, field: &str, value: Option<i32>) {
    if let Some(p) = value {
        if !(0..=100).contains(&p) {
            problems.push(format!("{field} must be between 0 and 100, got {p}"));
        }
    }
}

impl ProxyFaultSpec {
    pub fn validate(&self) -> Result<(), ImplError> {
        let mut problems = Vec::new();
        if self.target_service.trim().is_empty() {
            problems.push("targetService is required".to_string());
        }
        match self.action {
            ProxyAction::Delay if self.delay.is_none() => {
                problems.push("delay is required when action is delay".into())
            }
            ProxyAction::Abort if self.abort.is_none() => {
                problems.push("abort is required when action is abort".into())
            }
            ProxyAction::Fault if self.delay.is_none() && self.abort.is_none() => {
                problems.push("at least one of delay or abort is required when action is fault".into())
            }
            _ => {}
        }
        check_percentage(&mut problems, "percentage", self.percentage);

        if let Some(delay) = &self.delay {
            match delay.fixed_delay.as_deref() {
                None => problems.push("delay.fixedDelay is required".into()),
                Some(raw) => {
                    if let Err(e) = parse_duration(raw) {
                        problems.push(format!("delay.fixedDelay: {e}"));
                    }
                }
            }
            check_percentage(&mut problems, "delay.percentage", delay.percentage);
        }

        if let Some(abort) = &self.abort {
            match self.protocol {
                ProxyProtocol::Grpc if abort.grpc_status.is_none() && abort.http_status.is_none() => {
                    problems.push("abort needs grpcStatus or httpStatus for grpc".into())
                }
                ProxyProtocol::Http if abort.http_status.is_none() => {
                    problems.push("abort.httpStatus is required for http".into())
                }
                _ => {}
            }
            if let Some(code) = abort.http_status {
                if !(100..=599).contains(&code) {
                    problems.push(format!("abort.httpStatus must be between 100 and 599, got {code}"));
                }
            }
            if let Some(code) = abort.grpc_status {
                if !(0..=16).contains(&code) {
                    problems.push(format!("abort.grpcStatus must be between 0 and 16, got {code}"));
                }
            }
            check_percentage(&mut problems, "abort.percentage", abort.percentage);
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ImplError::Config(problems.join("; ")))
        }
    }

    /// Namespace of the service and of the generated config object.
    pub fn config_namespace<'a>(&'a self, resource_namespace: &'a str) -> &'a str {
        self.target_namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .or(self
                .envoy_config_namespace
                .as_deref()
                .filter(|ns| !ns.is_empty()))
            .unwrap_or(resource_namespace)
    }
}

/// Envoy `FractionalPercent` over a denominator of one hundred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FractionalPercent {
    pub numerator: u32,
    pub denominator: &'static str,
}

impl FractionalPercent {
    fn hundred(numerator: i32) -> Self {
        Self {
            numerator: numerator.clamp(0, 100) as u32,
            denominator: "HUNDRED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultDelay {
    pub fixed_delay: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<FractionalPercent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultAbort {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<FractionalPercent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafeRegex {
    pub regex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderMatcher {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exact_match: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_regex_match: Option<SafeRegex>,
}

/// Typed config of the Envoy HTTP fault filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpFaultConfig {
    #[serde(rename = "@type")]
    pub type_url: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<FaultDelay>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort: Option<FaultAbort>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderMatcher>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_cluster: Option<String>,
}

impl HttpFaultConfig {
    pub fn from_spec(spec: &ProxyFaultSpec) -> Self {
        let delay = spec.delay.as_ref().and_then(|d| {
            d.fixed_delay.as_ref().map(|fixed| FaultDelay {
                fixed_delay: fixed.clone(),
                percentage: d.percentage.or(spec.percentage).map(FractionalPercent::hundred),
            })
        });

        let abort = spec.abort.as_ref().map(|a| {
            let (http_status, grpc_status) = match (spec.protocol, a.grpc_status) {
                (ProxyProtocol::Grpc, Some(code)) => (None, Some(code)),
                _ => (a.http_status, None),
            };
            FaultAbort {
                http_status,
                grpc_status,
                percentage: a.percentage.or(spec.percentage).map(FractionalPercent::hundred),
            }
        });

        let headers = spec
            .headers
            .iter()
            .map(|(name, value)| match value.strip_prefix(REGEX_PREFIX) {
                Some(regex) => HeaderMatcher {
                    name: name.clone(),
                    exact_match: None,
                    safe_regex_match: Some(SafeRegex {
                        regex: regex.to_string(),
                    }),
                },
                None => HeaderMatcher {
                    name: name.clone(),
                    exact_match: Some(value.clone()),
                    safe_regex_match: None,
                },
            })
            .collect();

        Self {
            type_url: FAULT_TYPE,
            delay,
            abort,
            headers,
            upstream_cluster: Some(spec.target_service.clone()).filter(|s| !s.is_empty()),
        }
    }
}

pub fn config_name(resource_name: &str) -> String {
    format!("chaos-{resource_name}")
}

/// Build the proxy config object for `spec` on behalf of `resource`.
pub fn build_proxy_config(
    resource: &ChaosResource,
    spec: &ProxyFaultSpec,
) -> Result<DynamicObject, ImplError> {
    let namespace = spec.config_namespace(&resource.metadata.namespace);
    let fault = serde_json::to_value(HttpFaultConfig::from_spec(spec))
        .map_err(|e| ImplError::Config(format!("fault filter: {e}")))?;

    let mut service = json!({
        "name": spec.target_service,
        "namespace": namespace,
    });
    if let Some(port) = spec.target_port {
        service["ports"] = json!([port]);
    }

    let body = json!({
        "services": [service],
        "resources": [{
            "@type": LISTENER_TYPE,
            "name": format!("chaos-listener-{}", spec.target_service),
            "filterChains": [{
                "filters": [{
                    "name": HCM_FILTER,
                    "typedConfig": {
                        "@type": HCM_TYPE,
                        "statPrefix": "chaos_http",
                        "httpFilters": [
                            { "name": FAULT_FILTER, "typedConfig": fault },
                            { "name": ROUTER_FILTER },
                        ],
                    },
                }],
            }],
        }],
    });

    Ok(DynamicObject {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        metadata: DynamicMeta {
            name: config_name(&resource.metadata.name),
            namespace: namespace.to_string(),
            labels: BTreeMap::from([
                (INJECTED_LABEL.to_string(), "true".to_string()),
                (CHAOS_LABEL.to_string(), resource.metadata.name.clone()),
            ]),
        },
        spec: body,
    })
}

pub struct ProxyFaultImpl {
    objects: Arc<dyn ObjectApi>,
    log: Logger,
}

impl ProxyFaultImpl {
    pub fn new(objects: Arc<dyn ObjectApi>, log: Logger) -> Self {
        Self { objects, log }
    }

    fn spec<'a>(&self, resource: &'a ChaosResource) -> Result<&'a ProxyFaultSpec, ImplError> {
        match &resource.spec.fault {
            FaultSpec::ProxyFault(spec) => Ok(spec),
            _ => Err(wrong_kind(FaultKind::ProxyFault, resource)),
        }
    }

    async fn upsert(&self, resource: &ChaosResource) -> Result<(), ImplError> {
        let spec = self.spec(resource)?;
        spec.validate()?;
        let obj = build_proxy_config(resource, spec)?;
        match self.objects.create_object(&obj).await {
            Ok(()) => {}
            Err(ClusterError::AlreadyExists { .. }) => self.objects.update_object(&obj).await?,
            Err(e) => return Err(e.into()),
        }
        self.log
            .with_value("name", &obj.metadata.name)
            .with_value("namespace", &obj.metadata.namespace)
            .with_value("service", &spec.target_service)
            .audit("applied proxy fault config");
        Ok(())
    }
}

#[async_trait]
impl ResourceImpl for ProxyFaultImpl {
    async fn apply(&self, resource: &ChaosResource) -> Result<Phase, PhaseError> {
        self.upsert(resource)
            .await
            .map(|()| Phase::Injected)
            .map_err(|e| e.at(Phase::NotInjected))
    }

    async fn recover(&self, resource: &ChaosResource) -> Result<Phase, PhaseError> {
        let spec = self.spec(resource).map_err(|e| e.at(Phase::Injected))?;
        let name = config_name(&resource.metadata.name);
        let namespace = spec.config_namespace(&resource.metadata.namespace);
        match self.objects.delete_object(KIND, namespace, &name).await {
            Ok(()) => {
                self.log
                    .with_value("name", &name)
                    .with_value("namespace", namespace)
                    .audit("removed proxy fault config");
                Ok(Phase::NotInjected)
            }
            Err(e) if e.is_not_found() => Ok(Phase::NotInjected),
            Err(e) => Err(ImplError::from(e).at(Phase::Injected)),
        }
    }
}
