//! JSON request/response types of the chaos daemon API.
//!
//! Every operation is a `POST` carrying one of the request structs below.
//! Failures come back with a non-2xx status and an [`ErrorBody`].

use serde::{Deserialize, Serialize};

pub const DEFAULT_DAEMON_PORT: u16 = 31767;

pub mod routes {
    pub const CONTAINER_PID: &str = "/v1/container/pid";
    pub const JVM_RULES_INSTALL: &str = "/v1/jvm/rules/install";
    pub const JVM_RULES_UNINSTALL: &str = "/v1/jvm/rules/uninstall";
    pub const RUNTIME_MUTATOR_INSTALL: &str = "/v1/runtime-mutator/install";
    pub const RUNTIME_MUTATOR_UNINSTALL: &str = "/v1/runtime-mutator/uninstall";
    pub const FUSE_GRANT: &str = "/v1/devices/fuse/grant";
    pub const FUSE_REVOKE: &str = "/v1/devices/fuse/revoke";
    pub const HEALTHZ: &str = "/healthz";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRequest {
    pub container_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPidResponse {
    pub pid: u32,
}

/// Install or uninstall a bytecode-rewriting rule script in a JVM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JvmRulesRequest {
    pub container_id: String,
    pub rule: String,
    pub port: u16,
    #[serde(default)]
    pub enter_ns: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Constant,
    Operator,
    String,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::Constant => "constant",
            MutationKind::Operator => "operator",
            MutationKind::String => "string",
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeMutatorRequest {
    pub container_id: String,
    pub action: MutationKind,
    pub class: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub enter_ns: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeMutatorResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRuleResponse {
    /// `false` when the node's cgroup hierarchy has no devices controller.
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Body of operations with nothing to report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Invalid,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutator_request_omits_unset_optionals() {
        let req = RuntimeMutatorRequest {
            container_id: "containerd://abc".into(),
            action: MutationKind::Operator,
            class: "com.example.Cart".into(),
            method: "total".into(),
            signature: None,
            from: None,
            to: None,
            strategy: Some("negate".into()),
            port: 9090,
            enter_ns: true,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["action"], "operator");
        assert!(json.get("from").is_none());
        assert_eq!(json["strategy"], "negate");
    }

    #[test]
    fn error_kind_is_snake_case() {
        let body: ErrorBody =
            serde_json::from_str(r#"{"kind":"not_found","message":"gone"}"#).unwrap();
        assert_eq!(body.kind, ErrorKind::NotFound);
    }

    #[test]
    fn enter_ns_defaults_to_false() {
        let req: JvmRulesRequest =
            serde_json::from_str(r#"{"container_id":"c","rule":"RULE x","port":9277}"#).unwrap();
        assert!(!req.enter_ns);
    }
}
