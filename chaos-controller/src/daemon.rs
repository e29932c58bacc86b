//! Client side of the chaos daemon API.
//!
//! Every call resolves its target afresh and opens its own connection; the
//! connection is dropped with the [`DecodedTarget`] that owns it.

use chaos_common::protocol::{
    routes, ContainerPidResponse, ContainerRequest, DeviceRuleResponse, Empty, ErrorBody,
    ErrorKind, JvmRulesRequest, RuntimeMutatorRequest, RuntimeMutatorResponse,
};
use chaos_common::Logger;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::PodApi;
use crate::error::{ClusterError, ImplError};

/// One short-lived HTTP connection to the daemon on a node.
pub struct DaemonConnection {
    address: String,
    client: reqwest::Client,
    log: Logger,
}

impl DaemonConnection {
    pub fn open(address: &str, timeout: Duration, log: &Logger) -> Result<Self, ImplError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| ImplError::Unreachable {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        let log = log.with_value("daemon", address);
        log.debug("opening daemon connection");
        Ok(Self {
            address: address.to_string(),
            client,
            log,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn post<Req, Resp>(&self, route: &str, body: &Req) -> Result<Resp, ImplError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("http://{}{}", self.address, route);
        let unreachable = |e: reqwest::Error| ImplError::Unreachable {
            address: self.address.clone(),
            reason: e.to_string(),
        };
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(unreachable)?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Resp>()
                .await
                .map_err(|e| ImplError::Daemon(format!("{route}: undecodable response: {e}")));
        }

        let text = response.text().await.unwrap_or_default();
        let (kind, message) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => (Some(body.kind), body.message),
            Err(_) => (None, format!("{status}: {}", text.trim())),
        };
        self.log
            .with_value("route", route)
            .with_value("status", status.as_u16())
            .debug(format!("daemon returned error: {message}"));
        Err(match (kind, status.as_u16()) {
            (Some(ErrorKind::NotFound), _) | (None, 404) => ImplError::TargetGone(message),
            (Some(ErrorKind::Invalid), _) | (None, 400) => ImplError::Config(message),
            _ => ImplError::Daemon(message),
        })
    }

    pub async fn container_pid(&self, container_id: &str) -> Result<u32, ImplError> {
        let req = ContainerRequest {
            container_id: container_id.to_string(),
        };
        let resp: ContainerPidResponse = self.post(routes::CONTAINER_PID, &req).await?;
        Ok(resp.pid)
    }

    pub async fn install_jvm_rules(&self, req: &JvmRulesRequest) -> Result<(), ImplError> {
        let _: Empty = self.post(routes::JVM_RULES_INSTALL, req).await?;
        Ok(())
    }

    pub async fn uninstall_jvm_rules(&self, req: &JvmRulesRequest) -> Result<(), ImplError> {
        let _: Empty = self.post(routes::JVM_RULES_UNINSTALL, req).await?;
        Ok(())
    }

    pub async fn install_runtime_mutator(
        &self,
        req: &RuntimeMutatorRequest,
    ) -> Result<RuntimeMutatorResponse, ImplError> {
        self.post(routes::RUNTIME_MUTATOR_INSTALL, req).await
    }

    pub async fn uninstall_runtime_mutator(
        &self,
        req: &RuntimeMutatorRequest,
    ) -> Result<(), ImplError> {
        let _: Empty = self.post(routes::RUNTIME_MUTATOR_UNINSTALL, req).await?;
        Ok(())
    }

    pub async fn grant_fuse(&self, container_id: &str) -> Result<DeviceRuleResponse, ImplError> {
        let req = ContainerRequest {
            container_id: container_id.to_string(),
        };
        self.post(routes::FUSE_GRANT, &req).await
    }

    pub async fn revoke_fuse(&self, container_id: &str) -> Result<DeviceRuleResponse, ImplError> {
        let req = ContainerRequest {
            container_id: container_id.to_string(),
        };
        self.post(routes::FUSE_REVOKE, &req).await
    }
}

impl Drop for DaemonConnection {
    fn drop(&mut self) {
        self.log.debug("closing daemon connection");
    }
}

/// Parsed record id: `namespace/pod` or `namespace/pod/container`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRef {
    pub namespace: String,
    pub pod: String,
    pub container: Option<String>,
}

impl TargetRef {
    pub fn parse(id: &str) -> Result<Self, ImplError> {
        let parts: Vec<&str> = id.split('/').collect();
        let invalid = || ImplError::Config(format!("malformed target id {id:?}"));
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid());
        }
        match parts.as_slice() {
            [ns, pod] => Ok(Self {
                namespace: ns.to_string(),
                pod: pod.to_string(),
                container: None,
            }),
            [ns, pod, container] => Ok(Self {
                namespace: ns.to_string(),
                pod: pod.to_string(),
                container: Some(container.to_string()),
            }),
            _ => Err(invalid()),
        }
    }
}

/// Resolution of one record for the duration of one call.
pub struct DecodedTarget {
    pub container_id: String,
    pub host_pid: u32,
    pub connection: DaemonConnection,
}

#[derive(Clone)]
pub struct TargetDecoder {
    pods: Arc<dyn PodApi>,
    daemon_port: u16,
    timeout: Duration,
    log: Logger,
}

impl TargetDecoder {
    pub fn new(pods: Arc<dyn PodApi>, daemon_port: u16, timeout: Duration, log: Logger) -> Self {
        Self {
            pods,
            daemon_port,
            timeout,
            log,
        }
    }

    fn daemon_address(&self, node_address: &str) -> String {
        if node_address.contains(':') {
            node_address.to_string()
        } else {
            format!("{}:{}", node_address, self.daemon_port)
        }
    }

    pub async fn decode(&self, record_id: &str) -> Result<DecodedTarget, ImplError> {
        let target = TargetRef::parse(record_id)?;
        let gone = || ImplError::TargetGone(record_id.to_string());

        let pod = match self.pods.get_pod(&target.namespace, &target.pod).await {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => return Err(gone()),
            Err(e) => return Err(e.into()),
        };
        let container = match &target.container {
            Some(name) => pod.containers.iter().find(|c| &c.name == name),
            None => pod.containers.first(),
        };
        let container_id = match container {
            Some(c) if !c.container_id.is_empty() => c.container_id.clone(),
            _ => return Err(gone()),
        };
        if pod.node_name.is_empty() {
            return Err(gone());
        }

        let node_address = match self.pods.node_address(&pod.node_name).await {
            Ok(addr) => addr,
            Err(ClusterError::NotFound { .. }) => {
                return Err(ImplError::Unreachable {
                    address: pod.node_name.clone(),
                    reason: "node has no known daemon address".into(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let address = self.daemon_address(&node_address);
        let log = self.log.with_value("target", record_id);
        let connection = DaemonConnection::open(&address, self.timeout, &log)?;
        let host_pid = connection.container_pid(&container_id).await?;
        log.with_value("pid", host_pid).debug("resolved target");

        Ok(DecodedTarget {
            container_id,
            host_pid,
            connection,
        })
    }
}
