//! Bytecode mutation of a running JVM through the daemon's mutator agent.

use async_trait::async_trait;
use chaos_common::protocol::{MutationKind, RuntimeMutatorRequest};
use chaos_common::Logger;
use serde::{Deserialize, Serialize};

use super::{recovered, wrong_kind};
use crate::daemon::TargetDecoder;
use crate::dispatch::TargetImpl;
use crate::error::{ImplError, PhaseError};
use crate::resource::{ChaosResource, FaultKind, FaultSpec, Phase, Record};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeMutatorSpec {
    pub action: MutationKind,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    /// Control port of the agent inside the JVM.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    9090
}

/// An empty string counts as unset.
fn is_set(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

impl RuntimeMutatorSpec {
    pub fn validate(&self) -> Result<(), ImplError> {
        let mut problems = Vec::new();
        if self.class.trim().is_empty() {
            problems.push("class is required".to_string());
        }
        if self.method.trim().is_empty() {
            problems.push("method is required".to_string());
        }
        match self.action {
            MutationKind::Constant => {
                if !is_set(&self.from) || !is_set(&self.to) {
                    problems.push("from and to are required for constant mutation".into());
                }
                if is_set(&self.strategy) {
                    problems.push("strategy is not allowed for constant mutation".into());
                }
            }
            MutationKind::Operator | MutationKind::String => {
                if !is_set(&self.strategy) {
                    problems.push(format!("strategy is required for {} mutation", self.action));
                }
                if is_set(&self.from) || is_set(&self.to) {
                    problems.push(format!("from and to are not allowed for {} mutation", self.action));
                }
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ImplError::Config(problems.join("; ")))
        }
    }

    pub fn to_request(&self, container_id: &str) -> RuntimeMutatorRequest {
        RuntimeMutatorRequest {
            container_id: container_id.to_string(),
            action: self.action,
            class: self.class.clone(),
            method: self.method.clone(),
            signature: self.signature.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            strategy: self.strategy.clone(),
            port: self.port,
            enter_ns: false,
        }
    }
}

pub struct RuntimeMutatorImpl {
    decoder: TargetDecoder,
    log: Logger,
}

impl RuntimeMutatorImpl {
    pub fn new(decoder: TargetDecoder, log: Logger) -> Self {
        Self { decoder, log }
    }

    fn spec<'a>(&self, resource: &'a ChaosResource) -> Result<&'a RuntimeMutatorSpec, ImplError> {
        match &resource.spec.fault {
            FaultSpec::RuntimeMutator(spec) => Ok(spec),
            _ => Err(wrong_kind(FaultKind::RuntimeMutator, resource)),
        }
    }

    async fn install(&self, id: &str, spec: &RuntimeMutatorSpec) -> Result<(), ImplError> {
        let target = self.decoder.decode(id).await?;
        let log = self
            .log
            .with_value("target", id)
            .with_value("container", &target.container_id);
        log.info(format!(
            "installing runtime mutator action={} class={} method={}",
            spec.action, spec.class, spec.method
        ));
        let resp = target
            .connection
            .install_runtime_mutator(&spec.to_request(&target.container_id))
            .await?;
        if !resp.success {
            log.error(&resp.message, "runtime mutator installation failed");
            return Err(ImplError::Rejected(resp.message));
        }
        log.audit(format!("runtime mutator installed: {}", resp.message));
        Ok(())
    }

    async fn uninstall(&self, id: &str, spec: &RuntimeMutatorSpec) -> Result<(), ImplError> {
        let target = self.decoder.decode(id).await?;
        target
            .connection
            .uninstall_runtime_mutator(&spec.to_request(&target.container_id))
            .await?;
        self.log
            .with_value("target", id)
            .with_value("container", &target.container_id)
            .audit("runtime mutator uninstalled");
        Ok(())
    }
}

#[async_trait]
impl TargetImpl for RuntimeMutatorImpl {
    async fn apply(
        &self,
        index: usize,
        records: &[Record],
        resource: &ChaosResource,
    ) -> Result<Phase, PhaseError> {
        let spec = self.spec(resource).map_err(|e| e.at(Phase::NotInjected))?;
        spec.validate().map_err(|e| e.at(Phase::NotInjected))?;
        self.install(&records[index].id, spec)
            .await
            .map(|()| Phase::Injected)
            .map_err(|e| e.at(Phase::NotInjected))
    }

    async fn recover(
        &self,
        index: usize,
        records: &[Record],
        resource: &ChaosResource,
    ) -> Result<Phase, PhaseError> {
        let spec = self.spec(resource).map_err(|e| e.at(Phase::Injected))?;
        recovered(self.uninstall(&records[index].id, spec).await)
    }
}
