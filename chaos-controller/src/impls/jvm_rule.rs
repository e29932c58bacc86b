//! Rule-script injection into a JVM through the daemon's attach tools.

use async_trait::async_trait;
use chaos_common::protocol::JvmRulesRequest;
use chaos_common::Logger;
use serde::{Deserialize, Serialize};

use super::{recovered, wrong_kind};
use crate::daemon::TargetDecoder;
use crate::dispatch::TargetImpl;
use crate::error::{ImplError, PhaseError};
use crate::resource::{ChaosResource, FaultKind, FaultSpec, Phase, Record};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JvmRuleSpec {
    pub rule: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Copy the agent jars into the container's mount namespace first.
    #[serde(default)]
    pub enter_ns: bool,
}

fn default_port() -> u16 {
    9277
}

impl JvmRuleSpec {
    pub fn validate(&self) -> Result<(), ImplError> {
        if self.rule.trim().is_empty() {
            return Err(ImplError::Config("rule must not be empty".into()));
        }
        Ok(())
    }

    fn to_request(&self, container_id: &str) -> JvmRulesRequest {
        JvmRulesRequest {
            container_id: container_id.to_string(),
            rule: self.rule.clone(),
            port: self.port,
            enter_ns: self.enter_ns,
        }
    }
}

pub struct JvmRuleImpl {
    decoder: TargetDecoder,
    log: Logger,
}

impl JvmRuleImpl {
    pub fn new(decoder: TargetDecoder, log: Logger) -> Self {
        Self { decoder, log }
    }

    fn spec<'a>(&self, resource: &'a ChaosResource) -> Result<&'a JvmRuleSpec, ImplError> {
        match &resource.spec.fault {
            FaultSpec::JvmRule(spec) => Ok(spec),
            _ => Err(wrong_kind(FaultKind::JvmRule, resource)),
        }
    }
}

#[async_trait]
impl TargetImpl for JvmRuleImpl {
    async fn apply(
        &self,
        index: usize,
        records: &[Record],
        resource: &ChaosResource,
    ) -> Result<Phase, PhaseError> {
        let id = &records[index].id;
        let result = async {
            let spec = self.spec(resource)?;
            spec.validate()?;
            let target = self.decoder.decode(id).await?;
            target
                .connection
                .install_jvm_rules(&spec.to_request(&target.container_id))
                .await?;
            self.log
                .with_value("target", id)
                .with_value("port", spec.port)
                .audit("jvm rule installed");
            Ok::<(), ImplError>(())
        }
        .await;
        result
            .map(|()| Phase::Injected)
            .map_err(|e| e.at(Phase::NotInjected))
    }

    async fn recover(
        &self,
        index: usize,
        records: &[Record],
        resource: &ChaosResource,
    ) -> Result<Phase, PhaseError> {
        let id = &records[index].id;
        recovered(
            async {
                let spec = self.spec(resource)?;
                let target = self.decoder.decode(id).await?;
                target
                    .connection
                    .uninstall_jvm_rules(&spec.to_request(&target.container_id))
                    .await?;
                self.log.with_value("target", id).audit("jvm rule removed");
                Ok::<(), ImplError>(())
            }
            .await,
        )
    }
}
