//! FUSE device access for a pod, granted through its device cgroup.

use async_trait::async_trait;
use chaos_common::Logger;

use super::{recovered, wrong_kind};
use crate::daemon::TargetDecoder;
use crate::dispatch::TargetImpl;
use crate::error::{ImplError, PhaseError};
use crate::resource::{ChaosResource, FaultKind, FaultSpec, Phase, Record};

pub struct FuseDeviceImpl {
    decoder: TargetDecoder,
    log: Logger,
}

impl FuseDeviceImpl {
    pub fn new(decoder: TargetDecoder, log: Logger) -> Self {
        Self { decoder, log }
    }

    fn check_kind(&self, resource: &ChaosResource) -> Result<(), ImplError> {
        match resource.spec.fault {
            FaultSpec::FuseDevice => Ok(()),
            _ => Err(wrong_kind(FaultKind::FuseDevice, resource)),
        }
    }

    async fn change(&self, id: &str, grant: bool) -> Result<(), ImplError> {
        let target = self.decoder.decode(id).await?;
        let resp = if grant {
            target.connection.grant_fuse(&target.container_id).await?
        } else {
            target.connection.revoke_fuse(&target.container_id).await?
        };
        let log = self.log.with_value("target", id);
        let verb = if grant { "granted" } else { "revoked" };
        match resp.path {
            Some(path) if resp.applied => {
                log.with_value("path", path).audit(format!("fuse device {verb}"))
            }
            _ => log.info("no devices controller on node, nothing to change"),
        }
        Ok(())
    }
}

#[async_trait]
impl TargetImpl for FuseDeviceImpl {
    async fn apply(
        &self,
        index: usize,
        records: &[Record],
        resource: &ChaosResource,
    ) -> Result<Phase, PhaseError> {
        self.check_kind(resource)
            .map_err(|e| e.at(Phase::NotInjected))?;
        self.change(&records[index].id, true)
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
        self.check_kind(resource).map_err(|e| e.at(Phase::Injected))?;
        recovered(self.change(&records[index].id, false).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::testing::{decoder, records, resource};
    use chaos_common::protocol::routes;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn grant_without_devices_controller_still_injects() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(routes::CONTAINER_PID);
                then.status(200).json_body(json!({ "pid": 100 }));
            })
            .await;
        let grant = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path(routes::FUSE_GRANT)
                    .json_body(json!({ "container_id": "containerd://cart" }));
                then.status(200).json_body(json!({ "applied": false }));
            })
            .await;
        let revoke = server
            .mock_async(|when, then| {
                when.method(POST).path(routes::FUSE_REVOKE);
                then.status(200)
                    .json_body(json!({ "applied": true, "path": "/sys/fs/cgroup/devices/kubepods/devices.deny" }));
            })
            .await;

        let imp = FuseDeviceImpl::new(decoder(&server.address().to_string()).await, Logger::new("test"));
        let res = resource(FaultSpec::FuseDevice);
        let recs = records("shop/cart");
        assert_eq!(imp.apply(0, &recs, &res).await.unwrap(), Phase::Injected);
        assert_eq!(imp.recover(0, &recs, &res).await.unwrap(), Phase::NotInjected);
        grant.assert_async().await;
        revoke.assert_async().await;
    }

    #[tokio::test]
    async fn daemon_failure_leaves_record_not_injected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(routes::CONTAINER_PID);
                then.status(200).json_body(json!({ "pid": 100 }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(routes::FUSE_GRANT);
                then.status(500)
                    .json_body(json!({ "kind": "internal", "message": "cgroup write failed" }));
            })
            .await;

        let imp = FuseDeviceImpl::new(decoder(&server.address().to_string()).await, Logger::new("test"));
        let err = imp
            .apply(0, &records("shop/cart"), &resource(FaultSpec::FuseDevice))
            .await
            .unwrap_err();
        assert_eq!(err.phase, Phase::NotInjected);
        assert!(err.to_string().contains("cgroup write failed"));
    }
}
