//! Fault implementations, one per [`FaultKind`].

use chaos_common::Logger;
use std::sync::Arc;

use crate::cluster::ObjectApi;
use crate::daemon::TargetDecoder;
use crate::dispatch::{Binding, Dispatcher, DispatcherBuilder};
use crate::error::{DispatchError, ImplError, PhaseError};
use crate::resource::{ChaosResource, FaultKind, Phase};

pub mod fuse_device;
pub mod jvm_rule;
pub mod proxy_fault;
pub mod runtime_mutator;

/// Dispatcher with the stock implementation bound to every fault kind.
pub fn default_dispatcher(
    decoder: TargetDecoder,
    objects: Arc<dyn ObjectApi>,
    log: &Logger,
) -> Result<Dispatcher, DispatchError> {
    let log = log.with_name("impl");
    DispatcherBuilder::new()
        .register(
            FaultKind::RuntimeMutator,
            Binding::PerTarget(Arc::new(runtime_mutator::RuntimeMutatorImpl::new(
                decoder.clone(),
                log.with_name(FaultKind::RuntimeMutator.as_str()),
            ))),
        )
        .register(
            FaultKind::JvmRule,
            Binding::PerTarget(Arc::new(jvm_rule::JvmRuleImpl::new(
                decoder.clone(),
                log.with_name(FaultKind::JvmRule.as_str()),
            ))),
        )
        .register(
            FaultKind::FuseDevice,
            Binding::PerTarget(Arc::new(fuse_device::FuseDeviceImpl::new(
                decoder,
                log.with_name(FaultKind::FuseDevice.as_str()),
            ))),
        )
        .register(
            FaultKind::ProxyFault,
            Binding::Singleton(Arc::new(proxy_fault::ProxyFaultImpl::new(
                objects,
                log.with_name(FaultKind::ProxyFault.as_str()),
            ))),
        )
        .build()
}

fn wrong_kind(expected: FaultKind, resource: &ChaosResource) -> ImplError {
    ImplError::Config(format!(
        "{} bound to {expected} implementation",
        resource.kind()
    ))
}

/// Map a recover call's result, treating a vanished target as recovered.
fn recovered(result: Result<(), ImplError>) -> Result<Phase, PhaseError> {
    match result {
        Ok(()) => Ok(Phase::NotInjected),
        Err(ImplError::TargetGone(_)) => Ok(Phase::NotInjected),
        Err(e) => Err(e.at(Phase::Injected)),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::cluster::{ContainerStatus, MemoryCluster, Pod};
    use crate::daemon::TargetDecoder;
    use crate::resource::{ChaosResource, ChaosSpec, FaultSpec, ObjectMeta, Record};
    use crate::timer::SystemClock;
    use chaos_common::Logger;
    use std::sync::Arc;
    use std::time::Duration;

    pub fn pod(name: &str) -> Pod {
        Pod {
            namespace: "shop".into(),
            name: name.into(),
            labels: Default::default(),
            annotations: Default::default(),
            phase: "Running".into(),
            node_name: "node-1".into(),
            containers: vec![ContainerStatus {
                name: "app".into(),
                container_id: format!("containerd://{name}"),
            }],
        }
    }

    /// Decoder over one pod `shop/cart` on a node served by `daemon`.
    pub async fn decoder(daemon: &str) -> TargetDecoder {
        let cluster = MemoryCluster::new(Arc::new(SystemClock));
        cluster.upsert_pod(pod("cart")).await;
        cluster.set_node_address("node-1", daemon).await;
        TargetDecoder::new(
            Arc::new(cluster),
            31767,
            Duration::from_secs(2),
            Logger::new("test"),
        )
    }

    pub fn resource(fault: FaultSpec) -> ChaosResource {
        ChaosResource {
            metadata: ObjectMeta {
                name: "exp".into(),
                namespace: "shop".into(),
                ..Default::default()
            },
            spec: ChaosSpec {
                selector: Default::default(),
                duration: None,
                fault,
            },
            status: Default::default(),
        }
    }

    pub fn records(id: &str) -> Vec<Record> {
        vec![Record::new(id)]
    }
}
