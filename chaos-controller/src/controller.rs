//! Worker pool feeding resource keys from the work queue into the reconciler.

use chaos_common::Logger;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::cluster::ChaosStore;
use crate::engine::Reconciler;
use crate::error::ClusterError;
use crate::queue::WorkQueue;
use crate::resource::ResourceKey;

pub struct Controller {
    queue: Arc<WorkQueue<ResourceKey>>,
    reconciler: Arc<Reconciler>,
    store: Arc<dyn ChaosStore>,
    log: Logger,
}

impl Controller {
    pub fn new(
        reconciler: Reconciler,
        store: Arc<dyn ChaosStore>,
        queue: Arc<WorkQueue<ResourceKey>>,
        log: Logger,
    ) -> Self {
        Self {
            queue,
            reconciler: Arc::new(reconciler),
            store,
            log: log.with_name("worker"),
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ResourceKey>> {
        &self.queue
    }

    /// Queue every known resource.
    pub async fn enqueue_all(&self) -> Result<usize, ClusterError> {
        let keys = self.store.list_resources().await?;
        let n = keys.len();
        for key in keys {
            self.queue.add(key);
        }
        Ok(n)
    }

    pub fn spawn_workers(&self, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|id| {
                let queue = Arc::clone(&self.queue);
                let reconciler = Arc::clone(&self.reconciler);
                let log = self.log.with_value("worker", id);
                tokio::spawn(async move {
                    while let Some(key) = queue.get().await {
                        process(&queue, &reconciler, &key, &log).await;
                        queue.done(&key);
                    }
                    log.debug("worker stopped");
                })
            })
            .collect()
    }

    /// Stop handing out work and wait for in-flight reconciles to finish.
    pub async fn shutdown(&self, workers: Vec<JoinHandle<()>>) {
        self.queue.shutdown();
        for handle in workers {
            if let Err(e) = handle.await {
                self.log.error(&e, "worker task failed");
            }
        }
    }
}

async fn process(
    queue: &Arc<WorkQueue<ResourceKey>>,
    reconciler: &Reconciler,
    key: &ResourceKey,
    log: &Logger,
) {
    let log = log.with_value("resource", key);
    match reconciler.reconcile(key).await {
        Ok(outcome) => {
            if outcome.requeue {
                let delay = queue.add_rate_limited(key.clone());
                log.debug(format!("requeued in {delay:?}"));
            } else {
                queue.forget(key);
            }
            if let Some(after) = outcome.requeue_after {
                queue.add_after(key.clone(), after);
            }
        }
        Err(e) => {
            let delay = queue.add_rate_limited(key.clone());
            log.error(&e, format!("reconcile failed, retrying in {delay:?}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ContainerStatus, MemoryCluster, Pod};
    use crate::dispatch::testing::{dispatcher, Scripted};
    use crate::resource::{ChaosResource, ChaosSpec, FaultSpec, ObjectMeta, Phase};
    use crate::selector::{SelectorMode, TargetSelector};
    use crate::timer::SystemClock;
    use std::time::Duration;

    fn resource(name: &str) -> ChaosResource {
        ChaosResource {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: "shop".into(),
                ..Default::default()
            },
            spec: ChaosSpec {
                selector: TargetSelector {
                    mode: SelectorMode::All,
                    ..Default::default()
                },
                duration: None,
                fault: FaultSpec::FuseDevice,
            },
            status: Default::default(),
        }
    }

    #[tokio::test]
    async fn workers_reconcile_queued_resources() {
        let cluster = Arc::new(MemoryCluster::new(Arc::new(SystemClock)));
        cluster
            .upsert_pod(Pod {
                namespace: "shop".into(),
                name: "cart".into(),
                labels: Default::default(),
                annotations: Default::default(),
                phase: "Running".into(),
                node_name: "node-1".into(),
                containers: vec![ContainerStatus {
                    name: "app".into(),
                    container_id: "containerd://cart".into(),
                }],
            })
            .await;
        let a = cluster.apply_resource(resource("a")).await;
        let b = cluster.apply_resource(resource("b")).await;

        let imp = Arc::new(Scripted::default());
        let reconciler = Reconciler::new(
            cluster.clone(),
            cluster.clone(),
            dispatcher(imp.clone()),
            Arc::new(SystemClock),
            Logger::new("test"),
        );
        let queue = WorkQueue::new(Duration::from_millis(10), Duration::from_millis(100));
        let controller = Controller::new(reconciler, cluster.clone(), queue, Logger::new("test"));

        assert_eq!(controller.enqueue_all().await.unwrap(), 2);
        let workers = controller.spawn_workers(2);

        for _ in 0..200 {
            if imp.applies() == 2 && controller.queue().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        controller.shutdown(workers).await;

        for key in [a, b] {
            let res = cluster.get_resource(&key).await.unwrap();
            assert_eq!(res.status.records.len(), 1);
            assert_eq!(res.status.records[0].phase, Phase::Injected);
        }
    }
}
