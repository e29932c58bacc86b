//! Reconciliation of one chaos resource: target selection, the per-target
//! record state machine, duration expiry and finalizer handling.

use chaos_common::Logger;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cluster::{ChaosStore, PodApi};
use crate::dispatch::Dispatcher;
use crate::error::{ClusterError, ErrorClass, ReconcileError};
use crate::impls::proxy_fault;
use crate::resource::{
    ChaosResource, ChaosStatus, ConditionType, FaultKind, FaultSpec, Phase, Record, ResourceKey,
};
use crate::selector::{matching_targets, select_sticky, TargetLevel};
use crate::timer::{desired_state, Clock, DesiredState, StopReason};

/// Held on every live resource until all its records are recovered.
pub const FINALIZER: &str = "chaos-mesh.org/records";

/// Writes tried per reconcile when the resource version keeps moving.
const CONFLICT_RETRIES: u32 = 5;

fn without_finalizer(resource: &ChaosResource) -> Vec<String> {
    resource
        .metadata
        .finalizers
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Retry soon with backoff.
    pub requeue: bool,
    /// Reconcile again after this long, e.g. when the duration runs out.
    pub requeue_after: Option<Duration>,
}

pub fn target_level(kind: FaultKind) -> TargetLevel {
    match kind {
        FaultKind::FuseDevice => TargetLevel::Pod,
        _ => TargetLevel::Container,
    }
}

/// Record id of a singleton kind: the object it manages.
pub fn singleton_id(resource: &ChaosResource) -> String {
    let ns = &resource.metadata.namespace;
    match &resource.spec.fault {
        FaultSpec::ProxyFault(spec) => format!(
            "{}/{}",
            spec.config_namespace(ns),
            proxy_fault::config_name(&resource.metadata.name)
        ),
        _ => format!("{}/{}", ns, resource.metadata.name),
    }
}

pub struct Reconciler {
    store: Arc<dyn ChaosStore>,
    pods: Arc<dyn PodApi>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    max_apply_attempts: u32,
    log: Logger,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ChaosStore>,
        pods: Arc<dyn PodApi>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
        log: Logger,
    ) -> Self {
        Self {
            store,
            pods,
            dispatcher,
            clock,
            rng: Mutex::new(StdRng::from_entropy()),
            max_apply_attempts: 3,
            log: log.with_name("engine"),
        }
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_max_apply_attempts(mut self, attempts: u32) -> Self {
        self.max_apply_attempts = attempts.max(1);
        self
    }

    pub async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileOutcome, ReconcileError> {
        let resource = match self.store.get_resource(key).await {
            Ok(r) => r,
            Err(e) if e.is_not_found() => return Ok(ReconcileOutcome::default()),
            Err(e) => return Err(e.into()),
        };
        let log = self.log.with_value("resource", key);
        let mut version = resource.metadata.resource_version;

        if resource.is_deleting() {
            if !resource.has_finalizer(FINALIZER) {
                return Ok(ReconcileOutcome::default());
            }
        } else if !resource.has_finalizer(FINALIZER) {
            let mut finalizers = resource.metadata.finalizers.clone();
            finalizers.push(FINALIZER.to_string());
            version = self.store.update_finalizers(key, version, finalizers).await?;
            log.debug("added finalizer");
        }

        let mut status = resource.status.clone();
        let mut outcome = ReconcileOutcome::default();
        let mut failure = None;

        match desired_state(&resource, self.clock.now()) {
            Err(e) => {
                log.error(&e, "cannot evaluate duration");
                failure = Some(e.to_string());
            }
            Ok(DesiredState::Run { until }) => {
                let (requeue, selection_error) = self.run(&resource, &mut status, &log).await?;
                outcome.requeue |= requeue;
                outcome.requeue_after = until;
                failure = selection_error;
            }
            Ok(DesiredState::Stop(reason)) => {
                if reason == StopReason::DurationElapsed {
                    log.debug("duration elapsed, recovering");
                }
                outcome.requeue |= self.stop(&resource, &mut status, &log).await;
            }
        }
        self.update_conditions(&mut status, failure);

        if status != resource.status {
            version = self.write_status(key, version, &status, &log).await?;
        }

        let all_recovered = status.records.iter().all(|r| r.phase == Phase::NotInjected);
        if resource.is_deleting() && all_recovered {
            self.release_finalizer(&resource, version, &log).await?;
        }
        Ok(outcome)
    }

    /// Write `status` under the optimistic lock. A conflict re-reads the
    /// version and writes again: the records carry phases already applied to
    /// targets and must not be dropped.
    async fn write_status(
        &self,
        key: &ResourceKey,
        mut version: u64,
        status: &ChaosStatus,
        log: &Logger,
    ) -> Result<u64, ReconcileError> {
        let mut attempt = 1;
        loop {
            match self.store.update_status(key, version, status.clone()).await {
                Ok(v) => return Ok(v),
                Err(ClusterError::Conflict(_)) if attempt < CONFLICT_RETRIES => {
                    version = self.store.get_resource(key).await?.metadata.resource_version;
                    log.with_value("attempt", attempt)
                        .debug("status write conflicted, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drop the finalizer, re-reading the resource on conflict. The
    /// finalizer stays while the stored status still holds an injected record.
    async fn release_finalizer(
        &self,
        resource: &ChaosResource,
        mut version: u64,
        log: &Logger,
    ) -> Result<(), ReconcileError> {
        let key = resource.key();
        let mut finalizers = without_finalizer(resource);
        let mut attempt = 1;
        loop {
            match self.store.update_finalizers(&key, version, finalizers).await {
                Ok(_) => {
                    log.audit("all records recovered, finalizer removed");
                    return Ok(());
                }
                Err(ClusterError::Conflict(_)) if attempt < CONFLICT_RETRIES => {
                    let current = self.store.get_resource(&key).await?;
                    let injected = current
                        .status
                        .records
                        .iter()
                        .any(|r| r.phase != Phase::NotInjected);
                    if !current.has_finalizer(FINALIZER) || injected {
                        return Ok(());
                    }
                    version = current.metadata.resource_version;
                    finalizers = without_finalizer(&current);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Desired record ids for a running resource, plus the selection error
    /// if the selector could not be satisfied.
    async fn desired_targets(
        &self,
        resource: &ChaosResource,
        status: &mut ChaosStatus,
        log: &Logger,
    ) -> Result<(Vec<String>, Option<String>), ReconcileError> {
        let kind = resource.kind();
        if kind.is_singleton() {
            status.set_condition(ConditionType::Selected, true, None);
            return Ok((vec![singleton_id(resource)], None));
        }

        let selector = &resource.spec.selector;
        let mut pods = Vec::new();
        for ns in selector.namespaces_or(&resource.metadata.namespace) {
            pods.extend(self.pods.list_pods(&ns).await?);
        }
        let matches = matching_targets(selector, &pods, target_level(kind));
        let existing: Vec<String> = status.records.iter().map(|r| r.id.clone()).collect();

        let selection = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            select_sticky(selector, &matches, &existing, status.random_count, &mut *rng)
        };
        match selection {
            Ok(selection) => {
                if selection.random_count.is_some() {
                    status.random_count = selection.random_count;
                }
                status.set_condition(
                    ConditionType::Selected,
                    true,
                    Some(format!(
                        "selected {} of {} matching targets",
                        selection.targets.len(),
                        matches.len()
                    )),
                );
                Ok((selection.targets, None))
            }
            Err(e) => {
                // Keep what is still matched; never sample a partial set.
                log.error(&e, "target selection failed");
                status.set_condition(ConditionType::Selected, false, Some(e.to_string()));
                let matched: HashSet<&String> = matches.iter().collect();
                let kept = existing.into_iter().filter(|id| matched.contains(id)).collect();
                Ok((kept, Some(e.to_string())))
            }
        }
    }

    async fn run(
        &self,
        resource: &ChaosResource,
        status: &mut ChaosStatus,
        log: &Logger,
    ) -> Result<(bool, Option<String>), ReconcileError> {
        let (desired, selection_error) = self.desired_targets(resource, status, log).await?;
        let wanted: HashSet<&str> = desired.iter().map(String::as_str).collect();
        let mut requeue = false;

        // Recover and drop records that fell out of the selection.
        let mut records = std::mem::take(&mut status.records);
        let mut keep = vec![true; records.len()];
        for i in 0..records.len() {
            if wanted.contains(records[i].id.as_str()) {
                continue;
            }
            match self.dispatcher.recover(i, &records, resource).await {
                Ok(Phase::NotInjected) => {
                    log.with_value("target", &records[i].id)
                        .info("target no longer selected, record removed");
                    keep[i] = false;
                }
                Ok(phase) => records[i].phase = phase,
                Err(e) => {
                    log.with_value("target", &records[i].id)
                        .error(&e, "recover of deselected target failed");
                    records[i].phase = e.phase;
                    records[i].last_error = Some(e.error.to_string());
                    requeue = true;
                }
            }
        }
        let mut keep = keep.into_iter();
        records.retain(|_| keep.next().unwrap_or(true));

        let known: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
        for id in &desired {
            if !known.contains(id) {
                records.push(Record::new(id.clone()));
            }
        }

        for i in 0..records.len() {
            let record = &records[i];
            if record.phase != Phase::NotInjected
                || !wanted.contains(record.id.as_str())
                || record.attempts >= self.max_apply_attempts
            {
                continue;
            }
            requeue |= self.apply_one(i, &mut records, resource, log).await;
        }

        status.records = records;
        Ok((requeue, selection_error))
    }

    /// Apply record `i`; returns whether the resource should be requeued.
    async fn apply_one(
        &self,
        i: usize,
        records: &mut [Record],
        resource: &ChaosResource,
        log: &Logger,
    ) -> bool {
        let log = log.with_value("target", &records[i].id);
        match self.dispatcher.apply(i, records, resource).await {
            Ok(phase) => {
                let record = &mut records[i];
                record.phase = phase;
                record.attempts = 0;
                record.last_error = None;
                log.audit(format!("{} applied", resource.kind()));
                false
            }
            Err(e) => {
                let class = e.error.class();
                log.error(&e, "apply failed");
                {
                    let record = &mut records[i];
                    record.phase = e.phase;
                    record.last_error = Some(e.error.to_string());
                }
                match class {
                    ErrorClass::Transient | ErrorClass::TargetGone => true,
                    ErrorClass::Config => {
                        records[i].attempts = self.max_apply_attempts;
                        false
                    }
                    ErrorClass::Fatal => {
                        records[i].attempts += 1;
                        if records[i].phase == Phase::NotInjected {
                            if let Err(re) = self.dispatcher.rollback(i, records, resource).await {
                                log.error(&re, "rollback after failed apply failed");
                            }
                        }
                        records[i].attempts < self.max_apply_attempts
                    }
                }
            }
        }
    }

    async fn stop(&self, resource: &ChaosResource, status: &mut ChaosStatus, log: &Logger) -> bool {
        let mut requeue = false;
        for i in 0..status.records.len() {
            if status.records[i].phase != Phase::Injected {
                continue;
            }
            let target_log = log.with_value("target", &status.records[i].id);
            match self.dispatcher.recover(i, &status.records, resource).await {
                Ok(phase) => {
                    status.records[i].phase = phase;
                    status.records[i].last_error = None;
                    target_log.audit(format!("{} recovered", resource.kind()));
                }
                Err(e) => {
                    target_log.error(&e, "recover failed");
                    status.records[i].phase = e.phase;
                    status.records[i].last_error = Some(e.error.to_string());
                    requeue = true;
                }
            }
        }
        requeue
    }

    fn update_conditions(&self, status: &mut ChaosStatus, failure: Option<String>) {
        let records = &status.records;
        let all_injected = !records.is_empty() && records.iter().all(|r| r.phase == Phase::Injected);
        let all_recovered = records.iter().all(|r| r.phase == Phase::NotInjected);
        let mut failures: Vec<String> = failure.into_iter().collect();
        failures.extend(
            records
                .iter()
                .filter(|r| r.attempts >= self.max_apply_attempts)
                .map(|r| match &r.last_error {
                    Some(err) => format!("{}: {}", r.id, err),
                    None => r.id.clone(),
                }),
        );

        status.set_condition(ConditionType::AllInjected, all_injected, None);
        status.set_condition(ConditionType::AllRecovered, all_recovered, None);
        if failures.is_empty() {
            status.set_condition(ConditionType::Failed, false, None);
        } else {
            status.set_condition(ConditionType::Failed, true, Some(failures.join("; ")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ContainerStatus, MemoryCluster, Pod};
    use crate::dispatch::testing::{dispatcher, Scripted};
    use crate::dispatch::{Binding, DispatcherBuilder, TargetImpl};
    use crate::error::{ImplError, PhaseError};
    use crate::resource::{ChaosSpec, ObjectMeta};
    use crate::selector::{SelectorMode, TargetSelector};
    use crate::timer::ManualClock;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Env {
        cluster: Arc<MemoryCluster>,
        clock: Arc<ManualClock>,
        imp: Arc<Scripted>,
        reconciler: Reconciler,
    }

    fn pod(i: usize) -> Pod {
        Pod {
            namespace: "shop".into(),
            name: format!("p{i}"),
            labels: BTreeMap::from([("app".to_string(), "cart".to_string())]),
            annotations: BTreeMap::new(),
            phase: "Running".into(),
            node_name: "node-1".into(),
            containers: vec![ContainerStatus {
                name: "app".into(),
                container_id: format!("containerd://p{i}"),
            }],
        }
    }

    async fn env(pods: usize) -> Env {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
        let cluster = Arc::new(MemoryCluster::new(clock.clone()));
        for i in 0..pods {
            cluster.upsert_pod(pod(i)).await;
        }
        let imp = Arc::new(Scripted::default());
        let reconciler = Reconciler::new(
            cluster.clone(),
            cluster.clone(),
            dispatcher(imp.clone()),
            clock.clone(),
            Logger::new("test"),
        )
        .with_rng_seed(1);
        Env {
            cluster,
            clock,
            imp,
            reconciler,
        }
    }

    fn experiment(mode: SelectorMode, value: Option<&str>, duration: Option<&str>) -> ChaosResource {
        ChaosResource {
            metadata: ObjectMeta {
                name: "fuse".into(),
                namespace: "shop".into(),
                ..Default::default()
            },
            spec: ChaosSpec {
                selector: TargetSelector {
                    label_selectors: BTreeMap::from([("app".to_string(), "cart".to_string())]),
                    mode,
                    value: value.map(String::from),
                    ..Default::default()
                },
                duration: duration.map(String::from),
                fault: FaultSpec::FuseDevice,
            },
            status: Default::default(),
        }
    }

    impl Env {
        async fn status(&self, key: &ResourceKey) -> ChaosStatus {
            self.cluster.get_resource(key).await.unwrap().status
        }

        fn fail_apply(&self, make: fn() -> ImplError) {
            *self.imp.fail_apply.lock().unwrap() = Some(make);
        }
    }

    fn condition(status: &ChaosStatus, t: ConditionType) -> bool {
        status.condition(t).map(|c| c.status).unwrap_or(false)
    }

    #[tokio::test]
    async fn fixed_selection_injects_and_holds_finalizer() {
        let env = env(5).await;
        let key = env
            .cluster
            .apply_resource(experiment(SelectorMode::Fixed, Some("2"), None))
            .await;

        let outcome = env.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::default());

        let res = env.cluster.get_resource(&key).await.unwrap();
        assert!(res.has_finalizer(FINALIZER));
        assert_eq!(res.status.records.len(), 2);
        assert!(res.status.records.iter().all(|r| r.phase == Phase::Injected));
        assert!(condition(&res.status, ConditionType::AllInjected));
        assert!(condition(&res.status, ConditionType::Selected));
        assert_eq!(env.imp.applies(), 2);

        // A second pass keeps the same targets and applies nothing new.
        env.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(env.status(&key).await.records, res.status.records);
        assert_eq!(env.imp.applies(), 2);
    }

    #[tokio::test]
    async fn duration_expiry_recovers_once() {
        let env = env(3).await;
        let key = env
            .cluster
            .apply_resource(experiment(SelectorMode::All, None, Some("30s")))
            .await;

        let outcome = env.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(outcome.requeue_after, Some(Duration::from_secs(30)));

        env.clock.advance(Duration::from_secs(10));
        let outcome = env.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(outcome.requeue_after, Some(Duration::from_secs(20)));

        env.clock.advance(Duration::from_secs(20));
        let outcome = env.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::default());
        let status = env.status(&key).await;
        assert!(status.records.iter().all(|r| r.phase == Phase::NotInjected));
        assert!(condition(&status, ConditionType::AllRecovered));
        assert_eq!(env.imp.recovers(), 3);

        env.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(env.imp.recovers(), 3);
        assert_eq!(env.imp.applies(), 3);
    }

    #[tokio::test]
    async fn transient_apply_error_requeues_without_counting() {
        let env = env(1).await;
        env.fail_apply(|| ImplError::Unreachable {
            address: "10.0.0.1:31767".into(),
            reason: "connection refused".into(),
        });
        let key = env
            .cluster
            .apply_resource(experiment(SelectorMode::All, None, None))
            .await;

        let outcome = env.reconciler.reconcile(&key).await.unwrap();
        assert!(outcome.requeue);
        let record = &env.status(&key).await.records[0];
        assert_eq!(record.phase, Phase::NotInjected);
        assert_eq!(record.attempts, 0);
        assert!(record.last_error.is_some());
        assert_eq!(env.imp.recovers(), 0);
    }

    #[tokio::test]
    async fn fatal_apply_is_rolled_back_and_bounded() {
        let env = env(1).await;
        env.fail_apply(|| ImplError::Rejected("jattach failed".into()));
        let key = env
            .cluster
            .apply_resource(experiment(SelectorMode::All, None, None))
            .await;

        assert!(env.reconciler.reconcile(&key).await.unwrap().requeue);
        assert!(env.reconciler.reconcile(&key).await.unwrap().requeue);
        assert!(!env.reconciler.reconcile(&key).await.unwrap().requeue);
        assert_eq!(env.imp.applies(), 3);
        assert_eq!(env.imp.recovers(), 3);

        env.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(env.imp.applies(), 3);
        let status = env.status(&key).await;
        assert!(condition(&status, ConditionType::Failed));
        assert!(status
            .condition(ConditionType::Failed)
            .and_then(|c| c.message.as_deref())
            .unwrap()
            .contains("jattach failed"));
    }

    #[tokio::test]
    async fn config_error_is_never_retried() {
        let env = env(1).await;
        env.fail_apply(|| ImplError::Config("class is required".into()));
        let key = env
            .cluster
            .apply_resource(experiment(SelectorMode::All, None, None))
            .await;

        assert!(!env.reconciler.reconcile(&key).await.unwrap().requeue);
        env.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(env.imp.applies(), 1);
        assert_eq!(env.imp.recovers(), 0);
        assert!(condition(&env.status(&key).await, ConditionType::Failed));
    }

    #[tokio::test]
    async fn deselected_target_is_recovered_and_dropped() {
        let env = env(2).await;
        let key = env
            .cluster
            .apply_resource(experiment(SelectorMode::All, None, None))
            .await;
        env.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(env.status(&key).await.records.len(), 2);

        env.cluster.remove_pod("shop", "p1").await;
        env.reconciler.reconcile(&key).await.unwrap();
        let status = env.status(&key).await;
        assert_eq!(status.records.len(), 1);
        assert_eq!(status.records[0].id, "shop/p0");
        assert_eq!(env.imp.recovers(), 1);
    }

    #[tokio::test]
    async fn deletion_recovers_then_releases_finalizer() {
        let env = env(2).await;
        let key = env
            .cluster
            .apply_resource(experiment(SelectorMode::All, None, None))
            .await;
        env.reconciler.reconcile(&key).await.unwrap();

        *env.imp.fail_recover.lock().unwrap() = Some(|| ImplError::Daemon("busy".into()));
        env.cluster.request_deletion(&key).await;
        assert!(env.reconciler.reconcile(&key).await.unwrap().requeue);
        assert!(env.cluster.get_resource(&key).await.unwrap().has_finalizer(FINALIZER));

        *env.imp.fail_recover.lock().unwrap() = None;
        env.reconciler.reconcile(&key).await.unwrap();
        assert!(env.cluster.get_resource(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn too_few_targets_fails_selection() {
        let env = env(2).await;
        let key = env
            .cluster
            .apply_resource(experiment(SelectorMode::Fixed, Some("3"), None))
            .await;
        let outcome = env.reconciler.reconcile(&key).await.unwrap();
        assert!(!outcome.requeue);
        let status = env.status(&key).await;
        assert!(status.records.is_empty());
        assert!(!condition(&status, ConditionType::Selected));
        assert!(condition(&status, ConditionType::Failed));
        assert_eq!(env.imp.applies(), 0);
    }

    /// Marks the resource for deletion while the fault is being applied.
    struct DeletesDuringApply {
        cluster: Arc<MemoryCluster>,
        inner: Arc<Scripted>,
    }

    #[async_trait]
    impl TargetImpl for DeletesDuringApply {
        async fn apply(
            &self,
            index: usize,
            records: &[Record],
            resource: &ChaosResource,
        ) -> Result<Phase, PhaseError> {
            self.cluster.request_deletion(&resource.key()).await;
            TargetImpl::apply(&*self.inner, index, records, resource).await
        }

        async fn recover(
            &self,
            index: usize,
            records: &[Record],
            resource: &ChaosResource,
        ) -> Result<Phase, PhaseError> {
            TargetImpl::recover(&*self.inner, index, records, resource).await
        }
    }

    /// Store that answers the next N writes of each kind with a conflict.
    struct ConflictingStore {
        inner: Arc<MemoryCluster>,
        status_conflicts: AtomicUsize,
        finalizer_conflicts: AtomicUsize,
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl ChaosStore for ConflictingStore {
        async fn get_resource(&self, key: &ResourceKey) -> Result<ChaosResource, ClusterError> {
            self.inner.get_resource(key).await
        }

        async fn list_resources(&self) -> Result<Vec<ResourceKey>, ClusterError> {
            self.inner.list_resources().await
        }

        async fn update_status(
            &self,
            key: &ResourceKey,
            resource_version: u64,
            status: ChaosStatus,
        ) -> Result<u64, ClusterError> {
            if take_one(&self.status_conflicts) {
                return Err(ClusterError::Conflict(key.to_string()));
            }
            self.inner.update_status(key, resource_version, status).await
        }

        async fn update_finalizers(
            &self,
            key: &ResourceKey,
            resource_version: u64,
            finalizers: Vec<String>,
        ) -> Result<u64, ClusterError> {
            if take_one(&self.finalizer_conflicts) {
                return Err(ClusterError::Conflict(key.to_string()));
            }
            self.inner
                .update_finalizers(key, resource_version, finalizers)
                .await
        }
    }

    #[tokio::test]
    async fn deletion_during_apply_keeps_injected_records() {
        let env = env(1).await;
        let deleting = Arc::new(DeletesDuringApply {
            cluster: env.cluster.clone(),
            inner: env.imp.clone(),
        });
        let mut builder = DispatcherBuilder::new();
        for kind in FaultKind::ALL {
            let binding = if kind.is_singleton() {
                Binding::Singleton(env.imp.clone())
            } else {
                Binding::PerTarget(deleting.clone())
            };
            builder = builder.register(kind, binding);
        }
        let reconciler = Reconciler::new(
            env.cluster.clone(),
            env.cluster.clone(),
            builder.build().unwrap(),
            env.clock.clone(),
            Logger::new("test"),
        );
        let key = env
            .cluster
            .apply_resource(experiment(SelectorMode::All, None, None))
            .await;

        reconciler.reconcile(&key).await.unwrap();
        let res = env.cluster.get_resource(&key).await.unwrap();
        assert!(res.is_deleting());
        assert!(res.has_finalizer(FINALIZER));
        assert_eq!(res.status.records.len(), 1);
        assert_eq!(res.status.records[0].phase, Phase::Injected);

        reconciler.reconcile(&key).await.unwrap();
        assert_eq!(env.imp.applies(), 1);
        assert_eq!(env.imp.recovers(), 1);
        assert!(env.cluster.get_resource(&key).await.unwrap_err().is_not_found());
    }

    fn conflicting(env: &Env) -> (Arc<ConflictingStore>, Reconciler) {
        let store = Arc::new(ConflictingStore {
            inner: env.cluster.clone(),
            status_conflicts: AtomicUsize::new(0),
            finalizer_conflicts: AtomicUsize::new(0),
        });
        let reconciler = Reconciler::new(
            store.clone(),
            env.cluster.clone(),
            dispatcher(env.imp.clone()),
            env.clock.clone(),
            Logger::new("test"),
        );
        (store, reconciler)
    }

    #[tokio::test]
    async fn status_write_conflict_is_retried() {
        let env = env(2).await;
        let (store, reconciler) = conflicting(&env);
        let key = env
            .cluster
            .apply_resource(experiment(SelectorMode::All, None, None))
            .await;

        store.status_conflicts.store(2, Ordering::SeqCst);
        reconciler.reconcile(&key).await.unwrap();
        let status = env.status(&key).await;
        assert_eq!(status.records.len(), 2);
        assert!(status.records.iter().all(|r| r.phase == Phase::Injected));

        // Past the retry budget the error surfaces and the next pass writes
        // the same records without applying again.
        env.cluster.remove_pod("shop", "p1").await;
        store
            .status_conflicts
            .store(CONFLICT_RETRIES as usize, Ordering::SeqCst);
        assert!(reconciler.reconcile(&key).await.is_err());
        reconciler.reconcile(&key).await.unwrap();
        assert_eq!(env.status(&key).await.records.len(), 1);
        assert_eq!(env.imp.applies(), 2);
    }

    #[tokio::test]
    async fn finalizer_release_conflict_is_retried() {
        let env = env(1).await;
        let (store, reconciler) = conflicting(&env);
        let key = env
            .cluster
            .apply_resource(experiment(SelectorMode::All, None, None))
            .await;
        reconciler.reconcile(&key).await.unwrap();

        env.cluster.request_deletion(&key).await;
        store.finalizer_conflicts.store(1, Ordering::SeqCst);
        reconciler.reconcile(&key).await.unwrap();
        assert_eq!(env.imp.recovers(), 1);
        assert!(env.cluster.get_resource(&key).await.unwrap_err().is_not_found());
    }

    #[test]
    fn singleton_id_names_the_proxy_object() {
        let mut res = experiment(SelectorMode::All, None, None);
        res.spec.fault = FaultSpec::ProxyFault(proxy_fault::ProxyFaultSpec {
            target_service: "cart".into(),
            envoy_config_namespace: Some("mesh".into()),
            ..Default::default()
        });
        assert_eq!(singleton_id(&res), "mesh/chaos-fuse");
    }
}
