//! Routing of a resource's fault kind to the implementation bound to it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{DispatchError, ImplError, PhaseError};
use crate::resource::{ChaosResource, FaultKind, Phase, Record};

/// Fault applied to one selected target at a time.
#[async_trait]
pub trait TargetImpl: Send + Sync {
    async fn apply(
        &self,
        index: usize,
        records: &[Record],
        resource: &ChaosResource,
    ) -> Result<Phase, PhaseError>;

    async fn recover(
        &self,
        index: usize,
        records: &[Record],
        resource: &ChaosResource,
    ) -> Result<Phase, PhaseError>;
}

/// Fault applied once for the whole resource.
#[async_trait]
pub trait ResourceImpl: Send + Sync {
    async fn apply(&self, resource: &ChaosResource) -> Result<Phase, PhaseError>;
    async fn recover(&self, resource: &ChaosResource) -> Result<Phase, PhaseError>;
}

#[derive(Clone)]
pub enum Binding {
    PerTarget(Arc<dyn TargetImpl>),
    Singleton(Arc<dyn ResourceImpl>),
}

impl Binding {
    pub fn is_singleton(&self) -> bool {
        matches!(self, Binding::Singleton(_))
    }

    fn scope(&self) -> &'static str {
        if self.is_singleton() {
            "singleton"
        } else {
            "per-target"
        }
    }
}

#[derive(Default)]
pub struct DispatcherBuilder {
    bindings: HashMap<FaultKind, Binding>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: FaultKind, binding: Binding) -> Self {
        self.bindings.insert(kind, binding);
        self
    }

    /// Every fault kind must be bound, with the scope the kind declares.
    pub fn build(self) -> Result<Dispatcher, DispatchError> {
        for kind in FaultKind::ALL {
            let binding = self
                .bindings
                .get(&kind)
                .ok_or(DispatchError::Missing(kind.as_str()))?;
            if binding.is_singleton() != kind.is_singleton() {
                return Err(DispatchError::ScopeMismatch {
                    action: kind.as_str(),
                    registered: binding.scope(),
                    expected: if kind.is_singleton() {
                        "singleton"
                    } else {
                        "per-target"
                    },
                });
            }
        }
        Ok(Dispatcher {
            bindings: self.bindings,
        })
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    bindings: HashMap<FaultKind, Binding>,
}

impl Dispatcher {
    pub fn binding(&self, kind: FaultKind) -> Result<&Binding, DispatchError> {
        self.bindings
            .get(&kind)
            .ok_or_else(|| DispatchError::UnknownAction(kind.as_str().to_string()))
    }

    fn record<'a>(&self, index: usize, records: &'a [Record]) -> Result<&'a Record, PhaseError> {
        records.get(index).ok_or_else(|| {
            ImplError::Config(format!("record index {index} out of range")).at(Phase::NotInjected)
        })
    }

    pub async fn apply(
        &self,
        index: usize,
        records: &[Record],
        resource: &ChaosResource,
    ) -> Result<Phase, PhaseError> {
        let current = self.record(index, records)?.phase;
        match self
            .binding(resource.kind())
            .map_err(|e| ImplError::from(e).at(current))?
        {
            Binding::PerTarget(imp) => imp.apply(index, records, resource).await,
            Binding::Singleton(imp) => imp.apply(resource).await,
        }
    }

    /// Records already `NotInjected` are reported as such without calling
    /// the implementation.
    pub async fn recover(
        &self,
        index: usize,
        records: &[Record],
        resource: &ChaosResource,
    ) -> Result<Phase, PhaseError> {
        if self.record(index, records)?.phase == Phase::NotInjected {
            return Ok(Phase::NotInjected);
        }
        self.force_recover(index, records, resource).await
    }

    /// Recover regardless of the recorded phase, used to clean up after a
    /// failed apply.
    pub async fn rollback(
        &self,
        index: usize,
        records: &[Record],
        resource: &ChaosResource,
    ) -> Result<Phase, PhaseError> {
        self.record(index, records)?;
        self.force_recover(index, records, resource).await
    }

    async fn force_recover(
        &self,
        index: usize,
        records: &[Record],
        resource: &ChaosResource,
    ) -> Result<Phase, PhaseError> {
        match self
            .binding(resource.kind())
            .map_err(|e| ImplError::from(e).at(records[index].phase))?
        {
            Binding::PerTarget(imp) => imp.recover(index, records, resource).await,
            Binding::Singleton(imp) => imp.recover(resource).await,
        }
    }
}
