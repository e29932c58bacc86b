//! Seams to the cluster: pod inventory, unstructured objects, and the store
//! of chaos resources.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ClusterError;
use crate::resource::{ChaosResource, ChaosStatus, ResourceKey};

mod memory;

pub use memory::MemoryCluster;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub name: String,
    /// `scheme://id`; empty while the container has not started.
    #[serde(default)]
    pub container_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default = "default_pod_phase")]
    pub phase: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub containers: Vec<ContainerStatus>,
}

fn default_pod_phase() -> String {
    "Running".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Object of a kind this crate does not model, e.g. a proxy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicObject {
    pub api_version: String,
    pub kind: String,
    pub metadata: DynamicMeta,
    pub spec: serde_json::Value,
}

#[async_trait]
pub trait PodApi: Send + Sync {
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, ClusterError>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError>;
    /// Address (`host` or `host:port`) of the daemon serving `node`.
    async fn node_address(&self, node: &str) -> Result<String, ClusterError>;
}

#[async_trait]
pub trait ObjectApi: Send + Sync {
    /// Fails with `AlreadyExists` when the object is present.
    async fn create_object(&self, obj: &DynamicObject) -> Result<(), ClusterError>;
    /// Fails with `NotFound` when the object is absent.
    async fn update_object(&self, obj: &DynamicObject) -> Result<(), ClusterError>;
    async fn get_object(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, ClusterError>;
    async fn delete_object(&self, kind: &str, namespace: &str, name: &str)
        -> Result<(), ClusterError>;
}

/// Chaos resources with optimistic concurrency on writes.
#[async_trait]
pub trait ChaosStore: Send + Sync {
    async fn get_resource(&self, key: &ResourceKey) -> Result<ChaosResource, ClusterError>;
    async fn list_resources(&self) -> Result<Vec<ResourceKey>, ClusterError>;
    /// Returns the new resource version; `Conflict` if `resource_version` is
    /// stale.
    async fn update_status(
        &self,
        key: &ResourceKey,
        resource_version: u64,
        status: ChaosStatus,
    ) -> Result<u64, ClusterError>;
    /// Once a deleting resource has no finalizers left it is removed.
    async fn update_finalizers(
        &self,
        key: &ResourceKey,
        resource_version: u64,
        finalizers: Vec<String>,
    ) -> Result<u64, ClusterError>;
}
