use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{ChaosStore, DynamicObject, ObjectApi, Pod, PodApi};
use crate::error::ClusterError;
use crate::resource::{ChaosResource, ChaosStatus, ResourceKey};
use crate::timer::Clock;

type ObjectKey = (String, String, String);

/// In-process cluster state. Proxy objects can be mirrored as JSON files for
/// a downstream control plane.
pub struct MemoryCluster {
    pods: RwLock<BTreeMap<(String, String), Pod>>,
    nodes: RwLock<HashMap<String, String>>,
    resources: RwLock<BTreeMap<ResourceKey, ChaosResource>>,
    objects: RwLock<BTreeMap<ObjectKey, DynamicObject>>,
    object_dir: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl MemoryCluster {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            pods: RwLock::new(BTreeMap::new()),
            nodes: RwLock::new(HashMap::new()),
            resources: RwLock::new(BTreeMap::new()),
            objects: RwLock::new(BTreeMap::new()),
            object_dir: None,
            clock,
        }
    }

    pub fn with_object_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.object_dir = Some(dir.into());
        self
    }

    pub async fn upsert_pod(&self, pod: Pod) {
        self.pods
            .write()
            .await
            .insert((pod.namespace.clone(), pod.name.clone()), pod);
    }

    pub async fn remove_pod(&self, namespace: &str, name: &str) {
        self.pods
            .write()
            .await
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub async fn set_node_address(&self, node: &str, address: &str) {
        self.nodes
            .write()
            .await
            .insert(node.to_string(), address.to_string());
    }

    /// Replace pods and node addresses wholesale.
    pub async fn replace_inventory(&self, pods: Vec<Pod>, nodes: HashMap<String, String>) {
        let pods = pods
            .into_iter()
            .map(|p| ((p.namespace.clone(), p.name.clone()), p))
            .collect();
        *self.pods.write().await = pods;
        *self.nodes.write().await = nodes;
    }

    /// Create the resource, or update its spec keeping status and metadata.
    pub async fn apply_resource(&self, manifest: ChaosResource) -> ResourceKey {
        let key = manifest.key();
        let mut resources = self.resources.write().await;
        match resources.get_mut(&key) {
            Some(existing) => {
                if existing.spec != manifest.spec || existing.metadata.labels != manifest.metadata.labels {
                    existing.spec = manifest.spec;
                    existing.metadata.labels = manifest.metadata.labels;
                    existing.metadata.resource_version += 1;
                }
            }
            None => {
                let mut resource = manifest;
                resource.metadata.resource_version = 1;
                resource.metadata.creation_timestamp = Some(self.clock.now());
                resource.metadata.deletion_timestamp = None;
                resource.status = ChaosStatus::default();
                resources.insert(key.clone(), resource);
            }
        }
        key
    }

    /// Mark for deletion. Resources without finalizers go away at once.
    pub async fn request_deletion(&self, key: &ResourceKey) -> bool {
        let mut resources = self.resources.write().await;
        let Some(resource) = resources.get_mut(key) else {
            return false;
        };
        if resource.metadata.finalizers.is_empty() {
            resources.remove(key);
        } else if resource.metadata.deletion_timestamp.is_none() {
            resource.metadata.deletion_timestamp = Some(self.clock.now());
            resource.metadata.resource_version += 1;
        }
        true
    }

    pub async fn objects(&self) -> Vec<DynamicObject> {
        self.objects.read().await.values().cloned().collect()
    }

    fn object_file(&self, obj_key: &ObjectKey) -> Option<PathBuf> {
        let (kind, namespace, name) = obj_key;
        self.object_dir
            .as_ref()
            .map(|dir| dir.join(format!("{namespace}.{kind}.{name}.json")))
    }

    async fn mirror(&self, obj_key: &ObjectKey, obj: Option<&DynamicObject>) -> Result<(), ClusterError> {
        let Some(path) = self.object_file(obj_key) else {
            return Ok(());
        };
        let result = match obj {
            Some(obj) => {
                let body = serde_json::to_vec_pretty(obj)
                    .map_err(|e| ClusterError::Invalid(e.to_string()))?;
                tokio::fs::write(&path, body).await
            }
            None => match tokio::fs::remove_file(&path).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        result.map_err(|e| ClusterError::Unavailable(format!("{}: {e}", path.display())))
    }
}

fn object_key(kind: &str, namespace: &str, name: &str) -> ObjectKey {
    (kind.to_string(), namespace.to_string(), name.to_string())
}

#[async_trait]
impl PodApi for MemoryCluster {
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, ClusterError> {
        Ok(self
            .pods
            .read()
            .await
            .values()
            .filter(|p| p.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        self.pods
            .read()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::not_found("Pod", namespace, name))
    }

    async fn node_address(&self, node: &str) -> Result<String, ClusterError> {
        self.nodes
            .read()
            .await
            .get(node)
            .cloned()
            .ok_or_else(|| ClusterError::not_found("Node", "", node))
    }
}

#[async_trait]
impl ObjectApi for MemoryCluster {
    async fn create_object(&self, obj: &DynamicObject) -> Result<(), ClusterError> {
        let key = object_key(&obj.kind, &obj.metadata.namespace, &obj.metadata.name);
        {
            let mut objects = self.objects.write().await;
            if objects.contains_key(&key) {
                return Err(ClusterError::already_exists(&key.0, &key.1, &key.2));
            }
            objects.insert(key.clone(), obj.clone());
        }
        self.mirror(&key, Some(obj)).await
    }

    async fn update_object(&self, obj: &DynamicObject) -> Result<(), ClusterError> {
        let key = object_key(&obj.kind, &obj.metadata.namespace, &obj.metadata.name);
        {
            let mut objects = self.objects.write().await;
            let Some(existing) = objects.get_mut(&key) else {
                return Err(ClusterError::not_found(&key.0, &key.1, &key.2));
            };
            *existing = obj.clone();
        }
        self.mirror(&key, Some(obj)).await
    }

    async fn get_object(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, ClusterError> {
        self.objects
            .read()
            .await
            .get(&object_key(kind, namespace, name))
            .cloned()
            .ok_or_else(|| ClusterError::not_found(kind, namespace, name))
    }

    async fn delete_object(&self, kind: &str, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let key = object_key(kind, namespace, name);
        if self.objects.write().await.remove(&key).is_none() {
            return Err(ClusterError::not_found(kind, namespace, name));
        }
        self.mirror(&key, None).await
    }
}

#[async_trait]
impl ChaosStore for MemoryCluster {
    async fn get_resource(&self, key: &ResourceKey) -> Result<ChaosResource, ClusterError> {
        self.resources
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::not_found("Chaos", &key.namespace, &key.name))
    }

    async fn list_resources(&self) -> Result<Vec<ResourceKey>, ClusterError> {
        Ok(self.resources.read().await.keys().cloned().collect())
    }

    async fn update_status(
        &self,
        key: &ResourceKey,
        resource_version: u64,
        status: ChaosStatus,
    ) -> Result<u64, ClusterError> {
        let mut resources = self.resources.write().await;
        let resource = resources
            .get_mut(key)
            .ok_or_else(|| ClusterError::not_found("Chaos", &key.namespace, &key.name))?;
        if resource.metadata.resource_version != resource_version {
            return Err(ClusterError::Conflict(key.to_string()));
        }
        resource.status = status;
        resource.metadata.resource_version += 1;
        Ok(resource.metadata.resource_version)
    }

    async fn update_finalizers(
        &self,
        key: &ResourceKey,
        resource_version: u64,
        finalizers: Vec<String>,
    ) -> Result<u64, ClusterError> {
        let mut resources = self.resources.write().await;
        let resource = resources
            .get_mut(key)
            .ok_or_else(|| ClusterError::not_found("Chaos", &key.namespace, &key.name))?;
        if resource.metadata.resource_version != resource_version {
            return Err(ClusterError::Conflict(key.to_string()));
        }
        resource.metadata.finalizers = finalizers;
        resource.metadata.resource_version += 1;
        let version = resource.metadata.resource_version;
        if resource.is_deleting() && resource.metadata.finalizers.is_empty() {
            resources.remove(key);
        }
        Ok(version)
    }
}
