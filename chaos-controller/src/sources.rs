//! Declarative inputs read from disk: the cluster inventory and the
//! directory of chaos resource manifests.

use anyhow::{Context, Result};
use chaos_common::Logger;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::cluster::{MemoryCluster, Pod};
use crate::config::SourcesConfig;
use crate::resource::{ChaosResource, ResourceKey};

#[derive(Debug, Clone, Deserialize)]
pub struct NodeEntry {
    pub name: String,
    /// `host` or `host:port` of the node's daemon.
    pub address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
    #[serde(default)]
    pub pods: Vec<Pod>,
}

pub fn load_inventory(path: &Path) -> Result<Inventory> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read inventory {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("failed to parse inventory {}", path.display()))
}

fn is_manifest(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Parsed manifests in file name order, and the files that failed to parse.
pub fn load_manifests(dir: &Path) -> Result<(Vec<ChaosResource>, Vec<(PathBuf, String)>)> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("failed to read manifest dir {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_manifest(p))
        .collect();
    paths.sort();

    let mut resources = Vec::new();
    let mut broken = Vec::new();
    for path in paths {
        let parsed = fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_yaml::from_str::<ChaosResource>(&raw).map_err(|e| e.to_string()));
        match parsed {
            Ok(resource) => resources.push(resource),
            Err(e) => broken.push((path, e)),
        }
    }
    Ok((resources, broken))
}

/// Keeps a [`MemoryCluster`] in step with the files on disk.
pub struct FileSources {
    config: SourcesConfig,
    /// Keys declared by the previous sync.
    declared: Mutex<BTreeSet<ResourceKey>>,
    log: Logger,
}

impl FileSources {
    pub fn new(config: SourcesConfig, log: Logger) -> Self {
        Self {
            config,
            declared: Mutex::new(BTreeSet::new()),
            log: log.with_name("sources"),
        }
    }

    /// Load inventory and manifests into `cluster`. Returns the keys that
    /// changed or disappeared and need a reconcile.
    pub async fn sync(&self, cluster: &MemoryCluster) -> Result<Vec<ResourceKey>> {
        if self.config.inventory_path.exists() {
            let inventory = load_inventory(&self.config.inventory_path)?;
            let nodes: HashMap<String, String> = inventory
                .nodes
                .into_iter()
                .map(|n| (n.name, n.address))
                .collect();
            self.log
                .with_value("pods", inventory.pods.len())
                .with_value("nodes", nodes.len())
                .debug("inventory loaded");
            cluster.replace_inventory(inventory.pods, nodes).await;
        } else {
            self.log
                .with_value("path", self.config.inventory_path.display())
                .warn("inventory file missing, keeping current inventory");
        }

        let (resources, broken) = load_manifests(&self.config.manifests_dir)?;
        for (path, err) in &broken {
            self.log
                .with_value("path", path.display())
                .warn(format!("skipping malformed manifest: {err}"));
        }

        let mut declared = BTreeSet::new();
        let mut touched = Vec::new();
        for resource in resources {
            let key = cluster.apply_resource(resource).await;
            declared.insert(key.clone());
            touched.push(key);
        }

        let mut previous = self.declared.lock().await;
        if broken.is_empty() {
            for key in previous.difference(&declared) {
                if cluster.request_deletion(key).await {
                    self.log
                        .with_value("resource", key)
                        .info("manifest removed, deleting resource");
                    touched.push(key.clone());
                }
            }
            *previous = declared;
        } else {
            // A key may hide behind a broken file; only ever add.
            previous.extend(declared);
        }
        Ok(touched)
    }
}
