use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/chaos-controller/controller.toml";
const ENV_CONFIG_PATH: &str = "CHAOS_CONTROLLER_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

impl Config {
    /// Load configuration from `path`, or from `CHAOS_CONTROLLER_CONFIG` when
    /// set. A missing or malformed file yields defaults.
    pub fn load(path: &Path) -> Self {
        let path = std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| path.to_path_buf());
        match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!(
                        "[controller] ignoring malformed config {}: {e}",
                        path.display()
                    );
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControllerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Period of the full resync of manifests and inventory.
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    /// Tries per record before a failing apply is given up.
    #[serde(default = "default_max_apply_attempts")]
    pub max_apply_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
}

impl ControllerConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            resync_interval_secs: default_resync_interval_secs(),
            max_apply_attempts: default_max_apply_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_secs: default_backoff_max_secs(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_resync_interval_secs() -> u64 {
    30
}
fn default_max_apply_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_max_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    /// Port of the node daemon when a node address carries none.
    #[serde(default = "default_daemon_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl DaemonConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_daemon_port(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_daemon_port() -> u16 {
    chaos_common::protocol::DEFAULT_DAEMON_PORT
}
fn default_request_timeout_secs() -> u64 {
    70
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourcesConfig {
    /// Directory of chaos resource manifests (`*.yaml`, `*.yml`).
    #[serde(default = "default_manifests_dir")]
    pub manifests_dir: PathBuf,
    /// YAML listing nodes and pods.
    #[serde(default = "default_inventory_path")]
    pub inventory_path: PathBuf,
    /// Where proxy fault configs are written for the mesh control plane.
    #[serde(default)]
    pub proxy_config_dir: Option<PathBuf>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            manifests_dir: default_manifests_dir(),
            inventory_path: default_inventory_path(),
            proxy_config_dir: None,
        }
    }
}

fn default_manifests_dir() -> PathBuf {
    PathBuf::from("/etc/chaos-controller/experiments")
}
fn default_inventory_path() -> PathBuf {
    PathBuf::from("/etc/chaos-controller/inventory.yaml")
}
