use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::runtime::RuntimeKind;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/chaosd/chaosd.toml";
const ENV_CONFIG_PATH: &str = "CHAOSD_CONFIG";
const ENV_BYTEMAN_HOME: &str = "BYTEMAN_HOME";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub attach: AttachConfig,
    #[serde(default)]
    pub cgroup: CgroupConfig,
}

impl Config {
    /// Load configuration from `path`. The `CHAOSD_CONFIG` environment
    /// variable takes precedence over the given path. If the file is missing
    /// or fails to parse, defaults are returned.
    pub fn load(path: &Path) -> Self {
        let path = std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| path.to_path_buf());
        match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("[chaosd] ignoring malformed config {}: {e}", path.display());
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Upper bound for one request, including every command it spawns.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    format!("0.0.0.0:{}", chaos_common::protocol::DEFAULT_DAEMON_PORT)
}
fn default_request_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Runtime assumed for container ids without a `scheme://` prefix.
    #[serde(default = "default_runtime_kind")]
    pub default_runtime: RuntimeKind,
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
    #[serde(default = "default_crictl_bin")]
    pub crictl_bin: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_runtime: default_runtime_kind(),
            docker_bin: default_docker_bin(),
            crictl_bin: default_crictl_bin(),
        }
    }
}

fn default_runtime_kind() -> RuntimeKind {
    RuntimeKind::Containerd
}
fn default_docker_bin() -> String {
    "docker".to_string()
}
fn default_crictl_bin() -> String {
    "crictl".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AttachConfig {
    /// Installation of the bytecode-rewriting agent on this node. Falls back
    /// to `$BYTEMAN_HOME`.
    #[serde(default = "default_byteman_home")]
    pub byteman_home: Option<PathBuf>,
    /// Where agent jars are copied inside the target's mount namespace.
    #[serde(default = "default_container_byteman_dir")]
    pub container_byteman_dir: String,
    #[serde(default = "default_bminstall")]
    pub bminstall: String,
    #[serde(default = "default_bmsubmit")]
    pub bmsubmit: String,
    #[serde(default = "default_jattach")]
    pub jattach: String,
    #[serde(default = "default_curl")]
    pub curl: String,
    #[serde(default = "default_mutator_agent_path")]
    pub mutator_agent_path: String,
    /// Command name of the managed-runtime process inside a container.
    #[serde(default = "default_runtime_comm")]
    pub runtime_comm: String,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            byteman_home: default_byteman_home(),
            container_byteman_dir: default_container_byteman_dir(),
            bminstall: default_bminstall(),
            bmsubmit: default_bmsubmit(),
            jattach: default_jattach(),
            curl: default_curl(),
            mutator_agent_path: default_mutator_agent_path(),
            runtime_comm: default_runtime_comm(),
        }
    }
}

fn default_byteman_home() -> Option<PathBuf> {
    std::env::var_os(ENV_BYTEMAN_HOME)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
fn default_container_byteman_dir() -> String {
    "/usr/local/byteman".to_string()
}
fn default_bminstall() -> String {
    "bminstall.sh".to_string()
}
fn default_bmsubmit() -> String {
    "bmsubmit.sh".to_string()
}
fn default_jattach() -> String {
    "jattach".to_string()
}
fn default_curl() -> String {
    "curl".to_string()
}
fn default_mutator_agent_path() -> String {
    "/usr/local/chaos-mesh/mutator-agent.jar".to_string()
}
fn default_runtime_comm() -> String {
    "java".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CgroupConfig {
    /// Host `/sys` as mounted into the daemon's container.
    #[serde(default = "default_host_sys_prefix")]
    pub host_sys_prefix: PathBuf,
    #[serde(default = "default_local_sys_prefix")]
    pub local_sys_prefix: PathBuf,
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            host_sys_prefix: default_host_sys_prefix(),
            local_sys_prefix: default_local_sys_prefix(),
            proc_root: default_proc_root(),
        }
    }
}

fn default_host_sys_prefix() -> PathBuf {
    PathBuf::from("/host-sys")
}
fn default_local_sys_prefix() -> PathBuf {
    PathBuf::from("/sys")
}
fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"[server]
listen_addr = "127.0.0.1:4000"
[runtime]
default_runtime = "docker"
[attach]
byteman_home = "/opt/byteman"
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.server.listen_addr, "127.0.0.1:4000");
        assert_eq!(cfg.server.request_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.runtime.default_runtime, RuntimeKind::Docker);
        assert_eq!(cfg.runtime.crictl_bin, "crictl");
        assert_eq!(cfg.attach.byteman_home, Some(PathBuf::from("/opt/byteman")));
        assert_eq!(cfg.attach.runtime_comm, "java");
        assert_eq!(
            cfg.attach.mutator_agent_path,
            "/usr/local/chaos-mesh/mutator-agent.jar"
        );
        assert_eq!(cfg.cgroup.host_sys_prefix, PathBuf::from("/host-sys"));
    }

    #[test]
    fn empty_file_yields_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.server.listen_addr, "0.0.0.0:31767");
        assert_eq!(cfg.runtime.default_runtime, RuntimeKind::Containerd);
        assert_eq!(cfg.cgroup.proc_root, PathBuf::from("/proc"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("absent.toml"));
        assert_eq!(cfg.attach.bminstall, "bminstall.sh");
    }
}
