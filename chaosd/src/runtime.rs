use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::error::ExecutorError;
use crate::process::ProcessBuilder;

/// Container runtime a container id belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Containerd,
    Crio,
}

impl RuntimeKind {
    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "docker" => Some(RuntimeKind::Docker),
            "containerd" => Some(RuntimeKind::Containerd),
            "cri-o" | "crio" => Some(RuntimeKind::Crio),
            _ => None,
        }
    }
}

/// Split `scheme://id` into runtime and bare id. Ids without a scheme use
/// `default`.
pub fn parse_container_id(
    raw: &str,
    default: RuntimeKind,
) -> Result<(RuntimeKind, &str), ExecutorError> {
    let (kind, id) = match raw.split_once("://") {
        Some((scheme, id)) => {
            let kind = RuntimeKind::from_scheme(scheme).ok_or_else(|| {
                ExecutorError::InvalidRequest(format!("unsupported container runtime {scheme:?}"))
            })?;
            (kind, id)
        }
        None => (default, raw),
    };
    if id.is_empty() {
        return Err(ExecutorError::InvalidRequest("empty container id".into()));
    }
    Ok((kind, id))
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Host pid of the container's init process.
    async fn pid_of(&self, container_id: &str) -> Result<u32, ExecutorError>;
}

/// Resolves pids through the runtime CLIs (`docker inspect`, `crictl inspect`).
pub struct CliRuntime {
    config: RuntimeConfig,
    timeout: Duration,
}

impl CliRuntime {
    pub fn new(config: RuntimeConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    fn inspect_command(&self, kind: RuntimeKind, id: &str) -> ProcessBuilder {
        match kind {
            RuntimeKind::Docker => ProcessBuilder::new(
                &self.config.docker_bin,
                ["inspect", "--format", "{{.State.Pid}}", id],
            ),
            RuntimeKind::Containerd | RuntimeKind::Crio => ProcessBuilder::new(
                &self.config.crictl_bin,
                [
                    "inspect",
                    "--output",
                    "go-template",
                    "--template",
                    "{{.info.pid}}",
                    id,
                ],
            ),
        }
        .timeout(self.timeout)
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn pid_of(&self, container_id: &str) -> Result<u32, ExecutorError> {
        let (kind, id) = parse_container_id(container_id, self.config.default_runtime)?;
        let cmd = self.inspect_command(kind, id);
        let output = cmd.output().await?;
        if !output.success {
            if is_not_found(&output.stderr) {
                return Err(ExecutorError::ContainerNotFound(container_id.to_string()));
            }
            return Err(ExecutorError::tool_failed(cmd.program(), &output.combined()));
        }
        parse_pid(&output.stdout).ok_or_else(|| {
            ExecutorError::ContainerNotFound(container_id.to_string())
        })
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("not found")
}

/// A pid of `0` means the container exists but is not running.
fn parse_pid(stdout: &str) -> Option<u32> {
    stdout.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_selects_runtime() {
        assert_eq!(
            parse_container_id("docker://abc", RuntimeKind::Containerd).unwrap(),
            (RuntimeKind::Docker, "abc")
        );
        assert_eq!(
            parse_container_id("cri-o://def", RuntimeKind::Docker).unwrap(),
            (RuntimeKind::Crio, "def")
        );
        assert_eq!(
            parse_container_id("bare", RuntimeKind::Containerd).unwrap(),
            (RuntimeKind::Containerd, "bare")
        );
    }

    #[test]
    fn unknown_scheme_and_empty_id_are_invalid() {
        assert!(matches!(
            parse_container_id("rkt://abc", RuntimeKind::Docker),
            Err(ExecutorError::InvalidRequest(_))
        ));
        assert!(matches!(
            parse_container_id("docker://", RuntimeKind::Docker),
            Err(ExecutorError::InvalidRequest(_))
        ));
    }

    #[test]
    fn stopped_container_has_no_pid() {
        assert_eq!(parse_pid("1234\n"), Some(1234));
        assert_eq!(parse_pid("0\n"), None);
        assert_eq!(parse_pid("<no value>"), None);
    }

    #[test]
    fn detects_missing_container() {
        assert!(is_not_found("Error: No such container: abc"));
        assert!(is_not_found("rpc error: code = NotFound desc = container \"x\" not found"));
        assert!(!is_not_found("permission denied"));
    }

    #[tokio::test]
    async fn failing_cli_reports_tool_error() {
        let config = RuntimeConfig {
            default_runtime: RuntimeKind::Docker,
            docker_bin: "false".into(),
            crictl_bin: "false".into(),
        };
        let runtime = CliRuntime::new(config, Duration::from_secs(5));
        let err = runtime.pid_of("docker://abc").await.unwrap_err();
        assert!(matches!(err, ExecutorError::ToolFailed { .. }), "{err}");
    }
}
