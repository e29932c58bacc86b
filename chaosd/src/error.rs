use std::time::Duration;

use chaos_common::protocol::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("container {0} not found")]
    ContainerNotFound(String),
    #[error("process {0} not found")]
    ProcessNotFound(u32),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no {comm} process found in container {container_id}")]
    NoRuntimeProcess { comm: String, container_id: String },
    #[error("{tool} failed: {output}")]
    ToolFailed { tool: String, output: String },
    #[error("{0} timed out after {1:?}")]
    Timeout(String, Duration),
    #[error("invalid cgroup data: {0}")]
    Cgroup(String),
    #[error("{0} is not set")]
    MissingSetting(&'static str),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecutorError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ExecutorError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn tool_failed(tool: &str, output: &str) -> Self {
        ExecutorError::ToolFailed {
            tool: tool.to_string(),
            output: output.trim().to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutorError::ContainerNotFound(_) | ExecutorError::ProcessNotFound(_) => {
                ErrorKind::NotFound
            }
            ExecutorError::InvalidRequest(_) => ErrorKind::Invalid,
            _ => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_targets_map_to_not_found() {
        assert_eq!(
            ExecutorError::ContainerNotFound("docker://x".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(ExecutorError::ProcessNotFound(7).kind(), ErrorKind::NotFound);
        assert_eq!(
            ExecutorError::tool_failed("jattach", "boom\n").to_string(),
            "jattach failed: boom"
        );
    }
}
