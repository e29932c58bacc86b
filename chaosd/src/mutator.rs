//! Runtime code mutation agent, loaded with `jattach` and disabled over its
//! local HTTP listener.

use std::path::PathBuf;
use std::time::Duration;

use chaos_common::protocol::{MutationKind, RuntimeMutatorRequest};

use crate::config::AttachConfig;
use crate::error::ExecutorError;
use crate::process::{shell_quote, CommandOutput, NsType, ProcessBuilder};

/// curl exit status for "failed to connect to host".
const CURL_COULDNT_CONNECT: i32 = 7;

fn is_set(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

/// Check the request shape; the controller validates the same rules before
/// calling the daemon.
pub fn validate(req: &RuntimeMutatorRequest) -> Result<(), ExecutorError> {
    let mut problems = Vec::new();
    if req.class.trim().is_empty() {
        problems.push("class is required".to_string());
    }
    if req.method.trim().is_empty() {
        problems.push("method is required".to_string());
    }
    match req.action {
        MutationKind::Constant => {
            if !is_set(&req.from) || !is_set(&req.to) {
                problems.push("constant mutation requires from and to".to_string());
            }
            if is_set(&req.strategy) {
                problems.push("constant mutation does not take a strategy".to_string());
            }
        }
        MutationKind::Operator | MutationKind::String => {
            if !is_set(&req.strategy) {
                problems.push(format!("{} mutation requires a strategy", req.action));
            }
            if is_set(&req.from) || is_set(&req.to) {
                problems.push(format!("{} mutation does not take from/to", req.action));
            }
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ExecutorError::InvalidRequest(problems.join("; ")))
    }
}

/// Argument string handed to the agent's `agentmain`.
pub fn agent_args(req: &RuntimeMutatorRequest) -> String {
    let mut args = vec![
        format!("mutator_action={}", req.action),
        format!("mutator_class={}", req.class),
        format!("mutator_method={}", req.method),
    ];
    if let Some(signature) = req.signature.as_deref().filter(|s| !s.is_empty()) {
        args.push(format!("mutator_signature={signature}"));
    }
    match req.action {
        MutationKind::Constant => {
            args.push(format!("mutator_from={}", req.from.as_deref().unwrap_or("")));
            args.push(format!("mutator_to={}", req.to.as_deref().unwrap_or("")));
        }
        MutationKind::Operator | MutationKind::String => {
            args.push(format!(
                "mutator_strategy={}",
                req.strategy.as_deref().unwrap_or("")
            ));
        }
    }
    args.join(",")
}

pub struct MutatorTools {
    config: AttachConfig,
    proc_root: PathBuf,
    timeout: Duration,
}

impl MutatorTools {
    pub fn new(config: AttachConfig, proc_root: PathBuf, timeout: Duration) -> Self {
        Self {
            config,
            proc_root,
            timeout,
        }
    }

    /// `jattach <pid> load instrument false <agent>=<args>` through `sh -c`,
    /// run in the target's mount namespace when `enter_ns` is set.
    pub fn load_command(
        &self,
        req: &RuntimeMutatorRequest,
        container_pid: u32,
        jvm_pid: u32,
    ) -> ProcessBuilder {
        let agent = format!("{}={}", self.config.mutator_agent_path, agent_args(req));
        let script = format!(
            "{} {jvm_pid} load instrument false {}",
            shell_quote(&self.config.jattach),
            shell_quote(&agent)
        );
        let mut cmd = ProcessBuilder::shell(&script)
            .proc_root(&self.proc_root)
            .timeout(self.timeout);
        if req.enter_ns {
            cmd = cmd.set_ns(container_pid, NsType::Mount);
        }
        cmd
    }

    /// POST to the agent's disable endpoint from inside the target's network
    /// namespace.
    pub fn disable_command(&self, port: u16, container_pid: u32) -> ProcessBuilder {
        let script = format!(
            "{} -sS -X POST http://localhost:{port}/mutations/disable",
            shell_quote(&self.config.curl)
        );
        ProcessBuilder::shell(&script)
            .set_ns(container_pid, NsType::Net)
            .proc_root(&self.proc_root)
            .timeout(self.timeout)
    }

    pub async fn load(
        &self,
        req: &RuntimeMutatorRequest,
        container_pid: u32,
        jvm_pid: u32,
    ) -> Result<CommandOutput, ExecutorError> {
        self.load_command(req, container_pid, jvm_pid).output().await
    }

    pub async fn disable(&self, port: u16, container_pid: u32) -> Result<(), ExecutorError> {
        let output = self.disable_command(port, container_pid).output().await?;
        interpret_disable(&output)
    }
}

/// A refused connection means the agent is not listening, so there is no
/// mutation left to disable.
pub fn interpret_disable(output: &CommandOutput) -> Result<(), ExecutorError> {
    if output.success
        || output.code == Some(CURL_COULDNT_CONNECT)
        || output.combined().contains("Connection refused")
    {
        return Ok(());
    }
    Err(ExecutorError::tool_failed("curl", &output.combined()))
}
