//! Bytecode-rewriting agent: load it into a JVM and submit rule scripts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::AttachConfig;
use crate::error::ExecutorError;
use crate::process::{shell_quote, CommandOutput, NsType, ProcessBuilder};

const INSTALL_FLAGS: [&str; 4] = [
    "-b",
    "-Dorg.jboss.byteman.transform.all",
    "-Dorg.jboss.byteman.verbose",
    "-Dorg.jboss.byteman.compileToBytecode",
];

/// Install failures that still leave the agent loaded and listening.
pub const BENIGN_INSTALL_ERRORS: [&str; 4] = [
    "Agent JAR loaded but agent failed to initialize",
    "Provider sun.tools.attach.LinuxAttachProvider not found",
    "install java.io.IOException: Non-numeric value found",
    "com.sun.tools.attach.AgentLoadException",
];

/// Uninstall failures meaning there is nothing left to remove.
pub const BENIGN_UNINSTALL_ERRORS: [&str; 1] = ["No rule scripts to remove"];

/// Jars the agent needs on the target's filesystem.
pub const AGENT_JARS: [&str; 3] = ["byteman.jar", "byteman-helper.jar", "chaos-agent.jar"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    /// The tool failed with output that is known to be harmless.
    Tolerated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// `-b`: add a jar to the boot classpath.
    BootJar,
    /// `-l`: load rules.
    Load,
    /// `-u`: unload rules.
    Unload,
}

impl SubmitMode {
    fn flag(self) -> &'static str {
        match self {
            SubmitMode::BootJar => "-b",
            SubmitMode::Load => "-l",
            SubmitMode::Unload => "-u",
        }
    }
}

fn interpret(
    output: &CommandOutput,
    tool: &str,
    benign: &[&str],
) -> Result<StepOutcome, ExecutorError> {
    if output.success {
        return Ok(StepOutcome::Succeeded);
    }
    let text = output.combined();
    if benign.iter().any(|pattern| text.contains(pattern)) {
        return Ok(StepOutcome::Tolerated);
    }
    Err(ExecutorError::tool_failed(tool, &text))
}

pub fn interpret_install(output: &CommandOutput) -> Result<StepOutcome, ExecutorError> {
    interpret(output, "bminstall", &BENIGN_INSTALL_ERRORS)
}

pub fn interpret_uninstall(output: &CommandOutput) -> Result<StepOutcome, ExecutorError> {
    interpret(output, "bmsubmit", &BENIGN_UNINSTALL_ERRORS)
}

pub struct AttachTools {
    config: AttachConfig,
    proc_root: PathBuf,
    timeout: Duration,
}

impl AttachTools {
    pub fn new(config: AttachConfig, proc_root: PathBuf, timeout: Duration) -> Self {
        Self {
            config,
            proc_root,
            timeout,
        }
    }

    pub fn byteman_home(&self) -> Result<&Path, ExecutorError> {
        self.config
            .byteman_home
            .as_deref()
            .ok_or(ExecutorError::MissingSetting("BYTEMAN_HOME"))
    }

    /// Jar directory inside the target container.
    pub fn container_lib_dir(&self) -> String {
        format!("{}/lib", self.config.container_byteman_dir.trim_end_matches('/'))
    }

    /// `sh -c` line running bminstall against `pid`. With `enter_ns` the
    /// agent jars were copied into the target, and the install runs in a
    /// private mount namespace of its own.
    pub fn install_command(&self, pid: u32, port: u16, enter_ns: bool) -> ProcessBuilder {
        let script = format!(
            "{} {} -p {port} {pid}",
            shell_quote(&self.config.bminstall),
            INSTALL_FLAGS.join(" ")
        );
        let cmd = ProcessBuilder::shell(&script)
            .proc_root(&self.proc_root)
            .timeout(self.timeout);
        if enter_ns {
            cmd.local_mount()
        } else {
            cmd
        }
    }

    pub fn submit_command(&self, port: u16, mode: SubmitMode, file: &Path) -> ProcessBuilder {
        let script = format!(
            "{} -p {port} {} {}",
            shell_quote(&self.config.bmsubmit),
            mode.flag(),
            shell_quote(&file.to_string_lossy())
        );
        ProcessBuilder::shell(&script)
            .proc_root(&self.proc_root)
            .timeout(self.timeout)
    }

    pub async fn install(
        &self,
        pid: u32,
        port: u16,
        enter_ns: bool,
    ) -> Result<StepOutcome, ExecutorError> {
        let output = self.install_command(pid, port, enter_ns).output().await?;
        interpret_install(&output)
    }

    /// Submit through the agent's listener, from inside the network
    /// namespace of `net_pid` when given.
    pub async fn submit(
        &self,
        port: u16,
        mode: SubmitMode,
        file: &Path,
        net_pid: Option<u32>,
    ) -> Result<StepOutcome, ExecutorError> {
        let mut cmd = self.submit_command(port, mode, file);
        if let Some(pid) = net_pid {
            cmd = cmd.set_ns(pid, NsType::Net);
        }
        let output = cmd.output().await?;
        match mode {
            SubmitMode::Unload => interpret_uninstall(&output),
            _ if output.success => Ok(StepOutcome::Succeeded),
            _ => Err(ExecutorError::tool_failed("bmsubmit", &output.combined())),
        }
    }
}
