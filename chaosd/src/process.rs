use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sched::{setns, unshare, CloneFlags};
use tokio::process::Command;

use crate::error::ExecutorError;

/// Namespaces a spawned command can join before exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsType {
    Mount,
    Net,
}

impl NsType {
    fn proc_name(self) -> &'static str {
        match self {
            NsType::Mount => "mnt",
            NsType::Net => "net",
        }
    }

    fn clone_flag(self) -> CloneFlags {
        match self {
            NsType::Mount => CloneFlags::CLONE_NEWNS,
            NsType::Net => CloneFlags::CLONE_NEWNET,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.clone();
        text.push_str(&self.stderr);
        text
    }
}

/// Builder for commands that may run inside another process's namespaces.
///
/// The namespace files are opened by the daemon before the fork, then joined
/// with `setns(2)` in the child between fork and exec, so the daemon itself
/// never changes namespace. Spawned children are killed when the returned
/// future is dropped, which makes request cancellation and timeouts reach the
/// child process.
#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    program: String,
    args: Vec<String>,
    target_pid: Option<u32>,
    namespaces: Vec<NsType>,
    local_mount: bool,
    stdin: Option<PathBuf>,
    timeout: Option<Duration>,
    proc_root: PathBuf,
}

impl ProcessBuilder {
    pub fn new<I>(program: &str, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(|a| a.as_ref().to_string()).collect(),
            target_pid: None,
            namespaces: Vec::new(),
            local_mount: false,
            stdin: None,
            timeout: None,
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Run `script` through `sh -c`.
    pub fn shell(script: &str) -> Self {
        Self::new("sh", ["-c", script])
    }

    /// Join namespace `ns` of `pid`. All namespaces must belong to one pid.
    pub fn set_ns(mut self, pid: u32, ns: NsType) -> Self {
        self.target_pid = Some(pid);
        if !self.namespaces.contains(&ns) {
            self.namespaces.push(ns);
        }
        self
    }

    /// Run in a private copy of the daemon's mount namespace, so mounts made
    /// by the child never reach the daemon while the daemon's files stay
    /// visible to it.
    pub fn local_mount(mut self) -> Self {
        self.local_mount = true;
        self
    }

    pub fn has_local_mount(&self) -> bool {
        self.local_mount
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn describe(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    fn open_namespaces(&self) -> Result<Vec<(File, CloneFlags)>, ExecutorError> {
        let Some(pid) = self.target_pid else {
            return Ok(Vec::new());
        };
        self.namespaces
            .iter()
            .map(|ns| {
                let path = self
                    .proc_root
                    .join(pid.to_string())
                    .join("ns")
                    .join(ns.proc_name());
                match File::open(&path) {
                    Ok(file) => Ok((file, ns.clone_flag())),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        Err(ExecutorError::ProcessNotFound(pid))
                    }
                    Err(e) => Err(ExecutorError::io(format!("open {}", path.display()), e)),
                }
            })
            .collect()
    }

    pub fn build(&self) -> Result<Command, ExecutorError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match &self.stdin {
            Some(path) => {
                let file = File::open(path)
                    .map_err(|e| ExecutorError::io(format!("open {}", path.display()), e))?;
                cmd.stdin(Stdio::from(file));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }

        let namespaces = self.open_namespaces()?;
        let local_mount = self.local_mount;
        if local_mount || !namespaces.is_empty() {
            // SAFETY: the hook only calls unshare(2) and setns(2) on
            // descriptors opened before the fork; it does not allocate or
            // take locks.
            unsafe {
                cmd.pre_exec(move || {
                    if local_mount {
                        unshare(CloneFlags::CLONE_NEWNS).map_err(io::Error::from)?;
                    }
                    for (file, flag) in &namespaces {
                        setns(file, *flag).map_err(io::Error::from)?;
                    }
                    Ok(())
                });
            }
        }
        Ok(cmd)
    }

    /// Run to completion and collect both output streams.
    pub async fn output(&self) -> Result<CommandOutput, ExecutorError> {
        let mut cmd = self.build()?;
        let run = cmd.output();
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| ExecutorError::Timeout(self.describe(), limit))?,
            None => run.await,
        };
        let output = result.map_err(|e| ExecutorError::io(format!("spawn {}", self.program), e))?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Quote `value` for interpolation into an `sh -c` script.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Copy a host file to `dest` inside the mount namespace of `pid`.
pub async fn copy_into_mount_ns(
    source: &Path,
    dest: &str,
    pid: u32,
    proc_root: &Path,
    timeout: Duration,
) -> Result<(), ExecutorError> {
    let cmd = ProcessBuilder::shell(&format!("cat > {}", shell_quote(dest)))
        .set_ns(pid, NsType::Mount)
        .proc_root(proc_root)
        .stdin_file(source)
        .timeout(timeout);
    let output = cmd.output().await?;
    if !output.success {
        return Err(ExecutorError::tool_failed(&cmd.describe(), &output.combined()));
    }
    Ok(())
}
