//! Device access rules in a process's devices cgroup.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::config::CgroupConfig;
use crate::error::ExecutorError;

/// Character device 10:229 (`/dev/fuse`), read/write/mknod.
pub const FUSE_DEVICE_RULE: &str = "c 10:229 rwm";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCgroup {
    /// Path inside the v1 `devices` hierarchy.
    V1(String),
    /// Path inside the unified hierarchy.
    V2(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleFile {
    Allow,
    Deny,
}

impl RuleFile {
    fn file_name(self) -> &'static str {
        match self {
            RuleFile::Allow => "devices.allow",
            RuleFile::Deny => "devices.deny",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    Written(PathBuf),
    /// Unified hierarchy without a devices controller; device access is not
    /// enforced through cgroups, so there is nothing to change.
    ControllerAbsent,
}

/// Pick the devices cgroup from `/proc/<pid>/cgroup` content. A v1 `devices`
/// entry wins over the unified `0::` entry.
pub fn parse_device_cgroup(content: &str) -> Result<DeviceCgroup, ExecutorError> {
    let mut v1 = None;
    let mut unified = None;
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let parts: Vec<&str> = line.splitn(3, ':').collect();
        if parts.len() < 3 {
            return Err(ExecutorError::Cgroup(format!("invalid cgroup entry: {line:?}")));
        }
        if parts[1].split(',').any(|c| c == "devices") {
            v1 = Some(parts[2].to_string());
        } else if parts[1].is_empty() && unified.is_none() {
            unified = Some(parts[2].to_string());
        }
    }
    match (v1, unified) {
        (Some(path), _) => Ok(DeviceCgroup::V1(path)),
        (None, Some(path)) => Ok(DeviceCgroup::V2(path)),
        (None, None) => Err(ExecutorError::Cgroup("no device cgroup found".into())),
    }
}

/// Append `relative` to `base` without producing a double slash for `/`.
fn join_cgroup(base: PathBuf, relative: &str) -> PathBuf {
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        base
    } else {
        base.join(relative)
    }
}

#[derive(Debug, Clone)]
pub struct CgroupPaths {
    config: CgroupConfig,
}

impl CgroupPaths {
    pub fn new(config: CgroupConfig) -> Self {
        Self { config }
    }

    fn host_cgroup_root(&self) -> PathBuf {
        self.config.host_sys_prefix.join("fs/cgroup")
    }

    pub fn rule_path(&self, cgroup: &DeviceCgroup, file: RuleFile) -> PathBuf {
        let dir = match cgroup {
            DeviceCgroup::V1(path) => join_cgroup(self.host_cgroup_root().join("devices"), path),
            DeviceCgroup::V2(path) => join_cgroup(self.host_cgroup_root(), path),
        };
        dir.join(file.file_name())
    }

    /// `Some(false)` only when the root `cgroup.controllers` is readable and
    /// lacks `devices`.
    fn v2_devices_enabled(&self) -> Option<bool> {
        let host = self.host_cgroup_root().join("cgroup.controllers");
        let path = if host.exists() {
            host
        } else {
            self.config.local_sys_prefix.join("fs/cgroup/cgroup.controllers")
        };
        fs::read_to_string(path)
            .ok()
            .map(|c| c.split_whitespace().any(|name| name == "devices"))
    }

    fn read_proc_cgroup(&self, pid: u32) -> Result<String, ExecutorError> {
        let path = self.config.proc_root.join(pid.to_string()).join("cgroup");
        fs::read_to_string(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ExecutorError::ProcessNotFound(pid),
            _ => ExecutorError::io(format!("read {}", path.display()), e),
        })
    }

    pub fn write_rule(
        &self,
        pid: u32,
        rule: &str,
        file: RuleFile,
    ) -> Result<RuleOutcome, ExecutorError> {
        let cgroup = parse_device_cgroup(&self.read_proc_cgroup(pid)?)?;
        if matches!(cgroup, DeviceCgroup::V2(_)) && self.v2_devices_enabled() == Some(false) {
            return Ok(RuleOutcome::ControllerAbsent);
        }
        let path = self.rule_path(&cgroup, file);
        write_existing(&path, rule)?;
        Ok(RuleOutcome::Written(path))
    }

    /// [`CgroupPaths::write_rule`] on the blocking thread pool.
    pub async fn apply_rule(
        &self,
        pid: u32,
        rule: &'static str,
        file: RuleFile,
    ) -> Result<RuleOutcome, ExecutorError> {
        let paths = self.clone();
        tokio::task::spawn_blocking(move || paths.write_rule(pid, rule, file))
            .await
            .map_err(|e| ExecutorError::io("device rule task", io::Error::other(e)))?
    }
}

/// Control files must already exist; never create them.
fn write_existing(path: &Path, content: &str) -> Result<(), ExecutorError> {
    let mut f = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| ExecutorError::io(format!("open {}", path.display()), e))?;
    f.write_all(content.as_bytes())
        .map_err(|e| ExecutorError::io(format!("write {}", path.display()), e))
}
