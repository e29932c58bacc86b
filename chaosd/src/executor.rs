use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chaos_common::protocol::{
    DeviceRuleResponse, JvmRulesRequest, RuntimeMutatorRequest, RuntimeMutatorResponse,
};
use chaos_common::Logger;
use tempfile::NamedTempFile;

use crate::attach::{AttachTools, StepOutcome, SubmitMode, AGENT_JARS};
use crate::cgroup::{CgroupPaths, RuleFile, RuleOutcome, FUSE_DEVICE_RULE};
use crate::config::Config;
use crate::error::ExecutorError;
use crate::mutator::{self, MutatorTools};
use crate::process::{copy_into_mount_ns, shell_quote, NsType, ProcessBuilder};
use crate::proctree::{find_by_comm, ProcessInspector, SysinfoInspector};
use crate::runtime::{CliRuntime, ContainerRuntime};

/// Privileged operations performed on this node on behalf of the controller.
pub struct Executor {
    runtime: Arc<dyn ContainerRuntime>,
    inspector: Arc<dyn ProcessInspector>,
    attach: AttachTools,
    mutator: MutatorTools,
    cgroups: CgroupPaths,
    runtime_comm: String,
    proc_root: PathBuf,
    timeout: Duration,
    log: Logger,
}

impl Executor {
    pub fn new(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        inspector: Arc<dyn ProcessInspector>,
        log: Logger,
    ) -> Self {
        let timeout = config.server.request_timeout();
        let proc_root = config.cgroup.proc_root.clone();
        Self {
            runtime,
            inspector,
            attach: AttachTools::new(config.attach.clone(), proc_root.clone(), timeout),
            mutator: MutatorTools::new(config.attach.clone(), proc_root.clone(), timeout),
            cgroups: CgroupPaths::new(config.cgroup.clone()),
            runtime_comm: config.attach.runtime_comm.clone(),
            proc_root,
            timeout,
            log,
        }
    }

    /// Executor backed by the runtime CLIs and the host process table.
    pub fn from_config(config: &Config, log: Logger) -> Self {
        let runtime = CliRuntime::new(config.runtime.clone(), config.server.request_timeout());
        Self::new(
            config,
            Arc::new(runtime),
            Arc::new(SysinfoInspector),
            log,
        )
    }

    pub async fn container_pid(&self, container_id: &str) -> Result<u32, ExecutorError> {
        let pid = self.runtime.pid_of(container_id).await?;
        self.log
            .with_value("container", container_id)
            .with_value("pid", pid)
            .debug("resolved container pid");
        Ok(pid)
    }

    /// Pid of the managed-runtime process among the container's init process
    /// and its descendants.
    async fn find_runtime_process(&self, root: u32) -> Result<Option<u32>, ExecutorError> {
        let inspector = Arc::clone(&self.inspector);
        let tree = tokio::task::spawn_blocking(move || inspector.process_tree(root))
            .await
            .map_err(|e| ExecutorError::io("process table scan", std::io::Error::other(e)))?;
        Ok(find_by_comm(&tree, &self.runtime_comm))
    }

    pub async fn install_jvm_rules(&self, req: &JvmRulesRequest) -> Result<(), ExecutorError> {
        let log = self
            .log
            .with_value("container", &req.container_id)
            .with_value("port", req.port);
        let container_pid = self.container_pid(&req.container_id).await?;
        let pid = match self.find_runtime_process(container_pid).await? {
            Some(pid) => pid,
            None => {
                log.warn("no jvm process found, attaching to the container init process");
                container_pid
            }
        };
        let log = log.with_value("pid", pid);
        let home = self.attach.byteman_home()?.to_path_buf();

        if req.enter_ns {
            let lib_dir = self.attach.container_lib_dir();
            let mkdir = ProcessBuilder::shell(&format!("mkdir -p {}", shell_quote(&lib_dir)))
                .set_ns(pid, NsType::Mount)
                .proc_root(&self.proc_root)
                .timeout(self.timeout);
            let output = mkdir.output().await?;
            if !output.success {
                return Err(ExecutorError::tool_failed("mkdir", &output.combined()));
            }
            for jar in AGENT_JARS {
                let source = home.join("lib").join(jar);
                let dest = format!("{lib_dir}/{jar}");
                copy_into_mount_ns(&source, &dest, pid, &self.proc_root, self.timeout).await?;
                log.with_value("jar", jar).debug("copied agent jar into target");
            }
        }

        match self.attach.install(pid, req.port, req.enter_ns).await? {
            StepOutcome::Succeeded => log.info("agent installed"),
            StepOutcome::Tolerated => log.info("agent already loaded, continuing"),
        }

        let net_pid = req.enter_ns.then_some(pid);
        let helper = home.join("lib").join("byteman-helper.jar");
        self.attach
            .submit(req.port, SubmitMode::BootJar, &helper, net_pid)
            .await?;

        let rule_file = write_rule_file(&req.rule)?;
        self.attach
            .submit(req.port, SubmitMode::Load, rule_file.path(), net_pid)
            .await?;
        log.audit("jvm rules installed");
        Ok(())
    }

    pub async fn uninstall_jvm_rules(&self, req: &JvmRulesRequest) -> Result<(), ExecutorError> {
        let log = self
            .log
            .with_value("container", &req.container_id)
            .with_value("port", req.port);
        let pid = self.container_pid(&req.container_id).await?;
        let rule_file = write_rule_file(&req.rule)?;
        let net_pid = req.enter_ns.then_some(pid);
        match self
            .attach
            .submit(req.port, SubmitMode::Unload, rule_file.path(), net_pid)
            .await?
        {
            StepOutcome::Succeeded => log.audit("jvm rules removed"),
            StepOutcome::Tolerated => log.info("no jvm rules left to remove"),
        }
        Ok(())
    }

    /// Load the mutation agent. A failing `jattach` is reported in the
    /// response rather than as an error.
    pub async fn install_runtime_mutator(
        &self,
        req: &RuntimeMutatorRequest,
    ) -> Result<RuntimeMutatorResponse, ExecutorError> {
        mutator::validate(req)?;
        let log = self
            .log
            .with_value("container", &req.container_id)
            .with_value("class", &req.class)
            .with_value("method", &req.method);
        let container_pid = self.container_pid(&req.container_id).await?;
        let jvm_pid = self
            .find_runtime_process(container_pid)
            .await?
            .ok_or_else(|| ExecutorError::NoRuntimeProcess {
                comm: self.runtime_comm.clone(),
                container_id: req.container_id.clone(),
            })?;

        let output = self.mutator.load(req, container_pid, jvm_pid).await?;
        if !output.success {
            let message = output.combined().trim().to_string();
            log.with_value("output", &message)
                .warn("failed to load runtime mutator");
            return Ok(RuntimeMutatorResponse {
                success: false,
                message,
            });
        }
        log.with_value("pid", jvm_pid)
            .with_value("action", req.action)
            .audit("runtime mutator installed");
        Ok(RuntimeMutatorResponse {
            success: true,
            message: "runtime mutator installed".to_string(),
        })
    }

    pub async fn uninstall_runtime_mutator(
        &self,
        req: &RuntimeMutatorRequest,
    ) -> Result<(), ExecutorError> {
        let log = self.log.with_value("container", &req.container_id);
        let container_pid = self.container_pid(&req.container_id).await?;
        if self.find_runtime_process(container_pid).await?.is_none() {
            log.info("jvm process is gone, nothing to disable");
            return Ok(());
        }
        self.mutator.disable(req.port, container_pid).await?;
        log.audit("runtime mutator disabled");
        Ok(())
    }

    pub async fn grant_fuse(&self, container_id: &str) -> Result<DeviceRuleResponse, ExecutorError> {
        self.write_fuse_rule(container_id, RuleFile::Allow).await
    }

    pub async fn revoke_fuse(&self, container_id: &str) -> Result<DeviceRuleResponse, ExecutorError> {
        self.write_fuse_rule(container_id, RuleFile::Deny).await
    }

    async fn write_fuse_rule(
        &self,
        container_id: &str,
        file: RuleFile,
    ) -> Result<DeviceRuleResponse, ExecutorError> {
        let pid = self.container_pid(container_id).await?;
        let log = self
            .log
            .with_value("container", container_id)
            .with_value("pid", pid);
        match self.cgroups.apply_rule(pid, FUSE_DEVICE_RULE, file).await? {
            RuleOutcome::Written(path) => {
                log.with_value("path", path.display())
                    .audit(format!("fuse device rule written ({file:?})"));
                Ok(DeviceRuleResponse {
                    applied: true,
                    path: Some(path.display().to_string()),
                })
            }
            RuleOutcome::ControllerAbsent => {
                log.info("devices controller not enabled, nothing to change");
                Ok(DeviceRuleResponse {
                    applied: false,
                    path: None,
                })
            }
        }
    }
}

fn write_rule_file(rule: &str) -> Result<NamedTempFile, ExecutorError> {
    let mut file = tempfile::Builder::new()
        .prefix("rule")
        .suffix(".btm")
        .tempfile()
        .map_err(|e| ExecutorError::io("create rule file", e))?;
    file.write_all(rule.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| ExecutorError::io("write rule file", e))?;
    Ok(file)
}


#[cfg(test)]
mod tests {
    use super::testing::executor;
    use super::*;
    use chaos_common::protocol::MutationKind;

    use crate::proctree::ProcessEntry;

    fn entry(pid: u32, comm: &str) -> ProcessEntry {
        ProcessEntry {
            pid,
            comm: comm.to_string(),
        }
    }

    fn mutator_request(container_id: &str) -> RuntimeMutatorRequest {
        RuntimeMutatorRequest {
            container_id: container_id.into(),
            action: MutationKind::Operator,
            class: "com.example.Cart".into(),
            method: "total".into(),
            signature: None,
            from: None,
            to: None,
            strategy: Some("negate".into()),
            port: 9090,
            enter_ns: false,
        }
    }

    #[tokio::test]
    async fn unknown_container_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let exec = executor(root.path(), &[], vec![]);
        let err = exec.container_pid("docker://nope").await.unwrap_err();
        assert!(matches!(err, ExecutorError::ContainerNotFound(_)));
    }

    #[tokio::test]
    async fn mutator_requires_a_jvm_process() {
        let root = tempfile::tempdir().unwrap();
        let exec = executor(root.path(), &[("c1", 100)], vec![entry(100, "sh")]);
        let err = exec
            .install_runtime_mutator(&mutator_request("c1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::NoRuntimeProcess { .. }), "{err}");
    }

    #[tokio::test]
    async fn mutator_install_succeeds_when_jattach_does() {
        let root = tempfile::tempdir().unwrap();
        let exec = executor(
            root.path(),
            &[("c1", 100)],
            vec![entry(100, "sh"), entry(101, "java")],
        );
        let resp = exec
            .install_runtime_mutator(&mutator_request("c1"))
            .await
            .unwrap();
        assert!(resp.success, "{}", resp.message);
    }

    #[tokio::test]
    async fn mutator_uninstall_without_jvm_is_a_no_op() {
        let root = tempfile::tempdir().unwrap();
        let exec = executor(root.path(), &[("c1", 100)], vec![entry(100, "sh")]);
        exec.uninstall_runtime_mutator(&mutator_request("c1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn invalid_mutator_request_never_reaches_the_node() {
        let root = tempfile::tempdir().unwrap();
        let exec = executor(root.path(), &[], vec![]);
        let mut req = mutator_request("c1");
        req.strategy = None;
        let err = exec.install_runtime_mutator(&req).await.unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn fuse_grant_writes_allow_rule() {
        let root = tempfile::tempdir().unwrap();
        let proc_dir = root.path().join("proc/100");
        std::fs::create_dir_all(&proc_dir).unwrap();
        std::fs::write(proc_dir.join("cgroup"), "7:devices:/pod/c1\n").unwrap();
        let cg = root.path().join("host-sys/fs/cgroup/devices/pod/c1");
        std::fs::create_dir_all(&cg).unwrap();
        std::fs::write(cg.join("devices.allow"), "").unwrap();

        let exec = executor(root.path(), &[("c1", 100)], vec![]);
        let resp = exec.grant_fuse("c1").await.unwrap();

        assert!(resp.applied);
        assert_eq!(
            std::fs::read_to_string(cg.join("devices.allow")).unwrap(),
            "c 10:229 rwm"
        );
    }

    #[test]
    fn rule_file_holds_the_script() {
        let file = write_rule_file("RULE trace\nENDRULE\n").unwrap();
        assert!(file.path().to_string_lossy().ends_with(".btm"));
        assert_eq!(
            std::fs::read_to_string(file.path()).unwrap(),
            "RULE trace\nENDRULE\n"
        );
    }
}
