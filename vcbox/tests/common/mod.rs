use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nix::sys::signal::Signal;
use oci_spec::runtime::LinuxResources;
use tempfile::TempDir;

use vcbox::agent::{
    Agent, AgentConfig, AgentKind, Capabilities, ContainerStats, ProcessList, ProcessListOptions,
};
use vcbox::model::{Cmd, ContainerConfig, Device, Process, SandboxConfig};
use vcbox::{AgentError, AgentResult, RuntimeOptions, VcRuntime};

/// Agent that records every call and fails the operations it is told to.
pub struct ScriptedAgent {
    initialized: AtomicBool,
    capabilities: Capabilities,
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

#[allow(dead_code)]
impl ScriptedAgent {
    pub fn new() -> Arc<Self> {
        Self::with_capabilities(Capabilities::all())
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Arc<Self> {
        Arc::new(Self {
            initialized: AtomicBool::new(false),
            capabilities,
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        })
    }

    pub fn fail_on(&self, operation: &str) {
        self.failing.lock().unwrap().insert(operation.to_string());
    }

    pub fn succeed(&self, operation: &str) {
        self.failing.lock().unwrap().remove(operation);
    }

    /// Calls so far, as `"<operation> <target>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        let prefix = format!("{} ", operation);
        self.calls()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    fn record(&self, operation: &str, target: &str) -> AgentResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", operation, target));
        if operation != "init" && !self.initialized.load(Ordering::Acquire) {
            return Err(AgentError::NotReady);
        }
        if self.failing.lock().unwrap().contains(operation) {
            return Err(AgentError::Rpc {
                code: -1,
                message: format!("scripted failure in {}", operation),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Noop
    }

    async fn init(&self, sandbox_id: &str, _config: &AgentConfig) -> AgentResult<()> {
        self.record("init", sandbox_id)?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn check(&self) -> AgentResult<()> {
        self.record("check", "-")
    }

    async fn disconnect(&self) -> AgentResult<()> {
        self.record("disconnect", "-")
    }

    async fn create_sandbox(&self, config: &SandboxConfig) -> AgentResult<()> {
        self.record("create_sandbox", &config.id)
    }

    async fn start_sandbox(&self, sandbox_id: &str) -> AgentResult<()> {
        self.record("start_sandbox", sandbox_id)
    }

    async fn stop_sandbox(&self, sandbox_id: &str) -> AgentResult<()> {
        self.record("stop_sandbox", sandbox_id)
    }

    async fn cleanup_sandbox(&self, sandbox_id: &str) -> AgentResult<()> {
        self.record("cleanup_sandbox", sandbox_id)
    }

    async fn create_container(
        &self,
        sandbox_id: &str,
        config: &ContainerConfig,
    ) -> AgentResult<()> {
        self.record("create_container", &format!("{}/{}", sandbox_id, config.id))
    }

    async fn start_container(&self, sandbox_id: &str, container_id: &str) -> AgentResult<Process> {
        self.record("start_container", &format!("{}/{}", sandbox_id, container_id))?;
        Ok(Process::new(container_id, 4242))
    }

    async fn stop_container(&self, sandbox_id: &str, container_id: &str) -> AgentResult<()> {
        self.record("stop_container", &format!("{}/{}", sandbox_id, container_id))
    }

    async fn pause_container(&self, sandbox_id: &str, container_id: &str) -> AgentResult<()> {
        self.record("pause_container", &format!("{}/{}", sandbox_id, container_id))
    }

    async fn resume_container(&self, sandbox_id: &str, container_id: &str) -> AgentResult<()> {
        self.record("resume_container", &format!("{}/{}", sandbox_id, container_id))
    }

    async fn update_container(
        &self,
        sandbox_id: &str,
        container_id: &str,
        _resources: &LinuxResources,
    ) -> AgentResult<()> {
        self.record("update_container", &format!("{}/{}", sandbox_id, container_id))
    }

    async fn hotplug_device(
        &self,
        sandbox_id: &str,
        container_id: &str,
        device: &Device,
    ) -> AgentResult<()> {
        self.record(
            "hotplug_device",
            &format!("{}/{} {}", sandbox_id, container_id, device.id()),
        )
    }

    async fn stats_container(
        &self,
        sandbox_id: &str,
        container_id: &str,
    ) -> AgentResult<ContainerStats> {
        self.record("stats_container", &format!("{}/{}", sandbox_id, container_id))?;
        Ok(ContainerStats {
            pids: 3,
            ..Default::default()
        })
    }

    async fn process_list_container(
        &self,
        sandbox_id: &str,
        container_id: &str,
        options: &ProcessListOptions,
    ) -> AgentResult<ProcessList> {
        self.record("process_list_container", &format!("{}/{}", sandbox_id, container_id))?;
        Ok(ProcessList(format!("ps {}\n", options.args.join(" ")).into_bytes()))
    }

    async fn exec(&self, sandbox_id: &str, container_id: &str, _cmd: &Cmd) -> AgentResult<Process> {
        self.record("exec", &format!("{}/{}", sandbox_id, container_id))?;
        Ok(Process::new(format!("{}-exec", container_id), 4343))
    }

    async fn signal_process(
        &self,
        container_id: &str,
        process_id: &str,
        signal: Signal,
        _all: bool,
    ) -> AgentResult<()> {
        self.record("signal_process", &format!("{}/{} {}", container_id, process_id, signal))
    }

    async fn winsize_process(
        &self,
        container_id: &str,
        process_id: &str,
        _height: u32,
        _width: u32,
    ) -> AgentResult<()> {
        self.record("winsize_process", &format!("{}/{}", container_id, process_id))
    }

    async fn wait_process(&self, container_id: &str, process_id: &str) -> AgentResult<i32> {
        self.record("wait_process", &format!("{}/{}", container_id, process_id))?;
        Ok(0)
    }

    async fn online_cpu_mem(&self, cpus: u32) -> AgentResult<()> {
        self.record("online_cpu_mem", &cpus.to_string())
    }

    async fn write_process_stdin(
        &self,
        container_id: &str,
        process_id: &str,
        data: &[u8],
    ) -> AgentResult<usize> {
        self.record("write_process_stdin", &format!("{}/{}", container_id, process_id))?;
        Ok(data.len())
    }

    async fn close_process_stdin(&self, container_id: &str, process_id: &str) -> AgentResult<()> {
        self.record("close_process_stdin", &format!("{}/{}", container_id, process_id))
    }

    async fn read_process_stdout(
        &self,
        container_id: &str,
        process_id: &str,
        _buf: &mut [u8],
    ) -> AgentResult<usize> {
        self.record("read_process_stdout", &format!("{}/{}", container_id, process_id))?;
        Ok(0)
    }

    async fn read_process_stderr(
        &self,
        container_id: &str,
        process_id: &str,
        _buf: &mut [u8],
    ) -> AgentResult<usize> {
        self.record("read_process_stderr", &format!("{}/{}", container_id, process_id))?;
        Ok(0)
    }
}

pub struct TestContext {
    pub dir: TempDir,
    pub agent: Arc<ScriptedAgent>,
    pub runtime: VcRuntime,
}

#[allow(dead_code)]
impl TestContext {
    pub fn options(&self) -> RuntimeOptions {
        RuntimeOptions::new(self.dir.path().join("config"), self.dir.path().join("run"))
    }

    /// Second runtime over the same roots, as another process would see them.
    pub fn reopen(&self) -> VcRuntime {
        let agent = Arc::clone(&self.agent);
        VcRuntime::new(self.options()).with_agent_factory(move |_| agent.clone() as Arc<dyn Agent>)
    }
}

pub fn context() -> TestContext {
    context_with(ScriptedAgent::new())
}

pub fn context_with(agent: Arc<ScriptedAgent>) -> TestContext {
    let dir = TempDir::new().unwrap();
    let options = RuntimeOptions::new(dir.path().join("config"), dir.path().join("run"));
    let shared = Arc::clone(&agent);
    let runtime =
        VcRuntime::new(options).with_agent_factory(move |_| shared.clone() as Arc<dyn Agent>);
    TestContext {
        dir,
        agent,
        runtime,
    }
}
