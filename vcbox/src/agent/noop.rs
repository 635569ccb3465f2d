//! Agent that talks to no guest.
//!
//! Every operation succeeds once `init` has been called. Reads report end of
//! stream and writes swallow their input.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use nix::sys::signal::Signal;
use oci_spec::runtime::LinuxResources;

use vcbox_shared::errors::{AgentError, AgentResult};

use super::{
    Agent, AgentConfig, AgentKind, Capabilities, ContainerStats, ProcessList, ProcessListOptions,
};
use crate::model::{Cmd, ContainerConfig, Device, Process, SandboxConfig};

#[derive(Debug)]
pub struct NoopAgent {
    initialized: AtomicBool,
    capabilities: Capabilities,
}

impl Default for NoopAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl NoopAgent {
    /// Advertises every capability.
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::all())
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            initialized: AtomicBool::new(false),
            capabilities,
        }
    }

    fn ready(&self) -> AgentResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(AgentError::NotReady)
        }
    }
}

#[async_trait]
impl Agent for NoopAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Noop
    }

    async fn init(&self, sandbox_id: &str, _config: &AgentConfig) -> AgentResult<()> {
        self.initialized.store(true, Ordering::Release);
        tracing::debug!(sandbox_id = %sandbox_id, "Noop agent initialized");
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn check(&self) -> AgentResult<()> {
        self.ready()
    }

    async fn disconnect(&self) -> AgentResult<()> {
        Ok(())
    }

    async fn create_sandbox(&self, _config: &SandboxConfig) -> AgentResult<()> {
        self.ready()
    }

    async fn start_sandbox(&self, _sandbox_id: &str) -> AgentResult<()> {
        self.ready()
    }

    async fn stop_sandbox(&self, _sandbox_id: &str) -> AgentResult<()> {
        self.ready()
    }

    async fn cleanup_sandbox(&self, _sandbox_id: &str) -> AgentResult<()> {
        self.ready()
    }

    async fn create_container(
        &self,
        _sandbox_id: &str,
        _config: &ContainerConfig,
    ) -> AgentResult<()> {
        self.ready()
    }

    async fn start_container(&self, _sandbox_id: &str, container_id: &str) -> AgentResult<Process> {
        self.ready()?;
        Ok(Process::new(container_id, 0))
    }

    async fn stop_container(&self, _sandbox_id: &str, _container_id: &str) -> AgentResult<()> {
        self.ready()
    }

    async fn pause_container(&self, _sandbox_id: &str, _container_id: &str) -> AgentResult<()> {
        self.ready()
    }

    async fn resume_container(&self, _sandbox_id: &str, _container_id: &str) -> AgentResult<()> {
        self.ready()
    }

    async fn update_container(
        &self,
        _sandbox_id: &str,
        _container_id: &str,
        _resources: &LinuxResources,
    ) -> AgentResult<()> {
        self.ready()
    }

    async fn hotplug_device(
        &self,
        _sandbox_id: &str,
        _container_id: &str,
        _device: &Device,
    ) -> AgentResult<()> {
        self.ready()
    }

    async fn stats_container(
        &self,
        _sandbox_id: &str,
        _container_id: &str,
    ) -> AgentResult<ContainerStats> {
        self.ready()?;
        Ok(ContainerStats::default())
    }

    async fn process_list_container(
        &self,
        _sandbox_id: &str,
        _container_id: &str,
        _options: &ProcessListOptions,
    ) -> AgentResult<ProcessList> {
        self.ready()?;
        Ok(ProcessList::default())
    }

    async fn exec(
        &self,
        _sandbox_id: &str,
        _container_id: &str,
        cmd: &Cmd,
    ) -> AgentResult<Process> {
        self.ready()?;
        let mut process = Process::new(uuid::Uuid::new_v4().to_string(), 0);
        process.tty = cmd.tty;
        Ok(process)
    }

    async fn signal_process(
        &self,
        _container_id: &str,
        _process_id: &str,
        _signal: Signal,
        _all: bool,
    ) -> AgentResult<()> {
        self.ready()
    }

    async fn winsize_process(
        &self,
        _container_id: &str,
        _process_id: &str,
        _height: u32,
        _width: u32,
    ) -> AgentResult<()> {
        self.ready()
    }

    async fn wait_process(&self, _container_id: &str, _process_id: &str) -> AgentResult<i32> {
        self.ready()?;
        Ok(0)
    }

    async fn online_cpu_mem(&self, _cpus: u32) -> AgentResult<()> {
        self.ready()
    }

    async fn write_process_stdin(
        &self,
        _container_id: &str,
        _process_id: &str,
        data: &[u8],
    ) -> AgentResult<usize> {
        self.ready()?;
        Ok(data.len())
    }

    async fn close_process_stdin(&self, _container_id: &str, _process_id: &str) -> AgentResult<()> {
        self.ready()
    }

    async fn read_process_stdout(
        &self,
        _container_id: &str,
        _process_id: &str,
        _buf: &mut [u8],
    ) -> AgentResult<usize> {
        self.ready()?;
        Ok(0)
    }

    async fn read_process_stderr(
        &self,
        _container_id: &str,
        _process_id: &str,
        _buf: &mut [u8],
    ) -> AgentResult<usize> {
        self.ready()?;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_calls_before_init_not_ready() {
        let agent = NoopAgent::new();
        assert!(matches!(
            agent.start_sandbox("sb").await,
            Err(AgentError::NotReady)
        ));
        assert!(matches!(agent.check().await, Err(AgentError::NotReady)));
    }

    #[tokio::test]
    async fn test_stop_sandbox_twice() {
        let agent = NoopAgent::new();
        agent.init("sb", &AgentConfig::Noop).await.unwrap();
        agent.start_sandbox("sb").await.unwrap();
        agent.stop_sandbox("sb").await.unwrap();
        agent.stop_sandbox("sb").await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_returns_unique_tokens() {
        let agent = NoopAgent::new();
        agent.init("sb", &AgentConfig::Noop).await.unwrap();
        let cmd = Cmd::new(["ls"]).tty(true);
        let a = agent.exec("sb", "c1", &cmd).await.unwrap();
        let b = agent.exec("sb", "c1", &cmd).await.unwrap();
        assert_ne!(a.token, b.token);
        assert!(a.tty);
    }

    #[tokio::test]
    async fn test_custom_capabilities() {
        let agent = NoopAgent::with_capabilities(Capabilities::default());
        assert!(!agent.capabilities().pause);
        assert!(NoopAgent::new().capabilities().block_device_hotplug);
    }
}
