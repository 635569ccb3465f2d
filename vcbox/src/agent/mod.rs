//! Guest agent abstraction.
//!
//! An [`Agent`] is the host-side handle on the control process running inside
//! the sandbox VM. Every lifecycle intent is forwarded through it, and it
//! exposes raw per-process I/O primitives consumed by [`stream::IoStream`].
//!
//! Agents never retry: whether a retry is safe depends on the operation, so
//! failures go straight back to the caller.

pub mod noop;
pub mod rpc;
pub mod stream;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use oci_spec::runtime::LinuxResources;
use serde::{Deserialize, Serialize};

use vcbox_shared::errors::{AgentResult, VcError};

use crate::model::{Cmd, ContainerConfig, Device, Process, SandboxConfig};

pub use noop::NoopAgent;
pub use rpc::{RpcAgent, RpcAgentConfig};
pub use stream::{IoStream, OutputReader, StdinWriter};

// ============================================================================
// AGENT KIND & CONFIG
// ============================================================================

/// Agent variants the runtime can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Accepts every call without a guest. Used for testing.
    Noop,
    /// Newline-delimited JSON-RPC over the guest's Unix socket.
    Rpc,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentKind::Noop => write!(f, "noop"),
            AgentKind::Rpc => write!(f, "rpc"),
        }
    }
}

impl FromStr for AgentKind {
    type Err = VcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "noop" => Ok(AgentKind::Noop),
            "rpc" => Ok(AgentKind::Rpc),
            other => Err(VcError::Config(format!("unknown agent type {:?}", other))),
        }
    }
}

/// Typed configuration, one variant per agent kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AgentConfig {
    #[default]
    Noop,
    Rpc(RpcAgentConfig),
}

impl AgentConfig {
    pub fn kind(&self) -> AgentKind {
        match self {
            AgentConfig::Noop => AgentKind::Noop,
            AgentConfig::Rpc(_) => AgentKind::Rpc,
        }
    }

    pub fn rpc(socket_path: impl Into<PathBuf>) -> Self {
        AgentConfig::Rpc(RpcAgentConfig::new(socket_path))
    }
}

/// Build an uninitialized agent of the given kind.
pub fn new_agent(kind: AgentKind) -> Arc<dyn Agent> {
    match kind {
        AgentKind::Noop => Arc::new(NoopAgent::new()),
        AgentKind::Rpc => Arc::new(RpcAgent::new()),
    }
}

// ============================================================================
// CAPABILITIES & RESULTS
// ============================================================================

/// Optional features an agent advertises.
///
/// Callers check these before invoking the matching operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub block_device_support: bool,
    #[serde(default)]
    pub block_device_hotplug: bool,
    #[serde(default)]
    pub pause: bool,
    #[serde(default)]
    pub update_resources: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            block_device_support: true,
            block_device_hotplug: true,
            pause: true,
            update_resources: true,
        }
    }
}

/// Output format of a process listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessListFormat {
    #[default]
    Table,
    Json,
}

impl FromStr for ProcessListFormat {
    type Err = VcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "table" => Ok(ProcessListFormat::Table),
            "json" => Ok(ProcessListFormat::Json),
            other => Err(VcError::Config(format!("invalid format option {:?}", other))),
        }
    }
}

/// Arguments passed to `ps` inside the container.
pub const DEFAULT_PS_ARGS: &str = "-ef";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessListOptions {
    pub format: ProcessListFormat,
    pub args: Vec<String>,
}

impl Default for ProcessListOptions {
    fn default() -> Self {
        Self {
            format: ProcessListFormat::Table,
            args: vec![DEFAULT_PS_ARGS.to_string()],
        }
    }
}

impl ProcessListOptions {
    /// Empty `args` fall back to `-ef`.
    pub fn new(format: ProcessListFormat, args: Vec<String>) -> Self {
        let args = if args.is_empty() {
            vec![DEFAULT_PS_ARGS.to_string()]
        } else {
            args
        };
        Self { format, args }
    }
}

/// Formatted process listing, opaque to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessList(pub Vec<u8>);

impl ProcessList {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ProcessList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Resource usage of a container as reported by the guest.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerStats {
    #[serde(default)]
    pub cpu_usage_ns: u64,
    #[serde(default)]
    pub memory_usage_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<u64>,
    #[serde(default)]
    pub pids: u64,
    #[serde(default)]
    pub network_rx_bytes: u64,
    #[serde(default)]
    pub network_tx_bytes: u64,
}

// ============================================================================
// AGENT TRAIT
// ============================================================================

/// Remote control interface to the guest.
///
/// `init` must succeed before any other call; until then operations fail
/// with `AgentError::NotReady`. Calls may block on guest I/O for as long as
/// the guest takes; callers impose their own deadlines.
#[async_trait]
pub trait Agent: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// One-time setup for `sandbox_id` with the variant's configuration.
    async fn init(&self, sandbox_id: &str, config: &AgentConfig) -> AgentResult<()>;

    fn capabilities(&self) -> Capabilities;

    /// Opaque state persisted as `agent.json`.
    fn state(&self) -> serde_json::Value {
        serde_json::json!({ "type": self.kind() })
    }

    /// Liveness probe.
    async fn check(&self) -> AgentResult<()>;

    async fn disconnect(&self) -> AgentResult<()>;

    // --- sandbox lifecycle ---

    async fn create_sandbox(&self, config: &SandboxConfig) -> AgentResult<()>;

    async fn start_sandbox(&self, sandbox_id: &str) -> AgentResult<()>;

    /// Stop every container, then the sandbox. Succeeds on an already stopped sandbox.
    async fn stop_sandbox(&self, sandbox_id: &str) -> AgentResult<()>;

    async fn cleanup_sandbox(&self, sandbox_id: &str) -> AgentResult<()>;

    // --- container lifecycle ---

    async fn create_container(
        &self,
        sandbox_id: &str,
        config: &ContainerConfig,
    ) -> AgentResult<()>;

    /// Start the primary process of a created container.
    async fn start_container(&self, sandbox_id: &str, container_id: &str) -> AgentResult<Process>;

    async fn stop_container(&self, sandbox_id: &str, container_id: &str) -> AgentResult<()>;

    async fn pause_container(&self, sandbox_id: &str, container_id: &str) -> AgentResult<()>;

    async fn resume_container(&self, sandbox_id: &str, container_id: &str) -> AgentResult<()>;

    async fn update_container(
        &self,
        sandbox_id: &str,
        container_id: &str,
        resources: &LinuxResources,
    ) -> AgentResult<()>;

    /// Make `device` available inside a running container.
    async fn hotplug_device(
        &self,
        sandbox_id: &str,
        container_id: &str,
        device: &Device,
    ) -> AgentResult<()>;

    async fn stats_container(
        &self,
        sandbox_id: &str,
        container_id: &str,
    ) -> AgentResult<ContainerStats>;

    async fn process_list_container(
        &self,
        sandbox_id: &str,
        container_id: &str,
        options: &ProcessListOptions,
    ) -> AgentResult<ProcessList>;

    // --- processes ---

    /// Spawn a secondary process in a running container.
    async fn exec(&self, sandbox_id: &str, container_id: &str, cmd: &Cmd) -> AgentResult<Process>;

    /// Signal `process_id`, or every process of the container when `all` is set.
    async fn signal_process(
        &self,
        container_id: &str,
        process_id: &str,
        signal: Signal,
        all: bool,
    ) -> AgentResult<()>;

    async fn winsize_process(
        &self,
        container_id: &str,
        process_id: &str,
        height: u32,
        width: u32,
    ) -> AgentResult<()>;

    /// Block until the process exits and return its exit code.
    async fn wait_process(&self, container_id: &str, process_id: &str) -> AgentResult<i32>;

    /// Bring hot-added vCPUs and memory online in the guest.
    async fn online_cpu_mem(&self, cpus: u32) -> AgentResult<()>;

    // --- raw I/O ---

    async fn write_process_stdin(
        &self,
        container_id: &str,
        process_id: &str,
        data: &[u8],
    ) -> AgentResult<usize>;

    /// Not required to be idempotent; a second call may fail.
    async fn close_process_stdin(&self, container_id: &str, process_id: &str) -> AgentResult<()>;

    /// Returns 0 at end of stream.
    async fn read_process_stdout(
        &self,
        container_id: &str,
        process_id: &str,
        buf: &mut [u8],
    ) -> AgentResult<usize>;

    /// Returns 0 at end of stream.
    async fn read_process_stderr(
        &self,
        container_id: &str,
        process_id: &str,
        buf: &mut [u8],
    ) -> AgentResult<usize>;
}

// Agents are shared across tasks behind an Arc.
const _: () = {
    const fn assert_send_sync<T: Send + Sync + ?Sized>() {}
    assert_send_sync::<dyn Agent>();
};
