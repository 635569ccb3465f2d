//! JSON-RPC agent.
//!
//! Talks to the in-guest agent over the Unix socket the hypervisor exposes.
//! Requests and responses are single-line JSON-RPC 2.0 messages; process I/O
//! payloads travel base64-encoded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use nix::sys::signal::Signal;
use oci_spec::runtime::LinuxResources;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, OnceCell, oneshot};
use tokio::task::JoinHandle;

use vcbox_shared::errors::{AgentError, AgentResult};

use super::{
    Agent, AgentConfig, AgentKind, Capabilities, ContainerStats, ProcessList, ProcessListOptions,
};
use crate::model::{Cmd, ContainerConfig, Device, Process, SandboxConfig};
use crate::store::devices;

/// Default deadline for reaching the guest socket, retries included.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Interval between connection attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

/// Configuration of the RPC agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcAgentConfig {
    /// Unix socket bridged to the guest agent.
    pub socket_path: PathBuf,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl RpcAgentConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// ============================================================================
// CONNECTION
// ============================================================================

type Reply = AgentResult<serde_json::Value>;

/// Callers waiting for a reply, keyed by request id.
#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, oneshot::Sender<Reply>>,
}

type SharedPending = Arc<parking_lot::Mutex<Pending>>;

/// Mark the connection closed and fail every outstanding call.
fn fail_pending(pending: &SharedPending, reason: &str) {
    let mut pending = pending.lock();
    pending.closed = true;
    for (_, waiter) in pending.waiters.drain() {
        let _ = waiter.send(Err(AgentError::Communication(reason.to_string())));
    }
}

/// Multiplexed connection to the guest.
///
/// Requests are written under a short lock; a reader task hands each reply
/// to the caller whose request carried the same id.
struct Connection {
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    pending: SharedPending,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Connect, retrying until the guest socket shows up or `deadline` passes.
    async fn open(path: &Path, deadline: Duration) -> AgentResult<Self> {
        let start = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match UnixStream::connect(path).await {
                Ok(stream) => {
                    tracing::debug!(
                        path = %path.display(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        attempts,
                        "Connected to guest agent"
                    );
                    return Ok(Self::from_stream(stream));
                }
                Err(e) if start.elapsed() >= deadline => {
                    tracing::warn!(
                        path = %path.display(),
                        attempts,
                        error = %e,
                        "Guest agent connection timeout"
                    );
                    return Err(AgentError::Communication(format!(
                        "connect {} failed after {} attempts: {}",
                        path.display(),
                        attempts,
                        e
                    )));
                }
                Err(e) => {
                    tracing::trace!(
                        error = %e,
                        attempt = attempts,
                        "Connection attempt failed, retrying"
                    );
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    fn from_stream(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let pending = SharedPending::default();
        let reader = tokio::spawn(read_replies(
            BufReader::new(read_half),
            Arc::clone(&pending),
        ));
        Self {
            writer: Mutex::new(BufWriter::new(write_half)),
            pending,
            next_id: AtomicU64::new(1),
            reader,
        }
    }

    fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> Reply {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(AgentError::Communication(
                    "guest agent connection closed".into(),
                ));
            }
            pending.waiters.insert(id, tx);
        }
        // Unregisters the waiter if this call is dropped before its reply.
        let _waiter = WaiterGuard {
            pending: &self.pending,
            id,
        };

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        tracing::debug!(method = %method, id, "Sending agent request");
        self.send(&line).await?;

        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(AgentError::Communication(
                "guest agent connection closed".into(),
            )),
        }
    }

    async fn send(&self, line: &[u8]) -> AgentResult<()> {
        let mut writer = self.writer.lock().await;
        // A write cut short leaves a partial line on the wire.
        let mut torn = TornWriteGuard {
            pending: &self.pending,
            armed: true,
        };
        writer.write_all(line).await?;
        writer.flush().await?;
        torn.armed = false;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

struct WaiterGuard<'a> {
    pending: &'a SharedPending,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().waiters.remove(&self.id);
    }
}

struct TornWriteGuard<'a> {
    pending: &'a SharedPending,
    armed: bool,
}

impl Drop for TornWriteGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            fail_pending(self.pending, "request write to guest agent did not complete");
        }
    }
}

/// Route replies to their waiters until the stream ends or breaks.
async fn read_replies(mut reader: BufReader<OwnedReadHalf>, pending: SharedPending) {
    let reason = loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => break "guest agent closed the connection".to_string(),
            Ok(_) => {}
            Err(e) => break format!("read from guest agent failed: {}", e),
        }
        let response: serde_json::Value = match serde_json::from_str(&line) {
            Ok(response) => response,
            Err(e) => break format!("malformed message: {}", e),
        };
        let Some(id) = response.get("id").and_then(|v| v.as_u64()) else {
            tracing::warn!("Discarding guest agent message without id");
            continue;
        };

        let waiter = pending.lock().waiters.remove(&id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(into_reply(id, response));
            }
            None => tracing::debug!(id, "Discarding reply to an abandoned request"),
        }
    };
    tracing::debug!(reason = %reason, "Guest agent connection closed");
    fail_pending(&pending, &reason);
}

fn into_reply(id: u64, response: serde_json::Value) -> Reply {
    if let Some(error) = response.get("error") {
        let code = error.get("code").and_then(|v| v.as_i64()).unwrap_or(-1) as i32;
        let message = error
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
            .to_string();
        tracing::debug!(id, code, message = %message, "Agent returned error");
        return Err(AgentError::Rpc { code, message });
    }

    response
        .get("result")
        .cloned()
        .ok_or_else(|| AgentError::Communication("response without result".into()))
}

// ============================================================================
// RPC AGENT
// ============================================================================

#[derive(Debug, Deserialize)]
struct ProcessReply {
    token: String,
    #[serde(default)]
    pid: i32,
}

#[derive(Debug, Deserialize)]
struct WriteReply {
    written: usize,
}

#[derive(Debug, Deserialize)]
struct ReadReply {
    data: String,
}

#[derive(Debug, Deserialize)]
struct WaitReply {
    exit_code: i32,
}

#[derive(Debug, Deserialize)]
struct ProcessListReply {
    output: String,
}

/// Agent speaking newline-delimited JSON-RPC to the guest.
pub struct RpcAgent {
    config: OnceCell<RpcAgentConfig>,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl Default for RpcAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcAgent {
    pub fn new() -> Self {
        Self {
            config: OnceCell::new(),
            connection: Mutex::new(None),
        }
    }

    fn config(&self) -> AgentResult<&RpcAgentConfig> {
        self.config.get().ok_or(AgentError::NotReady)
    }

    /// Current connection, reconnecting once the previous one has closed.
    async fn connection(&self, config: &RpcAgentConfig) -> AgentResult<Arc<Connection>> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref().filter(|conn| !conn.is_closed()) {
            return Ok(Arc::clone(conn));
        }
        let conn = Connection::open(&config.socket_path, config.connect_timeout()).await?;
        let conn = Arc::new(conn);
        *guard = Some(Arc::clone(&conn));
        Ok(conn)
    }

    async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> AgentResult<R> {
        let conn = self.connection(self.config()?).await?;
        let result = conn.call(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn call_unit(&self, method: &str, params: serde_json::Value) -> AgentResult<()> {
        let _: IgnoredAny = self.call(method, params).await?;
        Ok(())
    }

    async fn read_stream(
        &self,
        method: &str,
        container_id: &str,
        process_id: &str,
        buf: &mut [u8],
    ) -> AgentResult<usize> {
        let reply: ReadReply = self
            .call(
                method,
                json!({ "container_id": container_id, "process_id": process_id, "len": buf.len() }),
            )
            .await?;
        let data = BASE64
            .decode(reply.data.as_bytes())
            .map_err(|e| AgentError::Communication(format!("invalid stream payload: {}", e)))?;
        if data.len() > buf.len() {
            return Err(AgentError::Communication(format!(
                "guest returned {} bytes for a {} byte read",
                data.len(),
                buf.len()
            )));
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

fn process_from_reply(reply: ProcessReply, tty: bool) -> Process {
    let mut process = Process::new(reply.token, reply.pid);
    process.tty = tty;
    process
}

#[async_trait]
impl Agent for RpcAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Rpc
    }

    async fn init(&self, sandbox_id: &str, config: &AgentConfig) -> AgentResult<()> {
        let AgentConfig::Rpc(rpc) = config else {
            return Err(AgentError::Config(format!(
                "rpc agent cannot use {} configuration",
                config.kind()
            )));
        };
        let stored = self.config.get_or_init(|| async { rpc.clone() }).await;
        if stored != rpc {
            return Err(AgentError::Config("agent already initialized".into()));
        }

        self.connection(rpc).await?;
        tracing::info!(
            sandbox_id = %sandbox_id,
            socket = %rpc.socket_path.display(),
            "RPC agent initialized"
        );
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn state(&self) -> serde_json::Value {
        match self.config.get() {
            Some(config) => json!({ "type": AgentKind::Rpc, "socket_path": config.socket_path }),
            None => json!({ "type": AgentKind::Rpc }),
        }
    }

    async fn check(&self) -> AgentResult<()> {
        self.call_unit("check", json!({})).await
    }

    async fn disconnect(&self) -> AgentResult<()> {
        let conn = self.connection.lock().await.take();
        if let Some(conn) = conn {
            conn.writer.lock().await.shutdown().await?;
        }
        Ok(())
    }

    async fn create_sandbox(&self, config: &SandboxConfig) -> AgentResult<()> {
        self.call_unit(
            "create_sandbox",
            json!({
                "sandbox_id": config.id,
                "network": config.network,
                "annotations": config.annotations,
            }),
        )
        .await
    }

    async fn start_sandbox(&self, sandbox_id: &str) -> AgentResult<()> {
        self.call_unit("start_sandbox", json!({ "sandbox_id": sandbox_id }))
            .await
    }

    async fn stop_sandbox(&self, sandbox_id: &str) -> AgentResult<()> {
        self.call_unit("stop_sandbox", json!({ "sandbox_id": sandbox_id }))
            .await
    }

    async fn cleanup_sandbox(&self, sandbox_id: &str) -> AgentResult<()> {
        self.call_unit("cleanup_sandbox", json!({ "sandbox_id": sandbox_id }))
            .await
    }

    async fn create_container(
        &self,
        sandbox_id: &str,
        config: &ContainerConfig,
    ) -> AgentResult<()> {
        self.call_unit(
            "create_container",
            json!({ "sandbox_id": sandbox_id, "config": config }),
        )
        .await
    }

    async fn start_container(&self, sandbox_id: &str, container_id: &str) -> AgentResult<Process> {
        let reply: ProcessReply = self
            .call(
                "start_container",
                json!({ "sandbox_id": sandbox_id, "container_id": container_id }),
            )
            .await?;
        Ok(process_from_reply(reply, false))
    }

    async fn stop_container(&self, sandbox_id: &str, container_id: &str) -> AgentResult<()> {
        self.call_unit(
            "stop_container",
            json!({ "sandbox_id": sandbox_id, "container_id": container_id }),
        )
        .await
    }

    async fn pause_container(&self, sandbox_id: &str, container_id: &str) -> AgentResult<()> {
        self.call_unit(
            "pause_container",
            json!({ "sandbox_id": sandbox_id, "container_id": container_id }),
        )
        .await
    }

    async fn resume_container(&self, sandbox_id: &str, container_id: &str) -> AgentResult<()> {
        self.call_unit(
            "resume_container",
            json!({ "sandbox_id": sandbox_id, "container_id": container_id }),
        )
        .await
    }

    async fn update_container(
        &self,
        sandbox_id: &str,
        container_id: &str,
        resources: &LinuxResources,
    ) -> AgentResult<()> {
        self.call_unit(
            "update_container",
            json!({
                "sandbox_id": sandbox_id,
                "container_id": container_id,
                "resources": resources,
            }),
        )
        .await
    }

    async fn hotplug_device(
        &self,
        sandbox_id: &str,
        container_id: &str,
        device: &Device,
    ) -> AgentResult<()> {
        self.call_unit(
            "hotplug_device",
            json!({
                "sandbox_id": sandbox_id,
                "container_id": container_id,
                "device": devices::envelope(device)?,
            }),
        )
        .await
    }

    async fn stats_container(
        &self,
        sandbox_id: &str,
        container_id: &str,
    ) -> AgentResult<ContainerStats> {
        self.call(
            "stats_container",
            json!({ "sandbox_id": sandbox_id, "container_id": container_id }),
        )
        .await
    }

    async fn process_list_container(
        &self,
        sandbox_id: &str,
        container_id: &str,
        options: &ProcessListOptions,
    ) -> AgentResult<ProcessList> {
        let reply: ProcessListReply = self
            .call(
                "process_list_container",
                json!({
                    "sandbox_id": sandbox_id,
                    "container_id": container_id,
                    "format": options.format,
                    "args": options.args,
                }),
            )
            .await?;
        Ok(ProcessList(reply.output.into_bytes()))
    }

    async fn exec(&self, sandbox_id: &str, container_id: &str, cmd: &Cmd) -> AgentResult<Process> {
        let reply: ProcessReply = self
            .call(
                "exec",
                json!({ "sandbox_id": sandbox_id, "container_id": container_id, "cmd": cmd }),
            )
            .await?;
        Ok(process_from_reply(reply, cmd.tty))
    }

    async fn signal_process(
        &self,
        container_id: &str,
        process_id: &str,
        signal: Signal,
        all: bool,
    ) -> AgentResult<()> {
        self.call_unit(
            "signal_process",
            json!({
                "container_id": container_id,
                "process_id": process_id,
                "signal": signal as i32,
                "all": all,
            }),
        )
        .await
    }

    async fn winsize_process(
        &self,
        container_id: &str,
        process_id: &str,
        height: u32,
        width: u32,
    ) -> AgentResult<()> {
        self.call_unit(
            "winsize_process",
            json!({
                "container_id": container_id,
                "process_id": process_id,
                "height": height,
                "width": width,
            }),
        )
        .await
    }

    async fn wait_process(&self, container_id: &str, process_id: &str) -> AgentResult<i32> {
        let reply: WaitReply = self
            .call(
                "wait_process",
                json!({ "container_id": container_id, "process_id": process_id }),
            )
            .await?;
        Ok(reply.exit_code)
    }

    async fn online_cpu_mem(&self, cpus: u32) -> AgentResult<()> {
        self.call_unit("online_cpu_mem", json!({ "cpus": cpus }))
            .await
    }

    async fn write_process_stdin(
        &self,
        container_id: &str,
        process_id: &str,
        data: &[u8],
    ) -> AgentResult<usize> {
        let reply: WriteReply = self
            .call(
                "write_process_stdin",
                json!({
                    "container_id": container_id,
                    "process_id": process_id,
                    "data": BASE64.encode(data),
                }),
            )
            .await?;
        Ok(reply.written)
    }

    async fn close_process_stdin(&self, container_id: &str, process_id: &str) -> AgentResult<()> {
        self.call_unit(
            "close_process_stdin",
            json!({ "container_id": container_id, "process_id": process_id }),
        )
        .await
    }

    async fn read_process_stdout(
        &self,
        container_id: &str,
        process_id: &str,
        buf: &mut [u8],
    ) -> AgentResult<usize> {
        self.read_stream("read_process_stdout", container_id, process_id, buf)
            .await
    }

    async fn read_process_stderr(
        &self,
        container_id: &str,
        process_id: &str,
        buf: &mut [u8],
    ) -> AgentResult<usize> {
        self.read_stream("read_process_stderr", container_id, process_id, buf)
            .await
    }
}
