//! Per-process stdio handles routed through the agent.
//!
//! Each direction carries its own closed flag. Clones of a handle share that
//! flag; the other directions are unaffected.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use vcbox_shared::errors::{AgentError, AgentResult};

use super::Agent;

/// Read size used by [`OutputReader::read_to_end`].
const READ_CHUNK: usize = 32 * 1024;

/// Process addressed by a stream.
struct StreamTarget {
    agent: Arc<dyn Agent>,
    container_id: String,
    process_id: String,
}

/// The three stdio handles of one process.
pub struct IoStream {
    stdin: StdinWriter,
    stdout: OutputReader,
    stderr: OutputReader,
}

impl IoStream {
    pub fn new(
        agent: Arc<dyn Agent>,
        container_id: impl Into<String>,
        process_id: impl Into<String>,
    ) -> Self {
        let target = Arc::new(StreamTarget {
            agent,
            container_id: container_id.into(),
            process_id: process_id.into(),
        });
        Self {
            stdin: StdinWriter {
                target: Arc::clone(&target),
                closed: Arc::new(AtomicBool::new(false)),
            },
            stdout: OutputReader {
                target: Arc::clone(&target),
                kind: OutputKind::Stdout,
                closed: Arc::new(AtomicBool::new(false)),
            },
            stderr: OutputReader {
                target,
                kind: OutputKind::Stderr,
                closed: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    pub fn stdin(&self) -> StdinWriter {
        self.stdin.clone()
    }

    pub fn stdout(&self) -> OutputReader {
        self.stdout.clone()
    }

    pub fn stderr(&self) -> OutputReader {
        self.stderr.clone()
    }

    pub fn into_parts(self) -> (StdinWriter, OutputReader, OutputReader) {
        (self.stdin, self.stdout, self.stderr)
    }

    /// Read stdout and stderr to end of stream concurrently.
    pub async fn collect_output(&self) -> AgentResult<(Vec<u8>, Vec<u8>)> {
        futures::try_join!(self.stdout.read_to_end(), self.stderr.read_to_end())
    }
}

// ============================================================================
// STDIN
// ============================================================================

/// Write half of a process's stdin.
#[derive(Clone)]
pub struct StdinWriter {
    target: Arc<StreamTarget>,
    closed: Arc<AtomicBool>,
}

impl StdinWriter {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn write(&self, data: &[u8]) -> AgentResult<usize> {
        if self.is_closed() {
            return Err(AgentError::StreamClosed);
        }
        let t = &self.target;
        t.agent
            .write_process_stdin(&t.container_id, &t.process_id, data)
            .await
    }

    /// Write until every byte has been accepted by the agent.
    pub async fn write_all(&self, mut data: &[u8]) -> AgentResult<()> {
        while !data.is_empty() {
            let n = self.write(data).await?;
            if n == 0 {
                return Err(AgentError::Communication(
                    "agent accepted no stdin bytes".into(),
                ));
            }
            data = &data[n.min(data.len())..];
        }
        Ok(())
    }

    /// Close stdin in the guest.
    ///
    /// A second close fails with `StreamClosed`. The handle only counts as
    /// closed once the agent call succeeded.
    pub async fn close(&self) -> AgentResult<()> {
        if self.is_closed() {
            return Err(AgentError::StreamClosed);
        }
        let t = &self.target;
        t.agent
            .close_process_stdin(&t.container_id, &t.process_id)
            .await?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

// ============================================================================
// STDOUT / STDERR
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputKind {
    Stdout,
    Stderr,
}

/// Read half of a process's stdout or stderr.
#[derive(Clone)]
pub struct OutputReader {
    target: Arc<StreamTarget>,
    kind: OutputKind,
    closed: Arc<AtomicBool>,
}

impl OutputReader {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read into `buf`; 0 means end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> AgentResult<usize> {
        if self.is_closed() {
            return Err(AgentError::StreamClosed);
        }
        let t = &self.target;
        match self.kind {
            OutputKind::Stdout => {
                t.agent
                    .read_process_stdout(&t.container_id, &t.process_id, buf)
                    .await
            }
            OutputKind::Stderr => {
                t.agent
                    .read_process_stderr(&t.container_id, &t.process_id, buf)
                    .await
            }
        }
    }

    pub async fn read_to_end(&self) -> AgentResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Stop reading. Host side only; the guest is not told.
    pub fn close(&self) -> AgentResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(AgentError::StreamClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentConfig, NoopAgent};

    async fn noop_stream() -> IoStream {
        let agent = Arc::new(NoopAgent::new());
        agent.init("sb", &AgentConfig::Noop).await.unwrap();
        IoStream::new(agent, "c1", "p1")
    }

    #[tokio::test]
    async fn test_stdin_double_close() {
        let stream = noop_stream().await;
        let stdin = stream.stdin();

        stdin.close().await.unwrap();
        assert!(matches!(stdin.close().await, Err(AgentError::StreamClosed)));
        assert!(matches!(
            stdin.write(b"late").await,
            Err(AgentError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_clones_share_closed_flag() {
        let stream = noop_stream().await;
        let a = stream.stdin();
        let b = stream.stdin();

        a.close().await.unwrap();
        assert!(b.is_closed());
        assert!(matches!(b.close().await, Err(AgentError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_directions_are_independent() {
        let stream = noop_stream().await;
        stream.stdin().close().await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(stream.stdout().read(&mut buf).await.unwrap(), 0);

        stream.stderr().close().unwrap();
        assert!(matches!(
            stream.stderr().read(&mut buf).await,
            Err(AgentError::StreamClosed)
        ));
        assert!(matches!(stream.stderr().close(), Err(AgentError::StreamClosed)));
        assert!(!stream.stdout().is_closed());
    }

    #[tokio::test]
    async fn test_failed_close_leaves_stdin_open() {
        // Not initialized: every agent call fails with NotReady.
        let stream = IoStream::new(Arc::new(NoopAgent::new()), "c1", "p1");
        let stdin = stream.stdin();

        assert!(matches!(stdin.close().await, Err(AgentError::NotReady)));
        assert!(!stdin.is_closed());
    }

    #[tokio::test]
    async fn test_agent_errors_propagate_unchanged() {
        let stream = IoStream::new(Arc::new(NoopAgent::new()), "c1", "p1");
        let mut buf = [0u8; 4];
        assert!(matches!(
            stream.stdout().read(&mut buf).await,
            Err(AgentError::NotReady)
        ));
        assert!(matches!(
            stream.stdin().write(b"x").await,
            Err(AgentError::NotReady)
        ));
    }

    #[tokio::test]
    async fn test_collect_output_at_eof() {
        let stream = noop_stream().await;
        let (out, err) = stream.collect_output().await.unwrap();
        assert!(out.is_empty());
        assert!(err.is_empty());
    }
}
