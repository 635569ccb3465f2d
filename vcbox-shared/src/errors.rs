//! Error types shared by every vcbox crate.

use std::io;

use thiserror::Error;

use crate::layout::{ResourceKind, ResourceScope};

/// Result alias used across vcbox.
pub type VcResult<T> = Result<T, VcError>;

/// Result alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Failures raised by an agent implementation.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A method was called before `init`.
    #[error("agent not ready: init has not been called")]
    NotReady,

    /// Read, write or close on an already closed stream handle.
    #[error("stream closed")]
    StreamClosed,

    /// Transport level failure talking to the guest.
    #[error("guest communication failed: {0}")]
    Communication(String),

    /// The guest answered with an error.
    #[error("guest returned error {code}: {message}")]
    Rpc { code: i32, message: String },

    /// The agent variant does not implement this operation or capability.
    #[error("unsupported agent operation: {0}")]
    Unsupported(String),

    /// Agent configuration does not match the agent variant.
    #[error("invalid agent configuration: {0}")]
    Config(String),
}

impl From<io::Error> for AgentError {
    fn from(err: io::Error) -> Self {
        AgentError::Communication(err.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Communication(format!("malformed message: {}", err))
    }
}

/// Errors returned by the store, the state machine and the runtime.
#[derive(Debug, Error)]
pub enum VcError {
    /// Empty sandbox or container identifier.
    #[error("missing {0} identifier")]
    MissingIdentifier(&'static str),

    #[error("{kind} resource not found for {scope}")]
    NotFound {
        kind: ResourceKind,
        scope: ResourceScope,
    },

    /// The file exists but does not deserialize.
    #[error("corrupt {kind} resource for {scope}: {source}")]
    CorruptData {
        kind: ResourceKind,
        scope: ResourceScope,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid resource kind {kind}: {reason}")]
    InvalidResourceKind { kind: ResourceKind, reason: String },

    #[error("unknown device type {0:?}")]
    UnknownDeviceType(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// An agent call failed; carries the operation and the resource it targeted.
    #[error("agent {operation} failed for {scope}: {source}")]
    Agent {
        operation: &'static str,
        scope: ResourceScope,
        #[source]
        source: AgentError,
    },

    /// State machine precondition violated.
    #[error("cannot {operation} {subject} in {from} state")]
    IllegalTransition {
        subject: String,
        from: String,
        operation: &'static str,
    },

    #[error("sandbox {sandbox_id} is not running (state: {state})")]
    SandboxNotRunning { sandbox_id: String, state: String },

    #[error("container {container_id} in sandbox {sandbox_id} is not running (state: {state})")]
    ContainerNotRunning {
        sandbox_id: String,
        container_id: String,
        state: String,
    },

    #[error("container {container_id} not found in sandbox {sandbox_id}")]
    ContainerNotFound {
        sandbox_id: String,
        container_id: String,
    },

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Non-blocking lock attempt while another process holds the lock.
    #[error("sandbox {sandbox_id} is locked by another process")]
    Locked { sandbox_id: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VcError {
    /// Wrap an I/O error with a short description of what was attempted.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        VcError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn agent(operation: &'static str, scope: ResourceScope, source: AgentError) -> Self {
        VcError::Agent {
            operation,
            scope,
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            VcError::NotFound { .. } | VcError::ContainerNotFound { .. }
        )
    }
}
