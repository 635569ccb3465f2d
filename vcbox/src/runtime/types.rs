//! Status snapshots returned by the runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Container, ContainerType, StateKind};
use crate::sandbox::Sandbox;

/// Public view of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub id: String,
    pub container_type: ContainerType,
    pub state: StateKind,
    /// Primary process pid, once started.
    pub pid: Option<i32>,
    pub rootfs: String,
    pub last_updated: Option<DateTime<Utc>>,
}

impl From<&Container> for ContainerStatus {
    fn from(container: &Container) -> Self {
        Self {
            id: container.id().to_string(),
            container_type: container.config.container_type,
            state: container.state.state,
            pid: container.process.as_ref().map(|p| p.pid),
            rootfs: container.config.rootfs.display().to_string(),
            last_updated: container.state.last_updated,
        }
    }
}

/// Public view of a sandbox and its containers (`state` and `list` output).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxStatus {
    pub id: String,
    pub state: StateKind,
    pub hotplugged_vcpus: u32,
    pub last_updated: Option<DateTime<Utc>>,
    pub containers: Vec<ContainerStatus>,
}

impl From<&Sandbox> for SandboxStatus {
    fn from(sandbox: &Sandbox) -> Self {
        Self {
            id: sandbox.id().to_string(),
            state: sandbox.state().state,
            hotplugged_vcpus: sandbox.state().hotplugged_vcpus,
            last_updated: sandbox.state().last_updated,
            containers: sandbox.containers().map(ContainerStatus::from).collect(),
        }
    }
}

impl SandboxStatus {
    pub fn container(&self, container_id: &str) -> Option<&ContainerStatus> {
        self.containers.iter().find(|c| c.id == container_id)
    }
}

/// What a command-line identifier refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The whole sandbox, addressed by its own id or by its pod sandbox
    /// container.
    Sandbox {
        sandbox_id: String,
        container_id: Option<String>,
    },
    Container {
        sandbox_id: String,
        container_id: String,
    },
}

impl Target {
    pub fn sandbox_id(&self) -> &str {
        match self {
            Target::Sandbox { sandbox_id, .. } | Target::Container { sandbox_id, .. } => sandbox_id,
        }
    }

    pub fn container_id(&self) -> Option<&str> {
        match self {
            Target::Sandbox { container_id, .. } => container_id.as_deref(),
            Target::Container { container_id, .. } => Some(container_id),
        }
    }
}
