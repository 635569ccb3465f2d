//! Container configuration, process and mount records.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::device::Device;
use super::state::State;

// ============================================================================
// COMMAND
// ============================================================================

/// Command run as a container's primary process or through exec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Cmd {
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub tty: bool,
}

impl Cmd {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }
}

// ============================================================================
// PROCESS
// ============================================================================

/// Process started inside a container (`process.json` for the primary one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    /// Identifier of the process inside its container, used by every I/O call.
    pub token: String,
    /// Host-visible pid of the process shim, zero when the agent has none.
    #[serde(default)]
    pub pid: i32,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub tty: bool,
}

impl Process {
    pub fn new(token: impl Into<String>, pid: i32) -> Self {
        Self {
            token: token.into(),
            pid,
            start_time: Utc::now(),
            tty: false,
        }
    }
}

// ============================================================================
// MOUNT
// ============================================================================

/// Mount applied in order when the container starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub destination: PathBuf,
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub options: Vec<String>,
    /// Host path of the shared directory backing this mount, once set up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<PathBuf>,
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    pub fn bind(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            fs_type: "bind".to_string(),
            options: vec!["rbind".to_string()],
            host_path: None,
            read_only: false,
        }
    }
}

// ============================================================================
// CONTAINER CONFIG
// ============================================================================

/// Role of a container within its pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContainerType {
    /// Infra container; shares its id with the sandbox.
    PodSandbox,
    #[default]
    PodContainer,
}

impl ContainerType {
    pub fn is_sandbox(self) -> bool {
        self == ContainerType::PodSandbox
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerType::PodSandbox => f.write_str("pod_sandbox"),
            ContainerType::PodContainer => f.write_str("pod_container"),
        }
    }
}

/// Immutable container description captured at creation (`config.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub id: String,
    #[serde(default)]
    pub container_type: ContainerType,
    /// Container root filesystem on the host.
    #[serde(default)]
    pub rootfs: PathBuf,
    pub cmd: Cmd,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Initial resource limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<oci_spec::runtime::LinuxResources>,
}

/// Device requested in a container config, resolved into a [`Device`] at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    #[serde(default = "default_dev_type")]
    pub dev_type: String,
    #[serde(default)]
    pub major: i64,
    #[serde(default)]
    pub minor: i64,
}

fn default_dev_type() -> String {
    "c".to_string()
}

impl ContainerConfig {
    pub fn new(id: impl Into<String>, cmd: Cmd) -> Self {
        Self {
            id: id.into(),
            container_type: ContainerType::PodContainer,
            rootfs: PathBuf::new(),
            cmd,
            mounts: Vec::new(),
            devices: Vec::new(),
            annotations: BTreeMap::new(),
            resources: None,
        }
    }

    pub fn with_type(mut self, container_type: ContainerType) -> Self {
        self.container_type = container_type;
        self
    }
}

// ============================================================================
// CONTAINER
// ============================================================================

/// Live container owned by a sandbox for the duration of one operation.
#[derive(Debug, Clone)]
pub struct Container {
    pub config: ContainerConfig,
    pub state: State,
    /// Primary process, set once the container has started.
    pub process: Option<Process>,
    pub mounts: Vec<Mount>,
    pub devices: Vec<Device>,
}

impl Container {
    pub fn id(&self) -> &str {
        &self.config.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_builder() {
        let cmd = Cmd::new(["sh", "-c", "echo hi"])
            .env("PATH", "/bin")
            .working_dir("/root")
            .tty(true);
        assert_eq!(cmd.args, vec!["sh", "-c", "echo hi"]);
        assert_eq!(cmd.env, vec![("PATH".to_string(), "/bin".to_string())]);
        assert_eq!(cmd.working_dir.as_deref(), Some("/root"));
        assert!(cmd.tty);
    }

    #[test]
    fn test_container_type_defaults_to_pod_container() {
        let json = r#"{"id":"c1","cmd":{"args":["true"]}}"#;
        let config: ContainerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.container_type, ContainerType::PodContainer);
        assert!(config.mounts.is_empty());
    }

    #[test]
    fn test_container_type_wire_names() {
        let json = serde_json::to_string(&ContainerType::PodSandbox).unwrap();
        assert_eq!(json, r#""pod_sandbox""#);
    }

    #[test]
    fn test_mount_type_field_name() {
        let mount = Mount::bind("/src", "/dst");
        let value = serde_json::to_value(&mount).unwrap();
        assert_eq!(value["type"], "bind");
    }
}
