//! Sandbox configuration (`config.json` at sandbox level).

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use vcbox_shared::errors::{VcError, VcResult};

use super::container::ContainerConfig;
use super::network::NetworkNamespace;
use crate::agent::AgentConfig;

// ============================================================================
// HYPERVISOR CONFIG
// ============================================================================

pub const DEFAULT_HYPERVISOR_PATH: &str = "/usr/bin/qemu-lite-system-x86_64";
pub const DEFAULT_KERNEL_PATH: &str = "/usr/share/kata-containers/vmlinuz.container";
pub const DEFAULT_IMAGE_PATH: &str = "/usr/share/kata-containers/kata-containers.img";
pub const DEFAULT_MACHINE_TYPE: &str = "pc";
pub const DEFAULT_VCPUS: u32 = 1;
pub const DEFAULT_MEMORY_MIB: u32 = 2048;
pub const DEFAULT_BLOCK_DRIVER: &str = "virtio-scsi";

/// Guest VM parameters handed to the hypervisor collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    pub path: PathBuf,
    pub kernel_path: PathBuf,
    pub image_path: PathBuf,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub kernel_params: Vec<String>,
    pub machine_type: String,
    pub default_vcpus: u32,
    pub default_memory_mib: u32,
    pub block_device_driver: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_HYPERVISOR_PATH.into(),
            kernel_path: DEFAULT_KERNEL_PATH.into(),
            image_path: DEFAULT_IMAGE_PATH.into(),
            kernel_params: Vec::new(),
            machine_type: DEFAULT_MACHINE_TYPE.to_string(),
            default_vcpus: DEFAULT_VCPUS,
            default_memory_mib: DEFAULT_MEMORY_MIB,
            block_device_driver: DEFAULT_BLOCK_DRIVER.to_string(),
        }
    }
}

impl HypervisorConfig {
    pub fn validate(&self) -> VcResult<()> {
        if self.default_vcpus == 0 {
            return Err(VcError::Config("default_vcpus must be at least 1".into()));
        }
        if self.default_memory_mib == 0 {
            return Err(VcError::Config(
                "default_memory_mib must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// SANDBOX CONFIG
// ============================================================================

/// Everything needed to create a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub id: String,
    #[serde(default)]
    pub hypervisor: HypervisorConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub network: NetworkNamespace,
    /// Containers created together with the sandbox.
    #[serde(default)]
    pub containers: Vec<ContainerConfig>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl SandboxConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hypervisor: HypervisorConfig::default(),
            agent: AgentConfig::default(),
            network: NetworkNamespace::default(),
            containers: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn with_container(mut self, container: ContainerConfig) -> Self {
        self.containers.push(container);
        self
    }

    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agent = agent;
        self
    }

    /// Check identifiers and hypervisor parameters.
    pub fn validate(&self) -> VcResult<()> {
        if self.id.is_empty() {
            return Err(VcError::MissingIdentifier("sandbox"));
        }
        self.hypervisor.validate()?;

        let mut seen = std::collections::BTreeSet::new();
        for container in &self.containers {
            if container.id.is_empty() {
                return Err(VcError::MissingIdentifier("container"));
            }
            if !seen.insert(container.id.as_str()) {
                return Err(VcError::AlreadyExists(format!(
                    "container {} in sandbox {}",
                    container.id, self.id
                )));
            }
        }
        Ok(())
    }
}
