//! On-disk layout of the resource store.
//!
//! Every sandbox owns one directory under each of two roots:
//! ```text
//! {config_root}/                 # stable, survives reboots
//! └── {sandbox_id}/
//!     ├── config.json            # SandboxConfig
//!     └── {container_id}/
//!         └── config.json        # ContainerConfig
//!
//! {runtime_root}/                # ephemeral, per boot
//! └── {sandbox_id}/
//!     ├── state.json
//!     ├── network.json
//!     ├── hypervisor.json
//!     ├── agent.json
//!     ├── lock
//!     └── {container_id}/
//!         ├── state.json
//!         ├── process.json
//!         ├── mounts.json
//!         └── devices.json
//! ```
//!
//! Lives in vcbox-shared so the CLI can resolve paths without pulling in the
//! whole runtime.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{VcError, VcResult};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Default configuration root.
pub const DEFAULT_CONFIG_ROOT: &str = "/var/lib/vc/sbs";

/// Default runtime root.
pub const DEFAULT_RUNTIME_ROOT: &str = "/run/vc/sbs";

/// Permission bits for every directory the store creates.
pub const DIR_MODE: u32 = 0o750;

/// Canonical resource file names.
pub mod files {
    pub const CONFIG: &str = "config.json";
    pub const STATE: &str = "state.json";
    pub const NETWORK: &str = "network.json";
    pub const HYPERVISOR: &str = "hypervisor.json";
    pub const AGENT: &str = "agent.json";
    pub const PROCESS: &str = "process.json";
    pub const LOCK: &str = "lock";
    pub const MOUNTS: &str = "mounts.json";
    pub const DEVICES: &str = "devices.json";
}

// ============================================================================
// RESOURCE KIND
// ============================================================================

/// Which of the two roots a resource lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageRoot {
    /// Stable configuration root.
    Config,
    /// Ephemeral runtime root.
    Runtime,
}

/// Kind of persisted resource.
///
/// The root and the file name of each kind are fixed; see [`ResourceKind::root`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Config,
    State,
    Network,
    Hypervisor,
    Agent,
    Process,
    Lock,
    Mounts,
    Devices,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 9] = [
        ResourceKind::Config,
        ResourceKind::State,
        ResourceKind::Network,
        ResourceKind::Hypervisor,
        ResourceKind::Agent,
        ResourceKind::Process,
        ResourceKind::Lock,
        ResourceKind::Mounts,
        ResourceKind::Devices,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Config => "config",
            ResourceKind::State => "state",
            ResourceKind::Network => "network",
            ResourceKind::Hypervisor => "hypervisor",
            ResourceKind::Agent => "agent",
            ResourceKind::Process => "process",
            ResourceKind::Lock => "lock",
            ResourceKind::Mounts => "mounts",
            ResourceKind::Devices => "devices",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            ResourceKind::Config => files::CONFIG,
            ResourceKind::State => files::STATE,
            ResourceKind::Network => files::NETWORK,
            ResourceKind::Hypervisor => files::HYPERVISOR,
            ResourceKind::Agent => files::AGENT,
            ResourceKind::Process => files::PROCESS,
            ResourceKind::Lock => files::LOCK,
            ResourceKind::Mounts => files::MOUNTS,
            ResourceKind::Devices => files::DEVICES,
        }
    }

    /// Root directory this kind is stored under.
    pub fn root(self) -> StorageRoot {
        match self {
            ResourceKind::Config => StorageRoot::Config,
            _ => StorageRoot::Runtime,
        }
    }

    /// Kinds that only ever exist at sandbox level.
    ///
    /// A container id supplied for one of these is ignored.
    pub fn is_sandbox_only(self) -> bool {
        matches!(
            self,
            ResourceKind::Lock
                | ResourceKind::Network
                | ResourceKind::Hypervisor
                | ResourceKind::Agent
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// RESOURCE SCOPE
// ============================================================================

/// Addressing of a resource: a whole sandbox, or one container inside it.
///
/// Choosing `Sandbox` is the explicit declaration of a sandbox-level
/// operation; container-scoped kinds then resolve to the sandbox directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceScope {
    Sandbox(String),
    Container {
        sandbox_id: String,
        container_id: String,
    },
}

impl ResourceScope {
    pub fn sandbox(sandbox_id: impl Into<String>) -> Self {
        ResourceScope::Sandbox(sandbox_id.into())
    }

    pub fn container(sandbox_id: impl Into<String>, container_id: impl Into<String>) -> Self {
        ResourceScope::Container {
            sandbox_id: sandbox_id.into(),
            container_id: container_id.into(),
        }
    }

    pub fn sandbox_id(&self) -> &str {
        match self {
            ResourceScope::Sandbox(id) => id,
            ResourceScope::Container { sandbox_id, .. } => sandbox_id,
        }
    }

    pub fn container_id(&self) -> Option<&str> {
        match self {
            ResourceScope::Sandbox(_) => None,
            ResourceScope::Container { container_id, .. } => Some(container_id),
        }
    }

    /// Reject empty identifiers.
    pub fn validate(&self) -> VcResult<()> {
        if self.sandbox_id().is_empty() {
            return Err(VcError::MissingIdentifier("sandbox"));
        }
        if self.container_id().is_some_and(str::is_empty) {
            return Err(VcError::MissingIdentifier("container"));
        }
        Ok(())
    }
}

impl fmt::Display for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceScope::Sandbox(id) => write!(f, "sandbox {}", id),
            ResourceScope::Container {
                sandbox_id,
                container_id,
            } => write!(f, "container {}/{}", sandbox_id, container_id),
        }
    }
}

// ============================================================================
// STORE LAYOUT
// ============================================================================

/// Resolves resource paths under the configuration and runtime roots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreLayout {
    config_root: PathBuf,
    runtime_root: PathBuf,
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_ROOT, DEFAULT_RUNTIME_ROOT)
    }
}

impl StoreLayout {
    pub fn new(config_root: impl Into<PathBuf>, runtime_root: impl Into<PathBuf>) -> Self {
        Self {
            config_root: config_root.into(),
            runtime_root: runtime_root.into(),
        }
    }

    pub fn config_root(&self) -> &Path {
        &self.config_root
    }

    pub fn runtime_root(&self) -> &Path {
        &self.runtime_root
    }

    pub fn root(&self, root: StorageRoot) -> &Path {
        match root {
            StorageRoot::Config => &self.config_root,
            StorageRoot::Runtime => &self.runtime_root,
        }
    }

    /// Sandbox directory: {root}/{sandbox_id}
    pub fn sandbox_dir(&self, root: StorageRoot, sandbox_id: &str) -> PathBuf {
        self.root(root).join(sandbox_id)
    }

    /// Container directory: {root}/{sandbox_id}/{container_id}
    pub fn container_dir(
        &self,
        root: StorageRoot,
        sandbox_id: &str,
        container_id: &str,
    ) -> PathBuf {
        self.sandbox_dir(root, sandbox_id).join(container_id)
    }

    /// Directory holding `kind` for `scope`.
    ///
    /// Sandbox-only kinds always resolve to the sandbox directory.
    pub fn resource_dir(&self, kind: ResourceKind, scope: &ResourceScope) -> PathBuf {
        let root = kind.root();
        match scope.container_id() {
            Some(cid) if !kind.is_sandbox_only() => {
                self.container_dir(root, scope.sandbox_id(), cid)
            }
            _ => self.sandbox_dir(root, scope.sandbox_id()),
        }
    }

    /// Full path of the file holding `kind` for `scope`.
    pub fn resource_path(&self, kind: ResourceKind, scope: &ResourceScope) -> PathBuf {
        self.resource_dir(kind, scope).join(kind.file_name())
    }

    /// Lock file of a sandbox: {runtime_root}/{sandbox_id}/lock
    pub fn lock_path(&self, sandbox_id: &str) -> PathBuf {
        self.sandbox_dir(StorageRoot::Runtime, sandbox_id)
            .join(files::LOCK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roots() {
        let layout = StoreLayout::default();
        assert_eq!(layout.config_root(), Path::new("/var/lib/vc/sbs"));
        assert_eq!(layout.runtime_root(), Path::new("/run/vc/sbs"));
    }

    #[test]
    fn test_kind_roots() {
        for kind in ResourceKind::ALL {
            let expected = if kind == ResourceKind::Config {
                StorageRoot::Config
            } else {
                StorageRoot::Runtime
            };
            assert_eq!(kind.root(), expected, "root of {}", kind);
        }
    }

    #[test]
    fn test_container_paths() {
        let layout = StoreLayout::new("/cfg", "/run");
        let scope = ResourceScope::container("sb", "c1");

        assert_eq!(
            layout.resource_path(ResourceKind::Config, &scope),
            PathBuf::from("/cfg/sb/c1/config.json")
        );
        assert_eq!(
            layout.resource_path(ResourceKind::Devices, &scope),
            PathBuf::from("/run/sb/c1/devices.json")
        );
    }

    #[test]
    fn test_sandbox_only_kinds_ignore_container() {
        let layout = StoreLayout::new("/cfg", "/run");
        let scope = ResourceScope::container("sb", "c1");

        for kind in [
            ResourceKind::Lock,
            ResourceKind::Network,
            ResourceKind::Hypervisor,
            ResourceKind::Agent,
        ] {
            assert!(kind.is_sandbox_only());
            assert_eq!(layout.resource_dir(kind, &scope), PathBuf::from("/run/sb"));
        }
        assert_eq!(layout.lock_path("sb"), PathBuf::from("/run/sb/lock"));
    }

    #[test]
    fn test_sandbox_scope_state() {
        let layout = StoreLayout::new("/cfg", "/run");
        assert_eq!(
            layout.resource_path(ResourceKind::State, &ResourceScope::sandbox("sb")),
            PathBuf::from("/run/sb/state.json")
        );
    }

    #[test]
    fn test_scope_validation() {
        assert!(ResourceScope::sandbox("sb").validate().is_ok());
        assert!(matches!(
            ResourceScope::sandbox("").validate(),
            Err(VcError::MissingIdentifier("sandbox"))
        ));
        assert!(matches!(
            ResourceScope::container("sb", "").validate(),
            Err(VcError::MissingIdentifier("container"))
        ));
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(ResourceScope::sandbox("sb").to_string(), "sandbox sb");
        assert_eq!(
            ResourceScope::container("sb", "c1").to_string(),
            "container sb/c1"
        );
    }
}
