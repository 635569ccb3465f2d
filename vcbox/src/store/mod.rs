//! File-backed resource store.
//!
//! Maps `(sandbox, container?, kind)` to one JSON file under the
//! configuration or runtime root (see [`vcbox_shared::layout`]). The store
//! holds no business logic: it validates addressing, serializes values and
//! moves bytes. Writes are whole-file overwrites without fsync, so a crash
//! mid-write surfaces as `CorruptData` on the next fetch.

pub mod devices;

use std::fs::{self, DirBuilder, File};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::Value;

use vcbox_shared::errors::{VcError, VcResult};
use vcbox_shared::layout::{DIR_MODE, ResourceKind, ResourceScope, StorageRoot, StoreLayout};

use crate::lock::{LockGuard, SandboxLock};
use crate::model::{
    ContainerConfig, Device, Mount, NetworkNamespace, Process, SandboxConfig, State,
};

/// Kinds removed by [`ResourceStore::delete`] when none are given.
pub const DEFAULT_DELETE_KINDS: [ResourceKind; 2] = [ResourceKind::Config, ResourceKind::State];

// ============================================================================
// RESOURCE VALUE
// ============================================================================

/// A value that can be persisted, tagged with the record it represents.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceValue {
    SandboxConfig(SandboxConfig),
    ContainerConfig(ContainerConfig),
    State(State),
    Network(NetworkNamespace),
    Process(Process),
    Mounts(Vec<Mount>),
    Devices(Vec<Device>),
    /// Opaque hypervisor state blob.
    Hypervisor(Value),
    /// Opaque agent state blob.
    Agent(Value),
}

impl ResourceValue {
    /// The only kind this value may be stored as.
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceValue::SandboxConfig(_) | ResourceValue::ContainerConfig(_) => {
                ResourceKind::Config
            }
            ResourceValue::State(_) => ResourceKind::State,
            ResourceValue::Network(_) => ResourceKind::Network,
            ResourceValue::Process(_) => ResourceKind::Process,
            ResourceValue::Mounts(_) => ResourceKind::Mounts,
            ResourceValue::Devices(_) => ResourceKind::Devices,
            ResourceValue::Hypervisor(_) => ResourceKind::Hypervisor,
            ResourceValue::Agent(_) => ResourceKind::Agent,
        }
    }

    fn encode(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            ResourceValue::SandboxConfig(v) => serde_json::to_vec(v),
            ResourceValue::ContainerConfig(v) => serde_json::to_vec(v),
            ResourceValue::State(v) => serde_json::to_vec(v),
            ResourceValue::Network(v) => serde_json::to_vec(v),
            ResourceValue::Process(v) => serde_json::to_vec(v),
            ResourceValue::Mounts(v) => serde_json::to_vec(v),
            ResourceValue::Devices(v) => devices::encode(v),
            ResourceValue::Hypervisor(v) | ResourceValue::Agent(v) => serde_json::to_vec(v),
        }
    }
}

// ============================================================================
// RESOURCE STORE
// ============================================================================

/// Durable storage of sandbox and container resources.
#[derive(Clone, Debug)]
pub struct ResourceStore {
    layout: StoreLayout,
}

impl ResourceStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    // ========================================================================
    // DIRECTORY SKELETON
    // ========================================================================

    /// Create the directory skeleton of a sandbox and its containers, plus
    /// an empty lock file.
    ///
    /// Idempotent. If anything after the sandbox directories fails, every
    /// directory of the sandbox is removed again.
    pub fn create_all_resources<'a, I>(&self, sandbox_id: &str, container_ids: I) -> VcResult<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        ResourceScope::sandbox(sandbox_id).validate()?;

        for root in [StorageRoot::Runtime, StorageRoot::Config] {
            create_dir(&self.layout.sandbox_dir(root, sandbox_id))?;
        }

        let result = container_ids
            .into_iter()
            .try_for_each(|cid| self.create_container_dirs(sandbox_id, cid))
            .and_then(|()| self.create_lock_file(sandbox_id));

        if let Err(err) = result {
            tracing::warn!(
                sandbox_id = %sandbox_id,
                error = %err,
                "Resource creation failed, rolling back sandbox directories"
            );
            if let Err(cleanup) = self.delete(&ResourceScope::sandbox(sandbox_id), &[]) {
                tracing::warn!(sandbox_id = %sandbox_id, error = %cleanup, "Rollback incomplete");
            }
            return Err(err);
        }

        tracing::debug!(sandbox_id = %sandbox_id, "Created sandbox resources");
        Ok(())
    }

    /// Create the directories of one container in an existing sandbox.
    ///
    /// On failure only that container's directories are removed.
    pub fn create_container_resources(&self, sandbox_id: &str, container_id: &str) -> VcResult<()> {
        let scope = ResourceScope::container(sandbox_id, container_id);
        scope.validate()?;

        if let Err(err) = self.create_container_dirs(sandbox_id, container_id) {
            if let Err(cleanup) = self.delete(&scope, &[]) {
                tracing::warn!(
                    sandbox_id = %sandbox_id,
                    container_id = %container_id,
                    error = %cleanup,
                    "Rollback incomplete"
                );
            }
            return Err(err);
        }
        Ok(())
    }

    fn create_container_dirs(&self, sandbox_id: &str, container_id: &str) -> VcResult<()> {
        if container_id.is_empty() {
            return Err(VcError::MissingIdentifier("container"));
        }
        for root in [StorageRoot::Runtime, StorageRoot::Config] {
            create_dir(&self.layout.container_dir(root, sandbox_id, container_id))?;
        }
        Ok(())
    }

    fn create_lock_file(&self, sandbox_id: &str) -> VcResult<()> {
        let path = self.layout.lock_path(sandbox_id);
        if path.exists() {
            return Ok(());
        }
        File::create(&path)
            .map(drop)
            .map_err(|e| VcError::io(format!("create lock file {}", path.display()), e))
    }

    // ========================================================================
    // GENERIC OPERATIONS
    // ========================================================================

    /// Overwrite the file of `kind` for `scope` with `value`.
    ///
    /// Parent directories must already exist.
    pub fn store(
        &self,
        kind: ResourceKind,
        scope: &ResourceScope,
        value: &ResourceValue,
    ) -> VcResult<()> {
        check_addressable(kind, scope)?;

        if value.kind() != kind {
            return Err(VcError::InvalidResourceKind {
                kind,
                reason: format!("value is a {} record", value.kind()),
            });
        }
        match (value, scope) {
            (ResourceValue::SandboxConfig(_), ResourceScope::Container { .. }) => {
                return Err(VcError::InvalidResourceKind {
                    kind,
                    reason: "sandbox config stored under a container".into(),
                });
            }
            (ResourceValue::ContainerConfig(_), ResourceScope::Sandbox(_)) => {
                return Err(VcError::InvalidResourceKind {
                    kind,
                    reason: "container config stored at sandbox level".into(),
                });
            }
            _ => {}
        }

        let bytes = value
            .encode()
            .map_err(|e| VcError::Internal(format!("serialize {} for {}: {}", kind, scope, e)))?;

        let path = self.layout.resource_path(kind, scope);
        fs::write(&path, bytes).map_err(|e| {
            VcError::io(format!("write {} for {} to {}", kind, scope, path.display()), e)
        })?;

        tracing::trace!(kind = %kind, scope = %scope, "Stored resource");
        Ok(())
    }

    /// Read and decode the file of `kind` for `scope`.
    pub fn fetch(&self, kind: ResourceKind, scope: &ResourceScope) -> VcResult<ResourceValue> {
        check_addressable(kind, scope)?;

        let path = self.layout.resource_path(kind, scope);
        let bytes = fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => VcError::NotFound {
                kind,
                scope: scope.clone(),
            },
            _ => VcError::io(format!("read {} for {} from {}", kind, scope, path.display()), e),
        })?;

        let value = match kind {
            ResourceKind::Config => match scope {
                ResourceScope::Sandbox(_) => {
                    ResourceValue::SandboxConfig(decode(&bytes, kind, scope)?)
                }
                ResourceScope::Container { .. } => {
                    ResourceValue::ContainerConfig(decode(&bytes, kind, scope)?)
                }
            },
            ResourceKind::State => ResourceValue::State(decode(&bytes, kind, scope)?),
            ResourceKind::Network => ResourceValue::Network(decode(&bytes, kind, scope)?),
            ResourceKind::Process => ResourceValue::Process(decode(&bytes, kind, scope)?),
            ResourceKind::Mounts => ResourceValue::Mounts(decode(&bytes, kind, scope)?),
            ResourceKind::Devices => ResourceValue::Devices(devices::decode(&bytes, scope)?),
            ResourceKind::Hypervisor => ResourceValue::Hypervisor(decode(&bytes, kind, scope)?),
            ResourceKind::Agent => ResourceValue::Agent(decode(&bytes, kind, scope)?),
            ResourceKind::Lock => return Err(lock_not_addressable()),
        };

        Ok(value)
    }

    /// Remove the directories holding `kinds` for `scope`.
    ///
    /// An empty `kinds` means config and state. At sandbox scope the whole
    /// sandbox directory under each kind's root goes, container subtrees
    /// included. Directories that are already gone are not an error.
    pub fn delete(&self, scope: &ResourceScope, kinds: &[ResourceKind]) -> VcResult<()> {
        scope.validate()?;
        let kinds = if kinds.is_empty() {
            &DEFAULT_DELETE_KINDS[..]
        } else {
            kinds
        };

        for kind in kinds {
            let dir = match scope {
                ResourceScope::Sandbox(sid) => self.layout.sandbox_dir(kind.root(), sid),
                ResourceScope::Container {
                    sandbox_id,
                    container_id,
                } => self.layout.container_dir(kind.root(), sandbox_id, container_id),
            };
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(VcError::io(format!("remove {}", dir.display()), e));
                }
            }
        }

        tracing::debug!(scope = %scope, ?kinds, "Deleted resources");
        Ok(())
    }

    // ========================================================================
    // DISCOVERY
    // ========================================================================

    /// Whether a sandbox has a persisted configuration.
    pub fn sandbox_exists(&self, sandbox_id: &str) -> bool {
        !sandbox_id.is_empty()
            && self
                .layout
                .resource_path(ResourceKind::Config, &ResourceScope::sandbox(sandbox_id))
                .is_file()
    }

    /// Whether a sandbox has committed any configuration or state.
    pub fn sandbox_persisted(&self, sandbox_id: &str) -> bool {
        let scope = ResourceScope::sandbox(sandbox_id);
        !sandbox_id.is_empty()
            && [ResourceKind::Config, ResourceKind::State]
                .into_iter()
                .any(|kind| self.layout.resource_path(kind, &scope).is_file())
    }

    /// Sandbox ids with a configuration directory, sorted.
    pub fn list_sandboxes(&self) -> VcResult<Vec<String>> {
        list_dirs(self.layout.config_root())
    }

    /// Container ids with a configuration directory in `sandbox_id`, sorted.
    pub fn list_containers(&self, sandbox_id: &str) -> VcResult<Vec<String>> {
        ResourceScope::sandbox(sandbox_id).validate()?;
        list_dirs(&self.layout.sandbox_dir(StorageRoot::Config, sandbox_id))
    }

    /// Lock handle for a sandbox.
    pub fn sandbox_lock(&self, sandbox_id: &str) -> SandboxLock {
        SandboxLock::new(&self.layout, sandbox_id)
    }

    /// Acquire the exclusive sandbox lock, blocking until it is free.
    pub async fn lock(&self, sandbox_id: &str) -> VcResult<LockGuard> {
        ResourceScope::sandbox(sandbox_id).validate()?;
        self.sandbox_lock(sandbox_id).acquire_async().await
    }

    /// Acquire the sandbox lock only if it is free.
    pub fn try_lock(&self, sandbox_id: &str) -> VcResult<LockGuard> {
        ResourceScope::sandbox(sandbox_id).validate()?;
        self.sandbox_lock(sandbox_id).try_acquire()
    }

    // ========================================================================
    // TYPED ACCESSORS
    // ========================================================================

    pub fn fetch_sandbox_config(&self, sandbox_id: &str) -> VcResult<SandboxConfig> {
        let scope = ResourceScope::sandbox(sandbox_id);
        match self.fetch(ResourceKind::Config, &scope)? {
            ResourceValue::SandboxConfig(v) => Ok(v),
            other => Err(unexpected(other, &scope)),
        }
    }

    pub fn fetch_sandbox_state(&self, sandbox_id: &str) -> VcResult<State> {
        self.fetch_state(&ResourceScope::sandbox(sandbox_id))
    }

    pub fn fetch_sandbox_network(&self, sandbox_id: &str) -> VcResult<NetworkNamespace> {
        let scope = ResourceScope::sandbox(sandbox_id);
        match self.fetch(ResourceKind::Network, &scope)? {
            ResourceValue::Network(v) => Ok(v),
            other => Err(unexpected(other, &scope)),
        }
    }

    pub fn fetch_hypervisor_state(&self, sandbox_id: &str) -> VcResult<Value> {
        let scope = ResourceScope::sandbox(sandbox_id);
        match self.fetch(ResourceKind::Hypervisor, &scope)? {
            ResourceValue::Hypervisor(v) => Ok(v),
            other => Err(unexpected(other, &scope)),
        }
    }

    pub fn fetch_agent_state(&self, sandbox_id: &str) -> VcResult<Value> {
        let scope = ResourceScope::sandbox(sandbox_id);
        match self.fetch(ResourceKind::Agent, &scope)? {
            ResourceValue::Agent(v) => Ok(v),
            other => Err(unexpected(other, &scope)),
        }
    }

    pub fn fetch_container_config(
        &self,
        sandbox_id: &str,
        container_id: &str,
    ) -> VcResult<ContainerConfig> {
        let scope = ResourceScope::container(sandbox_id, container_id);
        match self.fetch(ResourceKind::Config, &scope)? {
            ResourceValue::ContainerConfig(v) => Ok(v),
            other => Err(unexpected(other, &scope)),
        }
    }

    pub fn fetch_container_state(&self, sandbox_id: &str, container_id: &str) -> VcResult<State> {
        self.fetch_state(&ResourceScope::container(sandbox_id, container_id))
    }

    pub fn fetch_container_process(
        &self,
        sandbox_id: &str,
        container_id: &str,
    ) -> VcResult<Process> {
        let scope = ResourceScope::container(sandbox_id, container_id);
        match self.fetch(ResourceKind::Process, &scope)? {
            ResourceValue::Process(v) => Ok(v),
            other => Err(unexpected(other, &scope)),
        }
    }

    pub fn fetch_container_mounts(
        &self,
        sandbox_id: &str,
        container_id: &str,
    ) -> VcResult<Vec<Mount>> {
        let scope = ResourceScope::container(sandbox_id, container_id);
        match self.fetch(ResourceKind::Mounts, &scope)? {
            ResourceValue::Mounts(v) => Ok(v),
            other => Err(unexpected(other, &scope)),
        }
    }

    pub fn fetch_container_devices(
        &self,
        sandbox_id: &str,
        container_id: &str,
    ) -> VcResult<Vec<Device>> {
        let scope = ResourceScope::container(sandbox_id, container_id);
        match self.fetch(ResourceKind::Devices, &scope)? {
            ResourceValue::Devices(v) => Ok(v),
            other => Err(unexpected(other, &scope)),
        }
    }

    fn fetch_state(&self, scope: &ResourceScope) -> VcResult<State> {
        match self.fetch(ResourceKind::State, scope)? {
            ResourceValue::State(v) => Ok(v),
            other => Err(unexpected(other, scope)),
        }
    }

    pub fn store_sandbox_config(&self, config: &SandboxConfig) -> VcResult<()> {
        self.store(
            ResourceKind::Config,
            &ResourceScope::sandbox(&config.id),
            &ResourceValue::SandboxConfig(config.clone()),
        )
    }

    pub fn store_sandbox_state(&self, sandbox_id: &str, state: &State) -> VcResult<()> {
        self.store(
            ResourceKind::State,
            &ResourceScope::sandbox(sandbox_id),
            &ResourceValue::State(state.clone()),
        )
    }

    pub fn store_sandbox_network(
        &self,
        sandbox_id: &str,
        network: &NetworkNamespace,
    ) -> VcResult<()> {
        self.store(
            ResourceKind::Network,
            &ResourceScope::sandbox(sandbox_id),
            &ResourceValue::Network(network.clone()),
        )
    }

    pub fn store_hypervisor_state(&self, sandbox_id: &str, state: &Value) -> VcResult<()> {
        self.store(
            ResourceKind::Hypervisor,
            &ResourceScope::sandbox(sandbox_id),
            &ResourceValue::Hypervisor(state.clone()),
        )
    }

    pub fn store_agent_state(&self, sandbox_id: &str, state: &Value) -> VcResult<()> {
        self.store(
            ResourceKind::Agent,
            &ResourceScope::sandbox(sandbox_id),
            &ResourceValue::Agent(state.clone()),
        )
    }

    pub fn store_container_config(
        &self,
        sandbox_id: &str,
        config: &ContainerConfig,
    ) -> VcResult<()> {
        self.store(
            ResourceKind::Config,
            &ResourceScope::container(sandbox_id, &config.id),
            &ResourceValue::ContainerConfig(config.clone()),
        )
    }

    pub fn store_container_state(
        &self,
        sandbox_id: &str,
        container_id: &str,
        state: &State,
    ) -> VcResult<()> {
        self.store(
            ResourceKind::State,
            &ResourceScope::container(sandbox_id, container_id),
            &ResourceValue::State(state.clone()),
        )
    }

    pub fn store_container_process(
        &self,
        sandbox_id: &str,
        container_id: &str,
        process: &Process,
    ) -> VcResult<()> {
        self.store(
            ResourceKind::Process,
            &ResourceScope::container(sandbox_id, container_id),
            &ResourceValue::Process(process.clone()),
        )
    }

    pub fn store_container_mounts(
        &self,
        sandbox_id: &str,
        container_id: &str,
        mounts: &[Mount],
    ) -> VcResult<()> {
        self.store(
            ResourceKind::Mounts,
            &ResourceScope::container(sandbox_id, container_id),
            &ResourceValue::Mounts(mounts.to_vec()),
        )
    }

    pub fn store_container_devices(
        &self,
        sandbox_id: &str,
        container_id: &str,
        devices: &[Device],
    ) -> VcResult<()> {
        self.store(
            ResourceKind::Devices,
            &ResourceScope::container(sandbox_id, container_id),
            &ResourceValue::Devices(devices.to_vec()),
        )
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn check_addressable(kind: ResourceKind, scope: &ResourceScope) -> VcResult<()> {
    scope.validate()?;
    if kind == ResourceKind::Lock {
        return Err(lock_not_addressable());
    }
    Ok(())
}

fn lock_not_addressable() -> VcError {
    VcError::InvalidResourceKind {
        kind: ResourceKind::Lock,
        reason: "the lock file carries no data".into(),
    }
}

fn decode<T: DeserializeOwned>(
    bytes: &[u8],
    kind: ResourceKind,
    scope: &ResourceScope,
) -> VcResult<T> {
    serde_json::from_slice(bytes).map_err(|source| VcError::CorruptData {
        kind,
        scope: scope.clone(),
        source,
    })
}

fn unexpected(value: ResourceValue, scope: &ResourceScope) -> VcError {
    VcError::Internal(format!(
        "fetch for {} returned a {} record",
        scope,
        value.kind()
    ))
}

fn create_dir(path: &Path) -> VcResult<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)
        .map_err(|e| VcError::io(format!("create directory {}", path.display()), e))
}

fn list_dirs(path: &Path) -> VcResult<Vec<String>> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(VcError::io(format!("list {}", path.display()), e)),
    };

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| VcError::io(format!("list {}", path.display()), e))?;
        let is_dir = entry
            .file_type()
            .map_err(|e| VcError::io(format!("stat {}", entry.path().display()), e))?
            .is_dir();
        if is_dir && let Some(name) = entry.file_name().to_str() {
            ids.push(name.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}
