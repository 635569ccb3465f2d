//! Sandbox state machine.
//!
//! A [`Sandbox`] is rebuilt from the resource store on every invocation,
//! mutated through the lifecycle operations below and flushed back after each
//! state change. Every transition runs in the same order: check the
//! precondition, call the agent, persist the new state, then update memory.
//! A failed write therefore leaves the in-memory value untouched, even though
//! the guest side already moved.

use std::collections::BTreeMap;
use std::sync::Arc;

use nix::sys::signal::Signal;
use oci_spec::runtime::LinuxResources;
use serde_json::Value;

use vcbox_shared::errors::{AgentError, VcError, VcResult};
use vcbox_shared::layout::{ResourceKind, ResourceScope};

use crate::agent::{Agent, Capabilities, ContainerStats, IoStream, ProcessList, ProcessListOptions};
use crate::lock::LockGuard;
use crate::model::{
    BlockDevice, Cmd, Container, ContainerConfig, Device, DeviceInfo, DeviceSpec, GenericDevice,
    NetworkNamespace, Process, SandboxConfig, State, StateKind, VfioDevice,
};
use crate::store::ResourceStore;

/// Host path prefix of VFIO group devices.
const VFIO_PATH_PREFIX: &str = "/dev/vfio/";

// ============================================================================
// SANDBOX
// ============================================================================

/// In-memory sandbox for the duration of one operation.
///
/// Obtained through [`Sandbox::create`], [`Sandbox::open`] (exclusive lock
/// held until drop) or [`Sandbox::fetch_unlocked`] (read-only; mutating
/// operations are refused).
pub struct Sandbox {
    id: String,
    config: SandboxConfig,
    state: State,
    network: NetworkNamespace,
    containers: BTreeMap<String, Container>,
    hypervisor_state: Value,
    agent_state: Value,

    agent: Arc<dyn Agent>,
    agent_ready: bool,
    store: ResourceStore,
    lock: Option<LockGuard>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("state", &self.state.state)
            .field("containers", &self.containers.keys().collect::<Vec<_>>())
            .field("locked", &self.lock.is_some())
            .finish()
    }
}

impl Sandbox {
    // ========================================================================
    // CONSTRUCTION
    // ========================================================================

    /// Create a new sandbox and its initial containers, all in `ready`.
    ///
    /// Fails with `AlreadyExists` if the sandbox is already persisted, also
    /// when a concurrent creator of the same id commits first. If any step
    /// after taking the lock fails, the sandbox's resources are removed again.
    pub async fn create(
        store: ResourceStore,
        config: SandboxConfig,
        agent: Arc<dyn Agent>,
    ) -> VcResult<Self> {
        config.validate()?;
        let id = config.id.clone();
        if store.sandbox_exists(&id) {
            return Err(VcError::AlreadyExists(format!("sandbox {}", id)));
        }

        // The skeleton and lock file may be shared with other creators of the
        // same id; only the first lock holder to find nothing persisted owns it.
        let lock = loop {
            store.create_all_resources(&id, std::iter::empty::<&str>())?;
            match store.lock(&id).await {
                Err(VcError::NotFound {
                    kind: ResourceKind::Lock,
                    ..
                }) => {
                    tracing::debug!(sandbox_id = %id, "Sandbox removed while waiting, retrying");
                }
                result => break result?,
            }
        };
        if store.sandbox_persisted(&id) {
            lock.release();
            return Err(VcError::AlreadyExists(format!("sandbox {}", id)));
        }

        store.create_all_resources(&id, config.containers.iter().map(|c| c.id.as_str()))?;

        let mut sandbox = Sandbox {
            id: id.clone(),
            network: config.network.clone(),
            config,
            state: State::new(StateKind::Ready),
            containers: BTreeMap::new(),
            hypervisor_state: serde_json::json!({}),
            agent_state: Value::Null,
            agent,
            agent_ready: false,
            store: store.clone(),
            lock: Some(lock),
        };

        if let Err(err) = sandbox.provision().await {
            rollback_sandbox(&store, &id);
            return Err(err);
        }

        tracing::info!(
            sandbox_id = %id,
            containers = sandbox.containers.len(),
            agent = %sandbox.agent.kind(),
            "Created sandbox"
        );
        Ok(sandbox)
    }

    async fn provision(&mut self) -> VcResult<()> {
        self.init_agent().await?;
        self.agent
            .create_sandbox(&self.config)
            .await
            .map_err(|e| VcError::agent("create_sandbox", self.scope(), e))?;
        self.agent_state = self.agent.state();

        self.store.store_sandbox_config(&self.config)?;
        self.store.store_sandbox_network(&self.id, &self.network)?;
        self.store
            .store_hypervisor_state(&self.id, &self.hypervisor_state)?;
        self.store.store_agent_state(&self.id, &self.agent_state)?;
        self.store.store_sandbox_state(&self.id, &self.state)?;

        for container in self.config.containers.clone() {
            self.add_container(container).await?;
        }
        Ok(())
    }

    /// Rehydrate a sandbox under its exclusive lock.
    ///
    /// Blocks until any other holder releases the lock.
    pub async fn open(
        store: ResourceStore,
        sandbox_id: &str,
        agent: Arc<dyn Agent>,
    ) -> VcResult<Self> {
        ResourceScope::sandbox(sandbox_id).validate()?;
        if !store.sandbox_exists(sandbox_id) {
            return Err(VcError::NotFound {
                kind: ResourceKind::Config,
                scope: ResourceScope::sandbox(sandbox_id),
            });
        }
        let lock = store.lock(sandbox_id).await?;
        Self::load(store, sandbox_id, agent, Some(lock))
    }

    /// Rehydrate a sandbox without taking the lock.
    ///
    /// May observe a state mid-transition. Only read-only operations are
    /// allowed on the result.
    pub fn fetch_unlocked(
        store: ResourceStore,
        sandbox_id: &str,
        agent: Arc<dyn Agent>,
    ) -> VcResult<Self> {
        ResourceScope::sandbox(sandbox_id).validate()?;
        Self::load(store, sandbox_id, agent, None)
    }

    fn load(
        store: ResourceStore,
        sandbox_id: &str,
        agent: Arc<dyn Agent>,
        lock: Option<LockGuard>,
    ) -> VcResult<Self> {
        let config = store.fetch_sandbox_config(sandbox_id)?;
        let state = store.fetch_sandbox_state(sandbox_id)?;
        let network = optional(store.fetch_sandbox_network(sandbox_id))?.unwrap_or_default();
        let hypervisor_state =
            optional(store.fetch_hypervisor_state(sandbox_id))?.unwrap_or(Value::Null);
        let agent_state = optional(store.fetch_agent_state(sandbox_id))?.unwrap_or(Value::Null);

        let mut containers = BTreeMap::new();
        for cid in store.list_containers(sandbox_id)? {
            let config = store.fetch_container_config(sandbox_id, &cid)?;
            let state = store.fetch_container_state(sandbox_id, &cid)?;
            let process = optional(store.fetch_container_process(sandbox_id, &cid))?;
            let mounts = optional(store.fetch_container_mounts(sandbox_id, &cid))?
                .unwrap_or_else(|| config.mounts.clone());
            let devices = optional(store.fetch_container_devices(sandbox_id, &cid))?
                .unwrap_or_default();
            containers.insert(
                cid,
                Container {
                    config,
                    state,
                    process,
                    mounts,
                    devices,
                },
            );
        }

        tracing::debug!(
            sandbox_id = %sandbox_id,
            state = %state.state,
            containers = containers.len(),
            locked = lock.is_some(),
            "Loaded sandbox"
        );

        Ok(Sandbox {
            id: sandbox_id.to_string(),
            config,
            state,
            network,
            containers,
            hypervisor_state,
            agent_state,
            agent,
            agent_ready: false,
            store,
            lock,
        })
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn network(&self) -> &NetworkNamespace {
        &self.network
    }

    pub fn hypervisor_state(&self) -> &Value {
        &self.hypervisor_state
    }

    pub fn agent_state(&self) -> &Value {
        &self.agent_state
    }

    pub fn capabilities(&self) -> Capabilities {
        self.agent.capabilities()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Containers ordered by id.
    pub fn containers(&self) -> impl Iterator<Item = &Container> {
        self.containers.values()
    }

    pub fn container(&self, container_id: &str) -> Option<&Container> {
        self.containers.get(container_id)
    }

    /// Give up the lock before the sandbox is dropped.
    pub fn release(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
    }

    // ========================================================================
    // SANDBOX LIFECYCLE
    // ========================================================================

    /// `ready -> running`, then start every ready container.
    pub async fn start(&mut self) -> VcResult<()> {
        self.ensure_locked()?;
        if !self.state.state.can_start() {
            return Err(self.illegal("start"));
        }
        self.init_agent().await?;

        self.agent
            .start_sandbox(&self.id)
            .await
            .map_err(|e| VcError::agent("start_sandbox", self.scope(), e))?;
        self.set_sandbox_state(StateKind::Running)?;

        for cid in self.container_ids_in(&[StateKind::Ready]) {
            self.start_container_inner(&cid).await?;
        }

        tracing::info!(sandbox_id = %self.id, "Started sandbox");
        Ok(())
    }

    /// `running|paused -> stopped`. Containers are stopped by the agent first.
    pub async fn stop(&mut self) -> VcResult<()> {
        self.ensure_locked()?;
        if !self.state.state.can_stop() {
            return Err(self.illegal("stop"));
        }
        self.init_agent().await?;

        self.agent
            .stop_sandbox(&self.id)
            .await
            .map_err(|e| VcError::agent("stop_sandbox", self.scope(), e))?;

        for cid in self.container_ids_in(&[StateKind::Running, StateKind::Paused]) {
            self.set_container_state(&cid, StateKind::Stopped)?;
        }
        self.set_sandbox_state(StateKind::Stopped)?;

        tracing::info!(sandbox_id = %self.id, "Stopped sandbox");
        Ok(())
    }

    /// `running -> paused`, pausing every running container.
    pub async fn pause(&mut self) -> VcResult<()> {
        self.ensure_locked()?;
        if !self.state.state.can_transition_to(StateKind::Paused) {
            return Err(self.illegal("pause"));
        }
        self.require_capability("pause_sandbox", self.scope(), |c| c.pause)?;
        self.init_agent().await?;

        for cid in self.container_ids_in(&[StateKind::Running]) {
            self.agent
                .pause_container(&self.id, &cid)
                .await
                .map_err(|e| VcError::agent("pause_container", self.container_scope(&cid), e))?;
            self.set_container_state(&cid, StateKind::Paused)?;
        }
        self.set_sandbox_state(StateKind::Paused)?;

        tracing::info!(sandbox_id = %self.id, "Paused sandbox");
        Ok(())
    }

    /// `paused -> running`, resuming every paused container.
    pub async fn resume(&mut self) -> VcResult<()> {
        self.ensure_locked()?;
        if self.state.state != StateKind::Paused {
            return Err(self.illegal("resume"));
        }
        self.init_agent().await?;

        for cid in self.container_ids_in(&[StateKind::Paused]) {
            self.agent
                .resume_container(&self.id, &cid)
                .await
                .map_err(|e| VcError::agent("resume_container", self.container_scope(&cid), e))?;
            self.set_container_state(&cid, StateKind::Running)?;
        }
        self.set_sandbox_state(StateKind::Running)?;

        tracing::info!(sandbox_id = %self.id, "Resumed sandbox");
        Ok(())
    }

    /// Tear down a `ready` or `stopped` sandbox and remove all its resources.
    pub async fn delete(mut self) -> VcResult<()> {
        self.ensure_locked()?;
        if !self.state.state.can_delete() {
            return Err(self.illegal("delete"));
        }
        self.init_agent().await?;

        self.agent
            .cleanup_sandbox(&self.id)
            .await
            .map_err(|e| VcError::agent("cleanup_sandbox", self.scope(), e))?;
        if let Err(e) = self.agent.disconnect().await {
            tracing::warn!(sandbox_id = %self.id, error = %e, "Agent disconnect failed");
        }

        self.store.delete(&self.scope(), &[])?;
        self.release();

        tracing::info!(sandbox_id = %self.id, "Deleted sandbox");
        Ok(())
    }

    /// Tell the guest about hot-added vCPUs and record them.
    pub async fn online_cpu_mem(&mut self, added_vcpus: u32) -> VcResult<()> {
        self.ensure_locked()?;
        self.require_running()?;
        self.init_agent().await?;

        self.agent
            .online_cpu_mem(added_vcpus)
            .await
            .map_err(|e| VcError::agent("online_cpu_mem", self.scope(), e))?;

        let mut next = self.state.clone();
        next.hotplugged_vcpus = next.hotplugged_vcpus.saturating_add(added_vcpus);
        self.store.store_sandbox_state(&self.id, &next)?;
        self.state = next;
        Ok(())
    }

    /// Replace the opaque hypervisor state blob.
    pub fn set_hypervisor_state(&mut self, state: Value) -> VcResult<()> {
        self.ensure_locked()?;
        self.store.store_hypervisor_state(&self.id, &state)?;
        self.hypervisor_state = state;
        Ok(())
    }

    // ========================================================================
    // CONTAINER LIFECYCLE
    // ========================================================================

    /// Add a container in `ready` state.
    pub async fn create_container(&mut self, config: ContainerConfig) -> VcResult<()> {
        self.ensure_locked()?;
        if config.id.is_empty() {
            return Err(VcError::MissingIdentifier("container"));
        }
        if self.containers.contains_key(&config.id) {
            return Err(VcError::AlreadyExists(format!(
                "container {} in sandbox {}",
                config.id, self.id
            )));
        }
        if self.state.state == StateKind::Stopped {
            return Err(self.illegal("add a container to"));
        }
        self.init_agent().await?;

        let cid = config.id.clone();
        self.store.create_container_resources(&self.id, &cid)?;
        if let Err(err) = self.add_container(config).await {
            let scope = self.container_scope(&cid);
            if let Err(cleanup) = self.store.delete(&scope, &[]) {
                tracing::warn!(scope = %scope, error = %cleanup, "Container rollback incomplete");
            }
            return Err(err);
        }

        tracing::info!(sandbox_id = %self.id, container_id = %cid, "Created container");
        Ok(())
    }

    async fn add_container(&mut self, config: ContainerConfig) -> VcResult<()> {
        let cid = config.id.clone();
        self.agent
            .create_container(&self.id, &config)
            .await
            .map_err(|e| VcError::agent("create_container", self.container_scope(&cid), e))?;

        let devices = resolve_devices(&config.devices);
        let state = State::new(StateKind::Ready);
        self.store.store_container_config(&self.id, &config)?;
        self.store
            .store_container_mounts(&self.id, &cid, &config.mounts)?;
        self.store
            .store_container_devices(&self.id, &cid, &devices)?;
        self.store.store_container_state(&self.id, &cid, &state)?;

        self.containers.insert(
            cid,
            Container {
                mounts: config.mounts.clone(),
                config,
                state,
                process: None,
                devices,
            },
        );
        Ok(())
    }

    /// `ready -> running` for one container. The sandbox must be running.
    pub async fn start_container(&mut self, container_id: &str) -> VcResult<Process> {
        self.ensure_locked()?;
        let current = self.container_ref(container_id)?.state.state;
        self.require_running()?;
        if !current.can_start() {
            return Err(self.illegal_container(container_id, current, "start"));
        }
        self.init_agent().await?;

        let process = self.start_container_inner(container_id).await?;
        tracing::info!(
            sandbox_id = %self.id,
            container_id = %container_id,
            pid = process.pid,
            "Started container"
        );
        Ok(process)
    }

    async fn start_container_inner(&mut self, container_id: &str) -> VcResult<Process> {
        let process = self
            .agent
            .start_container(&self.id, container_id)
            .await
            .map_err(|e| VcError::agent("start_container", self.container_scope(container_id), e))?;

        self.store
            .store_container_process(&self.id, container_id, &process)?;
        self.set_container_state(container_id, StateKind::Running)?;
        if let Some(container) = self.containers.get_mut(container_id) {
            container.process = Some(process.clone());
        }
        Ok(process)
    }

    /// `running|paused -> stopped` for one container.
    pub async fn stop_container(&mut self, container_id: &str) -> VcResult<()> {
        self.ensure_locked()?;
        let current = self.container_ref(container_id)?.state.state;
        if !current.can_stop() {
            return Err(self.illegal_container(container_id, current, "stop"));
        }
        self.init_agent().await?;

        self.agent
            .stop_container(&self.id, container_id)
            .await
            .map_err(|e| VcError::agent("stop_container", self.container_scope(container_id), e))?;
        self.set_container_state(container_id, StateKind::Stopped)?;

        tracing::info!(sandbox_id = %self.id, container_id = %container_id, "Stopped container");
        Ok(())
    }

    pub async fn pause_container(&mut self, container_id: &str) -> VcResult<()> {
        self.ensure_locked()?;
        let current = self.container_ref(container_id)?.state.state;
        self.require_running()?;
        if !current.can_transition_to(StateKind::Paused) {
            return Err(self.illegal_container(container_id, current, "pause"));
        }
        self.require_capability("pause_container", self.container_scope(container_id), |c| {
            c.pause
        })?;
        self.init_agent().await?;

        self.agent
            .pause_container(&self.id, container_id)
            .await
            .map_err(|e| VcError::agent("pause_container", self.container_scope(container_id), e))?;
        self.set_container_state(container_id, StateKind::Paused)
    }

    pub async fn resume_container(&mut self, container_id: &str) -> VcResult<()> {
        self.ensure_locked()?;
        let current = self.container_ref(container_id)?.state.state;
        self.require_running()?;
        if current != StateKind::Paused {
            return Err(self.illegal_container(container_id, current, "resume"));
        }
        self.init_agent().await?;

        self.agent
            .resume_container(&self.id, container_id)
            .await
            .map_err(|e| {
                VcError::agent("resume_container", self.container_scope(container_id), e)
            })?;
        self.set_container_state(container_id, StateKind::Running)
    }

    /// Remove a `ready` or `stopped` container and its resources.
    pub fn delete_container(&mut self, container_id: &str) -> VcResult<()> {
        self.ensure_locked()?;
        let current = self.container_ref(container_id)?.state.state;
        if !current.can_delete() {
            return Err(self.illegal_container(container_id, current, "delete"));
        }

        self.store
            .delete(&self.container_scope(container_id), &[])?;
        self.containers.remove(container_id);

        tracing::info!(sandbox_id = %self.id, container_id = %container_id, "Deleted container");
        Ok(())
    }

    /// Attach a device to a container.
    ///
    /// A `ready` container only records the device. A running one has it
    /// hotplugged through the agent first; block devices need agent support.
    pub async fn attach_device(&mut self, container_id: &str, device: Device) -> VcResult<()> {
        self.ensure_locked()?;
        let current = self.container_ref(container_id)?.state.state;
        if !matches!(current, StateKind::Ready | StateKind::Running) {
            return Err(self.illegal_container(container_id, current, "attach a device to"));
        }

        let mut devices = self.container_ref(container_id)?.devices.clone();
        if devices.iter().any(|d| d.id() == device.id()) {
            return Err(VcError::AlreadyExists(format!(
                "device {} in container {}",
                device.id(),
                container_id
            )));
        }

        if current == StateKind::Running {
            if matches!(device, Device::Block(_)) {
                self.require_capability(
                    "hotplug_device",
                    self.container_scope(container_id),
                    |c| c.block_device_hotplug,
                )?;
            }
            self.init_agent().await?;
            self.agent
                .hotplug_device(&self.id, container_id, &device)
                .await
                .map_err(|e| {
                    VcError::agent("hotplug_device", self.container_scope(container_id), e)
                })?;
        }

        tracing::info!(
            sandbox_id = %self.id,
            container_id = %container_id,
            device_id = %device.id(),
            hotplugged = current == StateKind::Running,
            "Attached device"
        );
        devices.push(device);
        self.store
            .store_container_devices(&self.id, container_id, &devices)?;
        if let Some(container) = self.containers.get_mut(container_id) {
            container.devices = devices;
        }
        Ok(())
    }

    /// Apply new resource limits to a running container and record them.
    pub async fn update_container(
        &mut self,
        container_id: &str,
        resources: LinuxResources,
    ) -> VcResult<()> {
        self.ensure_locked()?;
        self.require_container_active(container_id, &[StateKind::Running, StateKind::Paused])?;
        self.require_capability("update_container", self.container_scope(container_id), |c| {
            c.update_resources
        })?;
        self.init_agent().await?;

        self.agent
            .update_container(&self.id, container_id, &resources)
            .await
            .map_err(|e| {
                VcError::agent("update_container", self.container_scope(container_id), e)
            })?;

        let mut config = self.container_ref(container_id)?.config.clone();
        config.resources = Some(resources);
        self.store.store_container_config(&self.id, &config)?;
        if let Some(container) = self.containers.get_mut(container_id) {
            container.config = config;
        }
        Ok(())
    }

    // ========================================================================
    // PROCESSES (no persisted state)
    // ========================================================================

    /// Run a secondary process in a running container.
    pub async fn exec(&mut self, container_id: &str, cmd: &Cmd) -> VcResult<(Process, IoStream)> {
        self.require_running()?;
        self.require_container_active(container_id, &[StateKind::Running])?;
        self.init_agent().await?;

        let process = self
            .agent
            .exec(&self.id, container_id, cmd)
            .await
            .map_err(|e| VcError::agent("exec", self.container_scope(container_id), e))?;
        let stream = IoStream::new(Arc::clone(&self.agent), container_id, process.token.clone());

        tracing::debug!(
            sandbox_id = %self.id,
            container_id = %container_id,
            process_id = %process.token,
            "Exec'd process"
        );
        Ok((process, stream))
    }

    /// stdio handles of an existing process.
    pub fn io_stream(&self, container_id: &str, process_id: &str) -> VcResult<IoStream> {
        self.container_ref(container_id)?;
        Ok(IoStream::new(
            Arc::clone(&self.agent),
            container_id,
            process_id,
        ))
    }

    pub async fn signal_process(
        &mut self,
        container_id: &str,
        process_id: &str,
        signal: Signal,
        all: bool,
    ) -> VcResult<()> {
        self.require_container_active(container_id, &[StateKind::Running, StateKind::Paused])?;
        self.init_agent().await?;

        self.agent
            .signal_process(container_id, process_id, signal, all)
            .await
            .map_err(|e| VcError::agent("signal_process", self.container_scope(container_id), e))
    }

    pub async fn winsize_process(
        &mut self,
        container_id: &str,
        process_id: &str,
        height: u32,
        width: u32,
    ) -> VcResult<()> {
        self.require_container_active(container_id, &[StateKind::Running])?;
        self.init_agent().await?;

        self.agent
            .winsize_process(container_id, process_id, height, width)
            .await
            .map_err(|e| VcError::agent("winsize_process", self.container_scope(container_id), e))
    }

    /// Block until the process exits; returns its exit code.
    pub async fn wait_process(&mut self, container_id: &str, process_id: &str) -> VcResult<i32> {
        self.container_ref(container_id)?;
        self.init_agent().await?;

        self.agent
            .wait_process(container_id, process_id)
            .await
            .map_err(|e| VcError::agent("wait_process", self.container_scope(container_id), e))
    }

    /// `ps` inside a running container.
    pub async fn process_list(
        &mut self,
        container_id: &str,
        options: &ProcessListOptions,
    ) -> VcResult<ProcessList> {
        self.require_container_active(container_id, &[StateKind::Running])?;
        self.require_running()?;
        self.init_agent().await?;

        self.agent
            .process_list_container(&self.id, container_id, options)
            .await
            .map_err(|e| {
                VcError::agent("process_list_container", self.container_scope(container_id), e)
            })
    }

    pub async fn stats_container(&mut self, container_id: &str) -> VcResult<ContainerStats> {
        self.require_container_active(container_id, &[StateKind::Running, StateKind::Paused])?;
        self.init_agent().await?;

        self.agent
            .stats_container(&self.id, container_id)
            .await
            .map_err(|e| VcError::agent("stats_container", self.container_scope(container_id), e))
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    async fn init_agent(&mut self) -> VcResult<()> {
        if self.agent_ready {
            return Ok(());
        }
        self.agent
            .init(&self.id, &self.config.agent)
            .await
            .map_err(|e| VcError::agent("init", self.scope(), e))?;
        self.agent_ready = true;
        Ok(())
    }

    fn scope(&self) -> ResourceScope {
        ResourceScope::sandbox(&self.id)
    }

    fn container_scope(&self, container_id: &str) -> ResourceScope {
        ResourceScope::container(&self.id, container_id)
    }

    fn ensure_locked(&self) -> VcResult<()> {
        if self.lock.is_none() {
            return Err(VcError::Internal(format!(
                "sandbox {} was opened without its lock",
                self.id
            )));
        }
        Ok(())
    }

    fn container_ref(&self, container_id: &str) -> VcResult<&Container> {
        self.containers
            .get(container_id)
            .ok_or_else(|| VcError::ContainerNotFound {
                sandbox_id: self.id.clone(),
                container_id: container_id.to_string(),
            })
    }

    fn container_ids_in(&self, states: &[StateKind]) -> Vec<String> {
        self.containers
            .values()
            .filter(|c| states.contains(&c.state.state))
            .map(|c| c.id().to_string())
            .collect()
    }

    fn require_running(&self) -> VcResult<()> {
        if self.state.state != StateKind::Running {
            return Err(VcError::SandboxNotRunning {
                sandbox_id: self.id.clone(),
                state: self.state.state.to_string(),
            });
        }
        Ok(())
    }

    fn require_container_active(&self, container_id: &str, allowed: &[StateKind]) -> VcResult<()> {
        let current = self.container_ref(container_id)?.state.state;
        if !allowed.contains(&current) {
            return Err(VcError::ContainerNotRunning {
                sandbox_id: self.id.clone(),
                container_id: container_id.to_string(),
                state: current.to_string(),
            });
        }
        Ok(())
    }

    fn require_capability(
        &self,
        operation: &'static str,
        scope: ResourceScope,
        supported: impl Fn(&Capabilities) -> bool,
    ) -> VcResult<()> {
        if supported(&self.agent.capabilities()) {
            return Ok(());
        }
        Err(VcError::agent(
            operation,
            scope,
            AgentError::Unsupported(format!("{} agent cannot {}", self.agent.kind(), operation)),
        ))
    }

    fn illegal(&self, operation: &'static str) -> VcError {
        VcError::IllegalTransition {
            subject: format!("sandbox {}", self.id),
            from: self.state.state.to_string(),
            operation,
        }
    }

    fn illegal_container(
        &self,
        container_id: &str,
        from: StateKind,
        operation: &'static str,
    ) -> VcError {
        VcError::IllegalTransition {
            subject: format!("container {}", container_id),
            from: from.to_string(),
            operation,
        }
    }

    fn set_sandbox_state(&mut self, next: StateKind) -> VcResult<()> {
        let new = self.state.with_state(next);
        self.store.store_sandbox_state(&self.id, &new)?;
        tracing::debug!(
            sandbox_id = %self.id,
            from = %self.state.state,
            to = %next,
            "Sandbox state changed"
        );
        self.state = new;
        Ok(())
    }

    fn set_container_state(&mut self, container_id: &str, next: StateKind) -> VcResult<()> {
        let Some(container) = self.containers.get_mut(container_id) else {
            return Err(VcError::ContainerNotFound {
                sandbox_id: self.id.clone(),
                container_id: container_id.to_string(),
            });
        };
        let new = container.state.with_state(next);
        self.store
            .store_container_state(&self.id, container_id, &new)?;
        tracing::debug!(
            sandbox_id = %self.id,
            container_id = %container_id,
            from = %container.state.state,
            to = %next,
            "Container state changed"
        );
        container.state = new;
        Ok(())
    }
}

// ============================================================================
// FREE FUNCTIONS
// ============================================================================

/// Map `NotFound` to `None`, keeping every other error.
fn optional<T>(result: VcResult<T>) -> VcResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(VcError::NotFound { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

fn rollback_sandbox(store: &ResourceStore, sandbox_id: &str) {
    tracing::warn!(sandbox_id = %sandbox_id, "Sandbox creation failed, removing resources");
    if let Err(e) = store.delete(&ResourceScope::sandbox(sandbox_id), &[]) {
        tracing::warn!(sandbox_id = %sandbox_id, error = %e, "Rollback incomplete");
    }
}

/// Turn requested device nodes into typed devices.
fn resolve_devices(specs: &[DeviceSpec]) -> Vec<Device> {
    specs
        .iter()
        .map(|spec| {
            let id = uuid::Uuid::new_v4().to_string();
            let info = DeviceInfo {
                host_path: spec.host_path.clone(),
                container_path: spec.container_path.clone(),
                dev_type: spec.dev_type.clone(),
                major: spec.major,
                minor: spec.minor,
                ..Default::default()
            };
            if spec.host_path.starts_with(VFIO_PATH_PREFIX) {
                Device::Vfio(VfioDevice {
                    id,
                    info,
                    bdfs: Vec::new(),
                })
            } else if spec.dev_type == "b" {
                Device::Block(BlockDevice {
                    id,
                    info,
                    drive: None,
                })
            } else {
                Device::Generic(GenericDevice { id, info })
            }
        })
        .collect()
}
