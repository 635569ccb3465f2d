//! Runtime facade used by the command line.
//!
//! Every call rebuilds the sandbox from the store, runs one operation and
//! drops it again, releasing the sandbox lock on the way out.

pub mod options;
pub mod types;

use std::sync::Arc;

use vcbox_shared::errors::{VcError, VcResult};
use vcbox_shared::layout::{ResourceKind, ResourceScope};

use crate::agent::{Agent, AgentKind, ContainerStats, ProcessList, ProcessListOptions};
use crate::model::{ContainerConfig, SandboxConfig};
use crate::sandbox::Sandbox;
use crate::store::ResourceStore;

pub use options::RuntimeOptions;
pub use types::{ContainerStatus, SandboxStatus, Target};

/// Builds the agent for a sandbox from its configured kind.
pub type AgentFactory = Arc<dyn Fn(AgentKind) -> Arc<dyn Agent> + Send + Sync>;

#[derive(Clone)]
pub struct VcRuntime {
    store: ResourceStore,
    agent_factory: AgentFactory,
}

impl std::fmt::Debug for VcRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcRuntime")
            .field("layout", self.store.layout())
            .finish()
    }
}

impl VcRuntime {
    pub fn new(options: RuntimeOptions) -> Self {
        tracing::debug!(
            config_root = %options.config_root.display(),
            runtime_root = %options.runtime_root.display(),
            "Runtime initialized"
        );
        Self {
            store: ResourceStore::new(options.layout()),
            agent_factory: Arc::new(crate::agent::new_agent),
        }
    }

    /// Replace how agents are built.
    pub fn with_agent_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(AgentKind) -> Arc<dyn Agent> + Send + Sync + 'static,
    {
        self.agent_factory = Arc::new(factory);
        self
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    // ========================================================================
    // SANDBOX HANDLES
    // ========================================================================

    fn agent_for(&self, sandbox_id: &str) -> VcResult<Arc<dyn Agent>> {
        let config = self.store.fetch_sandbox_config(sandbox_id)?;
        Ok((self.agent_factory)(config.agent.kind()))
    }

    /// Rehydrate a sandbox under its lock.
    pub async fn open(&self, sandbox_id: &str) -> VcResult<Sandbox> {
        let agent = self.agent_for(sandbox_id)?;
        Sandbox::open(self.store.clone(), sandbox_id, agent).await
    }

    /// Rehydrate a sandbox for reading only.
    pub fn fetch(&self, sandbox_id: &str) -> VcResult<Sandbox> {
        let agent = self.agent_for(sandbox_id)?;
        Sandbox::fetch_unlocked(self.store.clone(), sandbox_id, agent)
    }

    /// Work out whether `id` names a sandbox or a container.
    ///
    /// A pod sandbox container stands for its whole sandbox.
    pub fn resolve(&self, id: &str) -> VcResult<Target> {
        if id.is_empty() {
            return Err(VcError::MissingIdentifier("container"));
        }
        if self.store.sandbox_exists(id) {
            let has_container = self.store.list_containers(id)?.iter().any(|c| c == id);
            return Ok(Target::Sandbox {
                sandbox_id: id.to_string(),
                container_id: has_container.then(|| id.to_string()),
            });
        }

        for sandbox_id in self.store.list_sandboxes()? {
            if !self.store.list_containers(&sandbox_id)?.iter().any(|c| c == id) {
                continue;
            }
            let config = self.store.fetch_container_config(&sandbox_id, id)?;
            return Ok(if config.container_type.is_sandbox() {
                Target::Sandbox {
                    sandbox_id,
                    container_id: Some(id.to_string()),
                }
            } else {
                Target::Container {
                    sandbox_id,
                    container_id: id.to_string(),
                }
            });
        }

        Err(VcError::NotFound {
            kind: ResourceKind::Config,
            scope: ResourceScope::sandbox(id),
        })
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    pub async fn create(&self, config: SandboxConfig) -> VcResult<SandboxStatus> {
        let agent = (self.agent_factory)(config.agent.kind());
        let sandbox = Sandbox::create(self.store.clone(), config, agent).await?;
        Ok(SandboxStatus::from(&sandbox))
    }

    pub async fn create_container(
        &self,
        sandbox_id: &str,
        config: ContainerConfig,
    ) -> VcResult<ContainerStatus> {
        let container_id = config.id.clone();
        let mut sandbox = self.open(sandbox_id).await?;
        sandbox.create_container(config).await?;
        container_status(&sandbox, &container_id)
    }

    pub async fn start(&self, id: &str) -> VcResult<SandboxStatus> {
        let target = self.resolve(id)?;
        let mut sandbox = self.open(target.sandbox_id()).await?;
        match &target {
            Target::Sandbox { .. } => sandbox.start().await?,
            Target::Container { container_id, .. } => {
                sandbox.start_container(container_id).await?;
            }
        }
        Ok(SandboxStatus::from(&sandbox))
    }

    pub async fn stop(&self, id: &str) -> VcResult<SandboxStatus> {
        let target = self.resolve(id)?;
        let mut sandbox = self.open(target.sandbox_id()).await?;
        match &target {
            Target::Sandbox { .. } => sandbox.stop().await?,
            Target::Container { container_id, .. } => sandbox.stop_container(container_id).await?,
        }
        Ok(SandboxStatus::from(&sandbox))
    }

    pub async fn pause(&self, id: &str) -> VcResult<SandboxStatus> {
        let target = self.resolve(id)?;
        let mut sandbox = self.open(target.sandbox_id()).await?;
        match &target {
            Target::Sandbox { .. } => sandbox.pause().await?,
            Target::Container { container_id, .. } => sandbox.pause_container(container_id).await?,
        }
        Ok(SandboxStatus::from(&sandbox))
    }

    pub async fn resume(&self, id: &str) -> VcResult<SandboxStatus> {
        let target = self.resolve(id)?;
        let mut sandbox = self.open(target.sandbox_id()).await?;
        match &target {
            Target::Sandbox { .. } => sandbox.resume().await?,
            Target::Container { container_id, .. } => {
                sandbox.resume_container(container_id).await?;
            }
        }
        Ok(SandboxStatus::from(&sandbox))
    }

    /// Remove a sandbox or container. With `force`, an active one is stopped
    /// first.
    pub async fn delete(&self, id: &str, force: bool) -> VcResult<()> {
        let target = self.resolve(id)?;
        let mut sandbox = self.open(target.sandbox_id()).await?;
        match &target {
            Target::Sandbox { .. } => {
                if force && sandbox.state().state.can_stop() {
                    sandbox.stop().await?;
                }
                sandbox.delete().await
            }
            Target::Container { container_id, .. } => {
                let active = sandbox
                    .container(container_id)
                    .is_some_and(|c| c.state.state.can_stop());
                if force && active {
                    sandbox.stop_container(container_id).await?;
                }
                sandbox.delete_container(container_id)
            }
        }
    }

    // ========================================================================
    // QUERIES (no lock)
    // ========================================================================

    pub fn status(&self, id: &str) -> VcResult<SandboxStatus> {
        let target = self.resolve(id)?;
        let sandbox = self.fetch(target.sandbox_id())?;
        Ok(SandboxStatus::from(&sandbox))
    }

    /// Every readable sandbox, ordered by id. Unreadable ones are skipped.
    pub fn list(&self) -> VcResult<Vec<SandboxStatus>> {
        let mut out = Vec::new();
        for sandbox_id in self.store.list_sandboxes()? {
            match self.fetch(&sandbox_id) {
                Ok(sandbox) => out.push(SandboxStatus::from(&sandbox)),
                Err(e) => {
                    tracing::warn!(
                        sandbox_id = %sandbox_id,
                        error = %e,
                        "Skipping unreadable sandbox"
                    );
                }
            }
        }
        Ok(out)
    }

    /// `ps` inside a container. Empty `args` fall back to `-ef`.
    pub async fn ps(&self, id: &str, options: &ProcessListOptions) -> VcResult<ProcessList> {
        let (mut sandbox, container_id) = self.fetch_container(id)?;
        let options = ProcessListOptions::new(options.format, options.args.clone());
        sandbox.process_list(&container_id, &options).await
    }

    /// Resource usage of a running or paused container.
    pub async fn stats(&self, id: &str) -> VcResult<ContainerStats> {
        let (mut sandbox, container_id) = self.fetch_container(id)?;
        sandbox.stats_container(&container_id).await
    }

    fn fetch_container(&self, id: &str) -> VcResult<(Sandbox, String)> {
        let target = self.resolve(id)?;
        let sandbox_id = target.sandbox_id().to_string();
        let container_id = target
            .container_id()
            .map(str::to_string)
            .ok_or_else(|| VcError::ContainerNotFound {
                sandbox_id: sandbox_id.clone(),
                container_id: id.to_string(),
            })?;
        let sandbox = self.fetch(&sandbox_id)?;
        Ok((sandbox, container_id))
    }
}

fn container_status(sandbox: &Sandbox, container_id: &str) -> VcResult<ContainerStatus> {
    sandbox
        .container(container_id)
        .map(ContainerStatus::from)
        .ok_or_else(|| VcError::ContainerNotFound {
            sandbox_id: sandbox.id().to_string(),
            container_id: container_id.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::NoopAgent;
    use crate::model::{Cmd, ContainerType, StateKind};
    use tempfile::TempDir;

    fn runtime() -> (TempDir, VcRuntime) {
        let dir = TempDir::new().unwrap();
        let rt = VcRuntime::new(RuntimeOptions::new(
            dir.path().join("config"),
            dir.path().join("run"),
        ));
        (dir, rt)
    }

    fn pod(id: &str, containers: &[&str]) -> SandboxConfig {
        let sandbox = ContainerConfig::new(id, Cmd::new(["/pause"]))
            .with_type(ContainerType::PodSandbox);
        containers.iter().fold(
            SandboxConfig::new(id).with_container(sandbox),
            |cfg, cid| cfg.with_container(ContainerConfig::new(*cid, Cmd::new(["sh"]))),
        )
    }

    #[tokio::test]
    async fn test_resolve_targets() {
        let (_dir, rt) = runtime();
        rt.create(pod("sb", &["c1"])).await.unwrap();

        assert_eq!(
            rt.resolve("sb").unwrap(),
            Target::Sandbox {
                sandbox_id: "sb".into(),
                container_id: Some("sb".into())
            }
        );
        assert_eq!(
            rt.resolve("c1").unwrap(),
            Target::Container {
                sandbox_id: "sb".into(),
                container_id: "c1".into()
            }
        );
        assert!(rt.resolve("ghost").unwrap_err().is_not_found());
        assert!(matches!(
            rt.resolve(""),
            Err(VcError::MissingIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_start_by_pod_sandbox_id_starts_everything() {
        let (_dir, rt) = runtime();
        rt.create(pod("sb", &["c1"])).await.unwrap();

        let status = rt.start("sb").await.unwrap();
        assert_eq!(status.state, StateKind::Running);
        assert!(status.containers.iter().all(|c| c.state == StateKind::Running));
    }

    #[tokio::test]
    async fn test_container_commands() {
        let (_dir, rt) = runtime();
        rt.create(pod("sb", &[])).await.unwrap();
        rt.start("sb").await.unwrap();

        let created = rt
            .create_container("sb", ContainerConfig::new("c2", Cmd::new(["sh"])))
            .await
            .unwrap();
        assert_eq!(created.state, StateKind::Ready);

        let status = rt.start("c2").await.unwrap();
        assert_eq!(status.container("c2").unwrap().state, StateKind::Running);
        assert!(rt.ps("c2", &ProcessListOptions::default()).await.is_ok());
        assert!(rt.stats("c2").await.is_ok());

        rt.pause("c2").await.unwrap();
        assert_eq!(
            rt.status("sb").unwrap().container("c2").unwrap().state,
            StateKind::Paused
        );
        rt.resume("c2").await.unwrap();
        rt.delete("c2", true).await.unwrap();
        assert!(rt.status("sb").unwrap().container("c2").is_none());
    }

    #[tokio::test]
    async fn test_ps_requires_running_container() {
        let (_dir, rt) = runtime();
        rt.create(pod("sb", &["c1"])).await.unwrap();
        let err = rt.ps("c1", &ProcessListOptions::default()).await.unwrap_err();
        assert!(matches!(err, VcError::ContainerNotRunning { .. }));
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let (_dir, rt) = runtime();
        rt.create(pod("b", &[])).await.unwrap();
        rt.create(pod("a", &[])).await.unwrap();
        rt.start("a").await.unwrap();

        let ids: Vec<_> = rt.list().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, ["a", "b"]);

        assert!(matches!(
            rt.delete("a", false).await,
            Err(VcError::IllegalTransition { .. })
        ));
        rt.delete("a", true).await.unwrap();
        rt.delete("b", false).await.unwrap();
        assert!(rt.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_custom_agent_factory() {
        let (_dir, rt) = runtime();
        let rt = rt.with_agent_factory(|_| {
            Arc::new(NoopAgent::with_capabilities(Default::default())) as Arc<dyn Agent>
        });
        rt.create(pod("sb", &[])).await.unwrap();
        rt.start("sb").await.unwrap();
        assert!(matches!(
            rt.pause("sb").await,
            Err(VcError::Agent { .. })
        ));
        assert_eq!(rt.status("sb").unwrap().state, StateKind::Running);
    }
}
