use std::path::PathBuf;

use anyhow::{Context, anyhow};
use clap::Args;
use vcbox::AgentConfig;
use vcbox::model::{Cmd, ContainerConfig, ContainerType, SandboxConfig};

use crate::cli::GlobalFlags;

/// Primary process used when no command is given.
const DEFAULT_COMMAND: &str = "/bin/sh";

/// Create a sandbox, or a container inside an existing sandbox
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Sandbox (or, with --sandbox, container) id; overrides the id in --config
    #[arg(index = 1)]
    pub id: Option<String>,

    /// Sandbox configuration file (JSON)
    #[arg(short, long, value_name = "FILE", conflicts_with = "sandbox")]
    pub config: Option<PathBuf>,

    /// Add the container to this existing sandbox
    #[arg(long, value_name = "SANDBOX_ID")]
    pub sandbox: Option<String>,

    /// Container root filesystem
    #[arg(long, default_value = "rootfs")]
    pub rootfs: PathBuf,

    /// Guest agent socket; without it the noop agent is used
    #[arg(long, value_name = "PATH")]
    pub agent_socket: Option<PathBuf>,

    /// Set environment variables
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,

    /// Working directory inside the container
    #[arg(short = 'w', long = "workdir")]
    pub workdir: Option<String>,

    /// Command of the container's primary process
    #[arg(index = 2, last = true)]
    pub command: Vec<String>,
}

pub async fn execute(args: CreateArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let rt = global.create_runtime()?;

    if let Some(sandbox_id) = &args.sandbox {
        let config = args.container_config(args.required_id()?, ContainerType::PodContainer);
        let status = rt.create_container(sandbox_id, config).await?;
        println!("{}", status.id);
        return Ok(());
    }

    let status = rt.create(args.sandbox_config()?).await?;
    println!("{}", status.id);
    Ok(())
}

impl CreateArgs {
    fn required_id(&self) -> anyhow::Result<&str> {
        self.id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| anyhow!("an id is required"))
    }

    fn container_config(&self, id: &str, container_type: ContainerType) -> ContainerConfig {
        let args = if self.command.is_empty() {
            vec![DEFAULT_COMMAND.to_string()]
        } else {
            self.command.clone()
        };

        let mut cmd = Cmd::new(args);
        for entry in &self.env {
            match entry.split_once('=') {
                Some((key, value)) => cmd = cmd.env(key, value),
                None => tracing::warn!("Environment variable '{}' has no value, skipping", entry),
            }
        }
        if let Some(dir) = &self.workdir {
            cmd = cmd.working_dir(dir.clone());
        }

        let mut config = ContainerConfig::new(id, cmd).with_type(container_type);
        config.rootfs = self.rootfs.clone();
        config
    }

    fn sandbox_config(&self) -> anyhow::Result<SandboxConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_json::from_str::<SandboxConfig>(&content)
                    .with_context(|| format!("Invalid sandbox config {}", path.display()))?
            }
            None => {
                let id = self.required_id()?;
                SandboxConfig::new(id)
                    .with_container(self.container_config(id, ContainerType::PodSandbox))
            }
        };

        if let Some(id) = &self.id {
            config.id = id.clone();
        }
        if let Some(socket) = &self.agent_socket {
            config.agent = AgentConfig::rpc(socket.clone());
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcbox::AgentKind;

    fn args(id: &str) -> CreateArgs {
        CreateArgs {
            id: Some(id.to_string()),
            config: None,
            sandbox: None,
            rootfs: PathBuf::from("/bundle/rootfs"),
            agent_socket: None,
            env: vec!["A=1".into(), "MISSING".into()],
            workdir: Some("/work".into()),
            command: Vec::new(),
        }
    }

    #[test]
    fn test_default_sandbox_has_pod_container() {
        let config = args("sb").sandbox_config().unwrap();
        assert_eq!(config.id, "sb");
        assert_eq!(config.agent.kind(), AgentKind::Noop);

        let pod = &config.containers[0];
        assert_eq!(pod.id, "sb");
        assert_eq!(pod.container_type, ContainerType::PodSandbox);
        assert_eq!(pod.cmd.args, [DEFAULT_COMMAND]);
        assert_eq!(pod.cmd.env, [("A".to_string(), "1".to_string())]);
        assert_eq!(pod.cmd.working_dir.as_deref(), Some("/work"));
        assert_eq!(pod.rootfs, PathBuf::from("/bundle/rootfs"));
    }

    #[test]
    fn test_agent_socket_selects_rpc() {
        let mut a = args("sb");
        a.agent_socket = Some(PathBuf::from("/run/agent.sock"));
        assert_eq!(a.sandbox_config().unwrap().agent.kind(), AgentKind::Rpc);
    }

    #[test]
    fn test_missing_id() {
        let mut a = args("");
        a.id = None;
        assert!(a.sandbox_config().is_err());
    }
}
