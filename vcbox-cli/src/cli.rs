//! CLI definition and argument parsing for vcbox-cli.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use vcbox::{RuntimeOptions, VcRuntime};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "vcbox", author, version, about = "vcbox sandbox runtime CLI")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
#[non_exhaustive]
pub enum Commands {
    /// Create a sandbox, or a container inside an existing sandbox
    Create(crate::commands::create::CreateArgs),

    /// Start a sandbox or container
    Start(crate::commands::lifecycle::TargetArgs),

    /// Stop a sandbox or container
    Stop(crate::commands::lifecycle::TargetArgs),

    /// Pause a sandbox or container
    Pause(crate::commands::lifecycle::TargetArgs),

    /// Resume a paused sandbox or container
    Resume(crate::commands::lifecycle::TargetArgs),

    /// List processes running inside a container
    Ps(crate::commands::ps::PsArgs),

    /// Display container resource usage
    Events(crate::commands::events::EventsArgs),

    /// Print the state of a sandbox as JSON
    State(crate::commands::state::StateArgs),

    /// Delete one or more sandboxes or containers
    #[command(visible_alias = "rm")]
    Delete(crate::commands::delete::DeleteArgs),

    /// List sandboxes
    #[command(visible_alias = "ls")]
    List(crate::commands::list::ListArgs),
}

// ============================================================================
// GLOBAL FLAGS
// ============================================================================

#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// Enable debug output
    #[arg(long, global = true)]
    pub debug: bool,

    /// Runtime state directory (state, locks, process records)
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Configuration directory (sandbox and container configs)
    #[arg(long, global = true, value_name = "DIR")]
    pub config_root: Option<PathBuf>,

    /// JSON file with runtime options
    ///
    /// Values from VCBOX_CONFIG_ROOT / VCBOX_RUNTIME_ROOT override the file;
    /// --config-root / --root override both.
    #[arg(long, global = true, value_name = "FILE")]
    pub options: Option<PathBuf>,
}

impl GlobalFlags {
    pub fn runtime_options(&self) -> anyhow::Result<RuntimeOptions> {
        let mut options = match &self.options {
            Some(path) => RuntimeOptions::load(path)?,
            None => RuntimeOptions::default(),
        }
        .with_env();

        if let Some(root) = &self.config_root {
            options.config_root = root.clone();
        }
        if let Some(root) = &self.root {
            options.runtime_root = root.clone();
        }
        Ok(options)
    }

    pub fn create_runtime(&self) -> anyhow::Result<VcRuntime> {
        Ok(VcRuntime::new(self.runtime_options()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("vcbox").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = parse(&["start", "sb", "--root", "/tmp/run", "--debug"]);
        assert!(cli.global.debug);
        assert_eq!(cli.global.root, Some(PathBuf::from("/tmp/run")));
        assert!(matches!(cli.command, Commands::Start(ref a) if a.id == "sb"));
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = parse(&["--config-root", "/tmp/cfg", "--root", "/tmp/run", "list"]);
        let options = cli.global.runtime_options().unwrap();
        assert_eq!(options.config_root, PathBuf::from("/tmp/cfg"));
        assert_eq!(options.runtime_root, PathBuf::from("/tmp/run"));
    }

    #[test]
    fn test_rm_alias() {
        let cli = parse(&["rm", "-f", "a", "b"]);
        assert!(matches!(cli.command, Commands::Delete(ref a) if a.force && a.ids.len() == 2));
    }
}
