//! Runtime configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use vcbox_shared::errors::{VcError, VcResult};
use vcbox_shared::layout::{DEFAULT_CONFIG_ROOT, DEFAULT_RUNTIME_ROOT, StoreLayout};

/// Overrides the config root.
pub const CONFIG_ROOT_ENV: &str = "VCBOX_CONFIG_ROOT";
/// Overrides the runtime root.
pub const RUNTIME_ROOT_ENV: &str = "VCBOX_RUNTIME_ROOT";

/// Where the runtime keeps its state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Persistent sandbox and container configuration.
    pub config_root: PathBuf,
    /// Volatile state, lock files and process records.
    pub runtime_root: PathBuf,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            config_root: PathBuf::from(DEFAULT_CONFIG_ROOT),
            runtime_root: PathBuf::from(DEFAULT_RUNTIME_ROOT),
        }
    }
}

impl RuntimeOptions {
    pub fn new(config_root: impl Into<PathBuf>, runtime_root: impl Into<PathBuf>) -> Self {
        Self {
            config_root: config_root.into(),
            runtime_root: runtime_root.into(),
        }
    }

    /// Read options from a JSON file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> VcResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| VcError::io(format!("read options {}", path.display()), e))?;
        serde_json::from_str(&content).map_err(|e| {
            VcError::Config(format!("invalid options file {}: {}", path.display(), e))
        })
    }

    /// Apply `VCBOX_CONFIG_ROOT` / `VCBOX_RUNTIME_ROOT` from the process
    /// environment.
    pub fn with_env(self) -> Self {
        self.with_env_lookup(|key| std::env::var(key).ok())
    }

    fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(CONFIG_ROOT_ENV).filter(|v| !v.is_empty()) {
            self.config_root = PathBuf::from(root);
        }
        if let Some(root) = lookup(RUNTIME_ROOT_ENV).filter(|v| !v.is_empty()) {
            self.runtime_root = PathBuf::from(root);
        }
        self
    }

    pub fn layout(&self) -> StoreLayout {
        StoreLayout::new(self.config_root.clone(), self.runtime_root.clone())
    }
}
