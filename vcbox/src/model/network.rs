//! Network namespace record (`network.json`).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Interface configured inside the sandbox namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NetworkInterface {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    /// CIDR notation, e.g. `10.0.0.2/24`.
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

/// Network namespace owned by a sandbox.
///
/// Built by an external collaborator; the runtime only records it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NetworkNamespace {
    /// `/var/run/netns/...` or `/proc/<pid>/ns/net`. Empty when networking is disabled.
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default)]
    pub interfaces: Vec<NetworkInterface>,
}

impl NetworkNamespace {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            interfaces: Vec::new(),
        }
    }

    pub fn with_interface(mut self, iface: NetworkInterface) -> Self {
        self.interfaces.push(iface);
        self
    }
}
