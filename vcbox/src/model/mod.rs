//! Persisted data model of sandboxes and containers.

pub mod config;
pub mod container;
pub mod device;
pub mod network;
pub mod state;

pub use config::{HypervisorConfig, SandboxConfig};
pub use container::{Cmd, Container, ContainerConfig, ContainerType, DeviceSpec, Mount, Process};
pub use device::{
    BlockDevice, BlockDrive, Device, DeviceInfo, DeviceType, GenericDevice, VfioDevice,
};
pub use network::{NetworkInterface, NetworkNamespace};
pub use state::{State, StateKind};
