//! Devices passed through to a container.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Attributes common to every device variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeviceInfo {
    /// Device node on the host, e.g. `/dev/vfio/12`.
    pub host_path: PathBuf,
    /// Where the device appears inside the container.
    pub container_path: PathBuf,
    /// `c`, `b` or `u`.
    #[serde(default)]
    pub dev_type: String,
    #[serde(default)]
    pub major: i64,
    #[serde(default)]
    pub minor: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

/// A VFIO group passed through to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfioDevice {
    pub id: String,
    pub info: DeviceInfo,
    /// PCI addresses (`bus:device.function`) of the devices in the group.
    #[serde(default)]
    pub bdfs: Vec<String>,
}

/// Backing drive of a block device once it is attached to the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlockDrive {
    pub file: PathBuf,
    /// Image format, e.g. `raw`.
    pub format: String,
    pub id: String,
    pub index: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virt_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scsi_addr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    pub id: String,
    pub info: DeviceInfo,
    /// Set once the drive has been hotplugged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive: Option<BlockDrive>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericDevice {
    pub id: String,
    pub info: DeviceInfo,
}

/// Device variants known to the runtime.
///
/// Persisted through a tagged envelope, see `store::devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    Vfio(VfioDevice),
    Block(BlockDevice),
    Generic(GenericDevice),
}

/// Discriminant of a [`Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Vfio,
    Block,
    Generic,
}

impl DeviceType {
    /// Tag written into the persisted envelope.
    pub fn tag(self) -> &'static str {
        match self {
            DeviceType::Vfio => "vfio",
            DeviceType::Block => "block",
            DeviceType::Generic => "generic",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "vfio" => Some(DeviceType::Vfio),
            "block" => Some(DeviceType::Block),
            "generic" => Some(DeviceType::Generic),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl Device {
    pub fn device_type(&self) -> DeviceType {
        match self {
            Device::Vfio(_) => DeviceType::Vfio,
            Device::Block(_) => DeviceType::Block,
            Device::Generic(_) => DeviceType::Generic,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Device::Vfio(d) => &d.id,
            Device::Block(d) => &d.id,
            Device::Generic(d) => &d.id,
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        match self {
            Device::Vfio(d) => &d.info,
            Device::Block(d) => &d.info,
            Device::Generic(d) => &d.info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags() {
        for ty in [DeviceType::Vfio, DeviceType::Block, DeviceType::Generic] {
            assert_eq!(DeviceType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(DeviceType::from_tag("nvdimm"), None);
    }

    #[test]
    fn test_accessors() {
        let dev = Device::Generic(GenericDevice {
            id: "null".into(),
            info: DeviceInfo {
                host_path: "/dev/null".into(),
                container_path: "/dev/null".into(),
                dev_type: "c".into(),
                major: 1,
                minor: 3,
                ..Default::default()
            },
        });
        assert_eq!(dev.device_type(), DeviceType::Generic);
        assert_eq!(dev.id(), "null");
        assert_eq!(dev.info().minor, 3);
    }
}
