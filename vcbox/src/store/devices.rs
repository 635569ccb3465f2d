//! Tagged envelope persistence for device collections (`devices.json`).
//!
//! Each device is wrapped as `{"Type": <tag>, "Data": <variant json>}` so the
//! collection can be decoded without knowing the variants up front:
//! ```json
//! [
//!   {"Type": "vfio", "Data": {"id": "gpu0", "info": {...}, "bdfs": ["02:10.0"]}},
//!   {"Type": "block", "Data": {"id": "disk0", "info": {...}}}
//! ]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use vcbox_shared::errors::{VcError, VcResult};
use vcbox_shared::layout::{ResourceKind, ResourceScope};

use crate::model::{Device, DeviceType};

/// Persisted wrapper around one device.
#[derive(Debug, Serialize, Deserialize)]
struct TypedDevice {
    #[serde(rename = "Type")]
    device_type: String,
    #[serde(rename = "Data")]
    data: Value,
}

fn typed(device: &Device) -> serde_json::Result<TypedDevice> {
    let data = match device {
        Device::Vfio(d) => serde_json::to_value(d)?,
        Device::Block(d) => serde_json::to_value(d)?,
        Device::Generic(d) => serde_json::to_value(d)?,
    };
    Ok(TypedDevice {
        device_type: device.device_type().tag().to_string(),
        data,
    })
}

/// One device as an envelope value.
pub fn envelope(device: &Device) -> serde_json::Result<Value> {
    serde_json::to_value(typed(device)?)
}

/// Serialize a device collection into the envelope format.
pub fn encode(devices: &[Device]) -> serde_json::Result<Vec<u8>> {
    let envelopes = devices
        .iter()
        .map(typed)
        .collect::<serde_json::Result<Vec<_>>>()?;

    serde_json::to_vec(&envelopes)
}

/// Decode a device collection, dispatching each envelope on its tag.
pub fn decode(bytes: &[u8], scope: &ResourceScope) -> VcResult<Vec<Device>> {
    let corrupt = |source| VcError::CorruptData {
        kind: ResourceKind::Devices,
        scope: scope.clone(),
        source,
    };

    let envelopes: Vec<TypedDevice> = serde_json::from_slice(bytes).map_err(corrupt)?;

    envelopes
        .into_iter()
        .map(|envelope| {
            let Some(ty) = DeviceType::from_tag(&envelope.device_type) else {
                return Err(VcError::UnknownDeviceType(envelope.device_type));
            };
            let device = match ty {
                DeviceType::Vfio => {
                    Device::Vfio(serde_json::from_value(envelope.data).map_err(corrupt)?)
                }
                DeviceType::Block => {
                    Device::Block(serde_json::from_value(envelope.data).map_err(corrupt)?)
                }
                DeviceType::Generic => {
                    Device::Generic(serde_json::from_value(envelope.data).map_err(corrupt)?)
                }
            };
            Ok(device)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockDevice, BlockDrive, DeviceInfo, GenericDevice, VfioDevice};

    fn scope() -> ResourceScope {
        ResourceScope::container("sb", "c1")
    }

    fn sample_devices() -> Vec<Device> {
        vec![
            Device::Vfio(VfioDevice {
                id: "gpu0".into(),
                info: DeviceInfo {
                    host_path: "/dev/vfio/12".into(),
                    container_path: "/dev/vfio/12".into(),
                    dev_type: "c".into(),
                    major: 243,
                    minor: 0,
                    ..Default::default()
                },
                bdfs: vec!["02:10.0".into(), "02:10.1".into()],
            }),
            Device::Block(BlockDevice {
                id: "disk0".into(),
                info: DeviceInfo {
                    host_path: "/dev/sdb".into(),
                    container_path: "/dev/xvdb".into(),
                    dev_type: "b".into(),
                    major: 8,
                    minor: 16,
                    file_mode: Some(0o660),
                    uid: Some(0),
                    gid: Some(6),
                },
                drive: Some(BlockDrive {
                    file: "/dev/sdb".into(),
                    format: "raw".into(),
                    id: "drive-disk0".into(),
                    index: 1,
                    scsi_addr: Some("0:1".into()),
                    ..Default::default()
                }),
            }),
            Device::Generic(GenericDevice {
                id: "tty".into(),
                info: DeviceInfo {
                    host_path: "/dev/ttyS0".into(),
                    container_path: "/dev/ttyS0".into(),
                    dev_type: "c".into(),
                    major: 4,
                    minor: 64,
                    ..Default::default()
                },
            }),
        ]
    }

    #[test]
    fn test_envelope_preserves_every_variant() {
        let devices = sample_devices();
        let bytes = encode(&devices).unwrap();
        let decoded = decode(&bytes, &scope()).unwrap();
        assert_eq!(decoded, devices);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let bytes = encode(&sample_devices()).unwrap();
        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        let tags: Vec<&str> = raw
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["Type"].as_str().unwrap())
            .collect();
        assert_eq!(tags, vec!["vfio", "block", "generic"]);
        assert_eq!(raw[0]["Data"]["bdfs"][1], "02:10.1");
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let bytes = br#"[{"Type":"nvdimm","Data":{"id":"pmem0"}}]"#;
        match decode(bytes, &scope()) {
            Err(VcError::UnknownDeviceType(tag)) => assert_eq!(tag, "nvdimm"),
            other => panic!("expected UnknownDeviceType, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_payload_is_corrupt() {
        let bytes = br#"[{"Type":"block","Data":{"id":42}}]"#;
        assert!(matches!(
            decode(bytes, &scope()),
            Err(VcError::CorruptData {
                kind: ResourceKind::Devices,
                ..
            })
        ));
    }

    #[test]
    fn test_empty_collection() {
        let bytes = encode(&[]).unwrap();
        assert_eq!(bytes, b"[]");
        assert!(decode(&bytes, &scope()).unwrap().is_empty());
    }
}
