//! Concise-DCF persistence
//!
//! Serializes dictionary values to the concise DCF layout: a 32-bit entry
//! count followed by `(u16 index, u8 sub-index, u32 size, value bytes)`
//! records, everything little-endian. [`store`] snapshots the sub-objects
//! marked persistent; [`load`] installs a snapshot through the value
//! codec, skipping entries the dictionary no longer has.

use log::warn;

use pascan_common::values::Value;

use crate::error::DeviceError;
use crate::od::Device;

/// Serialize the persistent sub-objects of a device
pub fn store(device: &Device) -> Vec<u8> {
    let mut entries: Vec<(u16, u8, &[u8])> = Vec::new();
    for obj in device.objects() {
        for sub in obj.subs() {
            if !sub.is_persistent() {
                continue;
            }
            // Unwrap: every inserted sub-object has a storage slot
            let bytes = obj.sub_bytes(sub.sub_index()).unwrap();
            entries.push((obj.index(), sub.sub_index(), bytes));
        }
    }

    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (index, sub, bytes) in entries {
        out.extend_from_slice(&index.to_le_bytes());
        out.push(sub);
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(bytes);
    }
    out
}

/// Install a concise-DCF snapshot into a device
///
/// Values are installed directly, bypassing indication hooks and access
/// checks. Entries addressing sub-objects that no longer exist, or whose
/// bytes no longer fit the declared type, are skipped with a warning.
/// Returns the number of values installed.
pub fn load(device: &mut Device, data: &[u8]) -> Result<usize, DeviceError> {
    let mut pos = 0usize;
    let take = |pos: &mut usize, n: usize| -> Result<&[u8], DeviceError> {
        let slice = data
            .get(*pos..*pos + n)
            .ok_or(DeviceError::InvalidParameter)?;
        *pos += n;
        Ok(slice)
    };

    let count = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap());
    let mut installed = 0usize;
    for _ in 0..count {
        let index = u16::from_le_bytes(take(&mut pos, 2)?.try_into().unwrap());
        let sub = take(&mut pos, 1)?[0];
        let size = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap()) as usize;
        let bytes = take(&mut pos, size)?;

        let data_type = match device.find_sub(crate::od::SubAddr::new(index, sub)) {
            Ok(entry) => entry.data_type(),
            Err(_) => {
                warn!("Skipping snapshot entry for unknown object 0x{index:04X}sub{sub}");
                continue;
            }
        };
        match Value::decode(data_type, bytes) {
            Ok(value) => {
                if let Err(code) = device.set_value(index, sub, value) {
                    warn!("Skipping snapshot entry 0x{index:04X}sub{sub}: {code:?}");
                } else {
                    installed += 1;
                }
            }
            Err(code) => {
                warn!("Skipping undecodable snapshot entry 0x{index:04X}sub{sub}: {code:?}");
            }
        }
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{AccessType, Object, ObjectCode, SubObject};
    use pascan_common::node_id::NodeId;
    use pascan_common::values::DataType;

    fn snapshot_device() -> Device {
        let mut device = Device::new(NodeId::Assigned(1));
        let mut obj = Object::new(0x2000, ObjectCode::Var);
        obj.insert_sub(
            SubObject::new(0, DataType::UInt32)
                .access(AccessType::Rw)
                .persist(true),
        )
        .unwrap();
        device.insert_object(obj).unwrap();

        let mut obj = Object::new(0x2001, ObjectCode::Var);
        obj.insert_sub(
            SubObject::new(0, DataType::VisibleString)
                .access(AccessType::Rw)
                .persist(true),
        )
        .unwrap();
        device.insert_object(obj).unwrap();

        // Not persistent; must not appear in the snapshot
        let mut obj = Object::new(0x2002, ObjectCode::Var);
        obj.insert_sub(SubObject::new(0, DataType::UInt8).access(AccessType::Rw))
            .unwrap();
        device.insert_object(obj).unwrap();

        device
    }

    #[test]
    fn snapshot_round_trip() {
        let mut device = snapshot_device();
        device.set_value(0x2000, 0, Value::UInt32(0xDEAD_BEEF)).unwrap();
        device
            .set_value(0x2001, 0, Value::VisibleString("hello".into()))
            .unwrap();
        device.set_value(0x2002, 0, Value::UInt8(9)).unwrap();

        let snapshot = store(&device);

        let mut restored = snapshot_device();
        assert_eq!(2, load(&mut restored, &snapshot).unwrap());
        assert_eq!(Value::UInt32(0xDEAD_BEEF), restored.value(0x2000, 0).unwrap());
        assert_eq!(
            Value::VisibleString("hello".into()),
            restored.value(0x2001, 0).unwrap()
        );
        // The non-persistent value stays at its default
        assert_eq!(Value::UInt8(0), restored.value(0x2002, 0).unwrap());
    }

    #[test]
    fn snapshot_layout_is_concise_dcf() {
        let mut device = snapshot_device();
        device.remove_object(0x2001).unwrap();
        device.set_value(0x2000, 0, Value::UInt32(0x0102_0304)).unwrap();

        let snapshot = store(&device);
        assert_eq!(
            vec![
                1, 0, 0, 0, // entry count
                0x00, 0x20, // index
                0x00, // sub-index
                4, 0, 0, 0, // size
                0x04, 0x03, 0x02, 0x01, // value
            ],
            snapshot
        );
    }

    #[test]
    fn unknown_entries_are_skipped() {
        let device = snapshot_device();
        let snapshot = store(&device);

        let mut other = Device::new(NodeId::Assigned(1));
        let mut obj = Object::new(0x2000, ObjectCode::Var);
        obj.insert_sub(
            SubObject::new(0, DataType::UInt32)
                .access(AccessType::Rw)
                .persist(true),
        )
        .unwrap();
        other.insert_object(obj).unwrap();

        assert_eq!(1, load(&mut other, &snapshot).unwrap());
    }

    #[test]
    fn truncated_snapshot_is_an_error() {
        let mut device = snapshot_device();
        let mut snapshot = store(&device);
        snapshot.truncate(snapshot.len() - 2);
        assert_eq!(
            Err(DeviceError::InvalidParameter),
            load(&mut device, &snapshot)
        );
    }
}
