//! SYNC producer and consumer
//!
//! The SYNC service is configured through objects 0x1005 (COB-ID, with
//! bit 30 selecting the producer role), 0x1006 (communication cycle
//! period in microseconds) and 0x1019 (counter overflow). The producer
//! runs off the engine timer facade; a node with no configured node ID
//! never produces. Inbound SYNC frames advance a monotonically
//! incrementing local counter and are fanned out to the PDO engine by the
//! node.

use std::rc::Rc;

use log::warn;

use pascan_common::constants::object_ids;
use pascan_common::messages::{decode_cob_id, CanId, CanMessage, SyncMessage};
use pascan_common::sdo::AbortCode;

use crate::od::{Device, DownloadHook, SubAddr};

/// The SYNC service state
pub struct SyncService {
    producing: bool,
    cob_id: CanId,
    period_us: u64,
    overflow: u8,
    /// Counter value carried by the next produced SYNC
    counter: u8,
    next_tx: Option<u64>,
    /// Number of SYNC frames consumed since startup
    consumed: u64,
}

impl SyncService {
    /// Create an inactive SYNC service
    pub fn new() -> Self {
        Self {
            producing: false,
            cob_id: CanId::Std(0x80),
            period_us: 0,
            overflow: 0,
            counter: 1,
            next_tx: None,
            consumed: 0,
        }
    }

    /// Re-read the configuration objects from the dictionary
    pub fn reload(&mut self, device: &Device, now: u64) {
        let raw = device
            .read_u32(object_ids::SYNC_COB_ID, 0)
            .unwrap_or(0x80);
        let (cob_id, _, producer_bit) = decode_cob_id(raw);
        self.cob_id = cob_id;
        self.period_us = device
            .read_u32(object_ids::SYNC_PERIOD, 0)
            .unwrap_or(0) as u64;
        self.overflow = device
            .read_u8(object_ids::SYNC_COUNTER_OVERFLOW, 0)
            .unwrap_or(0);

        let wants_producer = producer_bit && self.period_us > 0;
        if wants_producer && !device.node_id().is_configured() {
            warn!("SYNC producer requested without a configured node ID");
        }
        let producing = wants_producer && device.node_id().is_configured();
        if producing && !self.producing {
            self.counter = 1;
            self.next_tx = Some(now + self.period_us);
        } else if !producing {
            self.next_tx = None;
        }
        self.producing = producing;
    }

    /// The COB-ID the SYNC object uses
    pub fn cob_id(&self) -> CanId {
        self.cob_id
    }

    /// Returns true while the producer role is active
    pub fn is_producing(&self) -> bool {
        self.producing
    }

    /// The next production instant
    pub fn next_deadline(&self) -> Option<u64> {
        self.next_tx
    }

    /// Number of SYNC frames consumed since startup
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Produce SYNC frames that are due
    pub fn process(&mut self, now: u64, send: &mut dyn FnMut(CanMessage)) {
        let Some(mut next) = self.next_tx else {
            return;
        };
        while next <= now {
            let counter = (self.overflow > 0).then_some(self.counter);
            send(SyncMessage { counter }.to_can_message(self.cob_id));
            if self.overflow > 0 {
                self.counter = if self.counter >= self.overflow {
                    1
                } else {
                    self.counter + 1
                };
            }
            next += self.period_us;
        }
        self.next_tx = Some(next);
    }

    /// Consume an inbound SYNC frame
    ///
    /// Returns the counter carried by the frame, for fan-out to the PDO
    /// engine.
    pub fn on_frame(&mut self, msg: &CanMessage) -> Option<u8> {
        self.consumed += 1;
        SyncMessage::from(msg).counter
    }
}

impl Default for SyncService {
    fn default() -> Self {
        Self::new()
    }
}

/// Validation hook for writes to 0x1005
///
/// Renumbering the SYNC CAN-ID while the producer role is active is
/// rejected; the host must clear bit 30 first.
pub fn cob_id_download_hook() -> DownloadHook {
    Rc::new(|device: &mut Device, addr: SubAddr, data: &[u8]| {
        if data.len() != 4 {
            return Err(AbortCode::TypeMismatch);
        }
        let new_raw = u32::from_le_bytes(data.try_into().unwrap());
        let old_raw = device.read_u32(addr.index, addr.sub)?;
        let (old_id, _, old_producer) = decode_cob_id(old_raw);
        let (new_id, _, new_producer) = decode_cob_id(new_raw);
        if old_producer && new_producer && old_id != new_id {
            return Err(AbortCode::InvalidValue);
        }
        device.commit_download(addr, data)
    })
}

/// Validation hook for writes to 0x1019
///
/// The counter overflow must not change while the communication cycle
/// period is nonzero.
pub fn overflow_download_hook() -> DownloadHook {
    Rc::new(|device: &mut Device, addr: SubAddr, data: &[u8]| {
        if device.read_u32(object_ids::SYNC_PERIOD, 0).unwrap_or(0) != 0 {
            return Err(AbortCode::CannotStoreDeviceState);
        }
        let overflow = *data.first().ok_or(AbortCode::TypeMismatchLengthLow)?;
        if overflow == 1 || overflow > 240 {
            return Err(AbortCode::InvalidValue);
        }
        device.commit_download(addr, data)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{AccessType, Object, ObjectCode, SubObject};
    use pascan_common::constants::COB_ID_ROLE_BIT;
    use pascan_common::node_id::NodeId;
    use pascan_common::values::{DataType, Value};

    fn sync_device(producer: bool, period_us: u32, overflow: u8) -> Device {
        let mut device = Device::new(NodeId::Assigned(1));
        let raw = 0x80 | if producer { COB_ID_ROLE_BIT } else { 0 };

        let mut obj = Object::new(object_ids::SYNC_COB_ID, ObjectCode::Var);
        obj.insert_sub(
            SubObject::new(0, DataType::UInt32)
                .access(AccessType::Rw)
                .with_default(Value::UInt32(raw)),
        )
        .unwrap();
        device.insert_object(obj).unwrap();

        let mut obj = Object::new(object_ids::SYNC_PERIOD, ObjectCode::Var);
        obj.insert_sub(
            SubObject::new(0, DataType::UInt32)
                .access(AccessType::Rw)
                .with_default(Value::UInt32(period_us)),
        )
        .unwrap();
        device.insert_object(obj).unwrap();

        let mut obj = Object::new(object_ids::SYNC_COUNTER_OVERFLOW, ObjectCode::Var);
        obj.insert_sub(
            SubObject::new(0, DataType::UInt8)
                .access(AccessType::Rw)
                .with_default(Value::UInt8(overflow)),
        )
        .unwrap();
        device.insert_object(obj).unwrap();

        device
    }

    #[test]
    fn producer_emits_at_period() {
        let device = sync_device(true, 10_000, 0);
        let mut sync = SyncService::new();
        sync.reload(&device, 0);
        assert!(sync.is_producing());
        assert_eq!(Some(10_000), sync.next_deadline());

        let mut out = Vec::new();
        sync.process(9_999, &mut |m| out.push(m));
        assert!(out.is_empty());
        sync.process(10_000, &mut |m| out.push(m));
        assert_eq!(1, out.len());
        assert_eq!(CanId::Std(0x80), out[0].id());
        // No counter configured: empty payload
        assert_eq!(0, out[0].data().len());
        assert_eq!(Some(20_000), sync.next_deadline());
    }

    #[test]
    fn producer_counter_wraps_at_overflow() {
        let device = sync_device(true, 1_000, 3);
        let mut sync = SyncService::new();
        sync.reload(&device, 0);

        let mut out = Vec::new();
        for i in 1..=4u64 {
            sync.process(i * 1_000, &mut |m| out.push(m));
        }
        let counters: Vec<u8> = out.iter().map(|m| m.data()[0]).collect();
        assert_eq!(vec![1, 2, 3, 1], counters);
    }

    #[test]
    fn unconfigured_node_does_not_produce() {
        let mut device = sync_device(true, 10_000, 0);
        device.set_node_id(NodeId::Unconfigured);
        let mut sync = SyncService::new();
        sync.reload(&device, 0);
        assert!(!sync.is_producing());
        assert_eq!(None, sync.next_deadline());
    }

    #[test]
    fn consumer_counts_frames() {
        let mut sync = SyncService::new();
        let msg = SyncMessage { counter: Some(7) }.to_can_message(CanId::Std(0x80));
        assert_eq!(Some(7), sync.on_frame(&msg));
        let msg = SyncMessage { counter: None }.to_can_message(CanId::Std(0x80));
        assert_eq!(None, sync.on_frame(&msg));
        assert_eq!(2, sync.consumed());
    }

    #[test]
    fn renumbering_active_producer_is_rejected() {
        let mut device = sync_device(true, 10_000, 0);
        let hook = cob_id_download_hook();
        let addr = SubAddr::new(object_ids::SYNC_COB_ID, 0);

        let new_raw = 0x90u32 | COB_ID_ROLE_BIT;
        assert_eq!(
            Err(AbortCode::InvalidValue),
            hook(&mut device, addr, &new_raw.to_le_bytes())
        );

        // Dropping the producer bit first makes the change legal
        hook(&mut device, addr, &0x80u32.to_le_bytes()).unwrap();
        hook(&mut device, addr, &(0x90u32 | COB_ID_ROLE_BIT).to_le_bytes()).unwrap();
    }

    #[test]
    fn overflow_write_rejected_while_period_runs() {
        let mut device = sync_device(false, 10_000, 0);
        let hook = overflow_download_hook();
        let addr = SubAddr::new(object_ids::SYNC_COUNTER_OVERFLOW, 0);
        assert_eq!(
            Err(AbortCode::CannotStoreDeviceState),
            hook(&mut device, addr, &[4])
        );

        device
            .set_value(object_ids::SYNC_PERIOD, 0, Value::UInt32(0))
            .unwrap();
        assert_eq!(Err(AbortCode::InvalidValue), hook(&mut device, addr, &[1]));
        hook(&mut device, addr, &[4]).unwrap();
    }
}
