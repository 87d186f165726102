//! EMCY producer and consumer
//!
//! The producer side maintains the error register (0x1001) and the
//! pre-defined error field (0x1003, a bounded FIFO with the newest error
//! first), and transmits an 8-byte emergency frame on the COB-ID from
//! 0x1014 whenever the host asserts an error condition. The inhibit time
//! from 0x1015 (multiples of 100 us) defers transmissions instead of
//! dropping them. The consumer side watches the COB-IDs listed in object
//! 0x1028 and raises an indication for each received emergency.

use std::collections::VecDeque;
use std::rc::Rc;

use log::warn;

use pascan_common::constants::{object_ids, COB_ID_INVALID_BIT};
use pascan_common::messages::{decode_cob_id, CanId, CanMessage, EmcyMessage};
use pascan_common::sdo::AbortCode;
use pascan_common::values::Value;

use crate::od::{Device, DownloadHook, SubAddr};

/// Emergency error code signalling "error reset / no error"
pub const EMCY_ERROR_RESET: u16 = 0x0000;

/// Callback raised for every consumed emergency frame
pub type EmcyIndication = Rc<dyn Fn(CanId, EmcyMessage)>;

#[derive(Debug, Clone, Copy)]
struct ActiveError {
    code: u16,
    register: u8,
}

/// The EMCY service state
pub struct EmcyService {
    cob_id: Option<CanId>,
    inhibit_us: u64,
    last_tx: Option<u64>,
    pending: VecDeque<EmcyMessage>,
    /// Active errors, newest first; mirrored into 0x1003
    errors: Vec<ActiveError>,
    indication: Option<EmcyIndication>,
}

impl EmcyService {
    /// Create an inactive EMCY service
    pub fn new() -> Self {
        Self {
            cob_id: None,
            inhibit_us: 0,
            last_tx: None,
            pending: VecDeque::new(),
            errors: Vec::new(),
            indication: None,
        }
    }

    /// Register the consumer indication
    pub fn set_indication(&mut self, indication: EmcyIndication) {
        self.indication = Some(indication);
    }

    /// Re-read the configuration objects (0x1014, 0x1015)
    pub fn reload(&mut self, device: &Device) {
        self.cob_id = device.read_u32(object_ids::EMCY_COB_ID, 0).ok().and_then(|raw| {
            let (id, enabled, _) = decode_cob_id(raw);
            enabled.then_some(id)
        });
        self.inhibit_us = device
            .read_u16(object_ids::EMCY_INHIBIT_TIME, 0)
            .unwrap_or(0) as u64
            * 100;
    }

    /// The COB-IDs to monitor for consumed emergencies (object 0x1028)
    pub fn consumer_cob_ids(device: &Device) -> Vec<CanId> {
        let Some(obj) = device.object(object_ids::EMCY_CONSUMER) else {
            return Vec::new();
        };
        let count = device.read_u8(object_ids::EMCY_CONSUMER, 0).unwrap_or(0);
        (1..=count)
            .filter_map(|sub| obj.value(sub).ok())
            .filter_map(|v| match v {
                Value::UInt32(raw) => {
                    let (id, enabled, _) = decode_cob_id(raw);
                    enabled.then_some(id)
                }
                _ => None,
            })
            .collect()
    }

    /// Number of active errors
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// The next instant deferred transmissions can go out
    pub fn next_deadline(&self) -> Option<u64> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.last_tx.map_or(0, |t| t + self.inhibit_us))
        }
    }

    fn history_capacity(device: &Device) -> usize {
        device
            .object(object_ids::ERROR_HISTORY)
            .map(|obj| obj.sub_count().saturating_sub(1))
            .unwrap_or(0)
    }

    fn write_history(&self, device: &mut Device) {
        let cap = Self::history_capacity(device);
        let count = self.errors.len().min(cap);
        let _ = device.set_value(
            object_ids::ERROR_HISTORY,
            0,
            Value::UInt8(count as u8),
        );
        for (i, error) in self.errors.iter().take(cap).enumerate() {
            let _ = device.set_value(
                object_ids::ERROR_HISTORY,
                (i + 1) as u8,
                Value::UInt32(error.code as u32),
            );
        }
    }

    fn write_register(&self, device: &mut Device) {
        let register = self
            .errors
            .iter()
            .fold(0u8, |acc, e| acc | e.register | 0x01);
        let _ = device.set_value(object_ids::ERROR_REGISTER, 0, Value::UInt8(register));
    }

    fn current_register(device: &Device) -> u8 {
        device.read_u8(object_ids::ERROR_REGISTER, 0).unwrap_or(0)
    }

    fn emit(&mut self, msg: EmcyMessage, now: u64, send: &mut dyn FnMut(CanMessage)) {
        let Some(cob_id) = self.cob_id else {
            return;
        };
        let inhibited = self
            .last_tx
            .is_some_and(|t| now < t + self.inhibit_us);
        if inhibited || !self.pending.is_empty() {
            self.pending.push_back(msg);
        } else {
            send(msg.to_can_message(cob_id));
            self.last_tx = Some(now);
        }
    }

    /// Assert an error condition
    ///
    /// Appends to the error history, folds `register_bits` into the error
    /// register and transmits the emergency frame.
    pub fn raise(
        &mut self,
        device: &mut Device,
        code: u16,
        register_bits: u8,
        data: [u8; 5],
        now: u64,
        send: &mut dyn FnMut(CanMessage),
    ) {
        self.errors.insert(
            0,
            ActiveError {
                code,
                register: register_bits,
            },
        );
        let cap = Self::history_capacity(device).max(1);
        self.errors.truncate(cap);
        self.write_history(device);
        self.write_register(device);

        let msg = EmcyMessage {
            code,
            register: Self::current_register(device),
            data,
        };
        self.emit(msg, now, send);
    }

    /// Retract the most recently asserted error
    ///
    /// When the last error is retracted, an "error reset" emergency is
    /// transmitted.
    pub fn pop(&mut self, device: &mut Device, now: u64, send: &mut dyn FnMut(CanMessage)) {
        if self.errors.is_empty() {
            return;
        }
        self.errors.remove(0);
        self.write_history(device);
        self.write_register(device);
        if self.errors.is_empty() {
            let msg = EmcyMessage {
                code: EMCY_ERROR_RESET,
                register: 0,
                data: [0; 5],
            };
            self.emit(msg, now, send);
        }
    }

    /// Retract all errors and transmit an "error reset" emergency
    pub fn clear(&mut self, device: &mut Device, now: u64, send: &mut dyn FnMut(CanMessage)) {
        if self.errors.is_empty() {
            return;
        }
        self.errors.clear();
        self.write_history(device);
        self.write_register(device);
        let msg = EmcyMessage {
            code: EMCY_ERROR_RESET,
            register: 0,
            data: [0; 5],
        };
        self.emit(msg, now, send);
    }

    /// Flush transmissions deferred by the inhibit window
    pub fn process(&mut self, now: u64, send: &mut dyn FnMut(CanMessage)) {
        let Some(cob_id) = self.cob_id else {
            self.pending.clear();
            return;
        };
        while let Some(msg) = self.pending.front() {
            let inhibited = self
                .last_tx
                .is_some_and(|t| now < t + self.inhibit_us);
            if inhibited {
                break;
            }
            send(msg.to_can_message(cob_id));
            self.pending.pop_front();
            self.last_tx = Some(now);
        }
    }

    /// Consume an inbound emergency frame from a monitored producer
    pub fn on_frame(&mut self, msg: &CanMessage) -> Option<EmcyMessage> {
        match EmcyMessage::try_from(msg) {
            Ok(emcy) => {
                if let Some(indication) = &self.indication {
                    indication(msg.id(), emcy);
                }
                Some(emcy)
            }
            Err(_) => {
                warn!("Dropping malformed EMCY frame with dlc {}", msg.data().len());
                None
            }
        }
    }
}

impl Default for EmcyService {
    fn default() -> Self {
        Self::new()
    }
}

/// Validation hook for writes to 0x1003
///
/// Only sub-index 0 is writable, and only with the value 0, which clears
/// the error history.
pub fn history_download_hook() -> DownloadHook {
    Rc::new(|device: &mut Device, addr: SubAddr, data: &[u8]| {
        if addr.sub != 0 {
            return Err(AbortCode::ReadOnly);
        }
        let value = *data.first().ok_or(AbortCode::TypeMismatchLengthLow)?;
        if value != 0 {
            return Err(AbortCode::InvalidValue);
        }
        device.commit_download(addr, data)
    })
}

/// Validation hook for writes to 0x1014
///
/// The CAN-ID may only change while the COB is disabled (bit 31 set).
pub fn cob_id_download_hook() -> DownloadHook {
    Rc::new(|device: &mut Device, addr: SubAddr, data: &[u8]| {
        if data.len() != 4 {
            return Err(AbortCode::TypeMismatch);
        }
        let new_raw = u32::from_le_bytes(data.try_into().unwrap());
        let old_raw = device.read_u32(addr.index, addr.sub)?;
        let old_enabled = old_raw & COB_ID_INVALID_BIT == 0;
        let new_enabled = new_raw & COB_ID_INVALID_BIT == 0;
        if old_enabled && new_enabled && (new_raw & 0x1FFF_FFFF) != (old_raw & 0x1FFF_FFFF) {
            return Err(AbortCode::InvalidValue);
        }
        device.commit_download(addr, data)
    })
}
