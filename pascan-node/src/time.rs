//! TIME producer and consumer
//!
//! The TIME service broadcasts the current time of day as a 6-byte frame
//! on the COB-ID configured in object 0x1012. Bit 30 of the COB-ID value
//! selects the producer role, bit 31 the consumer role.
//!
//! The engine owns no clock: the producer period is set by the host and
//! the produced timestamps come from a host-supplied wall-clock callback.
//! Renumbering the CAN-ID while either role is active is rejected with
//! `InvalidValue`; the host must stop the service first.

use std::rc::Rc;

use log::warn;

use pascan_common::constants::{object_ids, COB_ID_INVALID_BIT, COB_ID_ROLE_BIT};
use pascan_common::messages::{CanId, CanMessage, TimeMessage};
use pascan_common::sdo::AbortCode;
use pascan_common::values::TimeOfDay;

use crate::od::{Device, DownloadHook, SubAddr};

/// Host-supplied wall clock
pub type WallClock = Rc<dyn Fn() -> TimeOfDay>;

/// Callback raised for every consumed TIME frame
pub type TimeIndication = Rc<dyn Fn(TimeOfDay)>;

/// The TIME service state
pub struct TimeService {
    producer: bool,
    consumer: bool,
    cob_id: CanId,
    period_us: u64,
    next_tx: Option<u64>,
    clock: Option<WallClock>,
    indication: Option<TimeIndication>,
}

impl TimeService {
    /// Create an inactive TIME service
    pub fn new() -> Self {
        Self {
            producer: false,
            consumer: false,
            cob_id: CanId::Std(0x100),
            period_us: 0,
            next_tx: None,
            clock: None,
            indication: None,
        }
    }

    /// Register the wall clock used by the producer
    pub fn set_clock(&mut self, clock: WallClock) {
        self.clock = Some(clock);
    }

    /// Register the consumer indication
    pub fn set_indication(&mut self, indication: TimeIndication) {
        self.indication = Some(indication);
    }

    /// Re-read object 0x1012 from the dictionary
    pub fn reload(&mut self, device: &Device, now: u64) {
        let raw = device
            .read_u32(object_ids::TIME_COB_ID, 0)
            .unwrap_or(0x100);
        self.cob_id = if raw & (1 << 29) != 0 {
            CanId::Extended(raw & 0x1FFF_FFFF)
        } else {
            CanId::Std((raw & 0x7FF) as u16)
        };
        self.consumer = raw & COB_ID_INVALID_BIT != 0;
        let producer = raw & COB_ID_ROLE_BIT != 0 && self.period_us > 0;
        if producer && self.clock.is_none() {
            warn!("TIME producer requested without a wall clock");
        }
        let producer = producer && self.clock.is_some();
        if producer && !self.producer {
            self.next_tx = Some(now + self.period_us);
        } else if !producer {
            self.next_tx = None;
        }
        self.producer = producer;
    }

    /// Set the production period and (re)start the producer
    ///
    /// Production still requires the producer bit in 0x1012 and a
    /// registered wall clock.
    pub fn start_producer(&mut self, device: &Device, period_us: u64, now: u64) {
        self.period_us = period_us;
        self.reload(device, now);
    }

    /// Stop producing without touching the dictionary
    pub fn stop_producer(&mut self) {
        self.period_us = 0;
        self.producer = false;
        self.next_tx = None;
    }

    /// The COB-ID the TIME object uses
    pub fn cob_id(&self) -> CanId {
        self.cob_id
    }

    /// Returns true while the consumer role is active
    pub fn is_consumer(&self) -> bool {
        self.consumer
    }

    /// Returns true while the producer is running
    pub fn is_producer(&self) -> bool {
        self.producer
    }

    /// The next production instant
    pub fn next_deadline(&self) -> Option<u64> {
        self.next_tx
    }

    /// Produce TIME frames that are due
    pub fn process(&mut self, now: u64, send: &mut dyn FnMut(CanMessage)) {
        let Some(mut next) = self.next_tx else {
            return;
        };
        // Unwrap: the producer flag implies a registered clock
        let clock = self.clock.clone().unwrap();
        while next <= now {
            send(TimeMessage(clock()).to_can_message(self.cob_id));
            next += self.period_us;
        }
        self.next_tx = Some(next);
    }

    /// Consume an inbound TIME frame
    pub fn on_frame(&mut self, msg: &CanMessage) -> Option<TimeOfDay> {
        if !self.consumer {
            return None;
        }
        match TimeMessage::try_from(msg) {
            Ok(TimeMessage(stamp)) => {
                if let Some(indication) = &self.indication {
                    indication(stamp);
                }
                Some(stamp)
            }
            Err(_) => {
                warn!("Dropping malformed TIME frame with dlc {}", msg.data().len());
                None
            }
        }
    }
}

impl Default for TimeService {
    fn default() -> Self {
        Self::new()
    }
}

/// Validation hook for writes to 0x1012
///
/// The CAN-ID may only change while both the producer and the consumer
/// role are inactive.
pub fn cob_id_download_hook() -> DownloadHook {
    Rc::new(|device: &mut Device, addr: SubAddr, data: &[u8]| {
        if data.len() != 4 {
            return Err(AbortCode::TypeMismatch);
        }
        let new_raw = u32::from_le_bytes(data.try_into().unwrap());
        let old_raw = device.read_u32(addr.index, addr.sub)?;
        let active = old_raw & (COB_ID_ROLE_BIT | COB_ID_INVALID_BIT) != 0;
        if active && (new_raw & 0x1FFF_FFFF) != (old_raw & 0x1FFF_FFFF) {
            return Err(AbortCode::InvalidValue);
        }
        device.commit_download(addr, data)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{AccessType, Object, ObjectCode, SubObject};
    use pascan_common::node_id::NodeId;
    use pascan_common::values::{DataType, Value};
    use std::cell::RefCell;

    fn time_device(raw: u32) -> Device {
        let mut device = Device::new(NodeId::Assigned(1));
        let mut obj = Object::new(object_ids::TIME_COB_ID, ObjectCode::Var);
        obj.insert_sub(
            SubObject::new(0, DataType::UInt32)
                .access(AccessType::Rw)
                .with_default(Value::UInt32(raw)),
        )
        .unwrap();
        device.insert_object(obj).unwrap();
        device
    }

    #[test]
    fn producer_emits_wall_clock_payload() {
        let device = time_device(0x100 | COB_ID_ROLE_BIT);
        let mut time = TimeService::new();
        // 2024-05-01T12:00:00Z
        time.set_clock(Rc::new(|| {
            TimeOfDay::from_unix_seconds(1_714_564_800).unwrap()
        }));
        time.start_producer(&device, 100_000, 0);
        assert!(time.is_producer());

        let mut out = Vec::new();
        time.process(100_000, &mut |m| out.push(m));
        assert_eq!(1, out.len());
        assert_eq!(CanId::Std(0x100), out[0].id());
        assert_eq!(&[0x00, 0x6C, 0x93, 0x02, 0x8B, 0x39], out[0].data());
    }

    #[test]
    fn producer_without_clock_stays_off() {
        let device = time_device(0x100 | COB_ID_ROLE_BIT);
        let mut time = TimeService::new();
        time.start_producer(&device, 100_000, 0);
        assert!(!time.is_producer());
    }

    #[test]
    fn consumer_raises_indication() {
        let device = time_device(0x100 | COB_ID_INVALID_BIT);
        let mut time = TimeService::new();
        let seen = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        time.set_indication(Rc::new(move |stamp| {
            *seen2.borrow_mut() = Some(stamp);
        }));
        time.reload(&device, 0);
        assert!(time.is_consumer());

        let stamp = TimeOfDay::new(14731, 43_200_000);
        time.on_frame(&TimeMessage(stamp).to_can_message(CanId::Std(0x100)));
        assert_eq!(Some(stamp), *seen.borrow());
    }

    #[test]
    fn renumbering_active_service_is_rejected() {
        let mut device = time_device(0x100 | COB_ID_INVALID_BIT);
        let hook = cob_id_download_hook();
        let addr = SubAddr::new(object_ids::TIME_COB_ID, 0);

        assert_eq!(
            Err(AbortCode::InvalidValue),
            hook(
                &mut device,
                addr,
                &(0x101u32 | COB_ID_INVALID_BIT).to_le_bytes()
            )
        );

        // Deactivating both roles first makes the change legal
        hook(&mut device, addr, &0x100u32.to_le_bytes()).unwrap();
        hook(
            &mut device,
            addr,
            &(0x101u32 | COB_ID_INVALID_BIT).to_le_bytes(),
        )
        .unwrap();
        assert_eq!(
            Value::UInt32(0x101 | COB_ID_INVALID_BIT),
            device.value(object_ids::TIME_COB_ID, 0).unwrap()
        );
    }
}
