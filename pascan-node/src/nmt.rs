//! NMT slave and heartbeat producer
//!
//! The engine only implements the slave side of network management: it
//! consumes NMT commands addressed to this node (or broadcast), tracks
//! the NMT state machine, sends the boot-up message, and produces
//! heartbeats at the period configured in object 0x1017. PDO traffic is
//! gated on the Operational state by the node. Master-side boot
//! orchestration is left to a layer above the engine.

use log::debug;

use pascan_common::constants::object_ids;
use pascan_common::messages::{CanMessage, Heartbeat, NmtCommand, NmtCommandSpecifier, NmtState};
use pascan_common::node_id::NodeId;

use crate::od::Device;

/// Side effects of an NMT command that the node must carry out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmtEvent {
    /// Reset communication: COB-IDs and services return to their boot
    /// configuration
    ResetComm,
    /// Reset application: the whole dictionary returns to defaults
    ResetApp,
}

/// The NMT slave state machine
pub struct NmtSlave {
    state: NmtState,
    heartbeat_period_ms: u16,
    next_heartbeat: Option<u64>,
}

impl NmtSlave {
    /// Create a slave in the boot-up state
    pub fn new() -> Self {
        Self {
            state: NmtState::Bootup,
            heartbeat_period_ms: 0,
            next_heartbeat: None,
        }
    }

    /// The current NMT state
    pub fn state(&self) -> NmtState {
        self.state
    }

    /// Returns true while the node is Operational
    pub fn is_operational(&self) -> bool {
        self.state == NmtState::Operational
    }

    /// Re-read the heartbeat period from object 0x1017
    pub fn reload(&mut self, device: &Device, now: u64) {
        self.heartbeat_period_ms = device
            .read_u16(object_ids::HEARTBEAT_PRODUCER_TIME, 0)
            .unwrap_or(0);
        self.next_heartbeat = (self.heartbeat_period_ms > 0
            && device.node_id().is_configured())
        .then(|| now + self.heartbeat_period_ms as u64 * 1000);
    }

    /// Leave the boot-up state: send the boot-up message and enter
    /// PreOperational
    pub fn boot(&mut self, device: &Device, now: u64, send: &mut dyn FnMut(CanMessage)) {
        if let NodeId::Assigned(node) = device.node_id() {
            send(Heartbeat {
                node,
                state: NmtState::Bootup,
            }
            .into());
        }
        self.state = NmtState::PreOperational;
        self.reload(device, now);
    }

    /// Handle an NMT command addressed to this node or broadcast
    ///
    /// Returns the reset event the node has to act on, if any.
    pub fn handle_command(&mut self, cmd: &NmtCommand, node_id: NodeId) -> Option<NmtEvent> {
        let Some(own_id) = node_id.assigned() else {
            return None;
        };
        if cmd.node != 0 && cmd.node != own_id {
            return None;
        }
        let prev = self.state;
        let event = match cmd.cs {
            NmtCommandSpecifier::Start => {
                self.state = NmtState::Operational;
                None
            }
            NmtCommandSpecifier::Stop => {
                self.state = NmtState::Stopped;
                None
            }
            NmtCommandSpecifier::EnterPreOp => {
                self.state = NmtState::PreOperational;
                None
            }
            NmtCommandSpecifier::ResetApp => {
                self.state = NmtState::Bootup;
                Some(NmtEvent::ResetApp)
            }
            NmtCommandSpecifier::ResetComm => {
                self.state = NmtState::Bootup;
                Some(NmtEvent::ResetComm)
            }
        };
        debug!("NMT state changed from {} to {}", prev, self.state);
        event
    }

    /// The next heartbeat instant
    pub fn next_deadline(&self) -> Option<u64> {
        self.next_heartbeat
    }

    /// Produce heartbeats that are due
    pub fn process(&mut self, device: &Device, now: u64, send: &mut dyn FnMut(CanMessage)) {
        let Some(next) = self.next_heartbeat else {
            return;
        };
        if now < next {
            return;
        }
        if let NodeId::Assigned(node) = device.node_id() {
            send(Heartbeat {
                node,
                state: self.state,
            }
            .into());
        }
        let period_us = self.heartbeat_period_ms as u64 * 1000;
        let mut next = next + period_us;
        // Catch up if processing fell far behind
        if next <= now {
            next = now + period_us;
        }
        self.next_heartbeat = Some(next);
    }
}

impl Default for NmtSlave {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{AccessType, Object, ObjectCode, SubObject};
    use pascan_common::messages::CanId;
    use pascan_common::values::{DataType, Value};

    fn nmt_device(period_ms: u16) -> Device {
        let mut device = Device::new(NodeId::Assigned(3));
        let mut obj = Object::new(object_ids::HEARTBEAT_PRODUCER_TIME, ObjectCode::Var);
        obj.insert_sub(
            SubObject::new(0, DataType::UInt16)
                .access(AccessType::Rw)
                .with_default(Value::UInt16(period_ms)),
        )
        .unwrap();
        device.insert_object(obj).unwrap();
        device
    }

    #[test]
    fn boot_sends_bootup_and_enters_preop() {
        let device = nmt_device(0);
        let mut nmt = NmtSlave::new();
        let mut out = Vec::new();
        nmt.boot(&device, 0, &mut |m| out.push(m));

        assert_eq!(1, out.len());
        assert_eq!(CanId::Std(0x703), out[0].id());
        assert_eq!(&[0], out[0].data());
        assert_eq!(NmtState::PreOperational, nmt.state());
    }

    #[test]
    fn commands_drive_the_state_machine() {
        let device = nmt_device(0);
        let mut nmt = NmtSlave::new();
        let mut out = Vec::new();
        nmt.boot(&device, 0, &mut |m| out.push(m));

        let start = NmtCommand {
            cs: NmtCommandSpecifier::Start,
            node: 3,
        };
        assert_eq!(None, nmt.handle_command(&start, device.node_id()));
        assert!(nmt.is_operational());

        // A command for another node is ignored
        let stop_other = NmtCommand {
            cs: NmtCommandSpecifier::Stop,
            node: 4,
        };
        nmt.handle_command(&stop_other, device.node_id());
        assert!(nmt.is_operational());

        // Broadcast applies
        let stop_all = NmtCommand {
            cs: NmtCommandSpecifier::Stop,
            node: 0,
        };
        nmt.handle_command(&stop_all, device.node_id());
        assert_eq!(NmtState::Stopped, nmt.state());

        let reset = NmtCommand {
            cs: NmtCommandSpecifier::ResetComm,
            node: 3,
        };
        assert_eq!(
            Some(NmtEvent::ResetComm),
            nmt.handle_command(&reset, device.node_id())
        );
        assert_eq!(NmtState::Bootup, nmt.state());
    }

    #[test]
    fn heartbeat_runs_at_the_configured_period() {
        let device = nmt_device(100);
        let mut nmt = NmtSlave::new();
        let mut out = Vec::new();
        nmt.boot(&device, 0, &mut |m| out.push(m));
        out.clear();
        assert_eq!(Some(100_000), nmt.next_deadline());

        nmt.process(&device, 99_000, &mut |m| out.push(m));
        assert!(out.is_empty());
        nmt.process(&device, 100_000, &mut |m| out.push(m));
        assert_eq!(1, out.len());
        // PreOperational state byte
        assert_eq!(&[127], out[0].data());
        assert_eq!(Some(200_000), nmt.next_deadline());
    }

    #[test]
    fn unconfigured_node_sends_no_heartbeat() {
        let mut device = nmt_device(100);
        device.set_node_id(NodeId::Unconfigured);
        let mut nmt = NmtSlave::new();
        let mut out = Vec::new();
        nmt.boot(&device, 0, &mut |m| out.push(m));
        assert!(out.is_empty());
        assert_eq!(None, nmt.next_deadline());
    }
}
