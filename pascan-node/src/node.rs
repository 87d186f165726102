//! The Node facade
//!
//! A [`Node`] owns a [`Device`] and the protocol services driving it, and
//! is the single entry point the host talks to. The contract is strictly
//! passive and single-threaded:
//!
//! - the host pushes every inbound CAN frame into [`Node::recv`]
//! - the host either waits until [`Node::next_deadline`] and then calls
//!   [`Node::process`], or simply calls `process` periodically
//! - every outbound frame is pushed through the `send` callback passed to
//!   the call that produced it, in production order
//!
//! All calls on one node must be serialized by the host. Re-entering the
//! engine from an indication hook is allowed through the documented entry
//! points (value reads and writes, aborts, service start/stop).

use std::rc::Rc;

use log::warn;

use pascan_common::device_config::{ConfigError, DeviceConfig};
use pascan_common::messages::{
    CanMessage, NmtCommand, NmtState, SyncMessage, NMT_CMD_ID,
};
use pascan_common::node_id::NodeId;
use pascan_common::sdo::AbortCode;
use pascan_common::values::Value;

use crate::dispatch::{CanFilter, Dispatcher, TimerQueue};
use crate::emcy::{self, EmcyIndication, EmcyService};
use crate::error::DeviceError;
use crate::nmt::{NmtEvent, NmtSlave};
use crate::od::{Device, DownloadHook, SubAddr, UploadHook};
#[cfg(feature = "pdo")]
use crate::pdo::{self, PdoKind, Rpdo, Tpdo};
use crate::profile;
use crate::sdo_client::{SdoClient, SdoClientEvent};
use crate::sdo_server::SdoServer;
use crate::sync::{self, SyncService};
use crate::time::{self, TimeIndication, TimeService, WallClock};

/// Receiver keys for the frame dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceKey {
    Nmt,
    Sync,
    Time,
    EmcyConsumer,
    SdoServer(usize),
    SdoClient(usize),
    #[cfg(feature = "pdo")]
    Rpdo(usize),
    #[cfg(feature = "pdo")]
    Tpdo(usize),
}

/// Timer keys for the timer queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKey {
    Heartbeat,
    SyncProduce,
    TimeProduce,
    EmcyFlush,
    SdoServer(usize),
    SdoClient(usize),
    #[cfg(feature = "pdo")]
    Tpdo(usize),
}

/// Notifications returned to the host from [`Node::recv`] and
/// [`Node::process`]
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// An SDO download committed a new value to the dictionary
    ObjectDownloaded(SubAddr),
    /// A receive PDO committed its mapped values to the dictionary
    #[cfg(feature = "pdo")]
    RpdoCommitted(u8),
    /// A client transfer finished
    SdoClient {
        /// The client channel the event belongs to
        channel: usize,
        /// What happened
        event: SdoClientEvent,
    },
}

/// The main object representing a CANopen node
pub struct Node {
    device: Device,
    dispatcher: Dispatcher<ServiceKey>,
    timers: TimerQueue<TimerKey>,
    nmt: NmtSlave,
    sync: SyncService,
    time: TimeService,
    emcy: EmcyService,
    sdo_servers: Vec<SdoServer>,
    sdo_clients: Vec<SdoClient>,
    #[cfg(feature = "pdo")]
    rpdos: Vec<Rpdo>,
    #[cfg(feature = "pdo")]
    tpdos: Vec<Tpdo>,
}

impl Node {
    /// Create a node from a parsed device description
    pub fn from_config(node_id: NodeId, config: &DeviceConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(profile::build_device(node_id, config)?))
    }

    /// Create a node around an existing device
    ///
    /// Installs the engine's validation hooks on the communication
    /// profile objects and creates one PDO service per parameter object
    /// pair found in the dictionary. Call [`Node::start`] before pumping
    /// frames.
    pub fn new(mut device: Device) -> Self {
        Self::install_hooks(&mut device);

        #[cfg(feature = "pdo")]
        let rpdos = {
            let mut rpdos = Vec::new();
            while device
                .object(PdoKind::Rpdo.comm_index(rpdos.len() as u8))
                .is_some()
            {
                rpdos.push(Rpdo::new(rpdos.len() as u8));
            }
            rpdos
        };
        #[cfg(feature = "pdo")]
        let tpdos = {
            let mut tpdos = Vec::new();
            while device
                .object(PdoKind::Tpdo.comm_index(tpdos.len() as u8))
                .is_some()
            {
                tpdos.push(Tpdo::new(tpdos.len() as u8));
            }
            tpdos
        };

        let sdo_servers = match device.node_id().assigned() {
            Some(id) => vec![SdoServer::new_std(id)],
            None => Vec::new(),
        };

        Self {
            device,
            dispatcher: Dispatcher::new(),
            timers: TimerQueue::new(),
            nmt: NmtSlave::new(),
            sync: SyncService::new(),
            time: TimeService::new(),
            emcy: EmcyService::new(),
            sdo_servers,
            sdo_clients: Vec::new(),
            #[cfg(feature = "pdo")]
            rpdos,
            #[cfg(feature = "pdo")]
            tpdos,
        }
    }

    fn install_hooks(device: &mut Device) {
        use pascan_common::constants::object_ids;

        // A registration failing just means this profile omits the object
        let install = |device: &mut Device, index: u16, sub: u8, hook: DownloadHook| {
            let _ = device.set_download_hook(SubAddr::new(index, sub), hook);
        };

        install(device, object_ids::SYNC_COB_ID, 0, sync::cob_id_download_hook());
        install(
            device,
            object_ids::SYNC_COUNTER_OVERFLOW,
            0,
            sync::overflow_download_hook(),
        );
        install(device, object_ids::TIME_COB_ID, 0, time::cob_id_download_hook());
        install(device, object_ids::EMCY_COB_ID, 0, emcy::cob_id_download_hook());
        install(device, object_ids::ERROR_HISTORY, 0, emcy::history_download_hook());

        #[cfg(feature = "pdo")]
        for kind in [PdoKind::Rpdo, PdoKind::Tpdo] {
            let mut num = 0u8;
            while let Some(obj) = device.object(kind.comm_index(num)) {
                let comm_index = kind.comm_index(num);
                let mapping_index = kind.mapping_index(num);
                let comm_subs: Vec<u8> =
                    obj.subs().map(|s| s.sub_index()).filter(|s| *s != 0).collect();
                for sub in comm_subs {
                    install(device, comm_index, sub, pdo::comm_download_hook(kind));
                }
                if let Some(obj) = device.object(mapping_index) {
                    let map_subs: Vec<u8> = obj.subs().map(|s| s.sub_index()).collect();
                    for sub in map_subs {
                        install(device, mapping_index, sub, pdo::mapping_download_hook(kind));
                    }
                }
                num += 1;
            }
        }
    }

    /// Access the device and its dictionary
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Mutable access to the device
    ///
    /// Dictionary changes made directly do not reconfigure the running
    /// services; prefer [`Node::write`] for objects the engine watches.
    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    /// The current NMT state
    pub fn nmt_state(&self) -> NmtState {
        self.nmt.state()
    }

    /// The node ID
    pub fn node_id(&self) -> NodeId {
        self.device.node_id()
    }

    /// Assign a new node ID and run the boot sequence again
    pub fn set_node_id(&mut self, node_id: NodeId, now: u64, send: &mut dyn FnMut(CanMessage)) {
        self.device.set_node_id(node_id);
        self.sdo_servers = match node_id.assigned() {
            Some(id) => vec![SdoServer::new_std(id)],
            None => Vec::new(),
        };
        self.restart(now, send);
    }

    /// Boot the node: send the boot-up message, activate the services
    /// described by the dictionary and register the receive filters
    pub fn start(&mut self, now: u64, send: &mut dyn FnMut(CanMessage)) {
        self.restart(now, send);
    }

    fn restart(&mut self, now: u64, send: &mut dyn FnMut(CanMessage)) {
        self.nmt.boot(&self.device, now, send);
        self.reload_services(now);
        self.rebuild_filters();
        self.rearm_timers();
    }

    fn reload_services(&mut self, now: u64) {
        self.nmt.reload(&self.device, now);
        self.sync.reload(&self.device, now);
        self.time.reload(&self.device, now);
        self.emcy.reload(&self.device);
        #[cfg(feature = "pdo")]
        {
            for rpdo in &mut self.rpdos {
                rpdo.reload(&self.device);
            }
            for tpdo in &mut self.tpdos {
                tpdo.reload(&self.device, now);
            }
        }
    }

    fn rebuild_filters(&mut self) {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(CanFilter::exact(NMT_CMD_ID), ServiceKey::Nmt);
        dispatcher.register(CanFilter::exact(self.sync.cob_id()), ServiceKey::Sync);
        if self.time.is_consumer() {
            dispatcher.register(CanFilter::exact(self.time.cob_id()), ServiceKey::Time);
        }
        for cob_id in EmcyService::consumer_cob_ids(&self.device) {
            dispatcher.register(CanFilter::exact(cob_id), ServiceKey::EmcyConsumer);
        }
        for (i, server) in self.sdo_servers.iter().enumerate() {
            dispatcher.register(CanFilter::exact(server.rx_cob_id()), ServiceKey::SdoServer(i));
        }
        for (i, client) in self.sdo_clients.iter().enumerate() {
            dispatcher.register(CanFilter::exact(client.resp_cob_id()), ServiceKey::SdoClient(i));
        }
        #[cfg(feature = "pdo")]
        {
            for (i, rpdo) in self.rpdos.iter().enumerate() {
                if let Some(cob_id) = rpdo.cob_id() {
                    dispatcher.register(CanFilter::exact(cob_id), ServiceKey::Rpdo(i));
                }
            }
            for (i, tpdo) in self.tpdos.iter().enumerate() {
                if let Some(cob_id) = tpdo.cob_id() {
                    dispatcher.register(CanFilter::exact(cob_id), ServiceKey::Tpdo(i));
                }
            }
        }
        self.dispatcher = dispatcher;
    }

    fn arm_or_cancel(&mut self, key: TimerKey, deadline: Option<u64>) {
        match deadline {
            Some(deadline) => self.timers.arm(key, deadline),
            None => self.timers.cancel(key),
        }
    }

    fn rearm_timers(&mut self) {
        self.arm_or_cancel(TimerKey::Heartbeat, self.nmt.next_deadline());
        self.arm_or_cancel(TimerKey::SyncProduce, self.sync.next_deadline());
        self.arm_or_cancel(TimerKey::TimeProduce, self.time.next_deadline());
        self.arm_or_cancel(TimerKey::EmcyFlush, self.emcy.next_deadline());
        for i in 0..self.sdo_servers.len() {
            self.arm_or_cancel(TimerKey::SdoServer(i), self.sdo_servers[i].next_deadline());
        }
        for i in 0..self.sdo_clients.len() {
            self.arm_or_cancel(TimerKey::SdoClient(i), self.sdo_clients[i].next_deadline());
        }
        #[cfg(feature = "pdo")]
        for i in 0..self.tpdos.len() {
            self.arm_or_cancel(TimerKey::Tpdo(i), self.tpdos[i].next_deadline());
        }
    }

    /// Reconfigure services after a committed write to a watched object
    fn refresh(&mut self, addr: SubAddr, now: u64) {
        use pascan_common::constants::object_ids;
        match addr.index {
            object_ids::SYNC_COB_ID | object_ids::SYNC_PERIOD | object_ids::SYNC_COUNTER_OVERFLOW => {
                self.sync.reload(&self.device, now)
            }
            object_ids::TIME_COB_ID => self.time.reload(&self.device, now),
            object_ids::EMCY_COB_ID | object_ids::EMCY_INHIBIT_TIME | object_ids::EMCY_CONSUMER => {
                self.emcy.reload(&self.device)
            }
            object_ids::HEARTBEAT_PRODUCER_TIME => self.nmt.reload(&self.device, now),
            #[cfg(feature = "pdo")]
            0x1400..=0x17FF => {
                let num = (addr.index & 0x1FF) as usize;
                if let Some(rpdo) = self.rpdos.get_mut(num) {
                    rpdo.reload(&self.device);
                }
            }
            #[cfg(feature = "pdo")]
            0x1800..=0x1BFF => {
                let num = (addr.index & 0x1FF) as usize;
                if let Some(tpdo) = self.tpdos.get_mut(num) {
                    tpdo.reload(&self.device, now);
                }
            }
            _ => {}
        }
        self.rebuild_filters();
        self.rearm_timers();
    }

    /// The next instant at which [`Node::process`] has work to do
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    /// Push one inbound CAN frame into the node
    ///
    /// Frames are routed to the registered services; responses and any
    /// triggered traffic leave through `send` in production order.
    pub fn recv(
        &mut self,
        msg: &CanMessage,
        now: u64,
        send: &mut dyn FnMut(CanMessage),
    ) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        for key in self.dispatcher.route(msg.id()) {
            match key {
                ServiceKey::Nmt => {
                    let cmd = match NmtCommand::try_from(msg) {
                        Ok(cmd) => cmd,
                        Err(e) => {
                            warn!("Dropping malformed NMT command: {e}");
                            continue;
                        }
                    };
                    if let Some(event) = self.nmt.handle_command(&cmd, self.device.node_id()) {
                        match event {
                            NmtEvent::ResetComm => self.device.reset_range(0x1000..=0x1FFF),
                            NmtEvent::ResetApp => self.device.reset_range(0x0000..=0xFFFF),
                        }
                        self.restart(now, send);
                    }
                }
                ServiceKey::Sync => {
                    let counter = self.sync.on_frame(msg);
                    #[cfg(feature = "pdo")]
                    events.extend(self.pdo_on_sync(counter, now, send));
                    #[cfg(not(feature = "pdo"))]
                    let _ = counter;
                }
                ServiceKey::Time => {
                    self.time.on_frame(msg);
                }
                ServiceKey::EmcyConsumer => {
                    self.emcy.on_frame(msg);
                }
                ServiceKey::SdoServer(i) => {
                    // A stopped node only serves NMT and heartbeat
                    if self.nmt.state() == NmtState::Stopped {
                        continue;
                    }
                    let updated =
                        self.sdo_servers[i].handle_frame(msg, now, &mut self.device, send);
                    if let Some(addr) = updated {
                        self.refresh(addr, now);
                        events.push(NodeEvent::ObjectDownloaded(addr));
                    }
                }
                ServiceKey::SdoClient(i) => {
                    if let Some(event) = self.sdo_clients[i].handle_frame(msg, now, send) {
                        events.push(NodeEvent::SdoClient { channel: i, event });
                    }
                }
                #[cfg(feature = "pdo")]
                ServiceKey::Rpdo(i) => {
                    if !self.nmt.is_operational() {
                        continue;
                    }
                    if self.rpdos[i].handle_frame(msg, &mut self.device) {
                        events.push(NodeEvent::RpdoCommitted(self.rpdos[i].num()));
                    }
                }
                #[cfg(feature = "pdo")]
                ServiceKey::Tpdo(i) => {
                    if msg.is_rtr() && self.nmt.is_operational() {
                        self.tpdos[i].on_rtr(now, &self.device, send);
                    }
                }
            }
        }
        self.rearm_timers();
        events
    }

    #[cfg(feature = "pdo")]
    fn pdo_on_sync(
        &mut self,
        counter: Option<u8>,
        now: u64,
        send: &mut dyn FnMut(CanMessage),
    ) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        if !self.nmt.is_operational() {
            return events;
        }
        for rpdo in &mut self.rpdos {
            if rpdo.on_sync(&mut self.device) {
                events.push(NodeEvent::RpdoCommitted(rpdo.num()));
            }
        }
        for tpdo in &mut self.tpdos {
            tpdo.on_sync(counter, now, &self.device, send);
        }
        events
    }

    /// Run all timer-driven work that is due at `now`
    pub fn process(&mut self, now: u64, send: &mut dyn FnMut(CanMessage)) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        while let Some(key) = self.timers.pop_due(now) {
            match key {
                TimerKey::Heartbeat => self.nmt.process(&self.device, now, send),
                TimerKey::SyncProduce => {
                    let mut produced = Vec::new();
                    self.sync.process(now, &mut |m| produced.push(m));
                    for msg in produced {
                        send(msg);
                        // The producer acts on its own SYNC as well
                        #[cfg(feature = "pdo")]
                        events.extend(self.pdo_on_sync(
                            SyncMessage::from(&msg).counter,
                            now,
                            send,
                        ));
                        #[cfg(not(feature = "pdo"))]
                        let _ = SyncMessage::from(&msg);
                    }
                }
                TimerKey::TimeProduce => self.time.process(now, send),
                TimerKey::EmcyFlush => self.emcy.process(now, send),
                TimerKey::SdoServer(i) => self.sdo_servers[i].poll(now, send),
                TimerKey::SdoClient(i) => {
                    if let Some(event) = self.sdo_clients[i].poll(now, send) {
                        events.push(NodeEvent::SdoClient { channel: i, event });
                    }
                }
                #[cfg(feature = "pdo")]
                TimerKey::Tpdo(i) => {
                    self.tpdos[i].process(now, &self.device, send);
                }
            }
        }
        self.rearm_timers();
        events
    }

    /// Read a sub-object through the upload indication path
    pub fn read(&self, index: u16, sub: u8) -> Result<Value, DeviceError> {
        let addr = SubAddr::new(index, sub);
        let data = self.device.upload(addr)?;
        let data_type = self.device.find_sub(addr)?.data_type();
        Ok(Value::decode(data_type, &data)?)
    }

    /// Write a sub-object through the download indication path
    ///
    /// The engine's validation hooks apply exactly as they would for an
    /// SDO write, and the services pick up configuration changes.
    pub fn write(&mut self, index: u16, sub: u8, value: &Value, now: u64) -> Result<(), DeviceError> {
        let addr = SubAddr::new(index, sub);
        self.device.download(addr, &value.to_bytes())?;
        self.refresh(addr, now);
        Ok(())
    }

    /// Register a download indication hook on a sub-object
    pub fn set_download_hook(&mut self, addr: SubAddr, hook: DownloadHook) -> Result<(), DeviceError> {
        self.device.set_download_hook(addr, hook)
    }

    /// Register an upload indication hook on a sub-object
    pub fn set_upload_hook(&mut self, addr: SubAddr, hook: UploadHook) -> Result<(), DeviceError> {
        self.device.set_upload_hook(addr, hook)
    }

    /// Register the wall clock used by the TIME producer
    pub fn set_wall_clock(&mut self, clock: WallClock) {
        self.time.set_clock(clock);
    }

    /// Register the TIME consumer indication
    pub fn set_time_indication(&mut self, indication: TimeIndication) {
        self.time.set_indication(indication);
    }

    /// Register the EMCY consumer indication
    pub fn set_emcy_indication(&mut self, indication: EmcyIndication) {
        self.emcy.set_indication(indication);
    }

    /// Start producing TIME frames at the given period
    pub fn start_time_producer(&mut self, period_us: u64, now: u64) {
        self.time.start_producer(&self.device, period_us, now);
        self.rearm_timers();
    }

    /// Stop the TIME producer
    pub fn stop_time_producer(&mut self) {
        self.time.stop_producer();
        self.rearm_timers();
    }

    /// Assert an error condition: update 0x1001/0x1003 and transmit an
    /// emergency frame
    pub fn emcy_raise(
        &mut self,
        code: u16,
        register_bits: u8,
        data: [u8; 5],
        now: u64,
        send: &mut dyn FnMut(CanMessage),
    ) {
        self.emcy
            .raise(&mut self.device, code, register_bits, data, now, send);
        self.rearm_timers();
    }

    /// Retract the most recently asserted error condition
    pub fn emcy_pop(&mut self, now: u64, send: &mut dyn FnMut(CanMessage)) {
        self.emcy.pop(&mut self.device, now, send);
        self.rearm_timers();
    }

    /// Retract all error conditions
    pub fn emcy_clear(&mut self, now: u64, send: &mut dyn FnMut(CanMessage)) {
        self.emcy.clear(&mut self.device, now, send);
        self.rearm_timers();
    }

    /// Signal an application event for a transmit PDO
    #[cfg(feature = "pdo")]
    pub fn tpdo_event(
        &mut self,
        num: u8,
        now: u64,
        send: &mut dyn FnMut(CanMessage),
    ) -> Result<(), DeviceError> {
        if !self.nmt.is_operational() {
            return Ok(());
        }
        let tpdo = self
            .tpdos
            .get_mut(num as usize)
            .ok_or(DeviceError::NotFound)?;
        tpdo.trigger_event(now, &self.device, send);
        self.rearm_timers();
        Ok(())
    }

    /// Add an SDO server channel on a COB-ID pair
    pub fn add_sdo_server(&mut self, server: SdoServer) -> usize {
        self.sdo_servers.push(server);
        self.rebuild_filters();
        self.sdo_servers.len() - 1
    }

    /// Abort the active transfer on an SDO server channel
    pub fn sdo_server_abort(
        &mut self,
        channel: usize,
        code: AbortCode,
        send: &mut dyn FnMut(CanMessage),
    ) -> Result<(), DeviceError> {
        let server = self
            .sdo_servers
            .get_mut(channel)
            .ok_or(DeviceError::NotFound)?;
        server.abort(code, send);
        self.rearm_timers();
        Ok(())
    }

    /// Add an SDO client channel talking to the given server node
    pub fn add_sdo_client(&mut self, server_node_id: u8) -> usize {
        self.sdo_clients.push(SdoClient::new_std(server_node_id));
        self.rebuild_filters();
        self.sdo_clients.len() - 1
    }

    /// Start a client download (write) on a channel
    pub fn sdo_download(
        &mut self,
        channel: usize,
        index: u16,
        sub: u8,
        data: &[u8],
        now: u64,
        send: &mut dyn FnMut(CanMessage),
    ) -> Result<(), DeviceError> {
        self.sdo_clients
            .get_mut(channel)
            .ok_or(DeviceError::NotFound)?
            .download(index, sub, data, now, send)?;
        self.rearm_timers();
        Ok(())
    }

    /// Start a client upload (read) on a channel
    pub fn sdo_upload(
        &mut self,
        channel: usize,
        index: u16,
        sub: u8,
        now: u64,
        send: &mut dyn FnMut(CanMessage),
    ) -> Result<(), DeviceError> {
        self.sdo_clients
            .get_mut(channel)
            .ok_or(DeviceError::NotFound)?
            .upload(index, sub, now, send)?;
        self.rearm_timers();
        Ok(())
    }

    /// Start a client block download on a channel
    pub fn sdo_block_download(
        &mut self,
        channel: usize,
        index: u16,
        sub: u8,
        data: &[u8],
        now: u64,
        send: &mut dyn FnMut(CanMessage),
    ) -> Result<(), DeviceError> {
        self.sdo_clients
            .get_mut(channel)
            .ok_or(DeviceError::NotFound)?
            .block_download(index, sub, data, now, send)?;
        self.rearm_timers();
        Ok(())
    }

    /// Start a client block upload on a channel
    pub fn sdo_block_upload(
        &mut self,
        channel: usize,
        index: u16,
        sub: u8,
        now: u64,
        send: &mut dyn FnMut(CanMessage),
    ) -> Result<(), DeviceError> {
        self.sdo_clients
            .get_mut(channel)
            .ok_or(DeviceError::NotFound)?
            .block_upload(index, sub, now, send)?;
        self.rearm_timers();
        Ok(())
    }

    /// Abort the active transfer on an SDO client channel
    pub fn sdo_client_abort(
        &mut self,
        channel: usize,
        code: AbortCode,
        send: &mut dyn FnMut(CanMessage),
    ) -> Result<Option<SdoClientEvent>, DeviceError> {
        let event = self
            .sdo_clients
            .get_mut(channel)
            .ok_or(DeviceError::NotFound)?
            .abort(code, send);
        self.rearm_timers();
        Ok(event)
    }

    /// Enable or disable the SYNC producer role (bit 30 of 0x1005)
    pub fn set_sync_producer(&mut self, enabled: bool, now: u64) -> Result<(), DeviceError> {
        use pascan_common::constants::{object_ids, COB_ID_ROLE_BIT};
        let raw = self.device.read_u32(object_ids::SYNC_COB_ID, 0)?;
        let raw = if enabled {
            raw | COB_ID_ROLE_BIT
        } else {
            raw & !COB_ID_ROLE_BIT
        };
        self.device
            .set_value(object_ids::SYNC_COB_ID, 0, Value::UInt32(raw))?;
        self.refresh(SubAddr::new(object_ids::SYNC_COB_ID, 0), now);
        Ok(())
    }

    /// Enable or disable the TIME consumer role (bit 31 of 0x1012)
    pub fn set_time_consumer(&mut self, enabled: bool, now: u64) -> Result<(), DeviceError> {
        use pascan_common::constants::{object_ids, COB_ID_INVALID_BIT};
        let raw = self.device.read_u32(object_ids::TIME_COB_ID, 0)?;
        let raw = if enabled {
            raw | COB_ID_INVALID_BIT
        } else {
            raw & !COB_ID_INVALID_BIT
        };
        self.device
            .set_value(object_ids::TIME_COB_ID, 0, Value::UInt32(raw))?;
        self.refresh(SubAddr::new(object_ids::TIME_COB_ID, 0), now);
        Ok(())
    }

    /// Enable or disable a PDO (bit 31 of its COB-ID entry)
    #[cfg(feature = "pdo")]
    pub fn set_pdo_enabled(
        &mut self,
        kind: PdoKind,
        num: u8,
        enabled: bool,
        now: u64,
    ) -> Result<(), DeviceError> {
        use pascan_common::constants::COB_ID_INVALID_BIT;
        let comm_index = kind.comm_index(num);
        let raw = self.device.read_u32(comm_index, 1)?;
        let raw = if enabled {
            raw & !COB_ID_INVALID_BIT
        } else {
            raw | COB_ID_INVALID_BIT
        };
        self.device.set_value(comm_index, 1, Value::UInt32(raw))?;
        self.refresh(SubAddr::new(comm_index, 1), now);
        Ok(())
    }

    /// Build a default indication hook pair shared by custom hooks
    ///
    /// These forward to the engine's built-in decode/commit and encode
    /// behavior; they are handy as fallbacks inside custom hooks.
    pub fn default_hooks() -> (DownloadHook, UploadHook) {
        (
            Rc::new(|device: &mut Device, addr, data: &[u8]| device.commit_download(addr, data)),
            Rc::new(|device: &Device, addr| device.encode_current(addr)),
        )
    }
}
