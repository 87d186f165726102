//! PDO engine
//!
//! Receive and transmit PDO services, driven entirely by the communication
//! parameter objects (0x1400/0x1800 ranges) and mapping parameter objects
//! (0x1600/0x1A00 ranges) in the dictionary. The services keep a decoded
//! mirror of their parameter objects; the node reloads the mirror after
//! any committed download into the PDO parameter ranges.
//!
//! Mapped values are packed bit-by-bit, little-endian, in mapping order.
//! Receive PDOs with a synchronous transmission type (0..=240) stage the
//! most recent frame and commit it on the next SYNC; event-driven types
//! (254/255) commit immediately. Transmit PDOs support synchronous
//! operation (every Nth SYNC with an optional start value), RTR-only
//! types (252/253), and event-driven operation with inhibit time and
//! event timer.

use log::{debug, warn};

use pascan_common::constants::{object_ids, COB_ID_INVALID_BIT, PDO_MAX_MAPPING_ENTRIES};
use pascan_common::messages::{decode_cob_id, CanId, CanMessage, MAX_DATA_LENGTH};
use pascan_common::sdo::AbortCode;

use crate::od::{AccessType, Device, DownloadHook, SubAddr};

/// Number of mapping entries per PDO (sub-indices 1..=8 of the mapping
/// parameter object)
pub const N_MAPPING_PARAMS: usize = PDO_MAX_MAPPING_ENTRIES;

/// Largest total mapped size of one PDO, in bits
pub const MAX_PDO_BITS: usize = MAX_DATA_LENGTH * 8;

/// Direction of a PDO service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdoKind {
    /// Receive PDO: consumes frames and writes the dictionary
    Rpdo,
    /// Transmit PDO: samples the dictionary and produces frames
    Tpdo,
}

impl PdoKind {
    /// Index of the communication parameter object for PDO number `num`
    pub fn comm_index(self, num: u8) -> u16 {
        match self {
            PdoKind::Rpdo => object_ids::RPDO_COMM_BASE + num as u16,
            PdoKind::Tpdo => object_ids::TPDO_COMM_BASE + num as u16,
        }
    }

    /// Index of the mapping parameter object for PDO number `num`
    pub fn mapping_index(self, num: u8) -> u16 {
        match self {
            PdoKind::Rpdo => object_ids::RPDO_MAPPING_BASE + num as u16,
            PdoKind::Tpdo => object_ids::TPDO_MAPPING_BASE + num as u16,
        }
    }
}

/// Copy `len` bits from `src` starting at `src_bit` into `dst` at `dst_bit`
///
/// Bits are numbered LSB-first within each byte, matching the
/// little-endian packing of PDO payloads.
pub(crate) fn copy_bits(dst: &mut [u8], dst_bit: usize, src: &[u8], src_bit: usize, len: usize) {
    for i in 0..len {
        let s = src_bit + i;
        let d = dst_bit + i;
        let bit = (src[s / 8] >> (s % 8)) & 1;
        if bit != 0 {
            dst[d / 8] |= 1 << (d % 8);
        } else {
            dst[d / 8] &= !(1 << (d % 8));
        }
    }
}

/// One entry of a PDO mapping: which sub-object, and how many bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    /// Index of the mapped object
    pub index: u16,
    /// Sub-index of the mapped sub-object
    pub sub: u8,
    /// Mapped length in bits
    pub bits: u8,
}

impl MapEntry {
    /// Decode a mapping parameter value (index << 16 | sub << 8 | bits)
    pub fn from_raw(raw: u32) -> Option<Self> {
        if raw == 0 {
            return None;
        }
        Some(Self {
            index: (raw >> 16) as u16,
            sub: ((raw >> 8) & 0xFF) as u8,
            bits: (raw & 0xFF) as u8,
        })
    }

    /// Encode to the mapping parameter value
    pub fn to_raw(self) -> u32 {
        ((self.index as u32) << 16) | ((self.sub as u32) << 8) | self.bits as u32
    }

    fn addr(self) -> SubAddr {
        SubAddr::new(self.index, self.sub)
    }
}

/// Decoded communication parameters of one PDO
#[derive(Debug, Clone, Copy)]
pub struct PdoComm {
    /// The frame COB-ID
    pub cob_id: CanId,
    /// Valid bit (bit 31 inverted)
    pub enabled: bool,
    /// RTR-disallowed bit (bit 30)
    pub rtr_disabled: bool,
    /// Transmission type (sub-index 2)
    pub transmission_type: u8,
    /// Inhibit time in multiples of 100 us (sub-index 3)
    pub inhibit_time: u16,
    /// Event timer in milliseconds (sub-index 5)
    pub event_timer: u16,
    /// SYNC start value (sub-index 6)
    pub sync_start: u8,
}

impl Default for PdoComm {
    fn default() -> Self {
        Self {
            cob_id: CanId::Std(0),
            enabled: false,
            rtr_disabled: false,
            transmission_type: 255,
            inhibit_time: 0,
            event_timer: 0,
            sync_start: 0,
        }
    }
}

impl PdoComm {
    /// Read the communication parameters from the dictionary
    ///
    /// Missing sub-objects fall back to defaults; a PDO with no
    /// communication object at all is disabled.
    pub fn load(device: &Device, comm_index: u16) -> Self {
        if device.object(comm_index).is_none() {
            return Self::default();
        }
        let raw = device.read_u32(comm_index, 1).unwrap_or(COB_ID_INVALID_BIT);
        let (cob_id, enabled, rtr_disabled) = decode_cob_id(raw);
        Self {
            cob_id,
            enabled: enabled && cob_id.raw() != 0,
            rtr_disabled,
            transmission_type: device.read_u8(comm_index, 2).unwrap_or(255),
            inhibit_time: device.read_u16(comm_index, 3).unwrap_or(0),
            event_timer: device.read_u16(comm_index, 5).unwrap_or(0),
            sync_start: device.read_u8(comm_index, 6).unwrap_or(0),
        }
    }

    fn is_synchronous(&self) -> bool {
        self.transmission_type <= 240
    }
}

/// Read the mapping parameters from the dictionary
pub fn load_mapping(device: &Device, mapping_index: u16) -> Vec<MapEntry> {
    let count = device.read_u8(mapping_index, 0).unwrap_or(0);
    let mut map = Vec::new();
    for sub in 1..=count.min(N_MAPPING_PARAMS as u8) {
        if let Ok(raw) = device.read_u32(mapping_index, sub) {
            if let Some(entry) = MapEntry::from_raw(raw) {
                map.push(entry);
            }
        }
    }
    map
}

fn mapped_bits(map: &[MapEntry]) -> usize {
    map.iter().map(|e| e.bits as usize).sum()
}

/// A receive PDO service
pub struct Rpdo {
    num: u8,
    comm: PdoComm,
    map: Vec<MapEntry>,
    /// Most recent frame awaiting the next SYNC (synchronous types only)
    staged: Option<CanMessage>,
}

impl Rpdo {
    /// Create RPDO number `num` (0-based)
    pub fn new(num: u8) -> Self {
        Self {
            num,
            comm: PdoComm::default(),
            map: Vec::new(),
            staged: None,
        }
    }

    /// The PDO number (0-based)
    pub fn num(&self) -> u8 {
        self.num
    }

    /// Re-read the parameter objects from the dictionary
    pub fn reload(&mut self, device: &Device) {
        self.comm = PdoComm::load(device, PdoKind::Rpdo.comm_index(self.num));
        self.map = load_mapping(device, PdoKind::Rpdo.mapping_index(self.num));
        self.staged = None;
    }

    /// The COB-ID this RPDO listens on, when enabled
    pub fn cob_id(&self) -> Option<CanId> {
        self.comm.enabled.then_some(self.comm.cob_id)
    }

    /// Handle a frame for this RPDO's COB-ID
    ///
    /// Returns true when the dictionary was updated.
    pub fn handle_frame(&mut self, msg: &CanMessage, device: &mut Device) -> bool {
        if !self.comm.enabled || msg.is_rtr() {
            return false;
        }
        let bits = mapped_bits(&self.map);
        if msg.data().len() * 8 < bits {
            warn!(
                "RPDO{} frame too short: {} bytes for {} mapped bits",
                self.num,
                msg.data().len(),
                bits
            );
            return false;
        }
        if self.comm.is_synchronous() {
            // Stage; only the most recent frame before the SYNC counts
            self.staged = Some(*msg);
            false
        } else {
            self.commit(msg, device)
        }
    }

    /// Commit the staged frame, if any (called on SYNC)
    pub fn on_sync(&mut self, device: &mut Device) -> bool {
        match self.staged.take() {
            Some(msg) => self.commit(&msg, device),
            None => false,
        }
    }

    fn commit(&self, msg: &CanMessage, device: &mut Device) -> bool {
        let mut offset = 0usize;
        let mut updated = false;
        for entry in &self.map {
            let byte_len = match device.find_sub(entry.addr()) {
                Ok(sub) => sub
                    .data_type()
                    .fixed_size()
                    .unwrap_or_else(|| (entry.bits as usize).div_ceil(8)),
                Err(_) => {
                    offset += entry.bits as usize;
                    continue;
                }
            };
            let mut buf = vec![0u8; byte_len];
            copy_bits(&mut buf, 0, msg.data(), offset, entry.bits as usize);
            match device.download(entry.addr(), &buf) {
                Ok(()) => updated = true,
                Err(code) => {
                    // Mappings are validated at write time, so this is rare
                    warn!(
                        "RPDO{} write to 0x{:04X}sub{} failed: {:?}",
                        self.num, entry.index, entry.sub, code
                    );
                }
            }
            offset += entry.bits as usize;
        }
        updated
    }
}

/// A transmit PDO service
pub struct Tpdo {
    num: u8,
    comm: PdoComm,
    map: Vec<MapEntry>,
    /// SYNC periods seen since the last transmission
    sync_counter: u8,
    /// Becomes true once the SYNC start value has been observed
    sync_started: bool,
    /// Frame sampled at the last SYNC, served on RTR (type 252)
    sync_sample: Option<CanMessage>,
    /// Time of the last transmission, for the inhibit window
    last_tx: Option<u64>,
    /// An event fired inside the inhibit window; send when it closes
    pending: bool,
    event_deadline: Option<u64>,
}

impl Tpdo {
    /// Create TPDO number `num` (0-based)
    pub fn new(num: u8) -> Self {
        Self {
            num,
            comm: PdoComm::default(),
            map: Vec::new(),
            sync_counter: 0,
            sync_started: false,
            sync_sample: None,
            last_tx: None,
            pending: false,
            event_deadline: None,
        }
    }

    /// The PDO number (0-based)
    pub fn num(&self) -> u8 {
        self.num
    }

    /// Re-read the parameter objects from the dictionary
    pub fn reload(&mut self, device: &Device, now: u64) {
        self.comm = PdoComm::load(device, PdoKind::Tpdo.comm_index(self.num));
        self.map = load_mapping(device, PdoKind::Tpdo.mapping_index(self.num));
        self.sync_counter = 0;
        self.sync_started = self.comm.sync_start == 0;
        self.sync_sample = None;
        self.pending = false;
        self.event_deadline = (self.comm.enabled
            && self.comm.event_timer > 0
            && self.comm.transmission_type >= 254)
            .then(|| now + self.comm.event_timer as u64 * 1000);
    }

    /// The COB-ID this TPDO transmits on, when enabled
    pub fn cob_id(&self) -> Option<CanId> {
        self.comm.enabled.then_some(self.comm.cob_id)
    }

    /// The next instant at which [`Tpdo::process`] has work to do
    pub fn next_deadline(&self) -> Option<u64> {
        let inhibit_release = (self.pending)
            .then(|| self.last_tx.map(|t| t + self.inhibit_us()))
            .flatten();
        match (self.event_deadline, inhibit_release) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn inhibit_us(&self) -> u64 {
        self.comm.inhibit_time as u64 * 100
    }

    fn inhibited(&self, now: u64) -> bool {
        match self.last_tx {
            Some(t) => now < t + self.inhibit_us(),
            None => false,
        }
    }

    /// Sample the mapped sub-objects into a frame
    fn sample(&self, device: &Device) -> Option<CanMessage> {
        let bits = mapped_bits(&self.map);
        let mut buf = [0u8; MAX_DATA_LENGTH];
        let mut offset = 0usize;
        for entry in &self.map {
            let data = match device.upload(entry.addr()) {
                Ok(data) => data,
                Err(code) => {
                    warn!(
                        "TPDO{} read of 0x{:04X}sub{} failed: {:?}",
                        self.num, entry.index, entry.sub, code
                    );
                    return None;
                }
            };
            let len = (entry.bits as usize).min(data.len() * 8);
            copy_bits(&mut buf, offset, &data, 0, len);
            offset += entry.bits as usize;
        }
        Some(CanMessage::new(self.comm.cob_id, &buf[0..bits.div_ceil(8)]))
    }

    fn transmit(&mut self, now: u64, device: &Device, send: &mut dyn FnMut(CanMessage)) {
        if self.inhibited(now) {
            self.pending = true;
            return;
        }
        if let Some(msg) = self.sample(device) {
            send(msg);
            self.last_tx = Some(now);
            self.pending = false;
            if self.comm.event_timer > 0 && self.comm.transmission_type >= 254 {
                self.event_deadline = Some(now + self.comm.event_timer as u64 * 1000);
            }
        }
    }

    /// Handle a SYNC event
    pub fn on_sync(
        &mut self,
        counter: Option<u8>,
        now: u64,
        device: &Device,
        send: &mut dyn FnMut(CanMessage),
    ) {
        if !self.comm.enabled {
            return;
        }
        let tt = self.comm.transmission_type;
        if !self.sync_started {
            if counter == Some(self.comm.sync_start) {
                self.sync_started = true;
            } else {
                return;
            }
        }
        match tt {
            0 => {
                // Acyclic synchronous: send on SYNC only after an event
                if self.pending {
                    self.pending = false;
                    self.transmit(now, device, send);
                }
            }
            1..=240 => {
                self.sync_counter += 1;
                if self.sync_counter >= tt {
                    self.sync_counter = 0;
                    self.transmit(now, device, send);
                }
            }
            252 => {
                // Sample on SYNC, transmit on RTR
                self.sync_sample = self.sample(device);
            }
            _ => {}
        }
    }

    /// Handle an RTR frame for this TPDO's COB-ID
    pub fn on_rtr(&mut self, now: u64, device: &Device, send: &mut dyn FnMut(CanMessage)) {
        if !self.comm.enabled || self.comm.rtr_disabled {
            return;
        }
        match self.comm.transmission_type {
            252 => {
                if let Some(msg) = self.sync_sample {
                    send(msg);
                    self.last_tx = Some(now);
                }
            }
            253 => self.transmit(now, device, send),
            _ => {
                debug!("Ignoring RTR for TPDO{} with transmission type {}", self.num, self.comm.transmission_type);
            }
        }
    }

    /// Signal an application event on one of the mapped objects
    ///
    /// Event-driven types transmit immediately (subject to the inhibit
    /// time); synchronous acyclic types transmit on the next SYNC.
    pub fn trigger_event(&mut self, now: u64, device: &Device, send: &mut dyn FnMut(CanMessage)) {
        if !self.comm.enabled {
            return;
        }
        match self.comm.transmission_type {
            0 => self.pending = true,
            254 | 255 => self.transmit(now, device, send),
            _ => {}
        }
    }

    /// Run deferred work: inhibit-window release and the event timer
    pub fn process(&mut self, now: u64, device: &Device, send: &mut dyn FnMut(CanMessage)) {
        if !self.comm.enabled {
            return;
        }
        if self.pending && self.comm.transmission_type >= 254 && !self.inhibited(now) {
            self.transmit(now, device, send);
        }
        if let Some(deadline) = self.event_deadline {
            if now >= deadline {
                self.transmit(now, device, send);
            }
        }
    }
}

/// Validation hook for writes to the PDO communication parameter objects
///
/// Enforces the COB-ID renumbering rule (the PDO must be disabled before
/// its CAN-ID changes) and the transmission types valid for the
/// direction. Accepted writes are committed with the default behavior;
/// the node reloads the service mirror afterwards.
pub fn comm_download_hook(kind: PdoKind) -> DownloadHook {
    std::rc::Rc::new(move |device: &mut Device, addr: SubAddr, data: &[u8]| {
        match addr.sub {
            1 => {
                if data.len() != 4 {
                    return Err(AbortCode::TypeMismatch);
                }
                let raw = u32::from_le_bytes(data.try_into().unwrap());
                let (new_id, new_enabled, _) = decode_cob_id(raw);
                let old_raw = device.read_u32(addr.index, 1)?;
                let (old_id, old_enabled, _) = decode_cob_id(old_raw);
                if old_enabled && new_enabled && new_id != old_id {
                    return Err(AbortCode::InvalidValue);
                }
                device.commit_download(addr, data)
            }
            2 => {
                let tt = *data.first().ok_or(AbortCode::TypeMismatchLengthLow)?;
                let reserved = match kind {
                    PdoKind::Rpdo => (241..=253).contains(&tt),
                    PdoKind::Tpdo => (241..=251).contains(&tt),
                };
                if reserved {
                    return Err(AbortCode::InvalidValue);
                }
                device.commit_download(addr, data)
            }
            3 => {
                // The inhibit time may not change while the PDO is enabled
                let raw = device.read_u32(addr.index, 1)?;
                if raw & COB_ID_INVALID_BIT == 0 {
                    return Err(AbortCode::CannotStoreDeviceState);
                }
                device.commit_download(addr, data)
            }
            _ => device.commit_download(addr, data),
        }
    })
}

/// Validation hook for writes to the PDO mapping parameter objects
///
/// Mapping entries may only change while the map is deactivated (count
/// written to 0) and the PDO is disabled; a mapping may never widen the
/// target sub-object's declared type, the target must be mappable in the
/// right direction, and the total length must fit a frame.
pub fn mapping_download_hook(kind: PdoKind) -> DownloadHook {
    std::rc::Rc::new(move |device: &mut Device, addr: SubAddr, data: &[u8]| {
        let num = (addr.index - kind.mapping_index(0)) as u8;
        let comm_raw = device
            .read_u32(kind.comm_index(num), 1)
            .unwrap_or(COB_ID_INVALID_BIT);
        if comm_raw & COB_ID_INVALID_BIT == 0 {
            return Err(AbortCode::CannotStoreDeviceState);
        }
        if addr.sub == 0 {
            let count = *data.first().ok_or(AbortCode::TypeMismatchLengthLow)?;
            if count as usize > N_MAPPING_PARAMS {
                return Err(AbortCode::ParameterIncompatible);
            }
            // Activating the map validates the combined length
            let mut total_bits = 0usize;
            for sub in 1..=count {
                let raw = device.read_u32(addr.index, sub)?;
                let entry = MapEntry::from_raw(raw).ok_or(AbortCode::CannotMapPdo)?;
                validate_map_entry(device, kind, entry)?;
                total_bits += entry.bits as usize;
            }
            if total_bits > MAX_PDO_BITS {
                return Err(AbortCode::PdoLengthExceeded);
            }
            device.commit_download(addr, data)
        } else {
            // Entries may only change while the map is deactivated
            if device.read_u8(addr.index, 0)? != 0 {
                return Err(AbortCode::InvalidValue);
            }
            if data.len() != 4 {
                return Err(AbortCode::TypeMismatch);
            }
            let raw = u32::from_le_bytes(data.try_into().unwrap());
            if let Some(entry) = MapEntry::from_raw(raw) {
                validate_map_entry(device, kind, entry)?;
            }
            device.commit_download(addr, data)
        }
    })
}

fn validate_map_entry(device: &Device, kind: PdoKind, entry: MapEntry) -> Result<(), AbortCode> {
    let sub = device.find_sub(SubAddr::new(entry.index, entry.sub))?;
    if !sub.is_pdo_mappable() {
        return Err(AbortCode::CannotMapPdo);
    }
    let access = sub.access_type();
    let direction_ok = match kind {
        PdoKind::Rpdo => access.is_writable() && access != AccessType::Rwr,
        PdoKind::Tpdo => access.is_readable() && access != AccessType::Rww,
    };
    if !direction_ok {
        return Err(AbortCode::CannotMapPdo);
    }
    // A mapping must never widen the declared type
    let max_bits = match sub.data_type().fixed_size() {
        Some(size) => size * 8,
        None => sub.size() * 8,
    };
    if entry.bits == 0 || entry.bits as usize > max_bits {
        return Err(AbortCode::CannotMapPdo);
    }
    Ok(())
}
