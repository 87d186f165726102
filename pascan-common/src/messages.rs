//! CAN frame and broadcast message definitions

use snafu::Snafu;

use crate::values::TimeOfDay;

/// A CAN identifier
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CanId {
    /// An extended 29-bit identifier
    Extended(u32),
    /// A standard 11-bit identifier
    Std(u16),
}

impl CanId {
    /// Create a new extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id)
    }

    /// Create a new standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id)
    }

    /// Get the raw ID as a u32
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// Returns true if this ID is an extended ID
    pub fn is_extended(&self) -> bool {
        matches!(self, CanId::Extended(_))
    }
}

/// Maximum frame payload size
#[cfg(not(feature = "can-fd"))]
pub const MAX_DATA_LENGTH: usize = 8;
/// Maximum frame payload size
#[cfg(feature = "can-fd")]
pub const MAX_DATA_LENGTH: usize = 64;

/// A CAN frame
#[derive(Clone, Copy)]
pub struct CanMessage {
    /// The data payload of the message
    ///
    /// Note, some bytes may be unused. Check dlc.
    pub data: [u8; MAX_DATA_LENGTH],
    /// The length of the data payload
    pub dlc: u8,
    /// Indicates this message is a remote transmission request
    pub rtr: bool,
    /// The id of this message
    pub id: CanId,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            id: CanId::Std(0),
            rtr: false,
        }
    }
}

impl core::fmt::Debug for CanMessage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CanMessage")
            .field("id", &self.id)
            .field("rtr", &self.rtr)
            .field("data", &self.data())
            .finish()
    }
}

impl CanMessage {
    /// Create a new CAN message
    ///
    /// Panics if `data` exceeds the frame payload size.
    pub fn new(id: CanId, data: &[u8]) -> Self {
        assert!(
            data.len() <= MAX_DATA_LENGTH,
            "data length exceeds maximum of {} bytes",
            MAX_DATA_LENGTH
        );
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[0..data.len()].copy_from_slice(data);

        Self {
            id,
            dlc: data.len() as u8,
            data: buf,
            rtr: false,
        }
    }

    /// Create a new RTR message
    ///
    /// RTR messages have no data payload
    pub fn new_rtr(id: CanId) -> Self {
        Self {
            id,
            rtr: true,
            ..Default::default()
        }
    }

    /// Get the id of the message
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get a slice containing the data payload
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }

    /// Returns true if this message is a remote transmission request
    pub fn is_rtr(&self) -> bool {
        self.rtr
    }
}

/// The COB-ID used for NMT commands
pub const NMT_CMD_ID: CanId = CanId::Std(0);
/// The default COB-ID of the SYNC object
pub const SYNC_COB_ID: CanId = CanId::Std(0x80);
/// The default COB-ID of the TIME object
pub const TIME_COB_ID: CanId = CanId::Std(0x100);
/// The base COB-ID for emergency messages (node ID is added)
pub const EMCY_BASE: u16 = 0x80;
/// The base COB-ID for heartbeat messages (node ID is added)
pub const HEARTBEAT_BASE: u16 = 0x700;
/// The default base ID for SDO requests (server node ID is added)
pub const SDO_REQ_BASE: u16 = 0x600;
/// The default base ID for SDO responses (server node ID is added)
pub const SDO_RESP_BASE: u16 = 0x580;

/// Split a COB-ID dictionary entry into its CAN-ID and flag bits
///
/// Returns `(id, enabled, role)`: bit 31 clear means the COB is enabled,
/// bit 30 carries the role flag (producer for SYNC, RTR-disallowed for
/// PDOs), bit 29 selects the 29-bit frame format.
pub fn decode_cob_id(raw: u32) -> (CanId, bool, bool) {
    let enabled = raw & crate::constants::COB_ID_INVALID_BIT == 0;
    let role = raw & crate::constants::COB_ID_ROLE_BIT != 0;
    let id = if raw & crate::constants::COB_ID_EXTENDED_BIT != 0 {
        CanId::Extended(raw & 0x1FFF_FFFF)
    } else {
        CanId::Std((raw & 0x7FF) as u16)
    };
    (id, enabled, role)
}

/// Assemble a COB-ID dictionary entry from its CAN-ID and flag bits
pub fn encode_cob_id(id: CanId, enabled: bool, role: bool) -> u32 {
    let mut raw = id.raw();
    if id.is_extended() {
        raw |= crate::constants::COB_ID_EXTENDED_BIT;
    }
    if !enabled {
        raw |= crate::constants::COB_ID_INVALID_BIT;
    }
    if role {
        raw |= crate::constants::COB_ID_ROLE_BIT;
    }
    raw
}

/// The NMT state transition command specifier
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum NmtCommandSpecifier {
    /// Transition to the Operational state
    Start = 1,
    /// Transition to the Stopped state
    Stop = 2,
    /// Transition to the PreOperational state
    EnterPreOp = 128,
    /// Perform an application reset
    ResetApp = 129,
    /// Perform a communications reset
    ResetComm = 130,
}

impl NmtCommandSpecifier {
    /// Create a command specifier from the byte value carried in the message
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            1 => Ok(Self::Start),
            2 => Ok(Self::Stop),
            128 => Ok(Self::EnterPreOp),
            129 => Ok(Self::ResetApp),
            130 => Ok(Self::ResetComm),
            _ => Err(MessageError::InvalidField),
        }
    }
}

/// An NMT command message
#[derive(Clone, Copy, Debug)]
pub struct NmtCommand {
    /// The type of command
    pub cs: NmtCommandSpecifier,
    /// The node it applies to; 0 broadcasts to all nodes
    pub node: u8,
}

impl TryFrom<&CanMessage> for NmtCommand {
    type Error = MessageError;

    fn try_from(msg: &CanMessage) -> Result<Self, Self::Error> {
        let payload = msg.data();
        if msg.id() != NMT_CMD_ID {
            Err(MessageError::UnexpectedId {
                cob_id: msg.id(),
                expected: NMT_CMD_ID,
            })
        } else if payload.len() >= 2 {
            let cs = NmtCommandSpecifier::from_byte(payload[0])?;
            let node = payload[1];
            Ok(NmtCommand { cs, node })
        } else {
            Err(MessageError::MessageTooShort)
        }
    }
}

impl From<NmtCommand> for CanMessage {
    fn from(cmd: NmtCommand) -> Self {
        CanMessage::new(NMT_CMD_ID, &[cmd.cs as u8, cmd.node])
    }
}

/// Possible NMT states for a node
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum NmtState {
    /// Transient state during device start; reported in the boot-up message
    Bootup = 0,
    /// Node has been stopped
    Stopped = 4,
    /// Normal operational state
    Operational = 5,
    /// Node is awaiting the command to enter operation
    PreOperational = 127,
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NmtState::Bootup => write!(f, "Bootup"),
            NmtState::Stopped => write!(f, "Stopped"),
            NmtState::Operational => write!(f, "Operational"),
            NmtState::PreOperational => write!(f, "PreOperational"),
        }
    }
}

impl TryFrom<u8> for NmtState {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(NmtState::Bootup),
            4 => Ok(NmtState::Stopped),
            5 => Ok(NmtState::Operational),
            127 => Ok(NmtState::PreOperational),
            _ => Err(MessageError::InvalidNmtState { value }),
        }
    }
}

/// A heartbeat message
#[derive(Clone, Copy, Debug)]
pub struct Heartbeat {
    /// The ID of the node transmitting the heartbeat
    pub node: u8,
    /// The current NMT state of the node
    pub state: NmtState,
}

impl From<Heartbeat> for CanMessage {
    fn from(value: Heartbeat) -> Self {
        CanMessage::new(
            CanId::Std(HEARTBEAT_BASE | value.node as u16),
            &[value.state as u8],
        )
    }
}

/// A SYNC message
///
/// One node on the bus may act as the SYNC producer. The optional counter
/// starts at 1 and wraps back to 1 after the configured overflow value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyncMessage {
    /// Counter value; None when the producer is configured without one
    pub counter: Option<u8>,
}

impl SyncMessage {
    /// Serialize onto the given COB-ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        match self.counter {
            Some(count) => CanMessage::new(id, &[count]),
            None => CanMessage::new(id, &[]),
        }
    }
}

impl From<&CanMessage> for SyncMessage {
    fn from(msg: &CanMessage) -> Self {
        let counter = msg.data().first().copied();
        SyncMessage { counter }
    }
}

/// A TIME message: the current time of day
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeMessage(pub TimeOfDay);

impl TimeMessage {
    /// Serialize onto the given COB-ID (6 byte payload)
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.0.to_bytes())
    }
}

impl TryFrom<&CanMessage> for TimeMessage {
    type Error = MessageError;

    fn try_from(msg: &CanMessage) -> Result<Self, Self::Error> {
        TimeOfDay::from_bytes(msg.data())
            .map(TimeMessage)
            .ok_or(MessageError::MessageTooShort)
    }
}

/// An emergency message
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EmcyMessage {
    /// The emergency error code
    pub code: u16,
    /// The value of the error register (object 0x1001)
    pub register: u8,
    /// Manufacturer specific error data
    pub data: [u8; 5],
}

impl EmcyMessage {
    /// Serialize onto the given COB-ID (8 byte payload)
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        let mut payload = [0u8; 8];
        payload[0..2].copy_from_slice(&self.code.to_le_bytes());
        payload[2] = self.register;
        payload[3..8].copy_from_slice(&self.data);
        CanMessage::new(id, &payload)
    }
}

impl TryFrom<&CanMessage> for EmcyMessage {
    type Error = MessageError;

    fn try_from(msg: &CanMessage) -> Result<Self, Self::Error> {
        let payload = msg.data();
        if payload.len() < 8 {
            return Err(MessageError::MessageTooShort);
        }
        Ok(EmcyMessage {
            code: u16::from_le_bytes(payload[0..2].try_into().unwrap()),
            register: payload[2],
            data: payload[3..8].try_into().unwrap(),
        })
    }
}

/// An error for problems converting CAN frames to message types
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum MessageError {
    /// Not enough bytes were present in the message
    MessageTooShort,
    /// The message was malformed in some way
    MalformedMsg {
        /// The COB ID of the malformed message
        cob_id: CanId,
    },
    /// The message ID was not the expected value
    #[snafu(display("Unexpected message ID found: {cob_id:?}, expected: {expected:?}"))]
    UnexpectedId {
        /// Received ID
        cob_id: CanId,
        /// Expected ID
        expected: CanId,
    },
    /// A field in the message contained an unallowed value for that field
    InvalidField,
    /// The NMT state integer in the message is not a valid NMT state
    InvalidNmtState {
        /// The invalid byte
        value: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_message_round_trip() {
        let msg = SyncMessage { counter: Some(3) }.to_can_message(SYNC_COB_ID);
        assert_eq!(1, msg.data().len());
        assert_eq!(SyncMessage { counter: Some(3) }, SyncMessage::from(&msg));

        let msg = SyncMessage { counter: None }.to_can_message(SYNC_COB_ID);
        assert_eq!(0, msg.data().len());
        assert_eq!(SyncMessage { counter: None }, SyncMessage::from(&msg));
    }

    #[test]
    fn time_message_layout() {
        let msg = TimeMessage(TimeOfDay::new(14731, 43_200_000)).to_can_message(TIME_COB_ID);
        assert_eq!(&[0x00, 0x6C, 0x93, 0x02, 0x8B, 0x39], msg.data());
        let back = TimeMessage::try_from(&msg).unwrap();
        assert_eq!(14731, back.0.days);
        assert_eq!(43_200_000, back.0.ms);
    }

    #[test]
    fn emcy_message_layout() {
        let emcy = EmcyMessage {
            code: 0x8110,
            register: 0x11,
            data: [1, 2, 3, 4, 5],
        };
        let msg = emcy.to_can_message(CanId::Std(0x81));
        assert_eq!(&[0x10, 0x81, 0x11, 1, 2, 3, 4, 5], msg.data());
        assert_eq!(emcy, EmcyMessage::try_from(&msg).unwrap());
    }

    #[test]
    fn nmt_command_round_trip() {
        let cmd = NmtCommand {
            cs: NmtCommandSpecifier::Start,
            node: 5,
        };
        let msg: CanMessage = cmd.into();
        assert_eq!(&[1, 5], msg.data());
        let back = NmtCommand::try_from(&msg).unwrap();
        assert_eq!(NmtCommandSpecifier::Start, back.cs);
        assert_eq!(5, back.node);
    }
}
