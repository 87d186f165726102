//! Standard object indices, COB-ID bases and protocol defaults

/// Object indices for standard objects
pub mod object_ids {
    /// Error register
    pub const ERROR_REGISTER: u16 = 0x1001;
    /// Pre-defined error field (EMCY history)
    pub const ERROR_HISTORY: u16 = 0x1003;
    /// COB-ID of the SYNC object
    pub const SYNC_COB_ID: u16 = 0x1005;
    /// Communication cycle period, in microseconds
    pub const SYNC_PERIOD: u16 = 0x1006;
    /// Synchronous window length, in microseconds
    pub const SYNC_WINDOW: u16 = 0x1007;
    /// The device name object index
    pub const DEVICE_NAME: u16 = 0x1008;
    /// The hardware version object index
    pub const HARDWARE_VERSION: u16 = 0x1009;
    /// The software version object index
    pub const SOFTWARE_VERSION: u16 = 0x100A;
    /// COB-ID of the TIME object
    pub const TIME_COB_ID: u16 = 0x1012;
    /// High resolution time stamp
    pub const HIGH_RES_TIMESTAMP: u16 = 0x1013;
    /// COB-ID of the EMCY object
    pub const EMCY_COB_ID: u16 = 0x1014;
    /// EMCY inhibit time, in multiples of 100 us
    pub const EMCY_INHIBIT_TIME: u16 = 0x1015;
    /// The heartbeat producer time object index
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
    /// The identity object index
    pub const IDENTITY: u16 = 0x1018;
    /// SYNC counter overflow value
    pub const SYNC_COUNTER_OVERFLOW: u16 = 0x1019;
    /// Emergency consumer COB-IDs
    pub const EMCY_CONSUMER: u16 = 0x1028;
    /// First RPDO communication parameter object
    pub const RPDO_COMM_BASE: u16 = 0x1400;
    /// First RPDO mapping parameter object
    pub const RPDO_MAPPING_BASE: u16 = 0x1600;
    /// First TPDO communication parameter object
    pub const TPDO_COMM_BASE: u16 = 0x1800;
    /// First TPDO mapping parameter object
    pub const TPDO_MAPPING_BASE: u16 = 0x1A00;
}

/// Default SDO response timeout, in microseconds
pub const SDO_TIMEOUT_US: u64 = 100_000;

/// Number of mapping entries per PDO mapping parameter object
pub const PDO_MAX_MAPPING_ENTRIES: usize = 8;

/// Largest number of segments per SDO block
pub const SDO_MAX_BLKSIZE: u8 = 127;

/// COB-ID bit flag marking a disabled COB (bit 31)
pub const COB_ID_INVALID_BIT: u32 = 1 << 31;
/// COB-ID bit flag carrying the RTR-disallowed / producer role (bit 30)
pub const COB_ID_ROLE_BIT: u32 = 1 << 30;
/// COB-ID bit flag selecting a 29-bit frame format (bit 29)
pub const COB_ID_EXTENDED_BIT: u32 = 1 << 29;
