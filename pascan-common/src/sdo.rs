//! SDO protocol frames
//!
//! Defines the abort codes and the request/response messages of the SDO
//! protocol, with byte-exact conversions in both directions. Every SDO
//! frame is 8 bytes: byte 0 carries the command specifier in its top three
//! bits, bytes 1-2 the object index (little-endian), byte 3 the sub-index,
//! and bytes 4-7 payload or size, except for the segment frames which use
//! bytes 1-7 as payload.

use int_enum::IntEnum;

use crate::messages::{CanId, CanMessage};

/// Client command specifier (CCS) values in SDO request packets
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
enum ClientCommand {
    DownloadSegment = 0,
    InitiateDownload = 1,
    InitiateUpload = 2,
    UploadSegmentRequest = 3,
    Abort = 4,
    BlockUpload = 5,
    BlockDownload = 6,
}

impl TryFrom<u8> for ClientCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ClientCommand::*;
        match value {
            0 => Ok(DownloadSegment),
            1 => Ok(InitiateDownload),
            2 => Ok(InitiateUpload),
            3 => Ok(UploadSegmentRequest),
            4 => Ok(Abort),
            5 => Ok(BlockUpload),
            6 => Ok(BlockDownload),
            _ => Err(()),
        }
    }
}

/// Server command specifier (SCS) values in SDO response packets
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
enum ServerCommand {
    UploadSegment = 0,
    DownloadSegmentAck = 1,
    UploadInit = 2,
    DownloadInit = 3,
    Abort = 4,
    BlockDownload = 5,
    BlockUpload = 6,
}

impl TryFrom<u8> for ServerCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ServerCommand::*;
        match value {
            0 => Ok(UploadSegment),
            1 => Ok(DownloadSegmentAck),
            2 => Ok(UploadInit),
            3 => Ok(DownloadInit),
            4 => Ok(Abort),
            5 => Ok(BlockDownload),
            6 => Ok(BlockUpload),
            _ => Err(()),
        }
    }
}

/// SDO abort code
///
/// The 32-bit reason carried by an SDO abort frame.
#[derive(Clone, Copy, Debug, PartialEq, IntEnum)]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    Timeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Invalid block size (block mode only)
    InvalidBlockSize = 0x0504_0002,
    /// Invalid sequence number (block mode only)
    InvalidSequenceNumber = 0x0504_0003,
    /// CRC error (block mode only)
    CrcError = 0x0504_0004,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write-only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read-only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the object dictionary
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to the PDO
    CannotMapPdo = 0x0604_0041,
    /// The number and length of mapped objects would exceed the PDO length
    PdoLengthExceeded = 0x0604_0042,
    /// General parameter incompatibility
    ParameterIncompatible = 0x0604_0043,
    /// General internal incompatibility in the device
    InternalIncompatibility = 0x0604_0047,
    /// Access failed due to a hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    TypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    TypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    TypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030,
    /// Value of parameter written too high (download only)
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter written too low (download only)
    ValueTooLow = 0x0609_0032,
    /// Maximum value is less than minimum value
    RangeInvalid = 0x0609_0036,
    /// Resource not available
    ResourceNotAvailable = 0x060A_0023,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CannotStore = 0x0800_0020,
    /// Data cannot be transferred or stored because of local control
    CannotStoreLocalControl = 0x0800_0021,
    /// Data cannot be transferred or stored because of the device state
    CannotStoreDeviceState = 0x0800_0022,
    /// No object dictionary is present
    NoObjectDictionary = 0x0800_0023,
    /// No data available
    NoData = 0x0800_0024,
}

/// The CAN message carrying one segment of a block transfer
///
/// Block segments have no command specifier: byte 0 holds the complete flag
/// and a 7-bit sequence number starting at 1.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlockSegment {
    /// Indicates this is the last segment of the whole transfer
    pub c: bool,
    /// Sequence number, 1..=127 within each block
    pub seqnum: u8,
    /// The data bytes of this segment
    pub data: [u8; 7],
}

impl TryFrom<&[u8]> for BlockSegment {
    type Error = ();

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != 8 {
            return Err(());
        }
        let c = (value[0] & (1 << 7)) != 0;
        let seqnum = value[0] & 0x7F;
        let data: [u8; 7] = value[1..8].try_into().unwrap();
        Ok(Self { c, seqnum, data })
    }
}

impl BlockSegment {
    /// Convert to the CAN message payload bytes
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0; 8];
        bytes[0] = ((self.c as u8) << 7) | (self.seqnum & 0x7F);
        bytes[1..8].copy_from_slice(&self.data);
        bytes
    }

    /// Create a CanMessage from the segment for transmission
    pub fn to_can_message(&self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

/// Messages sent from SDO client to server
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SdoRequest {
    /// Begin a download, writing data to an object on the server
    InitiateDownload {
        /// Number of unused bytes in data (expedited only)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size-valid flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value when e=1, or total size when e=0 and s=1
        data: [u8; 4],
    },
    /// Send a segment of data to the server
    DownloadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// When set, this is the final segment
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Begin an upload of data from an object on the server
    InitiateUpload {
        /// The requested object index
        index: u16,
        /// The requested sub-index
        sub: u8,
    },
    /// Request the next segment in an upload
    UploadSegmentRequest {
        /// Toggle flag
        t: bool,
    },
    /// Initiate a block download
    InitiateBlockDownload {
        /// Client CRC support flag
        cc: bool,
        /// Size-valid flag
        s: bool,
        /// Index of object to download to
        index: u16,
        /// Sub-index to download to
        sub: u8,
        /// Number of bytes to be downloaded, when s=1
        size: u32,
    },
    /// End a block download
    EndBlockDownload {
        /// Number of bytes in the last segment which do not contain data
        n: u8,
        /// CRC of the transfer (when supported by both peers)
        crc: u16,
    },
    /// Initiate a block upload
    InitiateBlockUpload {
        /// Client CRC support flag
        cc: bool,
        /// Index of the object to upload
        index: u16,
        /// Sub-index of the object to upload
        sub: u8,
        /// Number of segments per block
        blksize: u8,
        /// Protocol switch threshold; when nonzero and the data size does
        /// not exceed it, the server may answer with a plain upload response
        pst: u8,
    },
    /// Request the server to start sending the first upload block
    StartBlockUpload,
    /// Confirm receipt of a block during a block upload
    BlockUploadAck {
        /// The sequence number of the last segment received in order
        ackseq: u8,
        /// The number of segments to use for the next block
        blksize: u8,
    },
    /// End a block upload
    EndBlockUpload,
    /// Sent by the client to abort an ongoing transfer
    Abort {
        /// The object index of the active transfer
        index: u16,
        /// The sub-index of the active transfer
        sub: u8,
        /// The abort reason
        code: u32,
    },
}

impl SdoRequest {
    /// Create an abort message
    pub fn abort(index: u16, sub: u8, code: AbortCode) -> Self {
        SdoRequest::Abort {
            index,
            sub,
            code: code.into(),
        }
    }

    /// Create an expedited download request carrying up to 4 bytes of data
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);
        SdoRequest::InitiateDownload {
            n: (4 - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: msg_data,
        }
    }

    /// Create a segmented initiate download request
    pub fn initiate_download(index: u16, sub: u8, size: Option<u32>) -> Self {
        SdoRequest::InitiateDownload {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data: size.unwrap_or(0).to_le_bytes(),
        }
    }

    /// Create a download segment
    pub fn download_segment(toggle: bool, last_segment: bool, segment_data: &[u8]) -> Self {
        let mut data = [0; 7];
        data[0..segment_data.len()].copy_from_slice(segment_data);
        SdoRequest::DownloadSegment {
            t: toggle,
            n: (7 - segment_data.len()) as u8,
            c: last_segment,
            data,
        }
    }

    /// Create an initiate upload request
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Create an upload segment request
    pub fn upload_segment_request(toggle: bool) -> Self {
        SdoRequest::UploadSegmentRequest { t: toggle }
    }

    /// Create an initiate block download request
    pub fn initiate_block_download(index: u16, sub: u8, crc_supported: bool, size: u32) -> Self {
        SdoRequest::InitiateBlockDownload {
            cc: crc_supported,
            s: true,
            index,
            sub,
            size,
        }
    }

    /// Create an end block download request
    pub fn end_block_download(n: u8, crc: u16) -> Self {
        SdoRequest::EndBlockDownload { n, crc }
    }

    /// Create an initiate block upload request
    pub fn initiate_block_upload(index: u16, sub: u8, blksize: u8, pst: u8) -> Self {
        SdoRequest::InitiateBlockUpload {
            cc: true,
            index,
            sub,
            blksize,
            pst,
        }
    }

    /// Convert the request to message payload bytes
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];

        match self {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = ((ClientCommand::InitiateDownload as u8) << 5)
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | s as u8;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                payload[0] = ((ClientCommand::DownloadSegment as u8) << 5)
                    | ((t as u8) << 4)
                    | ((n & 7) << 1)
                    | (c as u8);
                payload[1..8].copy_from_slice(&data);
            }
            SdoRequest::InitiateUpload { index, sub } => {
                payload[0] = (ClientCommand::InitiateUpload as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoRequest::UploadSegmentRequest { t } => {
                payload[0] = ((ClientCommand::UploadSegmentRequest as u8) << 5) | ((t as u8) << 4);
            }
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => {
                payload[0] = ((ClientCommand::BlockDownload as u8) << 5)
                    | ((cc as u8) << 2)
                    | ((s as u8) << 1);
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&size.to_le_bytes());
            }
            SdoRequest::EndBlockDownload { n, crc } => {
                payload[0] = ((ClientCommand::BlockDownload as u8) << 5)
                    | ((n & 7) << 2)
                    | BlockDownloadClientSub::End as u8;
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            SdoRequest::InitiateBlockUpload {
                cc,
                index,
                sub,
                blksize,
                pst,
            } => {
                payload[0] = ((ClientCommand::BlockUpload as u8) << 5)
                    | ((cc as u8) << 2)
                    | BlockUploadClientSub::Initiate as u8;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4] = blksize;
                payload[5] = pst;
            }
            SdoRequest::StartBlockUpload => {
                payload[0] =
                    ((ClientCommand::BlockUpload as u8) << 5) | BlockUploadClientSub::Start as u8;
            }
            SdoRequest::BlockUploadAck { ackseq, blksize } => {
                payload[0] =
                    ((ClientCommand::BlockUpload as u8) << 5) | BlockUploadClientSub::Ack as u8;
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoRequest::EndBlockUpload => {
                payload[0] =
                    ((ClientCommand::BlockUpload as u8) << 5) | BlockUploadClientSub::End as u8;
            }
            SdoRequest::Abort { index, sub, code } => {
                payload[0] = (ClientCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&code.to_le_bytes());
            }
        }
        payload
    }

    /// Convert the request to a CanMessage using the provided COB-ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
enum BlockDownloadClientSub {
    Initiate = 0,
    End = 1,
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
enum BlockDownloadServerSub {
    InitiateAck = 0,
    EndAck = 1,
    Ack = 2,
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
enum BlockUploadClientSub {
    Initiate = 0,
    End = 1,
    Ack = 2,
    Start = 3,
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
enum BlockUploadServerSub {
    InitiateAck = 0,
    End = 1,
}

impl TryFrom<&[u8]> for SdoRequest {
    type Error = AbortCode;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(AbortCode::TypeMismatchLengthLow);
        }
        let ccs: ClientCommand = (value[0] >> 5)
            .try_into()
            .map_err(|_| AbortCode::InvalidCommandSpecifier)?;

        let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
        let sub = value[3];
        match ccs {
            ClientCommand::DownloadSegment => {
                let t = (value[0] & (1 << 4)) != 0;
                let n = (value[0] >> 1) & 0x7;
                let c = (value[0] & 1) != 0;
                let data = value[1..8].try_into().unwrap();
                Ok(SdoRequest::DownloadSegment { t, n, c, data })
            }
            ClientCommand::InitiateDownload => {
                let n = (value[0] >> 2) & 0x3;
                let e = (value[0] & (1 << 1)) != 0;
                let s = (value[0] & 1) != 0;
                let data = value[4..8].try_into().unwrap();
                Ok(SdoRequest::InitiateDownload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ClientCommand::InitiateUpload => Ok(SdoRequest::InitiateUpload { index, sub }),
            ClientCommand::UploadSegmentRequest => {
                let t = (value[0] & (1 << 4)) != 0;
                Ok(SdoRequest::UploadSegmentRequest { t })
            }
            ClientCommand::Abort => {
                let code = u32::from_le_bytes(value[4..8].try_into().unwrap());
                Ok(SdoRequest::Abort { index, sub, code })
            }
            ClientCommand::BlockDownload => match value[0] & 0x1 {
                x if x == BlockDownloadClientSub::Initiate as u8 => {
                    let cc = (value[0] & (1 << 2)) != 0;
                    let s = (value[0] & (1 << 1)) != 0;
                    let size = u32::from_le_bytes(value[4..8].try_into().unwrap());
                    Ok(SdoRequest::InitiateBlockDownload {
                        cc,
                        s,
                        index,
                        sub,
                        size,
                    })
                }
                _ => {
                    let n = (value[0] >> 2) & 7;
                    let crc = u16::from_le_bytes(value[1..3].try_into().unwrap());
                    Ok(SdoRequest::EndBlockDownload { n, crc })
                }
            },
            ClientCommand::BlockUpload => match value[0] & 0x3 {
                x if x == BlockUploadClientSub::Initiate as u8 => {
                    let cc = (value[0] & (1 << 2)) != 0;
                    Ok(SdoRequest::InitiateBlockUpload {
                        cc,
                        index,
                        sub,
                        blksize: value[4],
                        pst: value[5],
                    })
                }
                x if x == BlockUploadClientSub::End as u8 => Ok(SdoRequest::EndBlockUpload),
                x if x == BlockUploadClientSub::Ack as u8 => Ok(SdoRequest::BlockUploadAck {
                    ackseq: value[1],
                    blksize: value[2],
                }),
                _ => Ok(SdoRequest::StartBlockUpload),
            },
        }
    }
}

/// Messages sent from SDO server to client
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SdoResponse {
    /// Response to an [`SdoRequest::InitiateUpload`]
    UploadInit {
        /// Number of unused bytes in data (expedited only)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size-valid flag
        s: bool,
        /// The index of the object being uploaded
        index: u16,
        /// The sub-index being uploaded
        sub: u8,
        /// Value when e=1, or size when s=1
        data: [u8; 4],
    },
    /// An upload segment
    UploadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// Indicates this is the final segment
        c: bool,
        /// Object data
        data: [u8; 7],
    },
    /// Response to a [`SdoRequest::InitiateDownload`]
    DownloadInitAck {
        /// The index of the object being written
        index: u16,
        /// The sub-index being written
        sub: u8,
    },
    /// Response to a [`SdoRequest::DownloadSegment`]
    DownloadSegmentAck {
        /// Toggle flag
        t: bool,
    },
    /// Confirm a block download initiation
    BlockDownloadInitAck {
        /// Server CRC support flag
        sc: bool,
        /// Index of the object being downloaded
        index: u16,
        /// Sub-index of the object being downloaded
        sub: u8,
        /// Number of segments per block
        blksize: u8,
    },
    /// Confirm a completed block during a block download
    BlockAck {
        /// Sequence number of the last segment received in order
        ackseq: u8,
        /// Number of segments to use for the next block
        blksize: u8,
    },
    /// Confirm completion of a block download
    BlockDownloadEndAck,
    /// Confirm a block upload initiation
    BlockUploadInitAck {
        /// Server CRC support flag
        sc: bool,
        /// Size-valid flag
        s: bool,
        /// Index of the object being uploaded
        index: u16,
        /// Sub-index of the object being uploaded
        sub: u8,
        /// Size of the data to be uploaded, when s=1
        size: u32,
    },
    /// Sent by the server to end a block upload
    BlockUploadEnd {
        /// Number of bytes in the last segment which do not contain data
        n: u8,
        /// CRC of the transfer (when supported by both peers)
        crc: u16,
    },
    /// Sent by the server to abort an ongoing transfer
    Abort {
        /// Object index of the active transfer
        index: u16,
        /// Sub-index of the active transfer
        sub: u8,
        /// Abort reason
        code: u32,
    },
}

impl SdoResponse {
    /// Create an expedited upload response carrying up to 4 bytes of data
    ///
    /// For zero-length values the size-valid flag is cleared to mark an
    /// empty response.
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> SdoResponse {
        assert!(data.len() <= 4, "expedited upload limited to 4 bytes");
        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);

        let (s, n) = if data.is_empty() {
            (false, 0)
        } else {
            (true, 4 - data.len() as u8)
        };
        SdoResponse::UploadInit {
            n,
            e: true,
            s,
            index,
            sub,
            data: msg_data,
        }
    }

    /// Create a segmented upload initiate response
    pub fn upload_init_ack(index: u16, sub: u8, size: Option<u32>) -> SdoResponse {
        SdoResponse::UploadInit {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data: size.unwrap_or(0).to_le_bytes(),
        }
    }

    /// Create an upload segment
    pub fn upload_segment(t: bool, c: bool, data: &[u8]) -> SdoResponse {
        let mut buf = [0; 7];
        buf[0..data.len()].copy_from_slice(data);
        SdoResponse::UploadSegment {
            t,
            n: (7 - data.len()) as u8,
            c,
            data: buf,
        }
    }

    /// Create a download acknowledge response
    pub fn download_ack(index: u16, sub: u8) -> SdoResponse {
        SdoResponse::DownloadInitAck { index, sub }
    }

    /// Create a download segment acknowledge response
    pub fn download_segment_ack(t: bool) -> SdoResponse {
        SdoResponse::DownloadSegmentAck { t }
    }

    /// Create a block download initiate acknowledge
    pub fn block_download_init_ack(sc: bool, index: u16, sub: u8, blksize: u8) -> SdoResponse {
        SdoResponse::BlockDownloadInitAck {
            sc,
            index,
            sub,
            blksize,
        }
    }

    /// Create a block acknowledge
    pub fn block_ack(ackseq: u8, blksize: u8) -> SdoResponse {
        SdoResponse::BlockAck { ackseq, blksize }
    }

    /// Create a block upload initiate acknowledge
    pub fn block_upload_init_ack(index: u16, sub: u8, size: u32) -> SdoResponse {
        SdoResponse::BlockUploadInitAck {
            sc: true,
            s: true,
            index,
            sub,
            size,
        }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, code: AbortCode) -> SdoResponse {
        SdoResponse::Abort {
            index,
            sub,
            code: code.into(),
        }
    }

    /// Convert the response to message payload bytes
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];

        match self {
            SdoResponse::UploadInit {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = ((ServerCommand::UploadInit as u8) << 5)
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | (s as u8);
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoResponse::UploadSegment { t, n, c, data } => {
                payload[0] = ((ServerCommand::UploadSegment as u8) << 5)
                    | ((t as u8) << 4)
                    | ((n & 7) << 1)
                    | c as u8;
                payload[1..8].copy_from_slice(&data);
            }
            SdoResponse::DownloadInitAck { index, sub } => {
                payload[0] = (ServerCommand::DownloadInit as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoResponse::DownloadSegmentAck { t } => {
                payload[0] = ((ServerCommand::DownloadSegmentAck as u8) << 5) | ((t as u8) << 4);
            }
            SdoResponse::BlockDownloadInitAck {
                sc,
                index,
                sub,
                blksize,
            } => {
                payload[0] = ((ServerCommand::BlockDownload as u8) << 5)
                    | ((sc as u8) << 2)
                    | BlockDownloadServerSub::InitiateAck as u8;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4] = blksize;
            }
            SdoResponse::BlockAck { ackseq, blksize } => {
                payload[0] = ((ServerCommand::BlockDownload as u8) << 5)
                    | BlockDownloadServerSub::Ack as u8;
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoResponse::BlockDownloadEndAck => {
                payload[0] = ((ServerCommand::BlockDownload as u8) << 5)
                    | BlockDownloadServerSub::EndAck as u8;
            }
            SdoResponse::BlockUploadInitAck {
                sc,
                s,
                index,
                sub,
                size,
            } => {
                payload[0] = ((ServerCommand::BlockUpload as u8) << 5)
                    | ((sc as u8) << 2)
                    | ((s as u8) << 1)
                    | BlockUploadServerSub::InitiateAck as u8;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&size.to_le_bytes());
            }
            SdoResponse::BlockUploadEnd { n, crc } => {
                payload[0] = ((ServerCommand::BlockUpload as u8) << 5)
                    | ((n & 7) << 2)
                    | BlockUploadServerSub::End as u8;
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            SdoResponse::Abort { index, sub, code } => {
                payload[0] = (ServerCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&code.to_le_bytes());
            }
        }
        payload
    }

    /// Convert the response to a CanMessage using the provided COB-ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

impl TryFrom<&[u8]> for SdoResponse {
    type Error = AbortCode;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(AbortCode::TypeMismatchLengthLow);
        }
        let scs: ServerCommand = (value[0] >> 5)
            .try_into()
            .map_err(|_| AbortCode::InvalidCommandSpecifier)?;

        let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
        let sub = value[3];
        match scs {
            ServerCommand::UploadSegment => {
                let t = (value[0] & (1 << 4)) != 0;
                let n = (value[0] >> 1) & 7;
                let c = (value[0] & 1) != 0;
                let data: [u8; 7] = value[1..8].try_into().unwrap();
                Ok(SdoResponse::UploadSegment { t, n, c, data })
            }
            ServerCommand::DownloadSegmentAck => {
                let t = (value[0] & (1 << 4)) != 0;
                Ok(SdoResponse::DownloadSegmentAck { t })
            }
            ServerCommand::UploadInit => {
                let n = (value[0] >> 2) & 0x3;
                let e = (value[0] & (1 << 1)) != 0;
                let s = (value[0] & 1) != 0;
                let data: [u8; 4] = value[4..8].try_into().unwrap();
                Ok(SdoResponse::UploadInit {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ServerCommand::DownloadInit => Ok(SdoResponse::DownloadInitAck { index, sub }),
            ServerCommand::BlockDownload => match value[0] & 0x3 {
                x if x == BlockDownloadServerSub::InitiateAck as u8 => {
                    let sc = (value[0] & (1 << 2)) != 0;
                    Ok(SdoResponse::BlockDownloadInitAck {
                        sc,
                        index,
                        sub,
                        blksize: value[4],
                    })
                }
                x if x == BlockDownloadServerSub::EndAck as u8 => {
                    Ok(SdoResponse::BlockDownloadEndAck)
                }
                x if x == BlockDownloadServerSub::Ack as u8 => Ok(SdoResponse::BlockAck {
                    ackseq: value[1],
                    blksize: value[2],
                }),
                _ => Err(AbortCode::InvalidCommandSpecifier),
            },
            ServerCommand::BlockUpload => match value[0] & 0x3 {
                x if x == BlockUploadServerSub::InitiateAck as u8 => {
                    let sc = (value[0] & (1 << 2)) != 0;
                    let s = (value[0] & (1 << 1)) != 0;
                    let size = u32::from_le_bytes(value[4..8].try_into().unwrap());
                    Ok(SdoResponse::BlockUploadInitAck {
                        sc,
                        s,
                        index,
                        sub,
                        size,
                    })
                }
                x if x == BlockUploadServerSub::End as u8 => {
                    let n = (value[0] >> 2) & 7;
                    let crc = u16::from_le_bytes(value[1..3].try_into().unwrap());
                    Ok(SdoResponse::BlockUploadEnd { n, crc })
                }
                _ => Err(AbortCode::InvalidCommandSpecifier),
            },
            ServerCommand::Abort => {
                let code = u32::from_le_bytes(value[4..8].try_into().unwrap());
                Ok(SdoResponse::Abort { index, sub, code })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expedited_download_layout() {
        let req = SdoRequest::expedited_download(0x2000, 0x01, &0x1234_5678u32.to_le_bytes());
        assert_eq!(
            [0x23, 0x00, 0x20, 0x01, 0x78, 0x56, 0x34, 0x12],
            req.to_bytes()
        );
        let ack = SdoResponse::download_ack(0x2000, 0x01);
        assert_eq!(
            [0x60, 0x00, 0x20, 0x01, 0x00, 0x00, 0x00, 0x00],
            ack.to_bytes()
        );
    }

    #[test]
    fn abort_layout() {
        let resp = SdoResponse::abort(0x1018, 0x01, AbortCode::ReadOnly);
        assert_eq!(
            [0x80, 0x18, 0x10, 0x01, 0x02, 0x00, 0x01, 0x06],
            resp.to_bytes()
        );
    }

    #[test]
    fn request_round_trips() {
        let samples = [
            SdoRequest::expedited_download(0x2000, 1, &[1, 2]),
            SdoRequest::initiate_download(0x2000, 1, Some(100)),
            SdoRequest::download_segment(true, false, &[1, 2, 3, 4, 5, 6, 7]),
            SdoRequest::download_segment(false, true, &[1, 2, 3]),
            SdoRequest::initiate_upload(0x1018, 4),
            SdoRequest::upload_segment_request(true),
            SdoRequest::initiate_block_download(0x2001, 0, true, 1024),
            SdoRequest::end_block_download(3, 0xBEEF),
            SdoRequest::initiate_block_upload(0x2001, 0, 127, 0),
            SdoRequest::StartBlockUpload,
            SdoRequest::BlockUploadAck {
                ackseq: 12,
                blksize: 127,
            },
            SdoRequest::EndBlockUpload,
            SdoRequest::abort(0x2000, 1, AbortCode::GeneralError),
        ];
        for req in samples {
            let bytes = req.to_bytes();
            assert_eq!(req, SdoRequest::try_from(bytes.as_slice()).unwrap());
        }
    }

    #[test]
    fn response_round_trips() {
        let samples = [
            SdoResponse::expedited_upload(0x2000, 1, &[1, 2, 3]),
            SdoResponse::expedited_upload(0x2000, 1, &[]),
            SdoResponse::upload_init_ack(0x2000, 1, Some(10)),
            SdoResponse::upload_segment(false, true, &[1, 2, 3]),
            SdoResponse::download_ack(0x2000, 1),
            SdoResponse::download_segment_ack(true),
            SdoResponse::block_download_init_ack(true, 0x2001, 0, 127),
            SdoResponse::block_ack(127, 127),
            SdoResponse::BlockDownloadEndAck,
            SdoResponse::block_upload_init_ack(0x2001, 0, 2048),
            SdoResponse::BlockUploadEnd { n: 4, crc: 0x1234 },
            SdoResponse::abort(0x2000, 1, AbortCode::Timeout),
        ];
        for resp in samples {
            let bytes = resp.to_bytes();
            assert_eq!(resp, SdoResponse::try_from(bytes.as_slice()).unwrap());
        }
    }

    #[test]
    fn block_segment_round_trip() {
        let seg = BlockSegment {
            c: true,
            seqnum: 42,
            data: [1, 2, 3, 4, 5, 6, 7],
        };
        let bytes = seg.to_bytes();
        assert_eq!(0x80 | 42, bytes[0]);
        assert_eq!(seg, BlockSegment::try_from(bytes.as_slice()).unwrap());
    }

    #[test]
    fn abort_codes_convert_to_u32() {
        assert_eq!(0x0503_0000u32, AbortCode::ToggleNotAlternated.into());
        assert_eq!(
            Ok(AbortCode::InvalidSequenceNumber),
            AbortCode::try_from(0x0504_0003)
        );
        assert!(AbortCode::try_from(0xDEAD_BEEF).is_err());
    }
}
