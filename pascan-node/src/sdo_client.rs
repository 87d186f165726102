//! SDO client
//!
//! The client side of the SDO protocol, as a passive state machine: the
//! host starts a transfer with [`SdoClient::download`] / [`SdoClient::upload`]
//! (or their block variants), routes response frames into
//! [`SdoClient::handle_frame`], and learns the outcome from the returned
//! [`SdoClientEvent`]. Like every other part of the engine, the client
//! sends frames only through the host-supplied callback and measures time
//! only through the values the host passes in.

use log::{debug, warn};

use pascan_common::constants::{SDO_MAX_BLKSIZE, SDO_TIMEOUT_US};
use pascan_common::messages::{CanId, CanMessage};
use pascan_common::sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse};

use crate::error::DeviceError;
use crate::od::SubAddr;

/// A wrapper around the AbortCode enum to allow for unknown values
///
/// The library knows the standard abort codes, but a peer may send any
/// 32-bit value and those must still be surfaced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawAbortCode {
    /// A recognized abort code
    Valid(AbortCode),
    /// An unrecognized abort code
    Unknown(u32),
}

impl core::fmt::Display for RawAbortCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RawAbortCode::Valid(code) => write!(f, "{code:?}"),
            RawAbortCode::Unknown(code) => write!(f, "{code:08X}"),
        }
    }
}

impl From<u32> for RawAbortCode {
    fn from(value: u32) -> Self {
        match AbortCode::try_from(value) {
            Ok(code) => Self::Valid(code),
            Err(_) => Self::Unknown(value),
        }
    }
}

impl From<AbortCode> for RawAbortCode {
    fn from(value: AbortCode) -> Self {
        RawAbortCode::Valid(value)
    }
}

/// Completion notification for a client transfer
#[derive(Debug, Clone, PartialEq)]
pub enum SdoClientEvent {
    /// A download finished; the server committed the value
    DownloadComplete {
        /// Object index of the transfer
        index: u16,
        /// Sub-index of the transfer
        sub: u8,
    },
    /// An upload finished with the given data
    UploadComplete {
        /// Object index of the transfer
        index: u16,
        /// Sub-index of the transfer
        sub: u8,
        /// The uploaded bytes
        data: Vec<u8>,
    },
    /// The transfer failed
    ///
    /// Either the server sent an abort, or the client detected a protocol
    /// violation (and sent the abort itself), or the transfer timed out.
    TransferFailed {
        /// Object index of the transfer
        index: u16,
        /// Sub-index of the transfer
        sub: u8,
        /// The abort reason
        code: RawAbortCode,
    },
}

enum State {
    Idle,
    DownloadInit {
        addr: SubAddr,
        data: Vec<u8>,
    },
    DownloadSegments {
        addr: SubAddr,
        data: Vec<u8>,
        /// Byte offset of the segment most recently sent
        pos: usize,
        toggle: bool,
    },
    UploadInit {
        addr: SubAddr,
    },
    UploadSegments {
        addr: SubAddr,
        toggle: bool,
        declared: Option<u32>,
        buf: Vec<u8>,
    },
    BlockDownloadInit {
        addr: SubAddr,
        data: Vec<u8>,
    },
    BlockDownloadAck {
        addr: SubAddr,
        data: Vec<u8>,
        /// Byte offset of the first segment of the outstanding block
        pos: usize,
        /// Segments sent in the outstanding block
        sent: u8,
        crc_enabled: bool,
    },
    BlockDownloadEnd {
        addr: SubAddr,
    },
    BlockUploadInit {
        addr: SubAddr,
    },
    BlockUploadReceive {
        addr: SubAddr,
        declared: Option<u32>,
        blksize: u8,
        buf: Vec<u8>,
        /// Buffer length at the start of the current block
        block_base: usize,
        /// Next expected in-sequence number within the block
        next_seq: u8,
        crc_enabled: bool,
    },
    BlockUploadEndWait {
        addr: SubAddr,
        buf: Vec<u8>,
        crc_enabled: bool,
    },
}

impl State {
    fn is_idle(&self) -> bool {
        matches!(self, State::Idle)
    }

    fn addr(&self) -> SubAddr {
        match self {
            State::Idle => SubAddr::new(0, 0),
            State::DownloadInit { addr, .. }
            | State::DownloadSegments { addr, .. }
            | State::UploadInit { addr }
            | State::UploadSegments { addr, .. }
            | State::BlockDownloadInit { addr, .. }
            | State::BlockDownloadAck { addr, .. }
            | State::BlockDownloadEnd { addr }
            | State::BlockUploadInit { addr }
            | State::BlockUploadReceive { addr, .. }
            | State::BlockUploadEndWait { addr, .. } => *addr,
        }
    }
}

/// A client for accessing a peer node's SDO server
///
/// A single SDO channel carries one transfer at a time; starting a second
/// transfer while one is active fails with [`DeviceError::Busy`].
pub struct SdoClient {
    req_cob_id: CanId,
    resp_cob_id: CanId,
    timeout_us: u64,
    state: State,
    deadline: Option<u64>,
}

impl SdoClient {
    /// Create a new client from request and response COB-IDs
    pub fn new(req_cob_id: CanId, resp_cob_id: CanId) -> Self {
        Self {
            req_cob_id,
            resp_cob_id,
            timeout_us: SDO_TIMEOUT_US,
            state: State::Idle,
            deadline: None,
        }
    }

    /// Create a client for a server node's default SDO channel
    pub fn new_std(server_node_id: u8) -> Self {
        Self::new(
            CanId::Std(0x600 + server_node_id as u16),
            CanId::Std(0x580 + server_node_id as u16),
        )
    }

    /// The COB-ID this client listens on for responses
    pub fn resp_cob_id(&self) -> CanId {
        self.resp_cob_id
    }

    /// Override the transfer timeout (default 100 ms)
    pub fn set_timeout_us(&mut self, timeout_us: u64) {
        self.timeout_us = timeout_us;
    }

    /// Returns true when no transfer is in progress
    pub fn is_idle(&self) -> bool {
        self.state.is_idle()
    }

    /// The deadline at which [`SdoClient::poll`] must run
    pub fn next_deadline(&self) -> Option<u64> {
        self.deadline
    }

    fn arm(&mut self, now: u64) {
        self.deadline = Some(now + self.timeout_us);
    }

    fn finish(&mut self) {
        self.state = State::Idle;
        self.deadline = None;
    }

    /// Start a download (write) of `data` to the server
    ///
    /// Values of at most 4 bytes use the expedited protocol; anything
    /// longer is segmented.
    pub fn download(
        &mut self,
        index: u16,
        sub: u8,
        data: &[u8],
        now: u64,
        send: &mut dyn FnMut(CanMessage),
    ) -> Result<(), DeviceError> {
        if !self.state.is_idle() {
            return Err(DeviceError::Busy);
        }
        let addr = SubAddr::new(index, sub);
        let req = if data.len() <= 4 {
            SdoRequest::expedited_download(index, sub, data)
        } else {
            SdoRequest::initiate_download(index, sub, Some(data.len() as u32))
        };
        send(req.to_can_message(self.req_cob_id));
        self.state = State::DownloadInit {
            addr,
            data: data.to_vec(),
        };
        self.arm(now);
        Ok(())
    }

    /// Start an upload (read) from the server
    pub fn upload(
        &mut self,
        index: u16,
        sub: u8,
        now: u64,
        send: &mut dyn FnMut(CanMessage),
    ) -> Result<(), DeviceError> {
        if !self.state.is_idle() {
            return Err(DeviceError::Busy);
        }
        send(SdoRequest::initiate_upload(index, sub).to_can_message(self.req_cob_id));
        self.state = State::UploadInit {
            addr: SubAddr::new(index, sub),
        };
        self.arm(now);
        Ok(())
    }

    /// Start a block download of `data` to the server
    pub fn block_download(
        &mut self,
        index: u16,
        sub: u8,
        data: &[u8],
        now: u64,
        send: &mut dyn FnMut(CanMessage),
    ) -> Result<(), DeviceError> {
        if !self.state.is_idle() {
            return Err(DeviceError::Busy);
        }
        send(
            SdoRequest::initiate_block_download(index, sub, true, data.len() as u32)
                .to_can_message(self.req_cob_id),
        );
        self.state = State::BlockDownloadInit {
            addr: SubAddr::new(index, sub),
            data: data.to_vec(),
        };
        self.arm(now);
        Ok(())
    }

    /// Start a block upload from the server
    pub fn block_upload(
        &mut self,
        index: u16,
        sub: u8,
        now: u64,
        send: &mut dyn FnMut(CanMessage),
    ) -> Result<(), DeviceError> {
        if !self.state.is_idle() {
            return Err(DeviceError::Busy);
        }
        send(
            SdoRequest::initiate_block_upload(index, sub, SDO_MAX_BLKSIZE, 0)
                .to_can_message(self.req_cob_id),
        );
        self.state = State::BlockUploadInit {
            addr: SubAddr::new(index, sub),
        };
        self.arm(now);
        Ok(())
    }

    /// Abort the active transfer
    pub fn abort(
        &mut self,
        code: AbortCode,
        send: &mut dyn FnMut(CanMessage),
    ) -> Option<SdoClientEvent> {
        if self.state.is_idle() {
            return None;
        }
        let addr = self.state.addr();
        send(SdoRequest::abort(addr.index, addr.sub, code).to_can_message(self.req_cob_id));
        self.finish();
        Some(SdoClientEvent::TransferFailed {
            index: addr.index,
            sub: addr.sub,
            code: code.into(),
        })
    }

    /// Check the transfer timeout
    pub fn poll(
        &mut self,
        now: u64,
        send: &mut dyn FnMut(CanMessage),
    ) -> Option<SdoClientEvent> {
        if let Some(deadline) = self.deadline {
            if now >= deadline {
                debug!("SDO client transfer timed out");
                return self.abort(AbortCode::Timeout, send);
            }
        }
        None
    }

    /// Fail the transfer locally: emit an abort frame and report the event
    fn fail(
        &mut self,
        code: AbortCode,
        send: &mut dyn FnMut(CanMessage),
    ) -> Option<SdoClientEvent> {
        self.abort(code, send)
    }

    fn peer_abort(&mut self, code: u32) -> Option<SdoClientEvent> {
        let addr = self.state.addr();
        self.finish();
        Some(SdoClientEvent::TransferFailed {
            index: addr.index,
            sub: addr.sub,
            code: code.into(),
        })
    }

    fn send_download_segment(
        &self,
        data: &[u8],
        pos: usize,
        toggle: bool,
        send: &mut dyn FnMut(CanMessage),
    ) -> usize {
        let len = (data.len() - pos).min(7);
        let c = pos + len == data.len();
        send(
            SdoRequest::download_segment(toggle, c, &data[pos..pos + len])
                .to_can_message(self.req_cob_id),
        );
        len
    }

    /// Emit one block of download segments; returns the number sent
    fn send_download_block(
        &self,
        data: &[u8],
        pos: usize,
        blksize: u8,
        send: &mut dyn FnMut(CanMessage),
    ) -> u8 {
        let remaining = data.len() - pos;
        let segments = remaining.div_ceil(7).min(blksize as usize);
        for i in 0..segments {
            let start = pos + i * 7;
            let len = (data.len() - start).min(7);
            let mut seg_data = [0u8; 7];
            seg_data[0..len].copy_from_slice(&data[start..start + len]);
            send(
                BlockSegment {
                    c: start + len == data.len(),
                    seqnum: (i + 1) as u8,
                    data: seg_data,
                }
                .to_can_message(self.req_cob_id),
            );
        }
        segments as u8
    }

    /// Handle a frame addressed to this client's response COB-ID
    pub fn handle_frame(
        &mut self,
        msg: &CanMessage,
        now: u64,
        send: &mut dyn FnMut(CanMessage),
    ) -> Option<SdoClientEvent> {
        if msg.is_rtr() || self.state.is_idle() {
            return None;
        }
        if msg.data().len() != 8 {
            warn!("Dropping malformed SDO response with dlc {}", msg.data().len());
            return None;
        }
        self.arm(now);

        // During block upload reception the frames are raw segments
        if let State::BlockUploadReceive { .. } = &self.state {
            if msg.data()[0] != 0x80 {
                return self.block_upload_segment(msg.data(), send);
            }
        }

        let resp = match SdoResponse::try_from(msg.data()) {
            Ok(resp) => resp,
            Err(code) => return self.fail(code, send),
        };
        if let SdoResponse::Abort { code, .. } = resp {
            return self.peer_abort(code);
        }

        let state = core::mem::replace(&mut self.state, State::Idle);
        match state {
            State::Idle => None,
            State::DownloadInit { addr, data } => self.download_init(resp, addr, data, send),
            State::DownloadSegments {
                addr,
                data,
                pos,
                toggle,
            } => self.download_segments(resp, addr, data, pos, toggle, send),
            State::UploadInit { addr } => self.upload_init(resp, addr, send),
            State::UploadSegments {
                addr,
                toggle,
                declared,
                buf,
            } => self.upload_segments(resp, addr, toggle, declared, buf, send),
            State::BlockDownloadInit { addr, data } => {
                self.block_download_init(resp, addr, data, send)
            }
            State::BlockDownloadAck {
                addr,
                data,
                pos,
                sent,
                crc_enabled,
            } => self.block_download_ack(resp, addr, data, pos, sent, crc_enabled, send),
            State::BlockDownloadEnd { addr } => self.block_download_end(resp, addr, send),
            State::BlockUploadInit { addr } => self.block_upload_init(resp, addr, send),
            state @ State::BlockUploadReceive { .. } => {
                // Only an abort reaches here, handled above; anything else
                // is a protocol violation
                self.state = state;
                self.fail(AbortCode::InvalidCommandSpecifier, send)
            }
            State::BlockUploadEndWait {
                addr,
                buf,
                crc_enabled,
            } => self.block_upload_end_wait(resp, addr, buf, crc_enabled, send),
        }
    }

    fn download_init(
        &mut self,
        resp: SdoResponse,
        addr: SubAddr,
        data: Vec<u8>,
        send: &mut dyn FnMut(CanMessage),
    ) -> Option<SdoClientEvent> {
        match resp {
            SdoResponse::DownloadInitAck { index, sub } => {
                if index != addr.index || sub != addr.sub {
                    self.state = State::DownloadInit { addr, data };
                    return self.fail(AbortCode::GeneralError, send);
                }
                if data.len() <= 4 {
                    self.finish();
                    return Some(SdoClientEvent::DownloadComplete {
                        index: addr.index,
                        sub: addr.sub,
                    });
                }
                let len = self.send_download_segment(&data, 0, false, send);
                self.state = State::DownloadSegments {
                    addr,
                    data,
                    pos: len,
                    toggle: false,
                };
                None
            }
            _ => {
                self.state = State::DownloadInit { addr, data };
                self.fail(AbortCode::InvalidCommandSpecifier, send)
            }
        }
    }

    fn download_segments(
        &mut self,
        resp: SdoResponse,
        addr: SubAddr,
        data: Vec<u8>,
        pos: usize,
        toggle: bool,
        send: &mut dyn FnMut(CanMessage),
    ) -> Option<SdoClientEvent> {
        match resp {
            SdoResponse::DownloadSegmentAck { t } => {
                if t != toggle {
                    self.state = State::DownloadSegments {
                        addr,
                        data,
                        pos,
                        toggle,
                    };
                    return self.fail(AbortCode::ToggleNotAlternated, send);
                }
                if pos == data.len() {
                    self.finish();
                    return Some(SdoClientEvent::DownloadComplete {
                        index: addr.index,
                        sub: addr.sub,
                    });
                }
                let toggle = !toggle;
                let len = self.send_download_segment(&data, pos, toggle, send);
                self.state = State::DownloadSegments {
                    addr,
                    data,
                    pos: pos + len,
                    toggle,
                };
                None
            }
            _ => {
                self.state = State::DownloadSegments {
                    addr,
                    data,
                    pos,
                    toggle,
                };
                self.fail(AbortCode::InvalidCommandSpecifier, send)
            }
        }
    }

    fn upload_init(
        &mut self,
        resp: SdoResponse,
        addr: SubAddr,
        send: &mut dyn FnMut(CanMessage),
    ) -> Option<SdoClientEvent> {
        match resp {
            SdoResponse::UploadInit {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                if index != addr.index || sub != addr.sub {
                    self.state = State::UploadInit { addr };
                    return self.fail(AbortCode::GeneralError, send);
                }
                if e {
                    let len = if s { 4 - n as usize } else { 0 };
                    self.finish();
                    return Some(SdoClientEvent::UploadComplete {
                        index: addr.index,
                        sub: addr.sub,
                        data: data[0..len].to_vec(),
                    });
                }
                let declared = s.then(|| u32::from_le_bytes(data));
                send(SdoRequest::upload_segment_request(false).to_can_message(self.req_cob_id));
                self.state = State::UploadSegments {
                    addr,
                    toggle: false,
                    declared,
                    buf: Vec::new(),
                };
                None
            }
            _ => {
                self.state = State::UploadInit { addr };
                self.fail(AbortCode::InvalidCommandSpecifier, send)
            }
        }
    }

    fn upload_segments(
        &mut self,
        resp: SdoResponse,
        addr: SubAddr,
        toggle: bool,
        declared: Option<u32>,
        mut buf: Vec<u8>,
        send: &mut dyn FnMut(CanMessage),
    ) -> Option<SdoClientEvent> {
        match resp {
            SdoResponse::UploadSegment { t, n, c, data } => {
                if t != toggle {
                    self.state = State::UploadSegments {
                        addr,
                        toggle,
                        declared,
                        buf,
                    };
                    return self.fail(AbortCode::ToggleNotAlternated, send);
                }
                buf.extend_from_slice(&data[0..7 - n as usize]);
                if c {
                    if let Some(size) = declared {
                        if buf.len() as u32 != size {
                            warn!(
                                "Upload of 0x{:04X}sub{} delivered {} bytes, server declared {}",
                                addr.index,
                                addr.sub,
                                buf.len(),
                                size
                            );
                        }
                    }
                    self.finish();
                    return Some(SdoClientEvent::UploadComplete {
                        index: addr.index,
                        sub: addr.sub,
                        data: buf,
                    });
                }
                let toggle = !toggle;
                send(SdoRequest::upload_segment_request(toggle).to_can_message(self.req_cob_id));
                self.state = State::UploadSegments {
                    addr,
                    toggle,
                    declared,
                    buf,
                };
                None
            }
            _ => {
                self.state = State::UploadSegments {
                    addr,
                    toggle,
                    declared,
                    buf,
                };
                self.fail(AbortCode::InvalidCommandSpecifier, send)
            }
        }
    }

    fn block_download_init(
        &mut self,
        resp: SdoResponse,
        addr: SubAddr,
        data: Vec<u8>,
        send: &mut dyn FnMut(CanMessage),
    ) -> Option<SdoClientEvent> {
        match resp {
            SdoResponse::BlockDownloadInitAck {
                sc,
                index,
                sub,
                blksize,
            } => {
                if index != addr.index || sub != addr.sub {
                    self.state = State::BlockDownloadInit { addr, data };
                    return self.fail(AbortCode::GeneralError, send);
                }
                if blksize == 0 || blksize > SDO_MAX_BLKSIZE {
                    self.state = State::BlockDownloadInit { addr, data };
                    return self.fail(AbortCode::InvalidBlockSize, send);
                }
                let sent = self.send_download_block(&data, 0, blksize, send);
                self.state = State::BlockDownloadAck {
                    addr,
                    data,
                    pos: 0,
                    sent,
                    crc_enabled: sc,
                };
                None
            }
            _ => {
                self.state = State::BlockDownloadInit { addr, data };
                self.fail(AbortCode::InvalidCommandSpecifier, send)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn block_download_ack(
        &mut self,
        resp: SdoResponse,
        addr: SubAddr,
        data: Vec<u8>,
        pos: usize,
        sent: u8,
        crc_enabled: bool,
        send: &mut dyn FnMut(CanMessage),
    ) -> Option<SdoClientEvent> {
        match resp {
            SdoResponse::BlockAck { ackseq, blksize } => {
                if ackseq > sent || blksize == 0 || blksize > SDO_MAX_BLKSIZE {
                    self.state = State::BlockDownloadAck {
                        addr,
                        data,
                        pos,
                        sent,
                        crc_enabled,
                    };
                    return self.fail(AbortCode::InvalidSequenceNumber, send);
                }
                if ackseq < sent {
                    debug!(
                        "Server acknowledged {} of {} segments, resending the rest",
                        ackseq, sent
                    );
                }
                let pos = (pos + ackseq as usize * 7).min(data.len());
                if pos == data.len() {
                    let n = ((7 - data.len() % 7) % 7) as u8;
                    let crc = if crc_enabled {
                        crc16::State::<crc16::XMODEM>::calculate(&data)
                    } else {
                        0
                    };
                    send(SdoRequest::end_block_download(n, crc).to_can_message(self.req_cob_id));
                    self.state = State::BlockDownloadEnd { addr };
                } else {
                    let sent = self.send_download_block(&data, pos, blksize, send);
                    self.state = State::BlockDownloadAck {
                        addr,
                        data,
                        pos,
                        sent,
                        crc_enabled,
                    };
                }
                None
            }
            _ => {
                self.state = State::BlockDownloadAck {
                    addr,
                    data,
                    pos,
                    sent,
                    crc_enabled,
                };
                self.fail(AbortCode::InvalidCommandSpecifier, send)
            }
        }
    }

    fn block_download_end(
        &mut self,
        resp: SdoResponse,
        addr: SubAddr,
        send: &mut dyn FnMut(CanMessage),
    ) -> Option<SdoClientEvent> {
        match resp {
            SdoResponse::BlockDownloadEndAck => {
                self.finish();
                Some(SdoClientEvent::DownloadComplete {
                    index: addr.index,
                    sub: addr.sub,
                })
            }
            _ => {
                self.state = State::BlockDownloadEnd { addr };
                self.fail(AbortCode::InvalidCommandSpecifier, send)
            }
        }
    }

    fn block_upload_init(
        &mut self,
        resp: SdoResponse,
        addr: SubAddr,
        send: &mut dyn FnMut(CanMessage),
    ) -> Option<SdoClientEvent> {
        match resp {
            SdoResponse::BlockUploadInitAck {
                sc,
                s,
                index,
                sub,
                size,
            } => {
                if index != addr.index || sub != addr.sub {
                    self.state = State::BlockUploadInit { addr };
                    return self.fail(AbortCode::GeneralError, send);
                }
                send(SdoRequest::StartBlockUpload.to_can_message(self.req_cob_id));
                self.state = State::BlockUploadReceive {
                    addr,
                    declared: s.then_some(size),
                    blksize: SDO_MAX_BLKSIZE,
                    buf: Vec::new(),
                    block_base: 0,
                    next_seq: 1,
                    crc_enabled: sc,
                };
                None
            }
            // The server may switch to the plain upload protocol when the
            // value is short
            SdoResponse::UploadInit { .. } => {
                self.state = State::UploadInit { addr };
                self.upload_init(resp, addr, send)
            }
            _ => {
                self.state = State::BlockUploadInit { addr };
                self.fail(AbortCode::InvalidCommandSpecifier, send)
            }
        }
    }

    /// Handle a raw segment frame during block upload reception
    fn block_upload_segment(
        &mut self,
        frame: &[u8],
        send: &mut dyn FnMut(CanMessage),
    ) -> Option<SdoClientEvent> {
        let state = core::mem::replace(&mut self.state, State::Idle);
        let State::BlockUploadReceive {
            addr,
            declared,
            blksize,
            mut buf,
            block_base,
            next_seq,
            crc_enabled,
        } = state
        else {
            // Unreachable: the caller checked the state
            return None;
        };
        // Unwrap: frame length was checked in handle_frame
        let segment = BlockSegment::try_from(frame).unwrap();

        let mut next_seq = next_seq;
        if segment.seqnum == next_seq {
            buf.extend_from_slice(&segment.data);
            next_seq += 1;
        }
        // A block ends at the last announced sequence number or at the
        // final segment; out-of-sequence segments in between are dropped
        // and recovered through the acknowledge
        if segment.seqnum == blksize || segment.c {
            let ackseq = next_seq - 1;
            send(
                SdoRequest::BlockUploadAck {
                    ackseq,
                    blksize: SDO_MAX_BLKSIZE,
                }
                .to_can_message(self.req_cob_id),
            );
            let complete = segment.c && segment.seqnum == ackseq;
            if complete {
                self.state = State::BlockUploadEndWait {
                    addr,
                    buf,
                    crc_enabled,
                };
            } else {
                // Receive the retransmitted remainder as a fresh block
                let base = block_base + ackseq as usize * 7;
                buf.truncate(base);
                self.state = State::BlockUploadReceive {
                    addr,
                    declared,
                    blksize: SDO_MAX_BLKSIZE,
                    buf,
                    block_base: base,
                    next_seq: 1,
                    crc_enabled,
                };
            }
        } else {
            self.state = State::BlockUploadReceive {
                addr,
                declared,
                blksize,
                buf,
                block_base,
                next_seq,
                crc_enabled,
            };
        }
        None
    }

    fn block_upload_end_wait(
        &mut self,
        resp: SdoResponse,
        addr: SubAddr,
        mut buf: Vec<u8>,
        crc_enabled: bool,
        send: &mut dyn FnMut(CanMessage),
    ) -> Option<SdoClientEvent> {
        match resp {
            SdoResponse::BlockUploadEnd { n, crc } => {
                buf.truncate(buf.len() - n as usize);
                if crc_enabled {
                    let computed = crc16::State::<crc16::XMODEM>::calculate(&buf);
                    if computed != crc {
                        self.state = State::BlockUploadEndWait {
                            addr,
                            buf,
                            crc_enabled,
                        };
                        return self.fail(AbortCode::CrcError, send);
                    }
                }
                send(SdoRequest::EndBlockUpload.to_can_message(self.req_cob_id));
                self.finish();
                Some(SdoClientEvent::UploadComplete {
                    index: addr.index,
                    sub: addr.sub,
                    data: buf,
                })
            }
            _ => {
                self.state = State::BlockUploadEndWait {
                    addr,
                    buf,
                    crc_enabled,
                };
                self.fail(AbortCode::InvalidCommandSpecifier, send)
            }
        }
    }
}
