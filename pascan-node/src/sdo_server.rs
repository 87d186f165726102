//! SDO server
//!
//! Implements the server side of the SDO protocol over the object
//! dictionary: expedited and segmented transfers in both directions, and
//! block transfers in both directions.
//!
//! The server is passive. The node routes frames addressed to the server's
//! request COB-ID into [`SdoServer::handle_frame`] and calls
//! [`SdoServer::poll`] when the timeout deadline reported by
//! [`SdoServer::next_deadline`] expires. Every response frame is pushed
//! through the send callback. A single server talks to a single client at
//! a time; an initiate request arriving mid-transfer is refused with a
//! `GeneralError` abort.

use log::{debug, warn};

use pascan_common::constants::{SDO_MAX_BLKSIZE, SDO_TIMEOUT_US};
use pascan_common::messages::{CanId, CanMessage};
use pascan_common::sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse};

use crate::od::{Device, SubAddr, SubObject};

/// Validate a client-declared download size against the target sub-object
fn validate_download_size(declared: usize, sub: &SubObject) -> Result<(), AbortCode> {
    match sub.data_type().fixed_size() {
        Some(size) => {
            if declared < size {
                Err(AbortCode::TypeMismatchLengthLow)
            } else if declared > size {
                Err(AbortCode::TypeMismatchLengthHigh)
            } else {
                Ok(())
            }
        }
        // Array types accept any length
        None => Ok(()),
    }
}

struct Step {
    reply: Option<SdoResponse>,
    updated: Option<SubAddr>,
    next: State,
}

impl Step {
    fn idle() -> Self {
        Self {
            reply: None,
            updated: None,
            next: State::Idle,
        }
    }

    fn stay(next: State) -> Self {
        Self {
            reply: None,
            updated: None,
            next,
        }
    }

    fn abort(index: u16, sub: u8, code: AbortCode) -> Self {
        Self {
            reply: Some(SdoResponse::abort(index, sub, code)),
            updated: None,
            next: State::Idle,
        }
    }

    fn reply(reply: SdoResponse, next: State) -> Self {
        Self {
            reply: Some(reply),
            updated: None,
            next,
        }
    }

    fn reply_with_update(reply: SdoResponse, addr: SubAddr, next: State) -> Self {
        Self {
            reply: Some(reply),
            updated: Some(addr),
            next,
        }
    }
}

enum State {
    Idle,
    DownloadSegments {
        addr: SubAddr,
        toggle: bool,
        declared: Option<u32>,
        buf: Vec<u8>,
    },
    UploadSegments {
        addr: SubAddr,
        toggle: bool,
        data: Vec<u8>,
        pos: usize,
    },
    BlockDownload {
        addr: SubAddr,
        crc_enabled: bool,
        declared: Option<u32>,
        next_seq: u8,
        buf: Vec<u8>,
    },
    BlockDownloadEnd {
        addr: SubAddr,
        crc_enabled: bool,
        buf: Vec<u8>,
    },
    /// Initiate acknowledged, waiting for the start request
    BlockUploadStart {
        addr: SubAddr,
        data: Vec<u8>,
        blksize: u8,
        crc_enabled: bool,
    },
    /// A burst of segments is out, waiting for the client's block ack
    BlockUploadAck {
        addr: SubAddr,
        data: Vec<u8>,
        /// Byte offset of the first segment of the outstanding block
        pos: usize,
        /// Number of segments sent in the outstanding block
        sent: u8,
        blksize: u8,
        crc_enabled: bool,
    },
    BlockUploadEnd {
        addr: SubAddr,
    },
}

impl State {
    fn is_idle(&self) -> bool {
        matches!(self, State::Idle)
    }

    /// The address to put into an abort frame for the active transfer
    fn abort_addr(&self) -> SubAddr {
        match self {
            State::Idle => SubAddr::new(0, 0),
            State::DownloadSegments { addr, .. }
            | State::UploadSegments { addr, .. }
            | State::BlockDownload { addr, .. }
            | State::BlockDownloadEnd { addr, .. }
            | State::BlockUploadStart { addr, .. }
            | State::BlockUploadAck { addr, .. }
            | State::BlockUploadEnd { addr } => *addr,
        }
    }
}

/// Implements an SDO server
///
/// A node implementing multiple SDO server channels instantiates multiple
/// `SdoServer` values, one per request/response COB-ID pair.
pub struct SdoServer {
    rx_cob_id: CanId,
    tx_cob_id: CanId,
    timeout_us: u64,
    state: State,
    deadline: Option<u64>,
}

impl SdoServer {
    /// Create a new SDO server on the given COB-ID pair
    pub fn new(rx_cob_id: CanId, tx_cob_id: CanId) -> Self {
        Self {
            rx_cob_id,
            tx_cob_id,
            timeout_us: SDO_TIMEOUT_US,
            state: State::Idle,
            deadline: None,
        }
    }

    /// Create the default server for a node ID (0x600 / 0x580 + ID)
    pub fn new_std(node_id: u8) -> Self {
        Self::new(
            CanId::Std(0x600 + node_id as u16),
            CanId::Std(0x580 + node_id as u16),
        )
    }

    /// The COB-ID this server listens on
    pub fn rx_cob_id(&self) -> CanId {
        self.rx_cob_id
    }

    /// The COB-ID this server responds on
    pub fn tx_cob_id(&self) -> CanId {
        self.tx_cob_id
    }

    /// Override the transfer timeout (default 100 ms)
    pub fn set_timeout_us(&mut self, timeout_us: u64) {
        self.timeout_us = timeout_us;
    }

    /// Returns true when no transfer is in progress
    pub fn is_idle(&self) -> bool {
        self.state.is_idle()
    }

    /// The deadline at which [`SdoServer::poll`] must run, if a transfer is
    /// in progress
    pub fn next_deadline(&self) -> Option<u64> {
        self.deadline
    }

    /// Check the transfer timeout
    ///
    /// When the deadline has passed, the transfer is dropped and an abort
    /// with [`AbortCode::Timeout`] is emitted to the peer.
    pub fn poll(&mut self, now: u64, send: &mut dyn FnMut(CanMessage)) {
        if let Some(deadline) = self.deadline {
            if now >= deadline {
                let addr = self.state.abort_addr();
                debug!("SDO server transfer 0x{:04X}sub{} timed out", addr.index, addr.sub);
                self.state = State::Idle;
                self.deadline = None;
                send(SdoResponse::abort(addr.index, addr.sub, AbortCode::Timeout)
                    .to_can_message(self.tx_cob_id));
            }
        }
    }

    /// Drop the active transfer, emitting an abort frame to the peer
    pub fn abort(&mut self, code: AbortCode, send: &mut dyn FnMut(CanMessage)) {
        if !self.state.is_idle() {
            let addr = self.state.abort_addr();
            self.state = State::Idle;
            self.deadline = None;
            send(SdoResponse::abort(addr.index, addr.sub, code).to_can_message(self.tx_cob_id));
        }
    }

    /// Handle a frame addressed to this server's request COB-ID
    ///
    /// Responses are pushed through `send`. Returns the address of the
    /// sub-object updated by a completed download, if any.
    pub fn handle_frame(
        &mut self,
        msg: &CanMessage,
        now: u64,
        device: &mut Device,
        send: &mut dyn FnMut(CanMessage),
    ) -> Option<SubAddr> {
        if msg.is_rtr() {
            return None;
        }
        if msg.data().len() != 8 {
            warn!("Dropping malformed SDO request with dlc {}", msg.data().len());
            return None;
        }

        let state = core::mem::replace(&mut self.state, State::Idle);
        let step = match state {
            State::Idle => self.idle(msg.data(), device),
            State::DownloadSegments {
                addr,
                toggle,
                declared,
                buf,
            } => self.download_segments(msg.data(), device, addr, toggle, declared, buf),
            State::UploadSegments {
                addr,
                toggle,
                data,
                pos,
            } => self.upload_segments(msg.data(), addr, toggle, data, pos),
            State::BlockDownload {
                addr,
                crc_enabled,
                declared,
                next_seq,
                buf,
            } => self.block_download(msg.data(), addr, crc_enabled, declared, next_seq, buf),
            State::BlockDownloadEnd {
                addr,
                crc_enabled,
                buf,
            } => self.block_download_end(msg.data(), device, addr, crc_enabled, buf),
            State::BlockUploadStart {
                addr,
                data,
                blksize,
                crc_enabled,
            } => self.block_upload_start(msg.data(), send, addr, data, blksize, crc_enabled),
            State::BlockUploadAck {
                addr,
                data,
                pos,
                sent,
                blksize,
                crc_enabled,
            } => self.block_upload_ack(msg.data(), send, addr, data, pos, sent, blksize, crc_enabled),
            State::BlockUploadEnd { addr } => self.block_upload_end(msg.data(), addr),
        };

        self.state = step.next;
        self.deadline = if self.state.is_idle() {
            None
        } else {
            Some(now + self.timeout_us)
        };
        if let Some(reply) = step.reply {
            send(reply.to_can_message(self.tx_cob_id));
        }
        step.updated
    }

    fn idle(&mut self, data: &[u8], device: &mut Device) -> Step {
        let req = match SdoRequest::try_from(data) {
            Ok(req) => req,
            Err(code) => return Step::abort(0, 0, code),
        };

        match req {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                let addr = SubAddr::new(index, sub);
                if e {
                    // Expedited download: the whole value is in this frame
                    let len = if s {
                        4 - n as usize
                    } else {
                        // No size indicated; fall back to the target width
                        match device.find_sub(addr) {
                            Ok(entry) => entry.data_type().fixed_size().unwrap_or(4).min(4),
                            Err(code) => return Step::abort(index, sub, code),
                        }
                    };
                    match device.download(addr, &data[0..len]) {
                        Ok(()) => Step::reply_with_update(
                            SdoResponse::download_ack(index, sub),
                            addr,
                            State::Idle,
                        ),
                        Err(code) => Step::abort(index, sub, code),
                    }
                } else {
                    // Starting a segmented download
                    let entry = match device.find_sub(addr) {
                        Ok(entry) => entry,
                        Err(code) => return Step::abort(index, sub, code),
                    };
                    if !entry.access_type().is_writable() {
                        return Step::abort(index, sub, AbortCode::ReadOnly);
                    }
                    let declared = s.then(|| u32::from_le_bytes(data));
                    if let Some(size) = declared {
                        if let Err(code) = validate_download_size(size as usize, entry) {
                            return Step::abort(index, sub, code);
                        }
                    }
                    Step::reply(
                        SdoResponse::download_ack(index, sub),
                        State::DownloadSegments {
                            addr,
                            toggle: false,
                            declared,
                            buf: Vec::new(),
                        },
                    )
                }
            }
            SdoRequest::InitiateUpload { index, sub } => {
                let addr = SubAddr::new(index, sub);
                let data = match device.upload(addr) {
                    Ok(data) => data,
                    Err(code) => return Step::abort(index, sub, code),
                };
                if data.len() <= 4 {
                    Step::reply(SdoResponse::expedited_upload(index, sub, &data), State::Idle)
                } else {
                    Step::reply(
                        SdoResponse::upload_init_ack(index, sub, Some(data.len() as u32)),
                        State::UploadSegments {
                            addr,
                            toggle: false,
                            data,
                            pos: 0,
                        },
                    )
                }
            }
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => {
                let addr = SubAddr::new(index, sub);
                let entry = match device.find_sub(addr) {
                    Ok(entry) => entry,
                    Err(code) => return Step::abort(index, sub, code),
                };
                if !entry.access_type().is_writable() {
                    return Step::abort(index, sub, AbortCode::ReadOnly);
                }
                let declared = s.then_some(size);
                if let Some(size) = declared {
                    if let Err(code) = validate_download_size(size as usize, entry) {
                        return Step::abort(index, sub, code);
                    }
                }
                Step::reply(
                    SdoResponse::block_download_init_ack(true, index, sub, SDO_MAX_BLKSIZE),
                    State::BlockDownload {
                        addr,
                        crc_enabled: cc,
                        declared,
                        next_seq: 1,
                        buf: Vec::new(),
                    },
                )
            }
            SdoRequest::InitiateBlockUpload {
                cc,
                index,
                sub,
                blksize,
                pst,
            } => {
                let addr = SubAddr::new(index, sub);
                let data = match device.upload(addr) {
                    Ok(data) => data,
                    Err(code) => return Step::abort(index, sub, code),
                };
                // Protocol switch: short values may be served with the
                // plain upload protocol when the client allows it
                if pst != 0 && data.len() <= pst as usize {
                    return if data.len() <= 4 {
                        Step::reply(SdoResponse::expedited_upload(index, sub, &data), State::Idle)
                    } else {
                        Step::reply(
                            SdoResponse::upload_init_ack(index, sub, Some(data.len() as u32)),
                            State::UploadSegments {
                                addr,
                                toggle: false,
                                data,
                                pos: 0,
                            },
                        )
                    };
                }
                if blksize == 0 || blksize > SDO_MAX_BLKSIZE {
                    return Step::abort(index, sub, AbortCode::InvalidBlockSize);
                }
                Step::reply(
                    SdoResponse::block_upload_init_ack(index, sub, data.len() as u32),
                    State::BlockUploadStart {
                        addr,
                        data,
                        blksize,
                        crc_enabled: cc,
                    },
                )
            }
            SdoRequest::Abort { .. } => Step::idle(),
            _ => Step::abort(0, 0, AbortCode::InvalidCommandSpecifier),
        }
    }

    fn download_segments(
        &mut self,
        data: &[u8],
        device: &mut Device,
        addr: SubAddr,
        toggle: bool,
        declared: Option<u32>,
        mut buf: Vec<u8>,
    ) -> Step {
        let req = match SdoRequest::try_from(data) {
            Ok(req) => req,
            Err(code) => return Step::abort(addr.index, addr.sub, code),
        };
        match req {
            SdoRequest::DownloadSegment { t, n, c, data } => {
                if t != toggle {
                    return Step::abort(addr.index, addr.sub, AbortCode::ToggleNotAlternated);
                }
                buf.extend_from_slice(&data[0..7 - n as usize]);
                if !c {
                    return Step::reply(
                        SdoResponse::download_segment_ack(toggle),
                        State::DownloadSegments {
                            addr,
                            toggle: !toggle,
                            declared,
                            buf,
                        },
                    );
                }
                // Final segment: the committed size must match the
                // declared size, when one was given
                if let Some(size) = declared {
                    if (buf.len() as u32) < size {
                        return Step::abort(addr.index, addr.sub, AbortCode::TypeMismatchLengthLow);
                    }
                    if (buf.len() as u32) > size {
                        return Step::abort(addr.index, addr.sub, AbortCode::TypeMismatchLengthHigh);
                    }
                }
                match device.download(addr, &buf) {
                    Ok(()) => Step::reply_with_update(
                        SdoResponse::download_segment_ack(toggle),
                        addr,
                        State::Idle,
                    ),
                    Err(code) => Step::abort(addr.index, addr.sub, code),
                }
            }
            SdoRequest::Abort { .. } => Step::idle(),
            req if is_initiate(&req) => Step::abort(addr.index, addr.sub, AbortCode::GeneralError),
            _ => Step::abort(addr.index, addr.sub, AbortCode::InvalidCommandSpecifier),
        }
    }

    fn upload_segments(
        &mut self,
        frame: &[u8],
        addr: SubAddr,
        toggle: bool,
        data: Vec<u8>,
        pos: usize,
    ) -> Step {
        let req = match SdoRequest::try_from(frame) {
            Ok(req) => req,
            Err(code) => return Step::abort(addr.index, addr.sub, code),
        };
        match req {
            SdoRequest::UploadSegmentRequest { t } => {
                if t != toggle {
                    return Step::abort(addr.index, addr.sub, AbortCode::ToggleNotAlternated);
                }
                let len = (data.len() - pos).min(7);
                let c = pos + len == data.len();
                let reply = SdoResponse::upload_segment(toggle, c, &data[pos..pos + len]);
                if c {
                    Step::reply(reply, State::Idle)
                } else {
                    Step::reply(
                        reply,
                        State::UploadSegments {
                            addr,
                            toggle: !toggle,
                            data,
                            pos: pos + len,
                        },
                    )
                }
            }
            SdoRequest::Abort { .. } => Step::idle(),
            req if is_initiate(&req) => Step::abort(addr.index, addr.sub, AbortCode::GeneralError),
            _ => Step::abort(addr.index, addr.sub, AbortCode::InvalidCommandSpecifier),
        }
    }

    fn block_download(
        &mut self,
        frame: &[u8],
        addr: SubAddr,
        crc_enabled: bool,
        declared: Option<u32>,
        next_seq: u8,
        mut buf: Vec<u8>,
    ) -> Step {
        // During the sub-block phase every frame is a raw segment. Abort
        // frames are recognized by their first byte: 0x80 corresponds to
        // the (invalid) sequence number 0, so there is no ambiguity.
        if frame[0] == 0x80 {
            if SdoRequest::try_from(frame).is_ok() {
                debug!("Block download 0x{:04X}sub{} aborted by client", addr.index, addr.sub);
            }
            return Step::idle();
        }
        // Unwrap: frame length was checked in handle_frame
        let segment = BlockSegment::try_from(frame).unwrap();
        if segment.seqnum == 0 {
            warn!("Ignoring block segment with sequence number 0");
            return Step::stay(State::BlockDownload {
                addr,
                crc_enabled,
                declared,
                next_seq,
                buf,
            });
        }
        if segment.seqnum != next_seq {
            return Step::abort(addr.index, addr.sub, AbortCode::InvalidSequenceNumber);
        }
        buf.extend_from_slice(&segment.data);

        if segment.c {
            // Last segment of the transfer; padding is trimmed by the end
            // request
            Step::reply(
                SdoResponse::block_ack(segment.seqnum, SDO_MAX_BLKSIZE),
                State::BlockDownloadEnd {
                    addr,
                    crc_enabled,
                    buf,
                },
            )
        } else if segment.seqnum == SDO_MAX_BLKSIZE {
            Step::reply(
                SdoResponse::block_ack(segment.seqnum, SDO_MAX_BLKSIZE),
                State::BlockDownload {
                    addr,
                    crc_enabled,
                    declared,
                    next_seq: 1,
                    buf,
                },
            )
        } else {
            Step::stay(State::BlockDownload {
                addr,
                crc_enabled,
                declared,
                next_seq: next_seq + 1,
                buf,
            })
        }
    }

    fn block_download_end(
        &mut self,
        frame: &[u8],
        device: &mut Device,
        addr: SubAddr,
        crc_enabled: bool,
        mut buf: Vec<u8>,
    ) -> Step {
        let req = match SdoRequest::try_from(frame) {
            Ok(req) => req,
            Err(code) => return Step::abort(addr.index, addr.sub, code),
        };
        match req {
            SdoRequest::EndBlockDownload { n, crc } => {
                buf.truncate(buf.len() - n as usize);
                if crc_enabled {
                    let computed = crc16::State::<crc16::XMODEM>::calculate(&buf);
                    if computed != crc {
                        return Step::abort(addr.index, addr.sub, AbortCode::CrcError);
                    }
                }
                match device.download(addr, &buf) {
                    Ok(()) => Step::reply_with_update(
                        SdoResponse::BlockDownloadEndAck,
                        addr,
                        State::Idle,
                    ),
                    Err(code) => Step::abort(addr.index, addr.sub, code),
                }
            }
            SdoRequest::Abort { .. } => Step::idle(),
            req if is_initiate(&req) => Step::abort(addr.index, addr.sub, AbortCode::GeneralError),
            _ => Step::abort(addr.index, addr.sub, AbortCode::InvalidCommandSpecifier),
        }
    }

    /// Emit one block of upload segments; returns the number sent
    fn send_upload_block(
        &self,
        send: &mut dyn FnMut(CanMessage),
        data: &[u8],
        pos: usize,
        blksize: u8,
    ) -> u8 {
        let remaining = data.len() - pos;
        let segments = remaining.div_ceil(7).min(blksize as usize);
        for i in 0..segments {
            let start = pos + i * 7;
            let len = (data.len() - start).min(7);
            let mut seg_data = [0u8; 7];
            seg_data[0..len].copy_from_slice(&data[start..start + len]);
            let seg = BlockSegment {
                c: start + len == data.len(),
                seqnum: (i + 1) as u8,
                data: seg_data,
            };
            send(seg.to_can_message(self.tx_cob_id));
        }
        segments as u8
    }

    #[allow(clippy::too_many_arguments)]
    fn block_upload_start(
        &mut self,
        frame: &[u8],
        send: &mut dyn FnMut(CanMessage),
        addr: SubAddr,
        data: Vec<u8>,
        blksize: u8,
        crc_enabled: bool,
    ) -> Step {
        let req = match SdoRequest::try_from(frame) {
            Ok(req) => req,
            Err(code) => return Step::abort(addr.index, addr.sub, code),
        };
        match req {
            SdoRequest::StartBlockUpload => {
                let sent = self.send_upload_block(send, &data, 0, blksize);
                Step::stay(State::BlockUploadAck {
                    addr,
                    data,
                    pos: 0,
                    sent,
                    blksize,
                    crc_enabled,
                })
            }
            SdoRequest::Abort { .. } => Step::idle(),
            req if is_initiate(&req) => Step::abort(addr.index, addr.sub, AbortCode::GeneralError),
            _ => Step::abort(addr.index, addr.sub, AbortCode::InvalidCommandSpecifier),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn block_upload_ack(
        &mut self,
        frame: &[u8],
        send: &mut dyn FnMut(CanMessage),
        addr: SubAddr,
        data: Vec<u8>,
        pos: usize,
        sent: u8,
        blksize: u8,
        crc_enabled: bool,
    ) -> Step {
        let req = match SdoRequest::try_from(frame) {
            Ok(req) => req,
            Err(code) => return Step::abort(addr.index, addr.sub, code),
        };
        match req {
            SdoRequest::BlockUploadAck {
                ackseq,
                blksize: new_blksize,
            } => {
                if ackseq > sent {
                    return Step::abort(addr.index, addr.sub, AbortCode::InvalidSequenceNumber);
                }
                if new_blksize == 0 || new_blksize > SDO_MAX_BLKSIZE {
                    return Step::abort(addr.index, addr.sub, AbortCode::InvalidBlockSize);
                }
                // Advance past the acknowledged segments; anything after
                // ackseq is resent in the next block
                let pos = (pos + ackseq as usize * 7).min(data.len());
                if pos == data.len() {
                    let n = ((7 - data.len() % 7) % 7) as u8;
                    let crc = if crc_enabled {
                        crc16::State::<crc16::XMODEM>::calculate(&data)
                    } else {
                        0
                    };
                    Step::reply(
                        SdoResponse::BlockUploadEnd { n, crc },
                        State::BlockUploadEnd { addr },
                    )
                } else {
                    let sent = self.send_upload_block(send, &data, pos, new_blksize);
                    Step::stay(State::BlockUploadAck {
                        addr,
                        data,
                        pos,
                        sent,
                        blksize: new_blksize,
                        crc_enabled,
                    })
                }
            }
            SdoRequest::Abort { .. } => Step::idle(),
            req if is_initiate(&req) => Step::abort(addr.index, addr.sub, AbortCode::GeneralError),
            _ => Step::abort(addr.index, addr.sub, AbortCode::InvalidCommandSpecifier),
        }
    }

    fn block_upload_end(&mut self, frame: &[u8], addr: SubAddr) -> Step {
        let req = match SdoRequest::try_from(frame) {
            Ok(req) => req,
            Err(code) => return Step::abort(addr.index, addr.sub, code),
        };
        match req {
            SdoRequest::EndBlockUpload => Step::idle(),
            SdoRequest::Abort { .. } => Step::idle(),
            req if is_initiate(&req) => Step::abort(addr.index, addr.sub, AbortCode::GeneralError),
            _ => Step::abort(addr.index, addr.sub, AbortCode::InvalidCommandSpecifier),
        }
    }
}

/// Returns true for requests which open a new transfer
fn is_initiate(req: &SdoRequest) -> bool {
    matches!(
        req,
        SdoRequest::InitiateDownload { .. }
            | SdoRequest::InitiateUpload { .. }
            | SdoRequest::InitiateBlockDownload { .. }
            | SdoRequest::InitiateBlockUpload { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{AccessType, Object, ObjectCode, SubObject};
    use pascan_common::node_id::NodeId;
    use pascan_common::values::{DataType, Value};

    const NODE_ID: u8 = 1;

    fn test_device() -> Device {
        let mut device = Device::new(NodeId::Assigned(NODE_ID));

        let mut obj = Object::new(0x2000, ObjectCode::Var);
        obj.insert_sub(
            SubObject::new(0x01, DataType::UInt32)
                .access(AccessType::Rw)
                .limits(Some(Value::UInt32(0)), Some(Value::UInt32(0xFFFF_FFFF))),
        )
        .unwrap();
        device.insert_object(obj).unwrap();

        let mut obj = Object::new(0x2001, ObjectCode::Var);
        obj.insert_sub(
            SubObject::new(0x00, DataType::OctetString)
                .access(AccessType::Rw)
                .with_default(Value::OctetString(b"abcdefghij".to_vec())),
        )
        .unwrap();
        device.insert_object(obj).unwrap();

        let mut obj = Object::new(0x1018, ObjectCode::Record);
        obj.insert_sub(SubObject::new(0x01, DataType::UInt32).with_default(Value::UInt32(0xCAFE)))
            .unwrap();
        device.insert_object(obj).unwrap();

        device
    }

    struct Harness {
        server: SdoServer,
        device: Device,
        out: Vec<CanMessage>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                server: SdoServer::new_std(NODE_ID),
                device: test_device(),
                out: Vec::new(),
            }
        }

        fn push(&mut self, bytes: [u8; 8], now: u64) -> Option<SubAddr> {
            let msg = CanMessage::new(CanId::Std(0x600 + NODE_ID as u16), &bytes);
            self.server
                .handle_frame(&msg, now, &mut self.device, &mut |m| self.out.push(m))
        }

        fn poll(&mut self, now: u64) {
            self.server.poll(now, &mut |m| self.out.push(m));
        }

        fn take_one(&mut self) -> CanMessage {
            assert_eq!(1, self.out.len(), "expected exactly one response");
            self.out.remove(0)
        }
    }

    #[test]
    fn expedited_download_commits_value() {
        let mut h = Harness::new();
        let updated = h.push([0x23, 0x00, 0x20, 0x01, 0x78, 0x56, 0x34, 0x12], 0);
        assert_eq!(Some(SubAddr::new(0x2000, 0x01)), updated);
        let reply = h.take_one();
        assert_eq!(
            &[0x60, 0x00, 0x20, 0x01, 0x00, 0x00, 0x00, 0x00],
            reply.data()
        );
        assert_eq!(
            Value::UInt32(0x1234_5678),
            h.device.value(0x2000, 0x01).unwrap()
        );
    }

    #[test]
    fn write_to_read_only_sub_aborts() {
        let mut h = Harness::new();
        let req = SdoRequest::expedited_download(0x1018, 0x01, &1u32.to_le_bytes());
        let updated = h.push(req.to_bytes(), 0);
        assert_eq!(None, updated);
        let reply = h.take_one();
        assert_eq!(
            &[0x80, 0x18, 0x10, 0x01, 0x02, 0x00, 0x01, 0x06],
            reply.data()
        );
        assert!(h.server.is_idle());
    }

    #[test]
    fn segmented_upload_of_octet_string() {
        let mut h = Harness::new();
        let updated = h.push(SdoRequest::initiate_upload(0x2001, 0x00).to_bytes(), 0);
        assert_eq!(None, updated);
        let reply = h.take_one();
        // Declared size 10, segmented
        assert_eq!(
            SdoResponse::upload_init_ack(0x2001, 0x00, Some(10)),
            SdoResponse::try_from(reply.data()).unwrap()
        );

        h.push(SdoRequest::upload_segment_request(false).to_bytes(), 0);
        let seg1 = h.take_one();
        assert_eq!(
            SdoResponse::upload_segment(false, false, b"abcdefg"),
            SdoResponse::try_from(seg1.data()).unwrap()
        );

        h.push(SdoRequest::upload_segment_request(true).to_bytes(), 0);
        let seg2 = h.take_one();
        assert_eq!(
            SdoResponse::upload_segment(true, true, b"hij"),
            SdoResponse::try_from(seg2.data()).unwrap()
        );
        assert!(h.server.is_idle());
    }

    #[test]
    fn expedited_upload_of_short_value() {
        let mut h = Harness::new();
        h.device
            .set_value(0x2000, 0x01, Value::UInt32(0xAABBCCDD))
            .unwrap();
        h.push(SdoRequest::initiate_upload(0x2000, 0x01).to_bytes(), 0);
        let reply = h.take_one();
        assert_eq!(
            SdoResponse::expedited_upload(0x2000, 0x01, &[0xDD, 0xCC, 0xBB, 0xAA]),
            SdoResponse::try_from(reply.data()).unwrap()
        );
    }

    #[test]
    fn segmented_download_round_trip() {
        let mut h = Harness::new();
        let data = b"0123456789abcdef";
        h.push(
            SdoRequest::initiate_download(0x2001, 0x00, Some(data.len() as u32)).to_bytes(),
            0,
        );
        h.take_one();

        let mut toggle = false;
        let mut sent = 0;
        while sent < data.len() {
            let len = (data.len() - sent).min(7);
            let c = sent + len == data.len();
            let updated = h.push(
                SdoRequest::download_segment(toggle, c, &data[sent..sent + len]).to_bytes(),
                0,
            );
            let reply = h.take_one();
            assert_eq!(
                SdoResponse::download_segment_ack(toggle),
                SdoResponse::try_from(reply.data()).unwrap()
            );
            if c {
                assert_eq!(Some(SubAddr::new(0x2001, 0x00)), updated);
            } else {
                assert_eq!(None, updated);
            }
            toggle = !toggle;
            sent += len;
        }
        assert_eq!(
            Value::OctetString(data.to_vec()),
            h.device.value(0x2001, 0x00).unwrap()
        );
    }

    #[test]
    fn toggle_violation_aborts() {
        let mut h = Harness::new();
        h.push(
            SdoRequest::initiate_download(0x2001, 0x00, Some(14)).to_bytes(),
            0,
        );
        h.take_one();
        // First segment must carry toggle 0
        h.push(
            SdoRequest::download_segment(true, false, &[0; 7]).to_bytes(),
            0,
        );
        let reply = h.take_one();
        assert_eq!(
            SdoResponse::abort(0x2001, 0x00, AbortCode::ToggleNotAlternated),
            SdoResponse::try_from(reply.data()).unwrap()
        );
        assert!(h.server.is_idle());
    }

    #[test]
    fn unexpected_command_specifier_aborts() {
        let mut h = Harness::new();
        h.push(
            SdoRequest::initiate_download(0x2001, 0x00, Some(14)).to_bytes(),
            0,
        );
        h.take_one();
        h.push(SdoRequest::upload_segment_request(false).to_bytes(), 0);
        let reply = h.take_one();
        assert_eq!(
            SdoResponse::abort(0x2001, 0x00, AbortCode::InvalidCommandSpecifier),
            SdoResponse::try_from(reply.data()).unwrap()
        );
    }

    #[test]
    fn initiate_on_busy_channel_aborts_with_general_error() {
        let mut h = Harness::new();
        h.push(
            SdoRequest::initiate_download(0x2001, 0x00, Some(14)).to_bytes(),
            0,
        );
        h.take_one();
        h.push(SdoRequest::initiate_upload(0x2000, 0x01).to_bytes(), 0);
        let reply = h.take_one();
        assert_eq!(
            SdoResponse::abort(0x2001, 0x00, AbortCode::GeneralError),
            SdoResponse::try_from(reply.data()).unwrap()
        );
    }

    #[test]
    fn timeout_aborts_to_idle() {
        let mut h = Harness::new();
        h.push(
            SdoRequest::initiate_download(0x2001, 0x00, Some(14)).to_bytes(),
            0,
        );
        h.take_one();
        assert!(h.server.next_deadline().is_some());

        // Before the deadline nothing happens
        h.poll(SDO_TIMEOUT_US - 1);
        assert!(h.out.is_empty());

        h.poll(SDO_TIMEOUT_US + 1);
        let reply = h.take_one();
        assert_eq!(
            SdoResponse::abort(0x2001, 0x00, AbortCode::Timeout),
            SdoResponse::try_from(reply.data()).unwrap()
        );
        assert!(h.server.is_idle());
        assert_eq!(None, h.server.next_deadline());
    }

    fn run_block_download(h: &mut Harness, data: &[u8], crc: u16) {
        h.push(
            SdoRequest::initiate_block_download(0x2001, 0x00, true, data.len() as u32).to_bytes(),
            0,
        );
        let reply = h.take_one();
        assert_eq!(
            SdoResponse::block_download_init_ack(true, 0x2001, 0x00, 127),
            SdoResponse::try_from(reply.data()).unwrap()
        );

        let mut seqnum = 0u8;
        let mut pos = 0;
        while pos < data.len() {
            let len = (data.len() - pos).min(7);
            let mut seg = [0u8; 7];
            seg[0..len].copy_from_slice(&data[pos..pos + len]);
            pos += len;
            seqnum += 1;
            let c = pos == data.len();
            let updated = h.push(BlockSegment { c, seqnum, data: seg }.to_bytes(), 0);
            assert_eq!(None, updated);

            if c || seqnum == 127 {
                let reply = h.take_one();
                assert_eq!(
                    SdoResponse::block_ack(seqnum, 127),
                    SdoResponse::try_from(reply.data()).unwrap()
                );
                if !c {
                    seqnum = 0;
                }
            } else {
                assert!(h.out.is_empty());
            }
        }

        let n = ((7 - data.len() % 7) % 7) as u8;
        let updated = h.push(SdoRequest::end_block_download(n, crc).to_bytes(), 0);
        assert_eq!(Some(SubAddr::new(0x2001, 0x00)), updated);
        let reply = h.take_one();
        assert_eq!(
            SdoResponse::BlockDownloadEndAck,
            SdoResponse::try_from(reply.data()).unwrap()
        );
    }

    #[test]
    fn block_download_round_trip() {
        for size in [20usize, 127 * 7, 1000] {
            let mut h = Harness::new();
            let data: Vec<u8> = (0..size).map(|x| (x % 256) as u8).collect();
            let crc = crc16::State::<crc16::XMODEM>::calculate(&data);
            run_block_download(&mut h, &data, crc);
            assert_eq!(
                Value::OctetString(data),
                h.device.value(0x2001, 0x00).unwrap()
            );
        }
    }

    #[test]
    fn block_download_sequence_mismatch_aborts() {
        let mut h = Harness::new();
        h.push(
            SdoRequest::initiate_block_download(0x2001, 0x00, true, 21).to_bytes(),
            0,
        );
        h.take_one();

        h.push(
            BlockSegment {
                c: false,
                seqnum: 1,
                data: [0; 7],
            }
            .to_bytes(),
            0,
        );
        assert!(h.out.is_empty());

        // Skip segment 2
        h.push(
            BlockSegment {
                c: true,
                seqnum: 3,
                data: [0; 7],
            }
            .to_bytes(),
            0,
        );
        let reply = h.take_one();
        assert_eq!(
            SdoResponse::abort(0x2001, 0x00, AbortCode::InvalidSequenceNumber),
            SdoResponse::try_from(reply.data()).unwrap()
        );
        assert!(h.server.is_idle());
    }

    #[test]
    fn block_download_crc_mismatch_aborts() {
        let mut h = Harness::new();
        h.push(
            SdoRequest::initiate_block_download(0x2001, 0x00, true, 7).to_bytes(),
            0,
        );
        h.take_one();
        h.push(
            BlockSegment {
                c: true,
                seqnum: 1,
                data: [1, 2, 3, 4, 5, 6, 7],
            }
            .to_bytes(),
            0,
        );
        h.take_one();
        h.push(SdoRequest::end_block_download(0, 0xBAD0).to_bytes(), 0);
        let reply = h.take_one();
        assert_eq!(
            SdoResponse::abort(0x2001, 0x00, AbortCode::CrcError),
            SdoResponse::try_from(reply.data()).unwrap()
        );
    }

    #[test]
    fn block_upload_round_trip() {
        let mut h = Harness::new();
        let data: Vec<u8> = (0..100u32).map(|x| (x % 256) as u8).collect();
        h.device
            .set_value(0x2001, 0x00, Value::OctetString(data.clone()))
            .unwrap();

        h.push(
            SdoRequest::initiate_block_upload(0x2001, 0x00, 127, 0).to_bytes(),
            0,
        );
        let reply = h.take_one();
        assert_eq!(
            SdoResponse::block_upload_init_ack(0x2001, 0x00, 100),
            SdoResponse::try_from(reply.data()).unwrap()
        );

        h.push(SdoRequest::StartBlockUpload.to_bytes(), 0);
        // 100 bytes = 15 segments
        assert_eq!(15, h.out.len());
        let mut received = Vec::new();
        for (i, msg) in h.out.drain(..).enumerate() {
            let seg = BlockSegment::try_from(msg.data()).unwrap();
            assert_eq!((i + 1) as u8, seg.seqnum);
            assert_eq!(i == 14, seg.c);
            received.extend_from_slice(&seg.data);
        }

        h.push(
            SdoRequest::BlockUploadAck {
                ackseq: 15,
                blksize: 127,
            }
            .to_bytes(),
            0,
        );
        let reply = h.take_one();
        let crc = crc16::State::<crc16::XMODEM>::calculate(&data);
        assert_eq!(
            SdoResponse::BlockUploadEnd { n: 5, crc },
            SdoResponse::try_from(reply.data()).unwrap()
        );
        received.truncate(100);
        assert_eq!(data, received);

        h.push(SdoRequest::EndBlockUpload.to_bytes(), 0);
        assert!(h.out.is_empty());
        assert!(h.server.is_idle());
    }

    #[test]
    fn block_upload_protocol_switch_falls_back_to_expedited() {
        let mut h = Harness::new();
        h.device
            .set_value(0x2000, 0x01, Value::UInt32(7))
            .unwrap();
        h.push(
            SdoRequest::initiate_block_upload(0x2000, 0x01, 127, 4).to_bytes(),
            0,
        );
        let reply = h.take_one();
        assert_eq!(
            SdoResponse::expedited_upload(0x2000, 0x01, &7u32.to_le_bytes()),
            SdoResponse::try_from(reply.data()).unwrap()
        );
        assert!(h.server.is_idle());
    }

    #[test]
    fn host_abort_resets_to_idle() {
        let mut h = Harness::new();
        h.push(
            SdoRequest::initiate_download(0x2001, 0x00, Some(14)).to_bytes(),
            0,
        );
        h.take_one();
        let mut out = Vec::new();
        h.server.abort(AbortCode::GeneralError, &mut |m| out.push(m));
        assert_eq!(1, out.len());
        assert!(h.server.is_idle());
    }
}
