//! Frame types and their wire encoding.
//!
//! Every frame starts with a one-byte type. Fields are fixed width and
//! big-endian:
//!
//! ```text
//! 0x00 PADDING          rest of the payload
//! 0x01 RST_STREAM       stream_id(4) byte_offset(8) error_code(4)
//! 0x02 CONNECTION_CLOSE error_code(4) len(2) details(len)
//! 0x03 GOAWAY           error_code(4) last_good_stream_id(4) len(2) reason(len)
//! 0x04 WINDOW_UPDATE    stream_id(4) byte_offset(8)
//! 0x05 BLOCKED          stream_id(4)
//! 0x06 STOP_WAITING     entropy_hash(1) least_unacked(8)
//! 0x07 PING
//! 0x40 ACK              entropy_hash(1) largest_observed(8) ack_delay_us(8)
//!                       flags(1) latest_revived(8) count(2) missing(8 * count)
//! 0x80 STREAM           stream_id(4) offset(8) fin(1) len(2) data(len)
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, ErrorCode, Result, RstStreamErrorCode};
use crate::types::{
    EncryptionLevel, EntropyHash, IsHandshake, PacketNumber, StreamId, StreamOffset,
    CRYPTO_STREAM_ID,
};

/// Frame type bytes
pub mod frame_type {
    /// Padding to the end of the packet
    pub const PADDING: u8 = 0x00;
    /// Stream reset
    pub const RST_STREAM: u8 = 0x01;
    /// Connection close
    pub const CONNECTION_CLOSE: u8 = 0x02;
    /// Go away
    pub const GOAWAY: u8 = 0x03;
    /// Flow control window update
    pub const WINDOW_UPDATE: u8 = 0x04;
    /// Flow control blocked
    pub const BLOCKED: u8 = 0x05;
    /// Stop waiting
    pub const STOP_WAITING: u8 = 0x06;
    /// Ping
    pub const PING: u8 = 0x07;
    /// Acknowledgment
    pub const ACK: u8 = 0x40;
    /// Stream data
    pub const STREAM: u8 = 0x80;
}

/// Ack flag: missing set was truncated
const ACK_FLAG_TRUNCATED: u8 = 0x01;

/// Encoded ack delay meaning "unknown"
const ACK_DELAY_INFINITE: u64 = u64::MAX;

/// Bytes of a stream frame before its data
pub const STREAM_FRAME_OVERHEAD: usize = 1 + 4 + 8 + 1 + 2;

/// Bytes of an ack frame before its missing list
pub const ACK_FRAME_OVERHEAD: usize = 1 + 1 + 8 + 8 + 1 + 8 + 2;

/// Bytes of a stop waiting frame
pub const STOP_WAITING_FRAME_SIZE: usize = 1 + 1 + 8;

/// Most missing packets an ack reports before truncating
pub const MAX_ACK_MISSING_PACKETS: usize = 255;

/// Stream data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    /// Stream
    pub stream_id: StreamId,
    /// Last frame of the stream
    pub fin: bool,
    /// Offset of `data` in the stream
    pub offset: StreamOffset,
    /// Payload
    pub data: Bytes,
}

impl StreamFrame {
    /// Build a stream frame.
    pub fn new(stream_id: StreamId, fin: bool, offset: StreamOffset, data: impl Into<Bytes>) -> Self {
        Self {
            stream_id,
            fin,
            offset,
            data: data.into(),
        }
    }
}

/// Acknowledgment of received packets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AckFrame {
    /// Cumulative entropy of received packets up to `largest_observed`
    pub entropy_hash: EntropyHash,
    /// Largest packet number received
    pub largest_observed: PacketNumber,
    /// Time between receipt of `largest_observed` and sending the ack
    pub ack_delay: Option<Duration>,
    /// Packets below `largest_observed` not yet received
    pub missing_packets: BTreeSet<PacketNumber>,
    /// The missing set did not fit
    pub is_truncated: bool,
    /// Latest packet reconstructed from FEC, 0 if none
    pub latest_revived_packet: PacketNumber,
}

impl AckFrame {
    /// Whether `packet_number` is reported as received.
    pub fn is_acked(&self, packet_number: PacketNumber) -> bool {
        packet_number <= self.largest_observed && !self.missing_packets.contains(&packet_number)
    }
}

/// Tells the peer to stop waiting for packets below `least_unacked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StopWaitingFrame {
    /// Cumulative sent entropy up to `least_unacked - 1`
    pub entropy_hash: EntropyHash,
    /// Lowest packet number the sender may still retransmit
    pub least_unacked: PacketNumber,
}

/// Abrupt stream termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RstStreamFrame {
    /// Stream
    pub stream_id: StreamId,
    /// Reason
    pub error_code: RstStreamErrorCode,
    /// Final byte offset written
    pub byte_offset: StreamOffset,
}

/// Connection termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    /// Reason
    pub error_code: ErrorCode,
    /// Human readable detail
    pub error_details: String,
}

/// Graceful shutdown notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAwayFrame {
    /// Reason
    pub error_code: ErrorCode,
    /// Last stream the sender will process
    pub last_good_stream_id: StreamId,
    /// Human readable reason
    pub reason_phrase: String,
}

/// Flow control window update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    /// Stream, 0 for the connection
    pub stream_id: StreamId,
    /// New maximum byte offset
    pub byte_offset: StreamOffset,
}

/// Flow control blocked notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedFrame {
    /// Stream, 0 for the connection
    pub stream_id: StreamId,
}

/// Any frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Padding of the given total length
    Padding(usize),
    /// Stream data
    Stream(StreamFrame),
    /// Acknowledgment
    Ack(AckFrame),
    /// Stop waiting
    StopWaiting(StopWaitingFrame),
    /// Ping
    Ping,
    /// MTU probe; encoded as a ping, the packet is padded to the probe size
    MtuDiscovery,
    /// Stream reset
    RstStream(RstStreamFrame),
    /// Connection close
    ConnectionClose(ConnectionCloseFrame),
    /// Go away
    GoAway(GoAwayFrame),
    /// Window update
    WindowUpdate(WindowUpdateFrame),
    /// Blocked
    Blocked(BlockedFrame),
}

impl Frame {
    /// Whether loss of this frame requires retransmission.
    pub fn is_retransmittable(&self) -> bool {
        !matches!(
            self,
            Frame::Padding(_) | Frame::Ack(_) | Frame::StopWaiting(_) | Frame::MtuDiscovery
        )
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Padding(len) => (*len).max(1),
            Frame::Stream(f) => STREAM_FRAME_OVERHEAD + f.data.len(),
            Frame::Ack(f) => ACK_FRAME_OVERHEAD + 8 * f.missing_packets.len(),
            Frame::StopWaiting(_) => STOP_WAITING_FRAME_SIZE,
            Frame::Ping | Frame::MtuDiscovery => 1,
            Frame::RstStream(_) => 1 + 4 + 8 + 4,
            Frame::ConnectionClose(f) => 1 + 4 + 2 + f.error_details.len(),
            Frame::GoAway(f) => 1 + 4 + 4 + 2 + f.reason_phrase.len(),
            Frame::WindowUpdate(_) => 1 + 4 + 8,
            Frame::Blocked(_) => 1 + 4,
        }
    }

    /// Append the encoded frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Padding(len) => {
                buf.put_u8(frame_type::PADDING);
                buf.put_bytes(0, len.saturating_sub(1));
            }
            Frame::Stream(f) => {
                buf.put_u8(frame_type::STREAM);
                buf.put_u32(f.stream_id);
                buf.put_u64(f.offset);
                buf.put_u8(f.fin as u8);
                buf.put_u16(f.data.len() as u16);
                buf.put_slice(&f.data);
            }
            Frame::Ack(f) => {
                buf.put_u8(frame_type::ACK);
                buf.put_u8(f.entropy_hash);
                buf.put_u64(f.largest_observed);
                buf.put_u64(
                    f.ack_delay
                        .map(|d| d.as_micros().min(ACK_DELAY_INFINITE as u128 - 1) as u64)
                        .unwrap_or(ACK_DELAY_INFINITE),
                );
                buf.put_u8(if f.is_truncated { ACK_FLAG_TRUNCATED } else { 0 });
                buf.put_u64(f.latest_revived_packet);
                buf.put_u16(f.missing_packets.len() as u16);
                for &missing in &f.missing_packets {
                    buf.put_u64(missing);
                }
            }
            Frame::StopWaiting(f) => {
                buf.put_u8(frame_type::STOP_WAITING);
                buf.put_u8(f.entropy_hash);
                buf.put_u64(f.least_unacked);
            }
            Frame::Ping | Frame::MtuDiscovery => buf.put_u8(frame_type::PING),
            Frame::RstStream(f) => {
                buf.put_u8(frame_type::RST_STREAM);
                buf.put_u32(f.stream_id);
                buf.put_u64(f.byte_offset);
                buf.put_u32(f.error_code.to_wire());
            }
            Frame::ConnectionClose(f) => {
                buf.put_u8(frame_type::CONNECTION_CLOSE);
                buf.put_u32(f.error_code.to_wire());
                put_string(buf, &f.error_details);
            }
            Frame::GoAway(f) => {
                buf.put_u8(frame_type::GOAWAY);
                buf.put_u32(f.error_code.to_wire());
                buf.put_u32(f.last_good_stream_id);
                put_string(buf, &f.reason_phrase);
            }
            Frame::WindowUpdate(f) => {
                buf.put_u8(frame_type::WINDOW_UPDATE);
                buf.put_u32(f.stream_id);
                buf.put_u64(f.byte_offset);
            }
            Frame::Blocked(f) => {
                buf.put_u8(frame_type::BLOCKED);
                buf.put_u32(f.stream_id);
            }
        }
    }

    /// Decode the body of a frame whose type byte was already consumed.
    ///
    /// Padding is not handled here: it swallows the rest of the payload.
    pub fn decode_body(frame_type: u8, data: &mut &[u8]) -> Result<Frame> {
        match frame_type {
            frame_type::STREAM => {
                let err = || Error::framing(ErrorCode::InvalidFrameData, "Unable to read stream frame.");
                ensure(data, 4 + 8 + 1 + 2).map_err(|_| err())?;
                let stream_id = data.get_u32();
                let offset = data.get_u64();
                let fin = match data.get_u8() {
                    0 => false,
                    1 => true,
                    _ => return Err(err()),
                };
                let len = data.get_u16() as usize;
                ensure(data, len).map_err(|_| err())?;
                let payload = Bytes::copy_from_slice(&data[..len]);
                data.advance(len);
                Ok(Frame::Stream(StreamFrame::new(stream_id, fin, offset, payload)))
            }
            frame_type::ACK => {
                let err = |d: &str| Error::framing(ErrorCode::InvalidAckData, d.to_string());
                ensure(data, ACK_FRAME_OVERHEAD - 1)
                    .map_err(|_| err("Unable to read ack frame."))?;
                let entropy_hash = data.get_u8();
                let largest_observed = data.get_u64();
                let delay = data.get_u64();
                let flags = data.get_u8();
                if flags & !ACK_FLAG_TRUNCATED != 0 {
                    return Err(err("Illegal ack flags."));
                }
                let latest_revived_packet = data.get_u64();
                let count = data.get_u16() as usize;
                ensure(data, count * 8).map_err(|_| err("Unable to read missing packets."))?;
                let mut missing_packets = BTreeSet::new();
                for _ in 0..count {
                    missing_packets.insert(data.get_u64());
                }
                Ok(Frame::Ack(AckFrame {
                    entropy_hash,
                    largest_observed,
                    ack_delay: (delay != ACK_DELAY_INFINITE).then(|| Duration::from_micros(delay)),
                    missing_packets,
                    is_truncated: flags & ACK_FLAG_TRUNCATED != 0,
                    latest_revived_packet,
                }))
            }
            frame_type::STOP_WAITING => {
                ensure(data, STOP_WAITING_FRAME_SIZE - 1).map_err(|_| {
                    Error::framing(
                        ErrorCode::InvalidStopWaitingData,
                        "Unable to read stop waiting frame.",
                    )
                })?;
                Ok(Frame::StopWaiting(StopWaitingFrame {
                    entropy_hash: data.get_u8(),
                    least_unacked: data.get_u64(),
                }))
            }
            frame_type::PING => Ok(Frame::Ping),
            frame_type::RST_STREAM => {
                let err = || Error::framing(ErrorCode::InvalidRstStreamData, "Unable to read rst stream frame.");
                ensure(data, 4 + 8 + 4).map_err(|_| err())?;
                let stream_id = data.get_u32();
                let byte_offset = data.get_u64();
                let error_code = RstStreamErrorCode::try_from(data.get_u32()).map_err(|_| err())?;
                Ok(Frame::RstStream(RstStreamFrame {
                    stream_id,
                    error_code,
                    byte_offset,
                }))
            }
            frame_type::CONNECTION_CLOSE => {
                let err = || {
                    Error::framing(
                        ErrorCode::InvalidConnectionCloseData,
                        "Unable to read connection close frame.",
                    )
                };
                ensure(data, 4).map_err(|_| err())?;
                let error_code = ErrorCode::try_from(data.get_u32()).map_err(|_| err())?;
                let error_details = get_string(data).ok_or_else(err)?;
                Ok(Frame::ConnectionClose(ConnectionCloseFrame {
                    error_code,
                    error_details,
                }))
            }
            frame_type::GOAWAY => {
                let err = || Error::framing(ErrorCode::InvalidGoawayData, "Unable to read goaway frame.");
                ensure(data, 8).map_err(|_| err())?;
                let error_code = ErrorCode::try_from(data.get_u32()).map_err(|_| err())?;
                let last_good_stream_id = data.get_u32();
                let reason_phrase = get_string(data).ok_or_else(err)?;
                Ok(Frame::GoAway(GoAwayFrame {
                    error_code,
                    last_good_stream_id,
                    reason_phrase,
                }))
            }
            frame_type::WINDOW_UPDATE => {
                ensure(data, 12).map_err(|_| {
                    Error::framing(
                        ErrorCode::InvalidWindowUpdateData,
                        "Unable to read window update frame.",
                    )
                })?;
                Ok(Frame::WindowUpdate(WindowUpdateFrame {
                    stream_id: data.get_u32(),
                    byte_offset: data.get_u64(),
                }))
            }
            frame_type::BLOCKED => {
                ensure(data, 4).map_err(|_| {
                    Error::framing(ErrorCode::InvalidBlockedData, "Unable to read blocked frame.")
                })?;
                Ok(Frame::Blocked(BlockedFrame {
                    stream_id: data.get_u32(),
                }))
            }
            other => Err(Error::framing(
                ErrorCode::InvalidFrameData,
                format!("Illegal frame type: {:#04x}", other),
            )),
        }
    }
}

fn ensure(data: &[u8], len: usize) -> Result<()> {
    if data.len() < len {
        return Err(Error::Buffer {
            expected: len,
            actual: data.len(),
        });
    }
    Ok(())
}

fn put_string(buf: &mut BytesMut, s: &str) {
    let bytes = &s.as_bytes()[..s.len().min(u16::MAX as usize)];
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn get_string(data: &mut &[u8]) -> Option<String> {
    if data.len() < 2 {
        return None;
    }
    let len = data.get_u16() as usize;
    if data.len() < len {
        return None;
    }
    let s = String::from_utf8_lossy(&data[..len]).into_owned();
    data.advance(len);
    Some(s)
}

/// The retransmittable frames of a sent packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmittableFrames {
    frames: Vec<Frame>,
    encryption_level: EncryptionLevel,
    has_crypto_handshake: IsHandshake,
}

impl RetransmittableFrames {
    /// Empty set at the given level.
    pub fn new(encryption_level: EncryptionLevel) -> Self {
        Self {
            frames: Vec::new(),
            encryption_level,
            has_crypto_handshake: IsHandshake::No,
        }
    }

    /// Add a frame.
    pub fn add_frame(&mut self, frame: Frame) {
        if let Frame::Stream(f) = &frame {
            if f.stream_id == CRYPTO_STREAM_ID {
                self.has_crypto_handshake = IsHandshake::Yes;
            }
        }
        self.frames.push(frame);
    }

    /// Frames in send order.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Level the frames were first sent at.
    pub fn encryption_level(&self) -> EncryptionLevel {
        self.encryption_level
    }

    /// Whether crypto stream data is among the frames.
    pub fn has_crypto_handshake(&self) -> IsHandshake {
        self.has_crypto_handshake
    }

    /// Whether no frames remain.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Whether a connection close frame is among the frames.
    pub fn has_connection_close(&self) -> bool {
        self.frames
            .iter()
            .any(|f| matches!(f, Frame::ConnectionClose(_)))
    }

    /// Drop stream frames of `stream_id`.
    pub fn remove_frames_for_stream(&mut self, stream_id: StreamId) {
        self.frames
            .retain(|f| !matches!(f, Frame::Stream(s) if s.stream_id == stream_id));
    }
}
