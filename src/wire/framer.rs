//! Packet parsing and serialization.
//!
//! [`process_packet`] walks one received packet and reports what it finds to
//! a [`FramerVisitor`], in wire order. The visitor owns the [`Framer`] (it
//! returns it from [`FramerVisitor::framer`]), which keeps the version and
//! decryption state the parse depends on. A callback returning `false`
//! stops further processing of the packet without it being an error.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::crypto::{Decrypter, NullDecrypter};
use crate::error::{Error, ErrorCode, Result};
use crate::types::{
    packet_entropy_hash, ConnectionId, EncryptionLevel, PacketNumber, Perspective, QuicVersion,
};
use crate::wire::frames::{
    frame_type, AckFrame, BlockedFrame, ConnectionCloseFrame, Frame, GoAwayFrame, RstStreamFrame,
    StopWaitingFrame, StreamFrame, WindowUpdateFrame,
};
use crate::wire::header::{
    private_flags, public_flags, FecData, PacketHeader, PublicHeader, PublicResetPacket,
    VersionNegotiationPacket, PACKET_NUMBER_SIZE, PUBLIC_FLAGS_AND_ID_SIZE,
    PUBLIC_RESET_BODY_SIZE, VERSION_SIZE,
};

/// Receives parse events for one packet.
pub trait FramerVisitor {
    /// Framer holding version and decryption state.
    fn framer(&self) -> &Framer;

    /// Mutable framer.
    fn framer_mut(&mut self) -> &mut Framer;

    /// Parsing failed; no further callbacks follow for this packet.
    fn on_error(&mut self, error: &Error);

    /// A new packet is about to be parsed.
    fn on_packet(&mut self);

    /// A public reset packet was received.
    fn on_public_reset_packet(&mut self, packet: &PublicResetPacket);

    /// A version negotiation packet was received (clients only).
    fn on_version_negotiation_packet(&mut self, packet: &VersionNegotiationPacket);

    /// A packet carries a version other than the framer's (servers only).
    /// Return `true` to continue parsing with the possibly updated version.
    fn on_protocol_version_mismatch(&mut self, received_version: QuicVersion) -> bool;

    /// The public header was parsed. Return `false` to drop the packet.
    fn on_unauthenticated_public_header(&mut self, header: &PublicHeader) -> bool;

    /// The packet number was parsed. Return `false` to drop the packet.
    fn on_unauthenticated_header(&mut self, header: &PacketHeader) -> bool;

    /// The payload decrypted at `level`.
    fn on_decrypted_packet(&mut self, level: EncryptionLevel);

    /// The full header was parsed and authenticated. Return `false` to stop.
    fn on_packet_header(&mut self, header: &PacketHeader) -> bool;

    /// A packet reconstructed from FEC is about to be processed.
    fn on_revived_packet(&mut self);

    /// Payload of a packet that belongs to an FEC group.
    fn on_fec_protected_payload(&mut self, payload: &[u8]);

    /// Stream frame.
    fn on_stream_frame(&mut self, frame: &StreamFrame) -> bool;

    /// Ack frame.
    fn on_ack_frame(&mut self, frame: &AckFrame) -> bool;

    /// Stop waiting frame.
    fn on_stop_waiting_frame(&mut self, frame: &StopWaitingFrame) -> bool;

    /// Ping frame.
    fn on_ping_frame(&mut self) -> bool;

    /// Rst stream frame.
    fn on_rst_stream_frame(&mut self, frame: &RstStreamFrame) -> bool;

    /// Connection close frame.
    fn on_connection_close_frame(&mut self, frame: &ConnectionCloseFrame) -> bool;

    /// Go away frame.
    fn on_go_away_frame(&mut self, frame: &GoAwayFrame) -> bool;

    /// Window update frame.
    fn on_window_update_frame(&mut self, frame: &WindowUpdateFrame) -> bool;

    /// Blocked frame.
    fn on_blocked_frame(&mut self, frame: &BlockedFrame) -> bool;

    /// FEC redundancy packet.
    fn on_fec_data(&mut self, fec: &FecData);

    /// Every frame of the packet was delivered.
    fn on_packet_complete(&mut self);
}

struct AlternativeDecrypter {
    decrypter: Box<dyn Decrypter>,
    level: EncryptionLevel,
    latch_once_used: bool,
}

/// Version and decryption state for parsing, plus serialization helpers.
pub struct Framer {
    supported_versions: Vec<QuicVersion>,
    version: QuicVersion,
    perspective: Perspective,
    decrypter: Box<dyn Decrypter>,
    decrypter_level: EncryptionLevel,
    alternative_decrypter: Option<AlternativeDecrypter>,
    error: ErrorCode,
    detailed_error: String,
}

impl Framer {
    /// Create a framer speaking the most preferred of `supported_versions`.
    pub fn new(supported_versions: Vec<QuicVersion>, perspective: Perspective) -> Self {
        let version = supported_versions
            .first()
            .copied()
            .unwrap_or(QuicVersion::V30);
        Self {
            supported_versions,
            version,
            perspective,
            decrypter: Box::new(NullDecrypter),
            decrypter_level: EncryptionLevel::None,
            alternative_decrypter: None,
            error: ErrorCode::NoError,
            detailed_error: String::new(),
        }
    }

    /// Current version.
    pub fn version(&self) -> QuicVersion {
        self.version
    }

    /// Switch version.
    pub fn set_version(&mut self, version: QuicVersion) {
        debug_assert!(self.is_supported_version(version));
        self.version = version;
    }

    /// Versions this endpoint supports, most preferred first.
    pub fn supported_versions(&self) -> &[QuicVersion] {
        &self.supported_versions
    }

    /// Whether `version` is supported.
    pub fn is_supported_version(&self, version: QuicVersion) -> bool {
        self.supported_versions.contains(&version)
    }

    /// Which side this framer parses for.
    pub fn perspective(&self) -> Perspective {
        self.perspective
    }

    /// Last parse error.
    pub fn error(&self) -> ErrorCode {
        self.error
    }

    /// Detail of the last parse error.
    pub fn detailed_error(&self) -> &str {
        &self.detailed_error
    }

    /// Replace the primary decrypter.
    pub fn set_decrypter(&mut self, level: EncryptionLevel, decrypter: Box<dyn Decrypter>) {
        self.decrypter = decrypter;
        self.decrypter_level = level;
    }

    /// Install a decrypter tried when the primary one fails.
    ///
    /// With `latch_once_used`, the first successful use promotes it to primary
    /// and the old primary is discarded; otherwise the two swap roles.
    pub fn set_alternative_decrypter(
        &mut self,
        level: EncryptionLevel,
        decrypter: Box<dyn Decrypter>,
        latch_once_used: bool,
    ) {
        self.alternative_decrypter = Some(AlternativeDecrypter {
            decrypter,
            level,
            latch_once_used,
        });
    }

    /// Level of the primary decrypter.
    pub fn decrypter_level(&self) -> EncryptionLevel {
        self.decrypter_level
    }

    fn set_error(&mut self, error: &Error) {
        self.error = error.code();
        self.detailed_error = match error {
            Error::Framing { details, .. } => details.clone(),
            other => other.to_string(),
        };
    }

    fn decrypt_payload(
        &mut self,
        packet_number: PacketNumber,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Option<(EncryptionLevel, Vec<u8>)> {
        if let Ok(plaintext) =
            self.decrypter
                .decrypt_packet(packet_number, associated_data, ciphertext)
        {
            return Some((self.decrypter_level, plaintext));
        }
        let alternative = self.alternative_decrypter.as_ref()?;
        let plaintext = alternative
            .decrypter
            .decrypt_packet(packet_number, associated_data, ciphertext)
            .ok()?;
        let level = alternative.level;
        if let Some(alternative) = self.alternative_decrypter.take() {
            if alternative.latch_once_used {
                self.decrypter = alternative.decrypter;
                self.decrypter_level = alternative.level;
            } else {
                let old = std::mem::replace(&mut self.decrypter, alternative.decrypter);
                let old_level = std::mem::replace(&mut self.decrypter_level, alternative.level);
                self.alternative_decrypter = Some(AlternativeDecrypter {
                    decrypter: old,
                    level: old_level,
                    latch_once_used: false,
                });
            }
        }
        Some((level, plaintext))
    }

    /// Serialize the header and frames of a data packet.
    ///
    /// Returns the authenticated public header and the plaintext to seal
    /// (private header followed by frames).
    pub fn build_data_packet(header: &PacketHeader, frames: &[Frame]) -> Result<(BytesMut, BytesMut)> {
        if frames.is_empty() {
            return Err(Error::framing(ErrorCode::MissingPayload, "Packet has no frames."));
        }
        let mut public = BytesMut::new();
        header.encode_public(&mut public);
        let mut body = BytesMut::with_capacity(2 + frames.iter().map(Frame::encoded_len).sum::<usize>());
        header.encode_private(&mut body);
        for frame in frames {
            frame.encode(&mut body);
        }
        Ok((public, body))
    }

    /// Serialize the header and redundancy of an FEC packet.
    pub fn build_fec_packet(header: &PacketHeader, redundancy: &[u8]) -> (BytesMut, BytesMut) {
        debug_assert!(header.fec_flag && header.is_in_fec_group);
        let mut public = BytesMut::new();
        header.encode_public(&mut public);
        let mut body = BytesMut::with_capacity(2 + redundancy.len());
        header.encode_private(&mut body);
        body.put_slice(redundancy);
        (public, body)
    }

    /// Serialize a version negotiation packet.
    pub fn build_version_negotiation_packet(
        connection_id: ConnectionId,
        versions: &[QuicVersion],
    ) -> Bytes {
        let header = PublicHeader {
            connection_id,
            reset_flag: false,
            version_flag: true,
            versions: versions.to_vec(),
        };
        let mut buf = BytesMut::with_capacity(PUBLIC_FLAGS_AND_ID_SIZE + VERSION_SIZE * versions.len());
        header.encode(&mut buf);
        buf.freeze()
    }

    /// Serialize a public reset packet.
    pub fn build_public_reset_packet(packet: &PublicResetPacket) -> Bytes {
        let mut buf = BytesMut::with_capacity(PUBLIC_FLAGS_AND_ID_SIZE + PUBLIC_RESET_BODY_SIZE);
        buf.put_u8(public_flags::RESET);
        buf.put_u64(packet.public_header.connection_id);
        buf.put_u64(packet.nonce_proof);
        buf.put_u64(packet.rejected_packet_number);
        buf.freeze()
    }
}

fn raise_error<V: FramerVisitor + ?Sized>(visitor: &mut V, error: Error) -> bool {
    debug!("framer error: {}", error);
    visitor.framer_mut().set_error(&error);
    visitor.on_error(&error);
    false
}

fn header_error(details: &str) -> Error {
    Error::framing(ErrorCode::InvalidPacketHeader, details.to_string())
}

/// Parse one received packet, reporting to `visitor`.
///
/// Returns `false` if parsing failed, in which case `on_error` was called.
pub fn process_packet<V: FramerVisitor + ?Sized>(visitor: &mut V, packet: &[u8]) -> bool {
    visitor.on_packet();

    let mut reader = packet;
    if reader.len() < PUBLIC_FLAGS_AND_ID_SIZE {
        return raise_error(visitor, header_error("Unable to read public flags."));
    }
    let flags = reader.get_u8();
    if flags & !public_flags::ALL != 0 {
        return raise_error(visitor, header_error("Illegal public flags value."));
    }
    let mut public_header = PublicHeader {
        connection_id: reader.get_u64(),
        reset_flag: flags & public_flags::RESET != 0,
        version_flag: flags & public_flags::VERSION != 0,
        versions: Vec::new(),
    };

    let perspective = visitor.framer().perspective();
    if public_header.reset_flag {
        if !visitor.on_unauthenticated_public_header(&public_header) {
            return true;
        }
        if reader.len() < PUBLIC_RESET_BODY_SIZE {
            return raise_error(
                visitor,
                Error::framing(
                    ErrorCode::InvalidPublicResetPacket,
                    "Unable to read public reset.",
                ),
            );
        }
        let reset = PublicResetPacket {
            nonce_proof: reader.get_u64(),
            rejected_packet_number: reader.get_u64(),
            public_header,
        };
        visitor.on_public_reset_packet(&reset);
        return true;
    }

    if public_header.version_flag && perspective == Perspective::Client {
        if reader.is_empty() || reader.len() % VERSION_SIZE != 0 {
            return raise_error(
                visitor,
                Error::framing(
                    ErrorCode::InvalidVersionNegotiationPacket,
                    "Unable to read supported versions.",
                ),
            );
        }
        while reader.has_remaining() {
            public_header.versions.push(QuicVersion(reader.get_u32()));
        }
        if !visitor.on_unauthenticated_public_header(&public_header) {
            return true;
        }
        let negotiation = VersionNegotiationPacket {
            connection_id: public_header.connection_id,
            versions: public_header.versions,
        };
        visitor.on_version_negotiation_packet(&negotiation);
        return true;
    }

    if public_header.version_flag {
        if reader.len() < VERSION_SIZE {
            return raise_error(visitor, header_error("Unable to read protocol version."));
        }
        public_header.versions.push(QuicVersion(reader.get_u32()));
    }

    if !visitor.on_unauthenticated_public_header(&public_header) {
        return true;
    }

    if perspective == Perspective::Server && public_header.version_flag {
        let received = public_header.versions[0];
        if received != visitor.framer().version() && !visitor.on_protocol_version_mismatch(received) {
            return true;
        }
    }

    if reader.len() < PACKET_NUMBER_SIZE {
        return raise_error(visitor, header_error("Unable to read packet number."));
    }
    let packet_number = reader.get_u64();
    let header_len = packet.len() - reader.len();
    let mut header = PacketHeader {
        public_header,
        packet_number,
        ..PacketHeader::default()
    };

    if !visitor.on_unauthenticated_header(&header) {
        return true;
    }

    let associated_data = &packet[..header_len];
    let Some((level, plaintext)) =
        visitor
            .framer_mut()
            .decrypt_payload(packet_number, associated_data, reader)
    else {
        return raise_error(
            visitor,
            Error::framing(ErrorCode::DecryptionFailure, "Unable to decrypt payload."),
        );
    };
    visitor.on_decrypted_packet(level);

    let mut body = plaintext.as_slice();
    if body.is_empty() {
        return raise_error(visitor, header_error("Unable to read private flags."));
    }
    let private = body.get_u8();
    if private & !private_flags::ALL != 0 {
        return raise_error(visitor, header_error("Illegal private flags value."));
    }
    header.entropy_flag = private & private_flags::ENTROPY != 0;
    header.fec_flag = private & private_flags::FEC != 0;
    header.is_in_fec_group = private & private_flags::FEC_GROUP != 0;
    if header.fec_flag && !header.is_in_fec_group {
        return raise_error(visitor, header_error("FEC packet without an FEC group."));
    }
    if header.is_in_fec_group {
        if body.is_empty() {
            return raise_error(visitor, header_error("Unable to read first fec protected packet offset."));
        }
        let offset = body.get_u8() as u64;
        if offset >= packet_number || (header.fec_flag && offset == 0) {
            return raise_error(visitor, header_error("Illegal FEC group offset."));
        }
        header.fec_group = packet_number - offset;
    }
    header.entropy_hash = packet_entropy_hash(header.entropy_flag, packet_number);

    if !visitor.on_packet_header(&header) {
        return true;
    }

    if header.fec_flag {
        let fec = FecData {
            fec_group: header.fec_group,
            redundancy: body.to_vec(),
        };
        visitor.on_fec_data(&fec);
    } else {
        if header.is_in_fec_group {
            visitor.on_fec_protected_payload(body);
        }
        if !process_frame_data(visitor, body) {
            return false;
        }
    }

    visitor.on_packet_complete();
    true
}

/// Process a packet reconstructed from an FEC group.
///
/// `payload` is the frame data that followed the private header.
pub fn process_revived_packet<V: FramerVisitor + ?Sized>(
    visitor: &mut V,
    header: &mut PacketHeader,
    payload: &[u8],
) -> bool {
    visitor.on_revived_packet();
    header.entropy_hash = packet_entropy_hash(header.entropy_flag, header.packet_number);

    if !visitor.on_packet_header(header) {
        return true;
    }
    if !process_frame_data(visitor, payload) {
        return false;
    }
    visitor.on_packet_complete();
    true
}

fn process_frame_data<V: FramerVisitor + ?Sized>(visitor: &mut V, payload: &[u8]) -> bool {
    let mut reader = payload;
    if reader.is_empty() {
        return raise_error(
            visitor,
            Error::framing(ErrorCode::MissingPayload, "Packet has no frames."),
        );
    }

    while reader.has_remaining() {
        let ty = reader.get_u8();
        if ty == frame_type::PADDING {
            return true;
        }
        let frame = match Frame::decode_body(ty, &mut reader) {
            Ok(frame) => frame,
            Err(error) => return raise_error(visitor, error),
        };
        let keep_going = match &frame {
            Frame::Stream(f) => visitor.on_stream_frame(f),
            Frame::Ack(f) => visitor.on_ack_frame(f),
            Frame::StopWaiting(f) => visitor.on_stop_waiting_frame(f),
            Frame::Ping | Frame::MtuDiscovery => visitor.on_ping_frame(),
            Frame::RstStream(f) => visitor.on_rst_stream_frame(f),
            Frame::ConnectionClose(f) => visitor.on_connection_close_frame(f),
            Frame::GoAway(f) => visitor.on_go_away_frame(f),
            Frame::WindowUpdate(f) => visitor.on_window_update_frame(f),
            Frame::Blocked(f) => visitor.on_blocked_frame(f),
            Frame::Padding(_) => true,
        };
        if !keep_going {
            trace!("Visitor asked to stop further processing.");
            return true;
        }
    }
    true
}
