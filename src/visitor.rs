//! Observers of connection events.
//!
//! [`ConnectionVisitor`] is the upper layer (the session): it receives
//! stream-level frames and lifecycle events, and answers a few questions the
//! connection asks about pending work. [`DebugVisitor`] is optional and sees
//! every packet and frame; all of its methods default to doing nothing.
//!
//! Visitors only observe. They never call back into the connection from a
//! callback.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::ErrorCode;
use crate::generator::SerializedPacket;
use crate::sent_packet_manager::CachedNetworkParameters;
use crate::types::{
    ConnectionId, EncryptionLevel, PacketNumber, PeerAddressChangeType, Perspective, QuicVersion,
    TransmissionType,
};
use crate::wire::{
    AckFrame, BlockedFrame, ConnectionCloseFrame, FecData, GoAwayFrame, PacketHeader,
    PublicResetPacket, RstStreamFrame, StopWaitingFrame, StreamFrame, VersionNegotiationPacket,
    WindowUpdateFrame,
};

/// Upper layer of a connection.
pub trait ConnectionVisitor {
    /// Stream data arrived.
    fn on_stream_frame(&mut self, frame: &StreamFrame);

    /// The peer reset a stream.
    fn on_rst_stream(&mut self, frame: &RstStreamFrame);

    /// The peer is going away.
    fn on_go_away(&mut self, frame: &GoAwayFrame);

    /// The peer raised a flow control window.
    fn on_window_update_frame(&mut self, frame: &WindowUpdateFrame);

    /// The peer is flow control blocked.
    fn on_blocked_frame(&mut self, frame: &BlockedFrame);

    /// The connection can take more data.
    fn on_can_write(&mut self);

    /// The writer blocked.
    fn on_write_blocked(&mut self);

    /// The connection closed. Called exactly once.
    fn on_connection_closed(&mut self, error: ErrorCode, from_peer: bool);

    /// Version negotiation finished with `version`.
    fn on_successful_version_negotiation(&mut self, version: QuicVersion);

    /// The peer address changed.
    fn on_connection_migration(&mut self, change_type: PeerAddressChangeType);

    /// The congestion window changed.
    fn on_congestion_window_change(&mut self, now: Instant);

    /// Whether handshake data is waiting to be sent.
    fn has_pending_handshake(&self) -> bool;

    /// Whether streams other than the crypto stream are open.
    fn has_open_dynamic_streams(&self) -> bool;

    /// Whether the session has data to write.
    fn willing_and_able_to_write(&self) -> bool;
}

/// Optional observer of everything the connection does.
#[allow(unused_variables)]
pub trait DebugVisitor {
    /// A packet was written.
    fn on_packet_sent(
        &mut self,
        packet: &SerializedPacket,
        original_packet_number: Option<PacketNumber>,
        transmission_type: TransmissionType,
        sent_time: Instant,
    ) {
    }

    /// A packet arrived.
    fn on_packet_received(&mut self, self_address: SocketAddr, peer_address: SocketAddr, packet: &[u8]) {}

    /// A packet carried another connection's id.
    fn on_incorrect_connection_id(&mut self, connection_id: ConnectionId) {}

    /// A packet could not be decrypted and was dropped.
    fn on_undecryptable_packet(&mut self) {}

    /// A packet was received twice.
    fn on_duplicate_packet(&mut self, packet_number: PacketNumber) {}

    /// A packet carried an unexpected version.
    fn on_protocol_version_mismatch(&mut self, version: QuicVersion) {}

    /// A version negotiation packet arrived.
    fn on_version_negotiation_packet(&mut self, packet: &VersionNegotiationPacket) {}

    /// Version negotiation finished.
    fn on_successful_version_negotiation(&mut self, version: QuicVersion) {}

    /// A packet header was authenticated.
    fn on_packet_header(&mut self, header: &PacketHeader) {}

    /// A packet decrypted at `level`.
    fn on_decrypted_packet(&mut self, level: EncryptionLevel) {}

    /// Stream frame.
    fn on_stream_frame(&mut self, frame: &StreamFrame) {}

    /// Ack frame.
    fn on_ack_frame(&mut self, frame: &AckFrame) {}

    /// Stop waiting frame.
    fn on_stop_waiting_frame(&mut self, frame: &StopWaitingFrame) {}

    /// Ping frame.
    fn on_ping_frame(&mut self) {}

    /// Rst stream frame.
    fn on_rst_stream_frame(&mut self, frame: &RstStreamFrame) {}

    /// Connection close frame.
    fn on_connection_close_frame(&mut self, frame: &ConnectionCloseFrame) {}

    /// Go away frame.
    fn on_go_away_frame(&mut self, frame: &GoAwayFrame) {}

    /// Window update frame.
    fn on_window_update_frame(&mut self, frame: &WindowUpdateFrame) {}

    /// Blocked frame.
    fn on_blocked_frame(&mut self, frame: &BlockedFrame) {}

    /// FEC redundancy arrived.
    fn on_fec_data(&mut self, fec: &FecData) {}

    /// Public reset packet.
    fn on_public_reset_packet(&mut self, packet: &PublicResetPacket) {}

    /// A packet was rebuilt from its FEC group.
    fn on_revived_packet(&mut self, header: &PacketHeader, payload: &[u8]) {}

    /// The RTT estimate changed.
    fn on_rtt_changed(&mut self, smoothed_rtt: Duration) {}

    /// Path state was exported.
    fn on_send_connection_state(&mut self, params: &CachedNetworkParameters) {}

    /// Path state was imported.
    fn on_resume_connection_state(&mut self, params: &CachedNetworkParameters) {}

    /// The connection closed.
    fn on_connection_closed(&mut self, error: ErrorCode, from_peer: bool) {}
}

/// Debug visitor that logs every event through `tracing`.
#[derive(Debug, Clone, Copy)]
pub struct LoggingDebugVisitor {
    perspective: Perspective,
}

impl LoggingDebugVisitor {
    /// Logger whose lines are prefixed with `perspective`.
    pub fn new(perspective: Perspective) -> Self {
        Self { perspective }
    }

    fn prefix(&self) -> &'static str {
        self.perspective.log_prefix()
    }
}

impl DebugVisitor for LoggingDebugVisitor {
    fn on_packet_sent(
        &mut self,
        packet: &SerializedPacket,
        original_packet_number: Option<PacketNumber>,
        transmission_type: TransmissionType,
        _sent_time: Instant,
    ) {
        trace!(
            "{}sent packet {} ({} bytes, {:?}, {:?}, original {:?})",
            self.prefix(),
            packet.packet_number,
            packet.len(),
            packet.encryption_level,
            transmission_type,
            original_packet_number
        );
    }

    fn on_packet_received(&mut self, self_address: SocketAddr, peer_address: SocketAddr, packet: &[u8]) {
        trace!(
            "{}received {} bytes from {} on {}",
            self.prefix(),
            packet.len(),
            peer_address,
            self_address
        );
    }

    fn on_incorrect_connection_id(&mut self, connection_id: ConnectionId) {
        debug!("{}packet for connection {} dropped", self.prefix(), connection_id);
    }

    fn on_undecryptable_packet(&mut self) {
        debug!("{}undecryptable packet dropped", self.prefix());
    }

    fn on_duplicate_packet(&mut self, packet_number: PacketNumber) {
        debug!("{}duplicate packet {}", self.prefix(), packet_number);
    }

    fn on_protocol_version_mismatch(&mut self, version: QuicVersion) {
        debug!("{}version mismatch: {}", self.prefix(), version);
    }

    fn on_version_negotiation_packet(&mut self, packet: &VersionNegotiationPacket) {
        debug!("{}version negotiation offering {:?}", self.prefix(), packet.versions);
    }

    fn on_successful_version_negotiation(&mut self, version: QuicVersion) {
        debug!("{}negotiated version {}", self.prefix(), version);
    }

    fn on_packet_header(&mut self, header: &PacketHeader) {
        trace!("{}packet header {:?}", self.prefix(), header);
    }

    fn on_decrypted_packet(&mut self, level: EncryptionLevel) {
        trace!("{}decrypted at {:?}", self.prefix(), level);
    }

    fn on_stream_frame(&mut self, frame: &StreamFrame) {
        trace!(
            "{}stream frame: stream {} offset {} len {} fin {}",
            self.prefix(),
            frame.stream_id,
            frame.offset,
            frame.data.len(),
            frame.fin
        );
    }

    fn on_ack_frame(&mut self, frame: &AckFrame) {
        trace!(
            "{}ack frame: largest {} missing {} truncated {}",
            self.prefix(),
            frame.largest_observed,
            frame.missing_packets.len(),
            frame.is_truncated
        );
    }

    fn on_stop_waiting_frame(&mut self, frame: &StopWaitingFrame) {
        trace!("{}stop waiting: least unacked {}", self.prefix(), frame.least_unacked);
    }

    fn on_ping_frame(&mut self) {
        trace!("{}ping frame", self.prefix());
    }

    fn on_rst_stream_frame(&mut self, frame: &RstStreamFrame) {
        debug!("{}rst stream {}: {}", self.prefix(), frame.stream_id, frame.error_code);
    }

    fn on_connection_close_frame(&mut self, frame: &ConnectionCloseFrame) {
        debug!(
            "{}connection close frame: {} {}",
            self.prefix(),
            frame.error_code,
            frame.error_details
        );
    }

    fn on_go_away_frame(&mut self, frame: &GoAwayFrame) {
        debug!("{}go away: {} {}", self.prefix(), frame.error_code, frame.reason_phrase);
    }

    fn on_window_update_frame(&mut self, frame: &WindowUpdateFrame) {
        trace!("{}window update: stream {} offset {}", self.prefix(), frame.stream_id, frame.byte_offset);
    }

    fn on_blocked_frame(&mut self, frame: &BlockedFrame) {
        trace!("{}blocked: stream {}", self.prefix(), frame.stream_id);
    }

    fn on_fec_data(&mut self, fec: &FecData) {
        trace!("{}FEC data for group {}", self.prefix(), fec.fec_group);
    }

    fn on_public_reset_packet(&mut self, packet: &PublicResetPacket) {
        debug!("{}public reset for packet {}", self.prefix(), packet.rejected_packet_number);
    }

    fn on_revived_packet(&mut self, header: &PacketHeader, payload: &[u8]) {
        debug!("{}revived packet {} ({} bytes)", self.prefix(), header.packet_number, payload.len());
    }

    fn on_rtt_changed(&mut self, smoothed_rtt: Duration) {
        trace!("{}smoothed rtt {:?}", self.prefix(), smoothed_rtt);
    }

    fn on_send_connection_state(&mut self, params: &CachedNetworkParameters) {
        debug!("{}exported connection state {:?}", self.prefix(), params);
    }

    fn on_resume_connection_state(&mut self, params: &CachedNetworkParameters) {
        debug!("{}resumed connection state {:?}", self.prefix(), params);
    }

    fn on_connection_closed(&mut self, error: ErrorCode, from_peer: bool) {
        debug!(
            "{}connection closed: {} (from peer: {})",
            self.prefix(),
            error,
            from_peer
        );
    }
}
