//! The connection state machine.
//!
//! A [`Connection`] owns everything about one peer: the framer that parses
//! inbound packets, the generator that assembles outbound ones, the send and
//! receive bookkeeping, the receive-side FEC groups and the alarm set.
//!
//! ```text
//!  process_udp_packet ─► Framer ─► FramerVisitor callbacks ─┬─► ReceivedPacketManager
//!                                      (ingest.rs)          ├─► FEC group table
//!                                                           ├─► SentPacketManager (acks)
//!                                                           └─► ConnectionVisitor
//!
//!  send_* ─► PacketBundler ─► PacketGenerator ─► send_or_queue_packet ─► PacketWriter
//!                                                    (write.rs)
//!  on_alarm(kind) ─► alarms.rs
//! ```
//!
//! Everything runs on the caller's thread. Visitors are told what happened
//! and never call back into the connection from a callback; once the
//! connection is closed every entry point is a no-op.

mod alarms;
mod guards;
mod ingest;
mod write;

#[cfg(test)]
mod tests;

pub use guards::{PacketBundler, RetransmissionScheduler};

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use crate::alarm::{AlarmKind, AlarmSet};
use crate::clock::{Clock, ConnectionHelper};
use crate::config::ConnectionConfig;
use crate::crypto::{Decrypter, Encrypter};
use crate::entropy::SentEntropyManager;
use crate::error::{ErrorCode, Result, RstStreamErrorCode};
use crate::fec::FecGroup;
use crate::generator::{PacketGenerator, SerializedPacket};
use crate::received_packet_manager::ReceivedPacketManager;
use crate::sent_packet_manager::{
    CachedNetworkParameters, DefaultSentPacketManager, SentPacketManager,
};
use crate::stats::ConnectionStats;
use crate::types::{
    AckBundling, ByteCount, ConnectionId, ConsumedData, EncryptionLevel, FecGroupNumber,
    FecProtection, HasRetransmittableData, IsHandshake, PacketCount, PacketNumber,
    PeerAddressChangeType, Perspective, QuicVersion, StreamId, StreamOffset, TransmissionType,
    VersionNegotiationState, CRYPTO_STREAM_ID, DEFAULT_MAX_PACKET_SIZE,
    DEFAULT_SERVER_MAX_PACKET_SIZE, MAX_PACKET_SIZE, PACKETS_BETWEEN_MTU_PROBES_BASE,
};
use crate::visitor::{ConnectionVisitor, DebugVisitor};
use crate::wire::{
    BlockedFrame, Frame, Framer, GoAwayFrame, PacketHeader, RstStreamFrame, StopWaitingFrame,
    WindowUpdateFrame,
};
use crate::writer::PacketWriter;

/// A serialized packet waiting to be written.
#[derive(Debug)]
pub(crate) struct QueuedPacket {
    pub(crate) serialized_packet: SerializedPacket,
    pub(crate) encryption_level: EncryptionLevel,
    pub(crate) transmission_type: TransmissionType,
    pub(crate) original_packet_number: Option<PacketNumber>,
}

impl QueuedPacket {
    fn new(
        serialized_packet: SerializedPacket,
        encryption_level: EncryptionLevel,
        transmission_type: TransmissionType,
        original_packet_number: Option<PacketNumber>,
    ) -> Self {
        Self {
            serialized_packet,
            encryption_level,
            transmission_type,
            original_packet_number,
        }
    }
}

/// One connection to one peer.
pub struct Connection {
    connection_id: ConnectionId,
    perspective: Perspective,
    config: ConnectionConfig,

    framer: Framer,
    generator: PacketGenerator,
    sent_packet_manager: Box<dyn SentPacketManager>,
    received_packet_manager: ReceivedPacketManager,
    sent_entropy_manager: SentEntropyManager,
    fec_groups: BTreeMap<FecGroupNumber, FecGroup>,
    alarms: AlarmSet,

    writer: Box<dyn PacketWriter>,
    visitor: Box<dyn ConnectionVisitor>,
    debug_visitor: Option<Box<dyn DebugVisitor>>,
    clock: Rc<dyn Clock>,
    stats: ConnectionStats,

    self_address: Option<SocketAddr>,
    last_self_address: Option<SocketAddr>,
    peer_address: SocketAddr,
    migrating_peer_address: Option<SocketAddr>,
    self_address_changed: bool,
    peer_change_type: PeerAddressChangeType,

    encryption_level: EncryptionLevel,
    has_forward_secure_encrypter: bool,
    first_required_forward_secure_packet: PacketNumber,

    // State of the packet being processed.
    last_header: PacketHeader,
    last_size: ByteCount,
    last_packet_decrypted: bool,
    last_packet_revived: bool,
    last_decrypted_packet_level: EncryptionLevel,
    should_last_packet_instigate_acks: bool,
    last_stop_waiting_frame: Option<StopWaitingFrame>,
    largest_seen_packet_with_ack: PacketNumber,
    largest_seen_packet_with_stop_waiting: PacketNumber,
    largest_received_packet_size: ByteCount,

    undecryptable_packets: VecDeque<Bytes>,
    max_undecryptable_packets: usize,
    queued_packets: VecDeque<QueuedPacket>,
    termination_packets: Vec<Bytes>,
    pending_version_negotiation_packet: bool,

    ack_queued: bool,
    num_packets_received_since_last_ack_sent: PacketCount,
    stop_waiting_count: usize,

    delay_setting_retransmission_alarm: bool,
    pending_retransmission_alarm: bool,

    idle_network_timeout: Duration,
    overall_connection_timeout: Option<Duration>,
    creation_time: Instant,
    time_of_last_received_packet: Instant,
    time_of_last_sent_new_packet: Instant,
    last_send_for_timeout: Instant,

    packet_number_of_last_sent_packet: PacketNumber,
    version_negotiation_state: VersionNegotiationState,
    server_supported_versions: Vec<QuicVersion>,

    mtu_discovery_target: ByteCount,
    mtu_probe_count: usize,
    packets_between_mtu_probes: PacketCount,
    next_mtu_probe_at: PacketNumber,

    connected: bool,
    goaway_sent: bool,
    goaway_received: bool,
    silent_close_enabled: bool,
    save_crypto_packets: bool,
}

impl Connection {
    /// Create a connection with the default configuration.
    ///
    /// The framer starts at the first (most preferred) of
    /// `supported_versions`.
    pub fn new(
        connection_id: ConnectionId,
        peer_address: SocketAddr,
        helper: &mut dyn ConnectionHelper,
        writer: Box<dyn PacketWriter>,
        visitor: Box<dyn ConnectionVisitor>,
        perspective: Perspective,
        supported_versions: Vec<QuicVersion>,
    ) -> Self {
        let config = ConnectionConfig::default();
        let clock = helper.clock();
        let now = clock.approximate_now();
        let framer = Framer::new(supported_versions, perspective);
        let generator = PacketGenerator::new(
            connection_id,
            perspective,
            framer.version(),
            DEFAULT_MAX_PACKET_SIZE,
            helper.random_generator(),
        );
        debug!(
            "{}created connection {} with {}",
            perspective.log_prefix(),
            connection_id,
            peer_address
        );

        let mut connection = Self {
            connection_id,
            perspective,
            sent_packet_manager: Box::new(DefaultSentPacketManager::new(perspective, &config)),
            max_undecryptable_packets: config.max_undecryptable_packets,
            config,
            framer,
            generator,
            received_packet_manager: ReceivedPacketManager::new(),
            sent_entropy_manager: SentEntropyManager::new(),
            fec_groups: BTreeMap::new(),
            alarms: AlarmSet::new(),
            writer,
            visitor,
            debug_visitor: None,
            clock,
            stats: ConnectionStats::new(now),
            self_address: None,
            last_self_address: None,
            peer_address,
            migrating_peer_address: None,
            self_address_changed: false,
            peer_change_type: PeerAddressChangeType::NoChange,
            encryption_level: EncryptionLevel::None,
            has_forward_secure_encrypter: false,
            first_required_forward_secure_packet: 0,
            last_header: PacketHeader::default(),
            last_size: 0,
            last_packet_decrypted: false,
            last_packet_revived: false,
            last_decrypted_packet_level: EncryptionLevel::None,
            should_last_packet_instigate_acks: false,
            last_stop_waiting_frame: None,
            largest_seen_packet_with_ack: 0,
            largest_seen_packet_with_stop_waiting: 0,
            largest_received_packet_size: 0,
            undecryptable_packets: VecDeque::new(),
            queued_packets: VecDeque::new(),
            termination_packets: Vec::new(),
            pending_version_negotiation_packet: false,
            ack_queued: false,
            num_packets_received_since_last_ack_sent: 0,
            stop_waiting_count: 0,
            delay_setting_retransmission_alarm: false,
            pending_retransmission_alarm: false,
            idle_network_timeout: Duration::ZERO,
            overall_connection_timeout: None,
            creation_time: now,
            time_of_last_received_packet: now,
            time_of_last_sent_new_packet: now,
            last_send_for_timeout: now,
            packet_number_of_last_sent_packet: 0,
            version_negotiation_state: VersionNegotiationState::StartNegotiation,
            server_supported_versions: Vec::new(),
            mtu_discovery_target: 0,
            mtu_probe_count: 0,
            packets_between_mtu_probes: PACKETS_BETWEEN_MTU_PROBES_BASE,
            next_mtu_probe_at: PACKETS_BETWEEN_MTU_PROBES_BASE,
            connected: true,
            goaway_sent: false,
            goaway_received: false,
            silent_close_enabled: false,
            save_crypto_packets: false,
        };

        let initial_length = match perspective {
            Perspective::Server => DEFAULT_SERVER_MAX_PACKET_SIZE,
            Perspective::Client => DEFAULT_MAX_PACKET_SIZE,
        };
        connection.set_max_packet_length(initial_length);
        let config = connection.config.clone();
        connection.set_from_config(&config);
        connection
    }

    /// Apply `config`: timeouts, loss recovery settings, undecryptable
    /// queue size, FEC policy and the MTU discovery target.
    pub fn set_from_config(&mut self, config: &ConnectionConfig) {
        if config.negotiated {
            self.set_network_timeouts(None, config.idle_connection_state_lifetime);
            if config.silent_close {
                self.silent_close_enabled = true;
            }
        } else {
            self.set_network_timeouts(
                Some(config.max_time_before_handshake),
                config.max_idle_time_before_handshake,
            );
        }
        self.sent_packet_manager.set_from_config(config);
        self.max_undecryptable_packets = config.max_undecryptable_packets;
        self.save_crypto_packets |= config.save_crypto_packets_as_termination_packets;
        self.generator.set_fec_policy(
            config.effective_fec_send_policy(),
            config.max_packets_per_fec_group,
        );
        if let Some(target) = config.mtu_discovery_target() {
            self.set_mtu_discovery_target(target);
        }
        self.config = config.clone();
    }

    /// Replace the sent-packet manager.
    pub fn set_sent_packet_manager(&mut self, manager: Box<dyn SentPacketManager>) {
        self.sent_packet_manager = manager;
    }

    /// Install a debug visitor.
    pub fn set_debug_visitor(&mut self, debug_visitor: Box<dyn DebugVisitor>) {
        self.debug_visitor = Some(debug_visitor);
    }

    /// Whether the connection is still open.
    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Connection id.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Which end of the connection this is.
    pub fn perspective(&self) -> Perspective {
        self.perspective
    }

    /// Version currently spoken.
    pub fn version(&self) -> QuicVersion {
        self.framer.version()
    }

    /// Versions this end supports, most preferred first.
    pub fn supported_versions(&self) -> &[QuicVersion] {
        self.framer.supported_versions()
    }

    /// Versions the server offered in its version negotiation packet.
    pub fn server_supported_versions(&self) -> &[QuicVersion] {
        &self.server_supported_versions
    }

    /// Progress of version negotiation.
    pub fn version_negotiation_state(&self) -> VersionNegotiationState {
        self.version_negotiation_state
    }

    /// Current peer address.
    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    /// Local address, once a packet has authenticated.
    pub fn self_address(&self) -> Option<SocketAddr> {
        self.self_address
    }

    /// Default level outgoing packets are sealed at.
    pub fn encryption_level(&self) -> EncryptionLevel {
        self.encryption_level
    }

    /// Largest packet the connection builds.
    pub fn max_packet_length(&self) -> ByteCount {
        self.generator.max_packet_length()
    }

    /// Change the largest packet built, bounded by the writer and the
    /// protocol maximum.
    pub fn set_max_packet_length(&mut self, length: ByteCount) {
        let limited = self.limit_max_packet_size(length);
        self.generator.set_max_packet_length(limited);
    }

    /// Probe for a larger path MTU, up to `target`.
    pub fn set_mtu_discovery_target(&mut self, target: ByteCount) {
        self.mtu_discovery_target = self.limit_max_packet_size(target);
    }

    /// Keep packets carrying crypto stream data as termination packets.
    pub fn enable_saving_crypto_packets(&mut self) {
        self.save_crypto_packets = true;
    }

    /// Close frames (and saved crypto packets) serialized so far, for
    /// replaying to a peer after the connection is gone.
    pub fn termination_packets(&self) -> &[Bytes] {
        &self.termination_packets
    }

    /// Packets waiting for the writer.
    pub fn num_queued_packets(&self) -> usize {
        self.queued_packets.len()
    }

    /// Whether anything is waiting to be written.
    pub fn has_queued_data(&self) -> bool {
        self.pending_version_negotiation_packet
            || !self.queued_packets.is_empty()
            || self.generator.has_queued_frames()
    }

    /// Whether a go-away frame was sent.
    pub fn goaway_sent(&self) -> bool {
        self.goaway_sent
    }

    /// Whether the peer sent a go-away frame.
    pub fn goaway_received(&self) -> bool {
        self.goaway_received
    }

    /// Sent-packet manager, for inspection.
    pub fn sent_packet_manager(&self) -> &dyn SentPacketManager {
        self.sent_packet_manager.as_ref()
    }

    /// Received-packet bookkeeping, for inspection.
    pub fn received_packet_manager(&self) -> &ReceivedPacketManager {
        &self.received_packet_manager
    }

    /// Statistics, with the estimates refreshed.
    pub fn stats(&mut self) -> &ConnectionStats {
        let rtt = self.sent_packet_manager.rtt_stats();
        let min_rtt = rtt.min_rtt();
        self.stats.min_rtt = if min_rtt.is_zero() {
            rtt.initial_rtt()
        } else {
            min_rtt
        };
        self.stats.srtt = rtt.smoothed_or_initial_rtt();
        self.stats.estimated_bandwidth = self.sent_packet_manager.bandwidth_estimate();
        self.stats.bytes_processed = self.received_packet_manager.bytes_received();
        self.stats.max_packet_size = self.generator.max_packet_length();
        self.stats.max_received_packet_size = self.largest_received_packet_size;
        self.stats.rto_count = self.sent_packet_manager.rto_count();
        self.stats.tlp_count = self.sent_packet_manager.tlp_count();
        &self.stats
    }

    /// Install the encrypter for `level`.
    ///
    /// Installing the forward-secure encrypter schedules the switch to
    /// forward-secure sending three congestion windows from now.
    pub fn set_encrypter(&mut self, level: EncryptionLevel, encrypter: Box<dyn Encrypter>) {
        self.generator.set_encrypter(level, encrypter);
        if level == EncryptionLevel::ForwardSecure {
            self.has_forward_secure_encrypter = true;
            let in_flight = self
                .sent_packet_manager
                .estimate_max_packets_in_flight(self.max_packet_length());
            self.first_required_forward_secure_packet =
                self.packet_number_of_last_sent_packet + 3 * in_flight;
        }
    }

    /// Seal new packets at `level`.
    pub fn set_default_encryption_level(&mut self, level: EncryptionLevel) {
        debug!("{}sending at {:?}", self.prefix(), level);
        self.encryption_level = level;
        self.generator.set_encryption_level(level);
    }

    /// Install the decrypter for `level`, replacing the current one.
    pub fn set_decrypter(&mut self, level: EncryptionLevel, decrypter: Box<dyn Decrypter>) {
        self.framer.set_decrypter(level, decrypter);
    }

    /// Install a decrypter tried when the current one fails.
    pub fn set_alternative_decrypter(
        &mut self,
        level: EncryptionLevel,
        decrypter: Box<dyn Decrypter>,
        latch_once_used: bool,
    ) {
        self.framer
            .set_alternative_decrypter(level, decrypter, latch_once_used);
    }

    /// Path state to seed a future connection with.
    pub fn cached_network_parameters(&mut self) -> CachedNetworkParameters {
        let params = self.sent_packet_manager.cached_network_parameters();
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_send_connection_state(&params);
        }
        params
    }

    /// Seed path state from a previous connection. Returns whether the
    /// parameters were used.
    pub fn resume_connection_state(
        &mut self,
        params: &CachedNetworkParameters,
        max_bandwidth_resumption: bool,
    ) -> bool {
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_resume_connection_state(params);
        }
        self.sent_packet_manager
            .resume_connection_state(params, max_bandwidth_resumption)
    }

    /// Number of open streams, for congestion control.
    pub fn set_num_open_streams(&mut self, num_streams: usize) {
        self.sent_packet_manager.set_num_open_streams(num_streams);
    }

    /// The crypto handshake completed.
    pub fn on_handshake_complete(&mut self) {
        self.sent_packet_manager.set_handshake_confirmed();
        // Clients ack the server's handshake message right away.
        if self.perspective == Perspective::Client
            && !self.ack_queued
            && self.received_packet_manager.ack_frame_updated()
        {
            let now = self.clock.approximate_now();
            let alarm = self.alarms.get_mut(AlarmKind::Ack);
            alarm.cancel();
            alarm.set(now);
        }
    }

    /// Send stream data, splitting it into as many packets as needed.
    ///
    /// Nothing is consumed while congestion control or the writer refuses
    /// non-handshake data.
    pub fn send_stream_data(
        &mut self,
        stream_id: StreamId,
        data: &[u8],
        offset: StreamOffset,
        fin: bool,
        fec_protection: FecProtection,
    ) -> ConsumedData {
        if !fin && data.is_empty() {
            warn!("{}attempt to send empty stream frame", self.prefix());
            return ConsumedData::new(0, false);
        }
        if !self.connected {
            return ConsumedData::default();
        }
        if self.config.never_write_unencrypted_data
            && stream_id != CRYPTO_STREAM_ID
            && self.encryption_level == EncryptionLevel::None
        {
            error!(
                "{}refusing to send stream {} data unencrypted",
                self.prefix(),
                stream_id
            );
            self.send_connection_close_with_details(
                ErrorCode::UnencryptedStreamData,
                "Cannot send stream data without encryption.",
            );
            return ConsumedData::new(0, false);
        }
        let handshake = if stream_id == CRYPTO_STREAM_ID {
            IsHandshake::Yes
        } else {
            IsHandshake::No
        };
        if !self.should_generate_packet(HasRetransmittableData::Yes, handshake) {
            return ConsumedData::default();
        }

        let mut scheduler = RetransmissionScheduler::new(self);
        let mut bundler = PacketBundler::new(&mut scheduler, AckBundling::BundlePendingAck);
        let consumed = bundler
            .with_generator(|g| g.consume_data(stream_id, data, offset, fin, fec_protection))
            .unwrap_or_default();
        consumed
    }

    /// Reset a stream.
    ///
    /// Unless the stream closed cleanly, retransmissions and queued packets
    /// carrying only this stream's data are dropped.
    pub fn send_rst_stream(
        &mut self,
        stream_id: StreamId,
        error: RstStreamErrorCode,
        bytes_written: StreamOffset,
    ) {
        if !self.connected {
            return;
        }
        let mut bundler = PacketBundler::new(self, AckBundling::BundlePendingAck);
        bundler.add_control_frame(Frame::RstStream(RstStreamFrame {
            stream_id,
            error_code: error,
            byte_offset: bytes_written,
        }));
        // Data of a cleanly closed stream must still reach the peer.
        if error == RstStreamErrorCode::NoError && bundler.version() > QuicVersion::V28 {
            return;
        }
        bundler
            .sent_packet_manager
            .cancel_retransmissions_for_stream(stream_id);
        bundler.queued_packets.retain_mut(|queued| {
            let Some(frames) = queued.serialized_packet.retransmittable_frames.as_mut() else {
                return true;
            };
            frames.remove_frames_for_stream(stream_id);
            !frames.is_empty()
        });
    }

    /// Raise a flow control window.
    pub fn send_window_update(&mut self, stream_id: StreamId, byte_offset: StreamOffset) {
        if !self.connected {
            return;
        }
        let mut bundler = PacketBundler::new(self, AckBundling::BundlePendingAck);
        bundler.add_control_frame(Frame::WindowUpdate(WindowUpdateFrame {
            stream_id,
            byte_offset,
        }));
    }

    /// Tell the peer a stream is flow control blocked.
    pub fn send_blocked(&mut self, stream_id: StreamId) {
        if !self.connected {
            return;
        }
        let mut bundler = PacketBundler::new(self, AckBundling::BundlePendingAck);
        bundler.add_control_frame(Frame::Blocked(BlockedFrame { stream_id }));
    }

    /// Tell the peer this end is going away. Sent at most once.
    pub fn send_goaway(
        &mut self,
        error: ErrorCode,
        last_good_stream_id: StreamId,
        reason: &str,
    ) {
        if !self.connected || self.goaway_sent {
            return;
        }
        debug!(
            "{}going away with error {} ({})",
            self.prefix(),
            error,
            reason
        );
        self.goaway_sent = true;
        let mut bundler = PacketBundler::new(self, AckBundling::BundlePendingAck);
        bundler.add_control_frame(Frame::GoAway(GoAwayFrame {
            error_code: error,
            last_good_stream_id,
            reason_phrase: reason.to_string(),
        }));
    }

    /// Send a ping.
    pub fn send_ping(&mut self) {
        if !self.connected {
            return;
        }
        let mut bundler = PacketBundler::new(self, AckBundling::BundlePendingAck);
        bundler.add_control_frame(Frame::Ping);
    }

    /// Send an ack and stop waiting frame now.
    pub fn send_ack(&mut self) {
        if !self.connected {
            return;
        }
        self.alarms.get_mut(AlarmKind::Ack).cancel();
        self.ack_queued = false;
        self.stop_waiting_count = 0;
        self.num_packets_received_since_last_ack_sent = 0;

        let now = self.clock.approximate_now();
        let ack = self
            .received_packet_manager
            .ack_frame_with_limit(now, self.generator.max_ack_missing_packets());
        let least_unacked = self.sent_packet_manager.least_unacked();
        let stop_waiting = StopWaitingFrame {
            entropy_hash: self
                .sent_entropy_manager
                .entropy_hash(least_unacked.saturating_sub(1)),
            least_unacked,
        };
        trace!(
            "{}sending ack: largest {} with {} missing",
            self.prefix(),
            ack.largest_observed,
            ack.missing_packets.len()
        );
        self.with_generator(|g| g.queue_ack(ack, Some(stop_waiting)));
        self.received_packet_manager.reset_ack_frame_updated();
    }

    /// Queue every unacked packet (or every initially encrypted one) for
    /// retransmission and write what can be written.
    pub fn retransmit_unacked_packets(&mut self, retransmission_type: TransmissionType) {
        if !self.connected {
            return;
        }
        self.sent_packet_manager
            .retransmit_unacked_packets(retransmission_type);
        self.write_if_not_blocked();
    }

    /// Stop retransmitting packets sent without encryption.
    pub fn neuter_unencrypted_packets(&mut self) {
        self.sent_packet_manager.neuter_unencrypted_packets();
        // Some unencrypted packets may have been the only ones in flight.
        self.set_retransmission_alarm();
    }

    fn add_control_frame(&mut self, frame: Frame) {
        self.with_generator(|g| g.add_control_frame(frame));
    }

    /// Run a generator operation and send whatever it sealed. A failure
    /// closes the connection.
    fn with_generator<T>(
        &mut self,
        op: impl FnOnce(&mut PacketGenerator) -> Result<T>,
    ) -> Option<T> {
        let result = op(&mut self.generator);
        self.drain_generator();
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                error!("{}failed to build packet: {}", self.prefix(), e);
                self.close_connection(e.code(), false);
                None
            }
        }
    }

    fn drain_generator(&mut self) {
        for packet in self.generator.take_packets() {
            if packet.is_fec_packet {
                self.alarms.get_mut(AlarmKind::Fec).cancel();
            }
            let level = packet.encryption_level;
            self.send_or_queue_packet(QueuedPacket::new(
                packet,
                level,
                TransmissionType::NotRetransmission,
                None,
            ));
        }
        if !self.generator.fec_group_open() {
            self.alarms.get_mut(AlarmKind::Fec).cancel();
        }
    }

    /// Flush frames left in the generator once a batch ends, if they may be
    /// sent now.
    fn send_queued_frames(&mut self) {
        if !self.connected || !self.generator.has_queued_frames() {
            return;
        }
        let retransmittable = if self.generator.has_queued_retransmittable_frames() {
            HasRetransmittableData::Yes
        } else {
            HasRetransmittableData::No
        };
        let handshake = if self.generator.has_queued_handshake_frames() {
            IsHandshake::Yes
        } else {
            IsHandshake::No
        };
        if self.should_generate_packet(retransmittable, handshake) {
            self.with_generator(PacketGenerator::flush);
        }
    }

    fn limit_max_packet_size(&self, suggested: ByteCount) -> ByteCount {
        suggested
            .min(self.writer.max_packet_size(self.peer_address))
            .min(MAX_PACKET_SIZE)
    }

    fn prefix(&self) -> &'static str {
        self.perspective.log_prefix()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connection_id", &self.connection_id)
            .field("perspective", &self.perspective)
            .field("version", &self.framer.version())
            .field("peer_address", &self.peer_address)
            .field("encryption_level", &self.encryption_level)
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}
