//! Inbound path: datagram processing and the framer callbacks.

use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::alarm::AlarmKind;
use crate::error::{Error, ErrorCode};
use crate::fec::FecGroup;
use crate::sent_packet_manager::NetworkChangeVisitor;
use crate::types::{
    AckBundling, EncryptionLevel, FecGroupNumber, PacketNumber, PeerAddressChangeType,
    Perspective, QuicVersion, TransmissionType, VersionNegotiationState, CRYPTO_STREAM_ID,
};
use crate::wire::{
    process_packet, process_revived_packet, AckFrame, BlockedFrame, ConnectionCloseFrame,
    FecData, Framer, FramerVisitor, GoAwayFrame, PacketHeader, PublicHeader, PublicResetPacket,
    RstStreamFrame, StopWaitingFrame, StreamFrame, VersionNegotiationPacket, WindowUpdateFrame,
};

use super::{Connection, PacketBundler, RetransmissionScheduler};

impl Connection {
    /// Process one datagram received from `peer_address` on `self_address`.
    ///
    /// Packets that cannot be decrypted yet are buffered until keys for a
    /// higher level arrive. Afterwards an ack is sent if one is queued and
    /// anything blocked on the last ack gets a chance to write.
    pub fn process_udp_packet(
        &mut self,
        self_address: SocketAddr,
        peer_address: SocketAddr,
        packet: &[u8],
    ) {
        if !self.connected {
            return;
        }
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_packet_received(self_address, peer_address, packet);
        }
        self.last_size = packet.len() as u64;
        self.check_for_address_migration(self_address, peer_address);
        self.stats.bytes_received += packet.len() as u64;
        self.stats.packets_received += 1;

        RetransmissionScheduler::new(self).process_received_packet(packet);
    }

    fn process_received_packet(&mut self, packet: &[u8]) {
        if !process_packet(self, packet) {
            if self.framer.error() == ErrorCode::DecryptionFailure {
                self.on_undecryptable_packet(packet);
            }
            return;
        }
        self.stats.packets_processed += 1;
        self.maybe_process_undecryptable_packets();
        self.maybe_send_in_response_to_packet();
        self.set_ping_alarm();
    }

    fn on_undecryptable_packet(&mut self, packet: &[u8]) {
        self.stats.packets_dropped += 1;
        // Keys for a higher level may still be on their way.
        if self.encryption_level != EncryptionLevel::ForwardSecure {
            if self.undecryptable_packets.len() < self.max_undecryptable_packets {
                trace!("{}queueing undecryptable packet", self.prefix());
                self.undecryptable_packets
                    .push_back(Bytes::copy_from_slice(packet));
                return;
            }
            if self.max_undecryptable_packets > 0 {
                self.send_connection_close_with_details(
                    ErrorCode::TooManyUndecryptablePackets,
                    "Too many undecryptable packets.",
                );
                return;
            }
        }
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_undecryptable_packet();
        }
    }

    fn check_for_address_migration(&mut self, self_address: SocketAddr, peer_address: SocketAddr) {
        self.self_address_changed = false;
        self.peer_change_type = PeerAddressChangeType::NoChange;
        self.migrating_peer_address = None;

        self.last_self_address = Some(self_address);
        self.self_address_changed = self
            .self_address
            .is_some_and(|current| current != self_address);
        if peer_address != self.peer_address {
            self.peer_change_type = PeerAddressChangeType::classify(&self.peer_address, &peer_address);
            self.migrating_peer_address = Some(peer_address);
        }
    }

    /// Address and size checks for a packet that authenticated.
    fn process_validated_packet(&mut self) -> bool {
        if self.self_address_changed {
            self.send_connection_close_with_details(
                ErrorCode::ErrorMigratingAddress,
                "Self address migration is not supported.",
            );
            return false;
        }
        // The first packet that authenticates fixes the local address.
        if self.self_address.is_none() {
            self.self_address = self.last_self_address;
        }

        if let Some(new_peer) = self.migrating_peer_address.take() {
            let change_type = self.peer_change_type;
            let allowed = !self.config.disable_non_nat_address_migration
                || change_type.is_nat_rebinding()
                || matches!(
                    change_type,
                    PeerAddressChangeType::NoChange | PeerAddressChangeType::Unknown
                );
            if !allowed {
                self.send_connection_close_with_details(
                    ErrorCode::ErrorMigratingAddress,
                    "Invalid peer address migration.",
                );
                return false;
            }
            debug!(
                "{}peer moved from {} to {} ({:?})",
                self.prefix(),
                self.peer_address,
                new_peer,
                change_type
            );
            self.peer_address = new_peer;
            self.visitor.on_connection_migration(change_type);
            self.sent_packet_manager.on_connection_migration(change_type);
            self.peer_change_type = PeerAddressChangeType::NoChange;
        }

        self.time_of_last_received_packet = self.clock.now();
        self.largest_received_packet_size = self.largest_received_packet_size.max(self.last_size);
        // A client's first packets show what fits on the path.
        if self.perspective == Perspective::Server
            && self.encryption_level == EncryptionLevel::None
            && self.last_size > self.max_packet_length()
        {
            self.set_max_packet_length(self.last_size);
        }
        true
    }

    fn maybe_send_in_response_to_packet(&mut self) {
        if !self.connected {
            return;
        }
        let ack_mode = if self.ack_queued {
            AckBundling::SendAck
        } else {
            AckBundling::NoAck
        };
        let mut bundler = PacketBundler::new(self, ack_mode);
        // Acked packets may have opened the congestion window.
        bundler.write_if_not_blocked();
    }

    fn maybe_process_undecryptable_packets(&mut self) {
        if self.undecryptable_packets.is_empty() || self.encryption_level == EncryptionLevel::None
        {
            return;
        }
        while self.connected {
            let Some(packet) = self.undecryptable_packets.front().cloned() else {
                break;
            };
            trace!("{}retrying undecryptable packet", self.prefix());
            if !process_packet(self, &packet) && self.framer.error() == ErrorCode::DecryptionFailure
            {
                break;
            }
            self.stats.packets_processed += 1;
            self.undecryptable_packets.pop_front();
        }

        // No later keys will arrive.
        if self.encryption_level == EncryptionLevel::ForwardSecure {
            for _ in self.undecryptable_packets.drain(..) {
                if let Some(debug) = self.debug_visitor.as_mut() {
                    debug.on_undecryptable_packet();
                }
            }
        }
    }

    fn last_packet_instigates_ack(&self) -> bool {
        self.should_last_packet_instigate_acks
            || self.num_packets_received_since_last_ack_sent
                >= self.config.max_packets_received_before_ack
    }

    fn maybe_queue_ack(&mut self) {
        // A packet that fills a gap is acked right away.
        self.ack_queued = self
            .received_packet_manager
            .is_missing(self.last_header.packet_number);
        if !self.ack_queued && self.last_packet_instigates_ack() {
            if self.alarms.is_set(AlarmKind::Ack) {
                self.ack_queued = true;
            } else {
                let deadline =
                    self.clock.approximate_now() + self.sent_packet_manager.delayed_ack_time();
                self.alarms.get_mut(AlarmKind::Ack).set(deadline);
            }
        }
        if self.ack_queued {
            self.alarms.get_mut(AlarmKind::Ack).cancel();
        }
    }

    fn process_stop_waiting_frame(&mut self, frame: &StopWaitingFrame) {
        self.received_packet_manager
            .update_packet_information_sent_by_peer(frame);
        self.close_fec_groups_before(frame.least_unacked + 1);
    }

    fn close_fec_groups_before(&mut self, packet_number: PacketNumber) {
        let current = self.last_header.fec_group;
        self.fec_groups.retain(|&number, group| {
            number == current || !group.protects_packets_before(packet_number)
        });
    }

    fn clear_last_frames(&mut self) {
        self.should_last_packet_instigate_acks = false;
        self.last_stop_waiting_frame = None;
    }

    fn maybe_close_if_too_many_outstanding_packets(&mut self) {
        let max_tracked = self.config.max_tracked_packets;
        if self.sent_packet_manager.largest_observed()
            > self.sent_packet_manager.least_unacked() + max_tracked
        {
            self.send_connection_close_with_details(
                ErrorCode::TooManyOutstandingSentPackets,
                &format!("More than {} outstanding.", max_tracked),
            );
        }
        if self.received_packet_manager.num_tracked_packets() as u64 > max_tracked {
            self.send_connection_close_with_details(
                ErrorCode::TooManyOutstandingReceivedPackets,
                &format!("More than {} outstanding.", max_tracked),
            );
        }
    }

    /// Receive-side FEC group `number`, created on first use.
    ///
    /// At capacity the lowest group is evicted; a group below every tracked
    /// one was already evicted and is not recreated.
    pub(super) fn fec_group(&mut self, number: FecGroupNumber) -> Option<&mut FecGroup> {
        if number == 0 {
            return None;
        }
        if !self.fec_groups.contains_key(&number)
            && self.fec_groups.len() >= self.config.max_fec_groups
        {
            let &lowest = self.fec_groups.keys().next()?;
            if number < lowest {
                return None;
            }
            if let Some(evicted) = self.fec_groups.remove(&lowest) {
                trace!(
                    "{}evicting FEC group {} with {} packets",
                    self.prefix(),
                    evicted.group_number(),
                    evicted.num_received_packets()
                );
            }
        }
        Some(
            self.fec_groups
                .entry(number)
                .or_insert_with(|| FecGroup::new(number)),
        )
    }

    fn current_fec_group(&mut self) -> Option<&mut FecGroup> {
        if !self.last_header.is_in_fec_group {
            return None;
        }
        self.fec_group(self.last_header.fec_group)
    }

    fn maybe_process_revived_packet(&mut self) {
        if !self.connected {
            return;
        }
        let number = self.last_header.fec_group;
        let Some(group) = self.current_fec_group() else {
            return;
        };
        let Some((packet_number, payload)) = group.revive() else {
            return;
        };
        let level = group.effective_encryption_level();
        self.fec_groups.remove(&number);

        let mut header = PacketHeader {
            public_header: PublicHeader {
                connection_id: self.connection_id,
                ..PublicHeader::default()
            },
            packet_number,
            ..PacketHeader::default()
        };
        self.last_decrypted_packet_level = level;
        self.last_packet_revived = true;
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_revived_packet(&header, &payload);
        }
        self.stats.packets_revived += 1;
        process_revived_packet(self, &mut header, &payload);
    }

    fn select_mutual_version(&mut self, available: &[QuicVersion]) -> bool {
        let Some(version) = self
            .framer
            .supported_versions()
            .iter()
            .copied()
            .find(|version| available.contains(version))
        else {
            return false;
        };
        self.framer.set_version(version);
        self.generator.set_version(version);
        true
    }

    fn negotiation_succeeded(&mut self, version: QuicVersion) {
        self.version_negotiation_state = VersionNegotiationState::NegotiatedVersion;
        self.visitor.on_successful_version_negotiation(version);
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_successful_version_negotiation(version);
        }
    }

    fn validate_ack_frame(&self, ack: &AckFrame) -> Result<(), &'static str> {
        if ack.largest_observed > self.generator.packet_number() {
            return Err("Peer's observed unsent packet.");
        }
        if ack.largest_observed < self.sent_packet_manager.largest_observed() {
            return Err("Peer's largest_observed packet decreased.");
        }
        if let (Some(&min), Some(&max)) =
            (ack.missing_packets.first(), ack.missing_packets.last())
        {
            if max > ack.largest_observed {
                return Err("Peer sent missing packet > largest observed.");
            }
            if min < self.sent_packet_manager.least_packet_awaited_by_peer() {
                return Err("Peer sent missing packet < least awaited.");
            }
        }
        if !self.sent_entropy_manager.is_valid_entropy(
            ack.largest_observed,
            &ack.missing_packets,
            ack.entropy_hash,
        ) {
            return Err("Peer sent invalid entropy.");
        }
        if ack.latest_revived_packet != 0
            && !ack.missing_packets.contains(&ack.latest_revived_packet)
        {
            return Err("Peer specified revived packet which was not missing.");
        }
        Ok(())
    }

    fn process_ack_frame(&mut self, ack: &AckFrame) {
        self.largest_seen_packet_with_ack = self.last_header.packet_number;
        let outcome = self
            .sent_packet_manager
            .on_incoming_ack(ack, self.time_of_last_received_packet);
        if outcome.cwnd_changed {
            self.on_congestion_window_change();
        }
        if outcome.rtt_updated {
            self.on_rtt_change();
        }
        if let Some(probe_size) = outcome.acked_mtu_probe {
            if probe_size > self.max_packet_length() {
                debug!("{}MTU probe of {} bytes acked", self.prefix(), probe_size);
                self.set_max_packet_length(probe_size);
            }
        }
        self.sent_entropy_manager.clear_entropy_before(
            self.sent_packet_manager
                .least_packet_awaited_by_peer()
                .saturating_sub(1),
        );
        // The RTT estimate just improved.
        self.set_retransmission_alarm();
    }

    fn validate_stop_waiting_frame(&self, frame: &StopWaitingFrame) -> Result<(), &'static str> {
        if frame.least_unacked < self.received_packet_manager.peer_least_packet_awaiting_ack() {
            return Err("Peer's sent low least_unacked.");
        }
        if frame.least_unacked > self.last_header.packet_number {
            return Err("Peer sent least_unacked > packet number.");
        }
        Ok(())
    }
}

impl FramerVisitor for Connection {
    fn framer(&self) -> &Framer {
        &self.framer
    }

    fn framer_mut(&mut self) -> &mut Framer {
        &mut self.framer
    }

    fn on_error(&mut self, error: &Error) {
        // Packets that did not decrypt are dropped, not fatal.
        if !self.connected || !self.last_packet_decrypted {
            return;
        }
        debug!("{}framer error: {}", self.prefix(), error);
        let code = self.framer.error();
        let details = self.framer.detailed_error().to_string();
        self.send_connection_close_with_details(code, &details);
    }

    fn on_packet(&mut self) {
        self.last_packet_decrypted = false;
        self.last_packet_revived = false;
    }

    fn on_public_reset_packet(&mut self, packet: &PublicResetPacket) {
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_public_reset_packet(packet);
        }
        self.close_connection(ErrorCode::PublicReset, true);
    }

    fn on_version_negotiation_packet(&mut self, packet: &VersionNegotiationPacket) {
        if self.perspective == Perspective::Server {
            warn!("{}version negotiation packet received", self.prefix());
            self.close_connection(ErrorCode::InternalError, false);
            return;
        }
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_version_negotiation_packet(packet);
        }
        if self.version_negotiation_state != VersionNegotiationState::StartNegotiation {
            // Likely a duplicate.
            return;
        }
        if packet.versions.contains(&self.version()) {
            // The server should have accepted our version.
            self.close_connection(ErrorCode::InvalidVersionNegotiationPacket, false);
            return;
        }
        if !self.select_mutual_version(&packet.versions) {
            self.send_connection_close_with_details(
                ErrorCode::InvalidVersion,
                "no common version found",
            );
            return;
        }
        debug!("{}switching to version {}", self.prefix(), self.version());
        self.server_supported_versions = packet.versions.clone();
        self.version_negotiation_state = VersionNegotiationState::NegotiationInProgress;
        self.retransmit_unacked_packets(TransmissionType::AllUnackedRetransmission);
    }

    fn on_protocol_version_mismatch(&mut self, received_version: QuicVersion) -> bool {
        if self.perspective == Perspective::Client {
            warn!("{}protocol version mismatch on a client", self.prefix());
            self.close_connection(ErrorCode::InternalError, false);
            return false;
        }
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_protocol_version_mismatch(received_version);
        }
        match self.version_negotiation_state {
            VersionNegotiationState::StartNegotiation
            | VersionNegotiationState::NegotiationInProgress => {
                if !self.framer.is_supported_version(received_version) {
                    let versions = self.framer.supported_versions().to_vec();
                    self.send_version_negotiation_packet(&versions);
                    self.version_negotiation_state =
                        VersionNegotiationState::NegotiationInProgress;
                    return false;
                }
            }
            // Stragglers sent before negotiation finished.
            VersionNegotiationState::NegotiatedVersion => return false,
        }
        self.framer.set_version(received_version);
        self.generator.set_version(received_version);
        self.negotiation_succeeded(received_version);
        true
    }

    fn on_unauthenticated_public_header(&mut self, header: &PublicHeader) -> bool {
        if header.connection_id == self.connection_id {
            return true;
        }
        self.stats.packets_dropped += 1;
        debug!(
            "{}ignoring packet for connection {}",
            self.prefix(),
            header.connection_id
        );
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_incorrect_connection_id(header.connection_id);
        }
        false
    }

    fn on_unauthenticated_header(&mut self, header: &PacketHeader) -> bool {
        trace!("{}packet {} header parsed", self.prefix(), header.packet_number);
        true
    }

    fn on_decrypted_packet(&mut self, level: EncryptionLevel) {
        self.last_decrypted_packet_level = level;
        self.last_packet_decrypted = true;
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_decrypted_packet(level);
        }
        // The peer has the forward-secure keys, so use ours.
        if self.encryption_level != EncryptionLevel::ForwardSecure
            && self.has_forward_secure_encrypter
            && level == EncryptionLevel::ForwardSecure
        {
            self.set_default_encryption_level(EncryptionLevel::ForwardSecure);
        }
    }

    fn on_packet_header(&mut self, header: &PacketHeader) -> bool {
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_packet_header(header);
        }
        if !self.process_validated_packet() {
            return false;
        }

        // Undone below if the packet is accepted.
        self.stats.packets_dropped += 1;

        if header.packet_number.abs_diff(self.last_header.packet_number)
            > self.config.max_packet_gap
        {
            self.send_connection_close_with_details(
                ErrorCode::InvalidPacketHeader,
                "packet number out of bounds",
            );
            return false;
        }

        if !self
            .received_packet_manager
            .is_awaiting_packet(header.packet_number)
        {
            trace!(
                "{}packet {} is a duplicate or no longer awaited",
                self.prefix(),
                header.packet_number
            );
            if let Some(debug) = self.debug_visitor.as_mut() {
                debug.on_duplicate_packet(header.packet_number);
            }
            return false;
        }

        if self.version_negotiation_state != VersionNegotiationState::NegotiatedVersion {
            match self.perspective {
                Perspective::Server if !header.public_header.version_flag => {
                    warn!(
                        "{}packet {} without version before negotiation",
                        self.prefix(),
                        header.packet_number
                    );
                    self.close_connection(ErrorCode::InvalidVersion, false);
                    return false;
                }
                Perspective::Server => {}
                // The server stopped sending the version: it accepted ours.
                Perspective::Client => self.generator.set_send_version_in_packet(false),
            }
            let version = self.version();
            self.negotiation_succeeded(version);
        }

        self.stats.packets_dropped -= 1;
        self.last_header = header.clone();
        true
    }

    fn on_revived_packet(&mut self) {
        trace!("{}processing revived packet", self.prefix());
    }

    fn on_fec_protected_payload(&mut self, payload: &[u8]) {
        let level = self.last_decrypted_packet_level;
        let packet_number = self.last_header.packet_number;
        if let Some(group) = self.current_fec_group() {
            group.update(level, packet_number, payload);
        }
    }

    fn on_stream_frame(&mut self, frame: &StreamFrame) -> bool {
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_stream_frame(frame);
        }
        if frame.stream_id != CRYPTO_STREAM_ID
            && self.last_decrypted_packet_level == EncryptionLevel::None
        {
            warn!(
                "{}unencrypted data on stream {}",
                self.prefix(),
                frame.stream_id
            );
            self.send_connection_close_with_details(
                ErrorCode::UnencryptedStreamData,
                "Unencrypted stream data seen",
            );
            return false;
        }
        self.visitor.on_stream_frame(frame);
        self.stats.stream_bytes_received += frame.data.len() as u64;
        self.should_last_packet_instigate_acks = true;
        self.connected
    }

    fn on_ack_frame(&mut self, frame: &AckFrame) -> bool {
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_ack_frame(frame);
        }
        if self.last_header.packet_number <= self.largest_seen_packet_with_ack {
            trace!("{}ignoring old ack", self.prefix());
            return true;
        }
        if let Err(details) = self.validate_ack_frame(frame) {
            warn!("{}invalid ack: {}", self.prefix(), details);
            self.send_connection_close_with_details(ErrorCode::InvalidAckData, details);
            return false;
        }
        self.process_ack_frame(frame);
        if frame.is_truncated {
            self.should_last_packet_instigate_acks = true;
        }
        // The peer still waits for packets that will never be resent; a
        // stop waiting frame raises its floor.
        let least_unacked = self.sent_packet_manager.least_unacked();
        match frame.missing_packets.first() {
            Some(&first_missing) if least_unacked > first_missing => {
                self.stop_waiting_count += 1;
            }
            _ => self.stop_waiting_count = 0,
        }
        self.connected
    }

    fn on_stop_waiting_frame(&mut self, frame: &StopWaitingFrame) -> bool {
        if self.last_header.packet_number <= self.largest_seen_packet_with_stop_waiting {
            trace!("{}ignoring old stop waiting", self.prefix());
            return true;
        }
        if let Err(details) = self.validate_stop_waiting_frame(frame) {
            warn!("{}invalid stop waiting: {}", self.prefix(), details);
            self.send_connection_close_with_details(ErrorCode::InvalidStopWaitingData, details);
            return false;
        }
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_stop_waiting_frame(frame);
        }
        self.largest_seen_packet_with_stop_waiting = self.last_header.packet_number;
        self.last_stop_waiting_frame = Some(frame.clone());
        self.connected
    }

    fn on_ping_frame(&mut self) -> bool {
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_ping_frame();
        }
        self.should_last_packet_instigate_acks = true;
        true
    }

    fn on_rst_stream_frame(&mut self, frame: &RstStreamFrame) -> bool {
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_rst_stream_frame(frame);
        }
        debug!(
            "{}stream {} reset: {}",
            self.prefix(),
            frame.stream_id,
            frame.error_code
        );
        self.visitor.on_rst_stream(frame);
        self.should_last_packet_instigate_acks = true;
        self.connected
    }

    fn on_connection_close_frame(&mut self, frame: &ConnectionCloseFrame) -> bool {
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_connection_close_frame(frame);
        }
        debug!(
            "{}peer closed with {}: {}",
            self.prefix(),
            frame.error_code,
            frame.error_details
        );
        self.close_connection(frame.error_code, true);
        self.connected
    }

    fn on_go_away_frame(&mut self, frame: &GoAwayFrame) -> bool {
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_go_away_frame(frame);
        }
        debug!(
            "{}go away received: {} (last good stream {})",
            self.prefix(),
            frame.error_code,
            frame.last_good_stream_id
        );
        self.goaway_received = true;
        self.visitor.on_go_away(frame);
        self.should_last_packet_instigate_acks = true;
        self.connected
    }

    fn on_window_update_frame(&mut self, frame: &WindowUpdateFrame) -> bool {
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_window_update_frame(frame);
        }
        self.visitor.on_window_update_frame(frame);
        self.should_last_packet_instigate_acks = true;
        self.connected
    }

    fn on_blocked_frame(&mut self, frame: &BlockedFrame) -> bool {
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_blocked_frame(frame);
        }
        self.visitor.on_blocked_frame(frame);
        self.should_last_packet_instigate_acks = true;
        self.connected
    }

    fn on_fec_data(&mut self, fec: &FecData) {
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_fec_data(fec);
        }
        let level = self.last_decrypted_packet_level;
        let packet_number = self.last_header.packet_number;
        if let Some(group) = self.current_fec_group() {
            group.update_fec(level, packet_number, &fec.redundancy);
        }
    }

    fn on_packet_complete(&mut self) {
        // The packet closed the connection.
        if !self.connected {
            self.clear_last_frames();
            return;
        }
        trace!(
            "{}packet {} complete{}",
            self.prefix(),
            self.last_header.packet_number,
            if self.last_packet_revived { " (revived)" } else { "" }
        );

        self.num_packets_received_since_last_ack_sent += 1;
        // Before recording, so a packet filling a gap is seen as missing.
        self.maybe_queue_ack();

        if self.last_packet_revived {
            self.received_packet_manager
                .record_packet_revived(self.last_header.packet_number);
        } else {
            self.received_packet_manager.record_packet_received(
                self.last_size,
                &self.last_header,
                self.time_of_last_received_packet,
            );
        }

        if let Some(stop_waiting) = self.last_stop_waiting_frame.take() {
            self.process_stop_waiting_frame(&stop_waiting);
        }

        // A new gap is reported after the delayed ack timeout.
        if self.last_packet_instigates_ack()
            && self.received_packet_manager.has_new_missing_packets()
            && !self.ack_queued
            && !self.alarms.is_set(AlarmKind::Ack)
        {
            let deadline =
                self.clock.approximate_now() + self.sent_packet_manager.delayed_ack_time();
            self.alarms.get_mut(AlarmKind::Ack).set(deadline);
        }

        self.clear_last_frames();
        self.maybe_close_if_too_many_outstanding_packets();
        self.maybe_process_revived_packet();
    }
}

impl NetworkChangeVisitor for Connection {
    fn on_congestion_window_change(&mut self) {
        let now = self.clock.approximate_now();
        self.visitor.on_congestion_window_change(now);
    }

    fn on_rtt_change(&mut self) {
        let smoothed = self.sent_packet_manager.rtt_stats().smoothed_or_initial_rtt();
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_rtt_changed(smoothed);
        }
    }
}
