//! Outbound path: write gating, the packet queue, retransmissions and close.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::alarm::AlarmKind;
use crate::error::ErrorCode;
use crate::types::{
    AckBundling, EncryptionLevel, HasRetransmittableData, IsHandshake, PacketNumber, QuicVersion,
    TransmissionType, CRYPTO_STREAM_ID,
};
use crate::wire::{ConnectionCloseFrame, Frame, Framer};
use crate::writer::WriteStatus;

use super::{Connection, PacketBundler, QueuedPacket};

const MIN_FEC_TIMEOUT: Duration = Duration::from_millis(5);

impl Connection {
    /// The writer can take packets again.
    ///
    /// Writes queued packets, then pending retransmissions, then lets the
    /// upper layer write inside a bundler. If it still has data afterwards,
    /// the resume-writes alarm is armed so it gets another turn.
    pub fn on_can_write(&mut self) {
        if !self.connected {
            return;
        }
        self.write_queued_packets();
        self.write_pending_retransmissions();

        if !self.can_write(HasRetransmittableData::Yes) {
            return;
        }
        {
            let mut bundler = PacketBundler::new(self, AckBundling::NoAck);
            bundler.visitor.on_can_write();
        }

        if self.visitor.willing_and_able_to_write()
            && !self.alarms.is_set(AlarmKind::ResumeWrites)
            && self.can_write(HasRetransmittableData::Yes)
        {
            let now = self.clock.approximate_now();
            self.alarms.get_mut(AlarmKind::ResumeWrites).set(now);
        }
    }

    pub(super) fn write_if_not_blocked(&mut self) {
        if !self.writer.is_write_blocked() {
            self.on_can_write();
        }
    }

    /// Whether a packet may be written now.
    ///
    /// Non-retransmittable packets (acks) only need a writable socket;
    /// anything else also needs congestion control to agree. A delay from
    /// congestion control arms the send alarm.
    pub(super) fn can_write(&mut self, retransmittable: HasRetransmittableData) -> bool {
        if !self.connected {
            return false;
        }
        if self.writer.is_write_blocked() {
            self.visitor.on_write_blocked();
            return false;
        }
        if retransmittable == HasRetransmittableData::No {
            return true;
        }
        if self.config.respect_send_alarm && self.alarms.is_set(AlarmKind::Send) {
            return false;
        }

        let now = self.clock.now();
        match self.sent_packet_manager.time_until_send(now, retransmittable) {
            None => {
                self.alarms.get_mut(AlarmKind::Send).cancel();
                return false;
            }
            Some(delay) if !delay.is_zero() => {
                self.alarms
                    .get_mut(AlarmKind::Send)
                    .update(Some(now + delay), Duration::from_millis(1));
                return false;
            }
            Some(_) => {}
        }
        if !self.config.respect_send_alarm {
            self.alarms.get_mut(AlarmKind::Send).cancel();
        }
        true
    }

    pub(super) fn should_generate_packet(
        &mut self,
        retransmittable: HasRetransmittableData,
        handshake: IsHandshake,
    ) -> bool {
        // Handshake data is never held back by congestion control.
        if handshake == IsHandshake::Yes {
            return true;
        }
        self.can_write(retransmittable)
    }

    /// Whether the upper layer may write stream data now.
    ///
    /// Nothing new is written while a version negotiation packet or queued
    /// packets are still waiting for the writer.
    pub fn can_write_stream_data(&mut self) -> bool {
        if self.pending_version_negotiation_packet || !self.queued_packets.is_empty() {
            return false;
        }
        let handshake = if self.visitor.has_pending_handshake() {
            IsHandshake::Yes
        } else {
            IsHandshake::No
        };
        self.should_generate_packet(HasRetransmittableData::Yes, handshake)
    }

    pub(super) fn send_or_queue_packet(&mut self, mut queued: QueuedPacket) {
        let packet_number = queued.serialized_packet.packet_number;
        self.sent_entropy_manager
            .record_packet(packet_number, queued.serialized_packet.entropy_hash);
        if !self.queued_packets.is_empty() || !self.write_packet(&mut queued) {
            self.queued_packets.push_back(queued);
        }

        // Switch to forward-secure sending once enough packets went out
        // that the peer must have the keys.
        if self.encryption_level != EncryptionLevel::ForwardSecure
            && self.has_forward_secure_encrypter
            && packet_number >= self.first_required_forward_secure_packet.saturating_sub(1)
        {
            self.set_default_encryption_level(EncryptionLevel::ForwardSecure);
        }
    }

    /// Write one packet. Returns `false` if it must stay queued.
    pub(super) fn write_packet(&mut self, queued: &mut QueuedPacket) -> bool {
        let packet_number = queued.serialized_packet.packet_number;
        if packet_number <= self.sent_packet_manager.largest_sent_packet() {
            error!(
                "{}attempt to write packet {} after {}",
                self.prefix(),
                packet_number,
                self.sent_packet_manager.largest_sent_packet()
            );
            self.send_connection_close_with_details(
                ErrorCode::InternalError,
                "Packet written out of order.",
            );
            return true;
        }
        if self.should_discard_packet(queued) {
            self.stats.packets_discarded += 1;
            return true;
        }

        let is_termination_packet = queued.serialized_packet.has_connection_close()
            || (self.save_crypto_packets
                && queued.encryption_level != EncryptionLevel::None
                && queued
                    .serialized_packet
                    .retransmittable_frames
                    .as_ref()
                    .is_some_and(|frames| {
                        frames.frames().iter().any(|frame| {
                            matches!(frame, Frame::Stream(s) if s.stream_id == CRYPTO_STREAM_ID)
                        })
                    }));
        if self.writer.is_write_blocked() && !is_termination_packet {
            return false;
        }

        self.packet_number_of_last_sent_packet = packet_number;
        if is_termination_packet {
            self.termination_packets
                .push(queued.serialized_packet.packet.clone());
            // A blocked writer cannot take the close now; it is kept as a
            // termination packet instead.
            if self.writer.is_write_blocked() {
                self.visitor.on_write_blocked();
                return true;
            }
        }

        let packet_length = queued.serialized_packet.len();
        let sent_time = self.clock.now();
        trace!(
            "{}sending packet {} ({} bytes, {:?}, {:?})",
            self.prefix(),
            packet_number,
            packet_length,
            queued.encryption_level,
            queued.transmission_type
        );
        let self_ip = self.self_ip();
        let result = self.writer.write_packet(
            &queued.serialized_packet.packet,
            self_ip,
            self.peer_address,
        );

        if result.status == WriteStatus::Blocked {
            self.visitor.on_write_blocked();
            // Stays queued unless the writer kept it.
            if !self.writer.is_write_blocked_data_buffered() {
                return false;
            }
        }
        if result.status != WriteStatus::Error {
            if let Some(debug) = self.debug_visitor.as_mut() {
                debug.on_packet_sent(
                    &queued.serialized_packet,
                    queued.original_packet_number,
                    queued.transmission_type,
                    sent_time,
                );
            }
        }

        let is_retransmittable = queued.transmission_type != TransmissionType::NotRetransmission
            || queued.serialized_packet.retransmittable_frames.is_some()
            || queued.serialized_packet.is_mtu_probe;
        if queued.transmission_type == TransmissionType::NotRetransmission {
            self.time_of_last_sent_new_packet = sent_time;
            if is_retransmittable && self.last_send_for_timeout <= self.time_of_last_received_packet {
                self.last_send_for_timeout = sent_time;
            }
        }
        self.set_ping_alarm();
        self.maybe_set_fec_alarm(packet_number);
        self.maybe_set_mtu_alarm();

        let reset_retransmission_alarm = self.sent_packet_manager.on_packet_sent(
            &mut queued.serialized_packet,
            queued.original_packet_number,
            sent_time,
            packet_length as u64,
            queued.transmission_type,
            if is_retransmittable {
                HasRetransmittableData::Yes
            } else {
                HasRetransmittableData::No
            },
        );
        if reset_retransmission_alarm || !self.alarms.is_set(AlarmKind::Retransmission) {
            self.set_retransmission_alarm();
        }

        self.stats.bytes_sent += packet_length as u64;
        self.stats.packets_sent += 1;
        if queued.transmission_type != TransmissionType::NotRetransmission {
            self.stats.bytes_retransmitted += packet_length as u64;
            self.stats.packets_retransmitted += 1;
        }

        if result.status == WriteStatus::Error {
            warn!(
                "{}write of packet {} failed with {}",
                self.prefix(),
                packet_number,
                result.error_code
            );
            self.close_connection(ErrorCode::PacketWriteError, false);
            return false;
        }
        true
    }

    fn self_ip(&self) -> IpAddr {
        self.self_address
            .or(self.last_self_address)
            .map(|address| address.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    fn should_discard_packet(&self, queued: &QueuedPacket) -> bool {
        let packet_number = queued.serialized_packet.packet_number;
        if !self.connected {
            debug!("{}not sending packet {}: connection closed", self.prefix(), packet_number);
            return true;
        }
        // Once forward-secure, unencrypted packets would only confuse the peer.
        if self.encryption_level == EncryptionLevel::ForwardSecure
            && queued.encryption_level == EncryptionLevel::None
        {
            debug!(
                "{}dropping unencrypted packet {} after going forward-secure",
                self.prefix(),
                packet_number
            );
            return true;
        }
        if let Some(original) = queued.original_packet_number {
            if !self.sent_packet_manager.is_unacked(original)
                || !self.sent_packet_manager.has_retransmittable_frames(original)
            {
                debug!(
                    "{}dropping retransmission of packet {}: acked or abandoned",
                    self.prefix(),
                    original
                );
                return true;
            }
        }
        false
    }

    fn maybe_set_fec_alarm(&mut self, packet_number: PacketNumber) {
        if self.alarms.is_set(AlarmKind::Fec)
            || self.generator.fec_group_number() != Some(packet_number)
        {
            return;
        }
        // First packet of a new group: bound how long the group stays open.
        let smoothed = self.sent_packet_manager.rtt_stats().smoothed_rtt();
        let timeout = smoothed
            .mul_f64(self.config.effective_fec_rtt_multiplier())
            .max(MIN_FEC_TIMEOUT);
        let now = self.clock.approximate_now();
        self.alarms
            .get_mut(AlarmKind::Fec)
            .update(Some(now + timeout), Duration::from_millis(1));
    }

    pub(super) fn write_queued_packets(&mut self) {
        if self.pending_version_negotiation_packet {
            let versions = self.framer.supported_versions().to_vec();
            self.send_version_negotiation_packet(&versions);
        }
        while let Some(mut queued) = self.queued_packets.pop_front() {
            if !self.write_packet(&mut queued) {
                self.queued_packets.push_front(queued);
                break;
            }
        }
    }

    pub(super) fn write_pending_retransmissions(&mut self) {
        while self.sent_packet_manager.has_pending_retransmissions()
            && self.can_write(HasRetransmittableData::Yes)
        {
            let Some(pending) = self.sent_packet_manager.next_pending_retransmission() else {
                break;
            };
            // Resealed under a new number, at the level the frames were
            // first sent at, without FEC.
            let Some(packet) =
                self.with_generator(|g| g.reserialize_all_frames(&pending.retransmittable_frames))
            else {
                return;
            };
            debug!(
                "{}retransmitting {} as {}",
                self.prefix(),
                pending.packet_number,
                packet.packet_number
            );
            let level = pending.retransmittable_frames.encryption_level();
            self.send_or_queue_packet(QueuedPacket::new(
                packet,
                level,
                pending.transmission_type,
                Some(pending.packet_number),
            ));
        }
    }

    /// Answer a packet carrying an unsupported version. Stays pending while
    /// the writer is blocked.
    pub(super) fn send_version_negotiation_packet(&mut self, versions: &[QuicVersion]) {
        self.pending_version_negotiation_packet = true;
        if self.writer.is_write_blocked() {
            self.visitor.on_write_blocked();
            return;
        }
        debug!("{}sending version negotiation packet", self.prefix());
        let packet = Framer::build_version_negotiation_packet(self.connection_id, versions);
        let self_ip = self.self_ip();
        let result = self.writer.write_packet(&packet, self_ip, self.peer_address);
        match result.status {
            WriteStatus::Error => {
                self.close_connection(ErrorCode::PacketWriteError, false);
            }
            WriteStatus::Blocked => {
                self.visitor.on_write_blocked();
                if self.writer.is_write_blocked_data_buffered() {
                    self.pending_version_negotiation_packet = false;
                }
            }
            WriteStatus::Ok => {
                self.pending_version_negotiation_packet = false;
            }
        }
    }

    /// Send a connection close frame (unless closing silently on idle
    /// timeout) and close.
    pub fn send_connection_close_with_details(&mut self, error: ErrorCode, details: &str) {
        if !self.connected {
            return;
        }
        let silent = self.silent_close_enabled && error == ErrorCode::ConnectionTimedOut;
        if !silent {
            debug!("{}sending connection close {}: {}", self.prefix(), error, details);
            // Nothing queued will ever be sent.
            self.queued_packets.clear();
            let mut bundler = PacketBundler::new(self, AckBundling::SendAck);
            bundler.add_control_frame(Frame::ConnectionClose(ConnectionCloseFrame {
                error_code: error,
                error_details: details.to_string(),
            }));
            bundler.with_generator(|g| g.flush());
        }
        self.close_connection(error, false);
    }

    /// Close without telling the peer.
    ///
    /// The first call notifies the visitors and cancels every alarm; later
    /// calls do nothing.
    pub fn close_connection(&mut self, error: ErrorCode, from_peer: bool) {
        if !self.connected {
            debug!("{}connection already closed", self.prefix());
            return;
        }
        self.connected = false;
        if from_peer {
            debug!("{}closed by peer with {}", self.prefix(), error);
        } else {
            debug!("{}closing with {}", self.prefix(), error);
        }
        self.visitor.on_connection_closed(error, from_peer);
        if let Some(debug) = self.debug_visitor.as_mut() {
            debug.on_connection_closed(error, from_peer);
        }
        self.alarms.cancel_all();
    }
}
