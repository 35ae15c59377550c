//! Default sent-packet manager.
//!
//! Every sent packet is tracked in an ordered map until it is acked or no
//! longer useful. Only packets with retransmittable frames count as in
//! flight. When frames are retransmitted, the old and new packets are linked
//! so that an ack of any transmission stops all the others from being
//! retransmitted again.

use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, trace};

use crate::config::ConnectionConfig;
use crate::generator::SerializedPacket;
use crate::sent_packet_manager::{
    AckOutcome, CachedNetworkParameters, CongestionConfig, CongestionController,
    PendingRetransmission, PreviousConnectionState, RttStats, SentPacketManager,
};
use crate::types::{
    ByteCount, EncryptionLevel, HasRetransmittableData, IsHandshake, PacketCount, PacketNumber,
    PeerAddressChangeType, Perspective, StreamId, TransmissionType,
};
use crate::wire::{AckFrame, RetransmittableFrames};

/// Nacks before a packet is declared lost
const NACKS_BEFORE_RETRANSMISSION: PacketCount = 3;

/// Tail loss probes sent before falling back to an RTO
const DEFAULT_MAX_TAIL_LOSS_PROBES: u32 = 2;

/// Packets that may bypass the congestion window after an RTO
const MAX_RTO_PACKETS: u32 = 2;

/// RTO before the first RTT sample
const DEFAULT_RETRANSMISSION_TIME: Duration = Duration::from_millis(500);

const MIN_RETRANSMISSION_TIME: Duration = Duration::from_millis(200);
const MAX_RETRANSMISSION_TIME: Duration = Duration::from_secs(60);
const MAX_RETRANSMISSION_BACKOFFS: u32 = 10;
const MIN_TAIL_LOSS_PROBE_TIMEOUT: Duration = Duration::from_millis(10);
const MIN_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetransmissionMode {
    Handshake,
    TailLossProbe,
    Rto,
}

#[derive(Debug, Clone)]
struct TransmissionInfo {
    retransmittable_frames: Option<RetransmittableFrames>,
    encryption_level: EncryptionLevel,
    bytes_sent: ByteCount,
    sent_time: Instant,
    in_flight: bool,
    nack_count: PacketCount,
    is_mtu_probe: bool,
    /// Older transmission of the same frames
    previous_transmission: Option<PacketNumber>,
    /// Newer transmission of the same frames
    next_transmission: Option<PacketNumber>,
}

impl TransmissionInfo {
    fn has_crypto_handshake(&self) -> bool {
        self.retransmittable_frames
            .as_ref()
            .is_some_and(|f| f.has_crypto_handshake() == IsHandshake::Yes)
    }
}

/// NACK-based loss detection with tail loss probes and retransmission
/// timeouts, on top of [`CongestionController`].
#[derive(Debug)]
pub struct DefaultSentPacketManager {
    perspective: Perspective,
    unacked_packets: BTreeMap<PacketNumber, TransmissionInfo>,
    pending_retransmissions: BTreeMap<PacketNumber, TransmissionType>,
    largest_sent_packet: PacketNumber,
    largest_observed: PacketNumber,
    least_packet_awaited_by_peer: PacketNumber,
    rtt_stats: RttStats,
    congestion: CongestionController,
    handshake_confirmed: bool,
    consecutive_rto_count: u32,
    consecutive_tlp_count: u32,
    consecutive_crypto_retransmission_count: u32,
    /// Packets allowed out regardless of the congestion window
    pending_timer_transmission_count: u32,
    max_tail_loss_probes: u32,
    delayed_ack_time: Duration,
    num_open_streams: usize,
    rto_count: u64,
    tlp_count: u64,
}

impl DefaultSentPacketManager {
    /// Create a manager configured from `config`.
    pub fn new(perspective: Perspective, config: &ConnectionConfig) -> Self {
        let congestion_config = CongestionConfig {
            pacing: config.pacing_enabled(),
            ..CongestionConfig::default()
        };
        Self {
            perspective,
            unacked_packets: BTreeMap::new(),
            pending_retransmissions: BTreeMap::new(),
            largest_sent_packet: 0,
            largest_observed: 0,
            least_packet_awaited_by_peer: 1,
            rtt_stats: RttStats::new(config.initial_rtt),
            congestion: CongestionController::new(congestion_config, config.initial_rtt),
            handshake_confirmed: false,
            consecutive_rto_count: 0,
            consecutive_tlp_count: 0,
            consecutive_crypto_retransmission_count: 0,
            pending_timer_transmission_count: 0,
            max_tail_loss_probes: DEFAULT_MAX_TAIL_LOSS_PROBES,
            delayed_ack_time: config.delayed_ack_time,
            num_open_streams: 0,
            rto_count: 0,
            tlp_count: 0,
        }
    }

    /// Congestion controller, for inspection.
    pub fn congestion_controller(&self) -> &CongestionController {
        &self.congestion
    }

    /// Bytes in flight.
    pub fn bytes_in_flight(&self) -> ByteCount {
        self.congestion.bytes_in_flight()
    }

    /// Open streams last reported by the connection.
    pub fn num_open_streams(&self) -> usize {
        self.num_open_streams
    }

    fn retransmission_mode(&self) -> RetransmissionMode {
        if !self.handshake_confirmed && self.has_pending_crypto_packets() {
            return RetransmissionMode::Handshake;
        }
        if self.consecutive_tlp_count < self.max_tail_loss_probes
            && self
                .unacked_packets
                .values()
                .any(|info| info.in_flight && info.retransmittable_frames.is_some())
        {
            return RetransmissionMode::TailLossProbe;
        }
        RetransmissionMode::Rto
    }

    fn has_pending_crypto_packets(&self) -> bool {
        self.unacked_packets
            .values()
            .any(|info| info.in_flight && info.has_crypto_handshake())
    }

    fn has_in_flight_packets(&self) -> bool {
        self.unacked_packets.values().any(|info| info.in_flight)
    }

    fn last_in_flight_sent_time(&self, crypto_only: bool) -> Option<Instant> {
        self.unacked_packets
            .values()
            .rev()
            .find(|info| info.in_flight && (!crypto_only || info.has_crypto_handshake()))
            .map(|info| info.sent_time)
    }

    fn crypto_retransmission_delay(&self) -> Duration {
        let srtt = self.rtt_stats.smoothed_or_initial_rtt();
        let delay = MIN_HANDSHAKE_TIMEOUT.max(srtt * 3 / 2);
        delay * (1u32 << self.consecutive_crypto_retransmission_count.min(MAX_RETRANSMISSION_BACKOFFS))
    }

    fn tail_loss_probe_delay(&self) -> Duration {
        let srtt = self.rtt_stats.smoothed_or_initial_rtt();
        let in_flight = self.unacked_packets.values().filter(|i| i.in_flight).count();
        if in_flight <= 1 {
            (srtt * 2).max(srtt * 3 / 2 + MIN_RETRANSMISSION_TIME / 2)
        } else {
            MIN_TAIL_LOSS_PROBE_TIMEOUT.max(srtt * 2)
        }
    }

    fn retransmission_delay(&self) -> Duration {
        let base = if self.rtt_stats.has_updates() {
            self.rtt_stats.smoothed_rtt() + self.rtt_stats.mean_deviation() * 4
        } else {
            DEFAULT_RETRANSMISSION_TIME
        };
        let base = base.max(MIN_RETRANSMISSION_TIME);
        let backoff = 1u32 << self.consecutive_rto_count.min(MAX_RETRANSMISSION_BACKOFFS);
        (base * backoff).min(MAX_RETRANSMISSION_TIME)
    }

    fn mark_for_retransmission(&mut self, packet_number: PacketNumber, transmission_type: TransmissionType) {
        let has_frames = self
            .unacked_packets
            .get(&packet_number)
            .is_some_and(|info| info.retransmittable_frames.is_some());
        if has_frames {
            self.pending_retransmissions
                .entry(packet_number)
                .or_insert(transmission_type);
        }
    }

    fn remove_from_in_flight(&mut self, packet_number: PacketNumber) {
        if let Some(info) = self.unacked_packets.get_mut(&packet_number) {
            if info.in_flight {
                info.in_flight = false;
                self.congestion.on_packet_abandoned(info.bytes_sent);
            }
        }
    }

    fn remove_retransmittability(&mut self, packet_number: PacketNumber) {
        if let Some(info) = self.unacked_packets.get_mut(&packet_number) {
            info.retransmittable_frames = None;
        }
        self.pending_retransmissions.remove(&packet_number);
    }

    /// Every transmission linked to `packet_number`, oldest first.
    fn transmission_chain(&self, packet_number: PacketNumber) -> Vec<PacketNumber> {
        let mut oldest = packet_number;
        while let Some(prev) = self
            .unacked_packets
            .get(&oldest)
            .and_then(|info| info.previous_transmission)
        {
            if !self.unacked_packets.contains_key(&prev) {
                break;
            }
            oldest = prev;
        }
        let mut chain = vec![oldest];
        let mut current = oldest;
        while let Some(next) = self
            .unacked_packets
            .get(&current)
            .and_then(|info| info.next_transmission)
        {
            if !self.unacked_packets.contains_key(&next) {
                break;
            }
            chain.push(next);
            current = next;
        }
        chain
    }

    fn newest_transmission(&self, packet_number: PacketNumber) -> PacketNumber {
        let mut current = packet_number;
        while let Some(next) = self
            .unacked_packets
            .get(&current)
            .and_then(|info| info.next_transmission)
        {
            current = next;
        }
        current
    }

    fn is_useless(&self, packet_number: PacketNumber, info: &TransmissionInfo) -> bool {
        let useful_for_rtt = packet_number > self.largest_observed;
        let useful_for_data = info.retransmittable_frames.is_some()
            || self.newest_transmission(packet_number) > self.largest_observed;
        !info.in_flight && !useful_for_rtt && !useful_for_data
    }

    fn remove_obsolete_packets(&mut self) {
        while let Some((&packet_number, info)) = self.unacked_packets.first_key_value() {
            if !self.is_useless(packet_number, info) {
                break;
            }
            self.unacked_packets.remove(&packet_number);
            self.pending_retransmissions.remove(&packet_number);
        }
    }

    fn on_packet_acked(&mut self, packet_number: PacketNumber, now: Instant, outcome: &mut AckOutcome) {
        for linked in self.transmission_chain(packet_number) {
            self.remove_retransmittability(linked);
        }
        let Some(info) = self.unacked_packets.remove(&packet_number) else {
            return;
        };
        if info.in_flight {
            let rtt = match self.rtt_stats.latest_rtt() {
                rtt if rtt.is_zero() => self.rtt_stats.smoothed_or_initial_rtt(),
                rtt => rtt,
            };
            self.congestion.on_packet_acked(now, info.bytes_sent, rtt);
        }
        if info.is_mtu_probe {
            outcome.acked_mtu_probe = Some(info.bytes_sent);
        }
        self.consecutive_rto_count = 0;
        self.consecutive_tlp_count = 0;
        self.consecutive_crypto_retransmission_count = 0;
    }

    fn detect_losses(&mut self) {
        let lost: Vec<PacketNumber> = self
            .unacked_packets
            .range(..self.largest_observed)
            .filter(|(_, info)| info.in_flight && info.nack_count >= NACKS_BEFORE_RETRANSMISSION)
            .map(|(&pn, _)| pn)
            .collect();
        for packet_number in lost {
            if let Some(info) = self.unacked_packets.get_mut(&packet_number) {
                info.in_flight = false;
                self.congestion.on_packet_lost(info.bytes_sent);
            }
            trace!("packet {} lost", packet_number);
            self.mark_for_retransmission(packet_number, TransmissionType::LossRetransmission);
        }
    }
}

impl SentPacketManager for DefaultSentPacketManager {
    fn set_from_config(&mut self, config: &ConnectionConfig) {
        if !self.rtt_stats.has_updates() {
            self.rtt_stats.set_initial_rtt(config.initial_rtt);
        }
        self.delayed_ack_time = config.delayed_ack_time;
        self.congestion.set_pacing(config.pacing_enabled());
    }

    fn resume_connection_state(
        &mut self,
        params: &CachedNetworkParameters,
        max_bandwidth_resumption: bool,
    ) -> bool {
        let bandwidth = if max_bandwidth_resumption {
            params.max_bandwidth_estimate_bytes_per_second
        } else {
            params.bandwidth_estimate_bytes_per_second
        };
        let min_rtt = Duration::from_millis(params.min_rtt_ms);
        if !self.congestion.resume(bandwidth, min_rtt) {
            return false;
        }
        if !self.rtt_stats.has_updates() {
            self.rtt_stats.set_initial_rtt(min_rtt);
        }
        true
    }

    fn set_num_open_streams(&mut self, num_streams: usize) {
        self.num_open_streams = num_streams;
    }

    fn set_handshake_confirmed(&mut self) {
        self.handshake_confirmed = true;
    }

    fn on_incoming_ack(&mut self, ack: &AckFrame, ack_receive_time: Instant) -> AckOutcome {
        let prior_cwnd = self.congestion.cwnd();
        let mut outcome = AckOutcome::default();

        if let Some(info) = self.unacked_packets.get(&ack.largest_observed) {
            if !ack.missing_packets.contains(&ack.largest_observed) {
                let send_delta = ack_receive_time.saturating_duration_since(info.sent_time);
                self.rtt_stats
                    .update_rtt(send_delta, ack.ack_delay.unwrap_or(Duration::ZERO));
                outcome.rtt_updated = true;
            }
        }
        self.largest_observed = self.largest_observed.max(ack.largest_observed);

        let candidates: Vec<PacketNumber> = self
            .unacked_packets
            .range(..=ack.largest_observed)
            .map(|(&pn, _)| pn)
            .collect();
        for packet_number in candidates {
            if ack.missing_packets.contains(&packet_number) {
                if packet_number == ack.latest_revived_packet {
                    // Delivered through FEC; the frames need not be resent.
                    self.remove_retransmittability(packet_number);
                }
                if let Some(info) = self.unacked_packets.get_mut(&packet_number) {
                    let min_nacks = ack.largest_observed - packet_number;
                    info.nack_count = (info.nack_count + 1).max(min_nacks);
                }
            } else {
                self.on_packet_acked(packet_number, ack_receive_time, &mut outcome);
            }
        }

        self.detect_losses();

        let awaited = ack
            .missing_packets
            .first()
            .copied()
            .unwrap_or(ack.largest_observed + 1);
        self.least_packet_awaited_by_peer = self.least_packet_awaited_by_peer.max(awaited);

        self.remove_obsolete_packets();
        outcome.cwnd_changed = self.congestion.cwnd() != prior_cwnd;
        outcome
    }

    fn on_packet_sent(
        &mut self,
        packet: &mut SerializedPacket,
        original_packet_number: Option<PacketNumber>,
        sent_time: Instant,
        bytes: ByteCount,
        transmission_type: TransmissionType,
        has_retransmittable_data: HasRetransmittableData,
    ) -> bool {
        let packet_number = packet.packet_number;
        debug_assert!(packet_number > self.largest_sent_packet);
        let in_flight = has_retransmittable_data == HasRetransmittableData::Yes;

        let mut info = TransmissionInfo {
            retransmittable_frames: packet.retransmittable_frames.take(),
            encryption_level: packet.encryption_level,
            bytes_sent: bytes,
            sent_time,
            in_flight,
            nack_count: 0,
            is_mtu_probe: packet.is_mtu_probe,
            previous_transmission: None,
            next_transmission: None,
        };

        if let Some(original) = original_packet_number {
            self.pending_retransmissions.remove(&original);
            if let Some(old) = self.unacked_packets.get_mut(&original) {
                old.retransmittable_frames = None;
                old.next_transmission = Some(packet_number);
                info.previous_transmission = Some(original);
            }
            trace!(
                "{:?} of packet {} as {}",
                transmission_type,
                original,
                packet_number
            );
        }

        self.unacked_packets.insert(packet_number, info);
        self.largest_sent_packet = packet_number;
        self.congestion.on_packet_sent(sent_time, bytes, in_flight);
        if in_flight && self.pending_timer_transmission_count > 0 {
            self.pending_timer_transmission_count -= 1;
        }
        in_flight
    }

    fn on_retransmission_timeout(&mut self) {
        match self.retransmission_mode() {
            RetransmissionMode::Handshake => {
                self.consecutive_crypto_retransmission_count += 1;
                let crypto: Vec<PacketNumber> = self
                    .unacked_packets
                    .iter()
                    .filter(|(_, info)| info.in_flight && info.has_crypto_handshake())
                    .map(|(&pn, _)| pn)
                    .collect();
                debug!(
                    "{}handshake timeout, retransmitting {} packets",
                    self.perspective.log_prefix(),
                    crypto.len()
                );
                for packet_number in crypto {
                    self.remove_from_in_flight(packet_number);
                    self.mark_for_retransmission(
                        packet_number,
                        TransmissionType::HandshakeRetransmission,
                    );
                }
            }
            RetransmissionMode::TailLossProbe => {
                self.tlp_count += 1;
                self.consecutive_tlp_count += 1;
                self.pending_timer_transmission_count = 1;
            }
            RetransmissionMode::Rto => {
                self.rto_count += 1;
                let unacked: Vec<PacketNumber> = self.unacked_packets.keys().copied().collect();
                let mut retransmitted = false;
                for packet_number in unacked {
                    if self.has_retransmittable_frames(packet_number) {
                        self.mark_for_retransmission(packet_number, TransmissionType::RtoRetransmission);
                        retransmitted = true;
                    }
                    self.remove_from_in_flight(packet_number);
                }
                debug!(
                    "{}retransmission timeout #{}",
                    self.perspective.log_prefix(),
                    self.consecutive_rto_count + 1
                );
                self.congestion.on_retransmission_timeout(retransmitted);
                self.consecutive_rto_count += 1;
                self.pending_timer_transmission_count = MAX_RTO_PACKETS;
            }
        }
    }

    fn maybe_retransmit_tail_loss_probe(&mut self) -> bool {
        if self.pending_timer_transmission_count == 0 {
            return false;
        }
        let probe = self
            .unacked_packets
            .iter()
            .find(|(_, info)| info.in_flight && info.retransmittable_frames.is_some())
            .map(|(&pn, _)| pn);
        match probe {
            Some(packet_number) => {
                self.mark_for_retransmission(packet_number, TransmissionType::TlpRetransmission);
                true
            }
            None => false,
        }
    }

    fn retransmit_unacked_packets(&mut self, retransmission_type: TransmissionType) {
        debug_assert!(matches!(
            retransmission_type,
            TransmissionType::AllUnackedRetransmission | TransmissionType::AllInitialRetransmission
        ));
        let selected: Vec<PacketNumber> = self
            .unacked_packets
            .iter()
            .filter(|(_, info)| {
                info.retransmittable_frames.as_ref().is_some_and(|frames| {
                    retransmission_type == TransmissionType::AllUnackedRetransmission
                        || frames.encryption_level() == EncryptionLevel::Initial
                })
            })
            .map(|(&pn, _)| pn)
            .collect();
        for packet_number in selected {
            self.remove_from_in_flight(packet_number);
            self.mark_for_retransmission(packet_number, retransmission_type);
        }
    }

    fn neuter_unencrypted_packets(&mut self) {
        let unencrypted: Vec<PacketNumber> = self
            .unacked_packets
            .iter()
            .filter(|(_, info)| {
                info.encryption_level == EncryptionLevel::None
                    && info.retransmittable_frames.is_some()
            })
            .map(|(&pn, _)| pn)
            .collect();
        for packet_number in unencrypted {
            self.remove_from_in_flight(packet_number);
            self.remove_retransmittability(packet_number);
        }
        self.remove_obsolete_packets();
    }

    fn has_pending_retransmissions(&self) -> bool {
        !self.pending_retransmissions.is_empty()
    }

    fn next_pending_retransmission(&mut self) -> Option<PendingRetransmission> {
        while let Some((packet_number, transmission_type)) = self.pending_retransmissions.pop_first() {
            let frames = self
                .unacked_packets
                .get(&packet_number)
                .and_then(|info| info.retransmittable_frames.clone());
            if let Some(retransmittable_frames) = frames {
                return Some(PendingRetransmission {
                    packet_number,
                    retransmittable_frames,
                    transmission_type,
                });
            }
        }
        None
    }

    fn is_unacked(&self, packet_number: PacketNumber) -> bool {
        self.unacked_packets.contains_key(&packet_number)
    }

    fn has_retransmittable_frames(&self, packet_number: PacketNumber) -> bool {
        self.unacked_packets
            .get(&packet_number)
            .is_some_and(|info| info.retransmittable_frames.is_some())
    }

    fn has_unacked_packets(&self) -> bool {
        !self.unacked_packets.is_empty()
    }

    fn retransmission_time(&self) -> Option<Instant> {
        if !self.has_in_flight_packets() || self.pending_timer_transmission_count > 0 {
            return None;
        }
        match self.retransmission_mode() {
            RetransmissionMode::Handshake => self
                .last_in_flight_sent_time(true)
                .map(|sent| sent + self.crypto_retransmission_delay()),
            RetransmissionMode::TailLossProbe => self
                .last_in_flight_sent_time(false)
                .map(|sent| sent + self.tail_loss_probe_delay()),
            RetransmissionMode::Rto => self
                .last_in_flight_sent_time(false)
                .map(|sent| sent + self.retransmission_delay()),
        }
    }

    fn time_until_send(
        &self,
        now: Instant,
        retransmittable: HasRetransmittableData,
    ) -> Option<Duration> {
        if self.pending_timer_transmission_count > 0 {
            return Some(Duration::ZERO);
        }
        self.congestion.time_until_send(now, retransmittable)
    }

    fn delayed_ack_time(&self) -> Duration {
        self.delayed_ack_time
    }

    fn least_unacked(&self) -> PacketNumber {
        self.unacked_packets
            .keys()
            .next()
            .copied()
            .unwrap_or(self.largest_sent_packet + 1)
    }

    fn least_packet_awaited_by_peer(&self) -> PacketNumber {
        self.least_packet_awaited_by_peer
    }

    fn largest_observed(&self) -> PacketNumber {
        self.largest_observed
    }

    fn largest_sent_packet(&self) -> PacketNumber {
        self.largest_sent_packet
    }

    fn rtt_stats(&self) -> &RttStats {
        &self.rtt_stats
    }

    fn bandwidth_estimate(&self) -> u64 {
        self.congestion.bandwidth()
    }

    fn estimate_max_packets_in_flight(&self, max_packet_length: ByteCount) -> PacketCount {
        self.congestion.cwnd() / max_packet_length.max(1)
    }

    fn cancel_retransmissions_for_stream(&mut self, stream_id: StreamId) {
        let mut emptied = Vec::new();
        for (&packet_number, info) in self.unacked_packets.iter_mut() {
            if let Some(frames) = info.retransmittable_frames.as_mut() {
                frames.remove_frames_for_stream(stream_id);
                if frames.is_empty() {
                    emptied.push(packet_number);
                }
            }
        }
        for packet_number in emptied {
            self.remove_retransmittability(packet_number);
        }
    }

    fn on_connection_migration(&mut self, change_type: PeerAddressChangeType) {
        if change_type == PeerAddressChangeType::NoChange || change_type.is_nat_rebinding() {
            return;
        }
        debug!(
            "{}resetting path state after {:?}",
            self.perspective.log_prefix(),
            change_type
        );
        self.rtt_stats.on_connection_migration();
        self.congestion.on_connection_migration();
    }

    fn cached_network_parameters(&self) -> CachedNetworkParameters {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let min_rtt = self.rtt_stats.min_rtt();
        let min_rtt = if min_rtt.is_zero() {
            self.rtt_stats.initial_rtt()
        } else {
            min_rtt
        };
        CachedNetworkParameters {
            bandwidth_estimate_bytes_per_second: self.congestion.bandwidth(),
            max_bandwidth_estimate_bytes_per_second: self.congestion.max_bandwidth(),
            min_rtt_ms: min_rtt.as_millis() as u64,
            previous_connection_state: if self.congestion.in_slow_start() {
                PreviousConnectionState::SlowStart
            } else {
                PreviousConnectionState::CongestionAvoidance
            },
            timestamp,
        }
    }

    fn rto_count(&self) -> u64 {
        self.rto_count
    }

    fn tlp_count(&self) -> u64 {
        self.tlp_count
    }
}
