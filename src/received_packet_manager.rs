//! Receive-side packet tracking and ack frame construction.

use std::collections::BTreeSet;
use std::time::Instant;

use tracing::trace;

use crate::entropy::ReceivedEntropyTracker;
use crate::types::{ByteCount, PacketCount, PacketNumber};
use crate::wire::{AckFrame, PacketHeader, StopWaitingFrame};
use crate::wire::frames::MAX_ACK_MISSING_PACKETS;

/// A new gap counts as new while the largest observed packet is at most this
/// far past the highest missing packet.
const MAX_PACKETS_AFTER_NEW_MISSING: PacketCount = 4;

/// Tracks which packets arrived and builds ack frames for them.
#[derive(Debug, Clone)]
pub struct ReceivedPacketManager {
    entropy_tracker: ReceivedEntropyTracker,
    largest_observed: PacketNumber,
    missing_packets: BTreeSet<PacketNumber>,
    latest_revived_packet: PacketNumber,
    time_largest_observed: Option<Instant>,
    /// The peer no longer retransmits anything below this
    peer_least_packet_awaiting_ack: PacketNumber,
    ack_frame_updated: bool,
    bytes_received: ByteCount,
}

impl Default for ReceivedPacketManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceivedPacketManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            entropy_tracker: ReceivedEntropyTracker::new(),
            largest_observed: 0,
            missing_packets: BTreeSet::new(),
            latest_revived_packet: 0,
            time_largest_observed: None,
            peer_least_packet_awaiting_ack: 0,
            ack_frame_updated: false,
            bytes_received: 0,
        }
    }

    /// Record a packet that decrypted and parsed.
    pub fn record_packet_received(
        &mut self,
        bytes: ByteCount,
        header: &PacketHeader,
        receipt_time: Instant,
    ) {
        let packet_number = header.packet_number;
        debug_assert!(self.is_awaiting_packet(packet_number));
        self.bytes_received += bytes;
        self.ack_frame_updated = true;

        self.missing_packets.remove(&packet_number);
        if packet_number > self.largest_observed {
            let first_missing = (self.largest_observed + 1).max(self.peer_least_packet_awaiting_ack);
            self.missing_packets.extend(first_missing..packet_number);
            self.largest_observed = packet_number;
            self.time_largest_observed = Some(receipt_time);
        }
        self.entropy_tracker
            .record_packet_entropy_hash(packet_number, header.entropy_hash);
    }

    /// Record a packet reconstructed from FEC. It stays in the missing set
    /// and is reported as the latest revived packet instead.
    pub fn record_packet_revived(&mut self, packet_number: PacketNumber) {
        if !self.is_awaiting_packet(packet_number) {
            return;
        }
        self.latest_revived_packet = packet_number;
        self.ack_frame_updated = true;
    }

    /// Whether `packet_number` is below the largest observed and missing.
    pub fn is_missing(&self, packet_number: PacketNumber) -> bool {
        self.missing_packets.contains(&packet_number)
    }

    /// Whether `packet_number` is new and the peer may still send it.
    pub fn is_awaiting_packet(&self, packet_number: PacketNumber) -> bool {
        packet_number >= self.peer_least_packet_awaiting_ack
            && (packet_number > self.largest_observed || self.is_missing(packet_number))
    }

    /// Apply a stop waiting frame from the peer.
    pub fn update_packet_information_sent_by_peer(&mut self, stop_waiting: &StopWaitingFrame) {
        let least_unacked = stop_waiting.least_unacked;
        if least_unacked <= self.peer_least_packet_awaiting_ack {
            return;
        }
        trace!(
            "peer stopped waiting for packets below {}, {} missing dropped",
            least_unacked,
            self.missing_packets.range(..least_unacked).count()
        );
        self.missing_packets = self.missing_packets.split_off(&least_unacked);
        self.entropy_tracker
            .set_cumulative_entropy_up_to(least_unacked, stop_waiting.entropy_hash);
        self.peer_least_packet_awaiting_ack = least_unacked;
        if self.entropy_tracker.largest_observed() > self.largest_observed {
            self.largest_observed = self.entropy_tracker.largest_observed();
        }
        if self.latest_revived_packet < least_unacked {
            self.latest_revived_packet = 0;
        }
        self.ack_frame_updated = true;
    }

    /// Build an ack frame describing what has been received.
    ///
    /// More than 255 missing packets truncate the frame: only the lowest 255
    /// are reported and the largest observed is lowered to the highest
    /// received packet below the first one left out.
    pub fn ack_frame(&self, approximate_now: Instant) -> AckFrame {
        self.ack_frame_with_limit(approximate_now, MAX_ACK_MISSING_PACKETS)
    }

    /// Ack frame reporting at most `max_missing_packets` missing packets,
    /// so that it fits in the packet it will be sent in.
    pub fn ack_frame_with_limit(&self, approximate_now: Instant, max_missing_packets: usize) -> AckFrame {
        let max_missing_packets = max_missing_packets.clamp(1, MAX_ACK_MISSING_PACKETS);
        let mut ack = AckFrame {
            largest_observed: self.largest_observed,
            latest_revived_packet: self.latest_revived_packet,
            ..AckFrame::default()
        };

        if self.missing_packets.len() > max_missing_packets {
            let mut kept: BTreeSet<PacketNumber> = self
                .missing_packets
                .iter()
                .take(max_missing_packets)
                .copied()
                .collect();
            let cut = self
                .missing_packets
                .iter()
                .nth(max_missing_packets)
                .copied()
                .unwrap_or(self.largest_observed + 1);
            let mut largest = cut - 1;
            while kept.remove(&largest) {
                largest -= 1;
            }
            ack.largest_observed = largest;
            ack.missing_packets = kept;
            ack.is_truncated = true;
            if ack.latest_revived_packet > largest {
                ack.latest_revived_packet = 0;
            }
        } else {
            ack.missing_packets = self.missing_packets.clone();
            ack.ack_delay = self
                .time_largest_observed
                .and_then(|t| approximate_now.checked_duration_since(t));
        }

        ack.entropy_hash = if ack.largest_observed == 0 {
            0
        } else {
            self.entropy_tracker.entropy_hash(ack.largest_observed)
        };
        ack
    }

    /// Whether the highest gap appeared within the last few packets.
    pub fn has_new_missing_packets(&self) -> bool {
        self.missing_packets
            .last()
            .is_some_and(|&highest| self.largest_observed - highest <= MAX_PACKETS_AFTER_NEW_MISSING)
    }

    /// Largest packet number received.
    pub fn largest_observed(&self) -> PacketNumber {
        self.largest_observed
    }

    /// Lowest packet the peer may still retransmit.
    pub fn peer_least_packet_awaiting_ack(&self) -> PacketNumber {
        self.peer_least_packet_awaiting_ack
    }

    /// Latest packet reconstructed from FEC, 0 if none.
    pub fn latest_revived_packet(&self) -> PacketNumber {
        self.latest_revived_packet
    }

    /// Packets tracked above the first gap.
    pub fn num_tracked_packets(&self) -> usize {
        self.entropy_tracker.size()
    }

    /// Whether anything changed since the flag was last reset.
    pub fn ack_frame_updated(&self) -> bool {
        self.ack_frame_updated
    }

    /// Clear the updated flag after an ack went out.
    pub fn reset_ack_frame_updated(&mut self) {
        self.ack_frame_updated = false;
    }

    /// Total bytes of recorded packets.
    pub fn bytes_received(&self) -> ByteCount {
        self.bytes_received
    }
}
