//! Entropy bookkeeping.
//!
//! Every packet contributes a one-byte entropy hash (see
//! [`packet_entropy_hash`](crate::types::packet_entropy_hash)). An ack
//! carries the XOR of the hashes of every packet the receiver got up to its
//! largest observed, so the sender can check the ack is not made up.

use std::collections::{BTreeSet, VecDeque};

use crate::types::{EntropyHash, PacketNumber};

/// Per-packet entropy of sent packets.
#[derive(Debug, Clone)]
pub struct SentEntropyManager {
    /// Hash of each packet from `map_offset` on
    packets_entropy: VecDeque<EntropyHash>,
    /// Packet number of the front of `packets_entropy`
    map_offset: PacketNumber,
    /// XOR of every packet below `map_offset`
    cleared_hash: EntropyHash,
}

impl Default for SentEntropyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SentEntropyManager {
    /// Empty manager; packet numbers start at 1.
    pub fn new() -> Self {
        Self {
            packets_entropy: VecDeque::new(),
            map_offset: 1,
            cleared_hash: 0,
        }
    }

    fn largest_recorded(&self) -> PacketNumber {
        self.map_offset + self.packets_entropy.len() as u64 - 1
    }

    /// Record the hash of a sent packet. Packet numbers must increase.
    pub fn record_packet(&mut self, packet_number: PacketNumber, hash: EntropyHash) {
        if packet_number < self.map_offset {
            return;
        }
        if self.packets_entropy.is_empty() && packet_number > self.map_offset {
            // Nothing recorded yet; start the map at this packet.
            self.map_offset = packet_number;
        }
        while self.largest_recorded() + 1 < packet_number {
            self.packets_entropy.push_back(0);
        }
        if packet_number <= self.largest_recorded() {
            let index = (packet_number - self.map_offset) as usize;
            self.packets_entropy[index] = hash;
        } else {
            self.packets_entropy.push_back(hash);
        }
    }

    /// XOR of the hashes of every packet up to and including `packet_number`.
    pub fn entropy_hash(&self, packet_number: PacketNumber) -> EntropyHash {
        if packet_number < self.map_offset {
            return self.cleared_hash;
        }
        let count = (packet_number - self.map_offset + 1) as usize;
        self.packets_entropy
            .iter()
            .take(count)
            .fold(self.cleared_hash, |acc, h| acc ^ h)
    }

    /// Whether `entropy_hash` matches an ack of `largest_observed` with the
    /// given packets missing.
    pub fn is_valid_entropy(
        &self,
        largest_observed: PacketNumber,
        missing_packets: &BTreeSet<PacketNumber>,
        entropy_hash: EntropyHash,
    ) -> bool {
        if largest_observed > self.largest_recorded() {
            return false;
        }
        if missing_packets
            .iter()
            .next()
            .is_some_and(|&first| first < self.map_offset)
        {
            return false;
        }
        let mut expected = self.entropy_hash(largest_observed);
        for &missing in missing_packets.range(..=largest_observed) {
            let index = (missing - self.map_offset) as usize;
            expected ^= self.packets_entropy.get(index).copied().unwrap_or(0);
        }
        expected == entropy_hash
    }

    /// Forget per-packet hashes below `packet_number`, folding them into the
    /// cumulative hash.
    pub fn clear_entropy_before(&mut self, packet_number: PacketNumber) {
        while self.map_offset < packet_number {
            let Some(hash) = self.packets_entropy.pop_front() else {
                break;
            };
            self.cleared_hash ^= hash;
            self.map_offset += 1;
        }
    }
}

/// Entropy of received packets, used to fill in ack frames.
///
/// Packets below `first_gap` are folded into `packets_entropy_hash`; from
/// `first_gap` on each slot records whether the packet arrived and its hash.
#[derive(Debug, Clone)]
pub struct ReceivedEntropyTracker {
    packets_entropy: VecDeque<(EntropyHash, bool)>,
    /// XOR of every received packet
    packets_entropy_hash: EntropyHash,
    first_gap: PacketNumber,
    largest_observed: PacketNumber,
}

impl Default for ReceivedEntropyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceivedEntropyTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self {
            packets_entropy: VecDeque::new(),
            packets_entropy_hash: 0,
            first_gap: 1,
            largest_observed: 0,
        }
    }

    /// Smallest packet number not yet received.
    pub fn first_gap(&self) -> PacketNumber {
        self.first_gap
    }

    /// Largest packet number recorded.
    pub fn largest_observed(&self) -> PacketNumber {
        self.largest_observed
    }

    /// Slots tracked beyond the first gap.
    pub fn size(&self) -> usize {
        self.packets_entropy.len()
    }

    /// Record a received packet.
    pub fn record_packet_entropy_hash(&mut self, packet_number: PacketNumber, hash: EntropyHash) {
        if packet_number < self.first_gap {
            return;
        }
        let index = (packet_number - self.first_gap) as usize;
        if index >= self.packets_entropy.len() {
            self.packets_entropy.resize(index + 1, (0, false));
        }
        if self.packets_entropy[index].1 {
            return;
        }
        self.packets_entropy[index] = (hash, true);
        self.packets_entropy_hash ^= hash;
        self.largest_observed = self.largest_observed.max(packet_number);
        self.advance_first_gap();
    }

    /// Cumulative hash of every received packet up to `packet_number`.
    ///
    /// `packet_number` must lie between `first_gap - 1` and the largest
    /// observed packet.
    pub fn entropy_hash(&self, packet_number: PacketNumber) -> EntropyHash {
        debug_assert!(packet_number + 1 >= self.first_gap);
        debug_assert!(packet_number <= self.largest_observed);
        let skip = (packet_number + 1).saturating_sub(self.first_gap) as usize;
        self.packets_entropy
            .iter()
            .skip(skip)
            .filter(|(_, received)| *received)
            .fold(self.packets_entropy_hash, |acc, (h, _)| acc ^ h)
    }

    /// Replace everything below `packet_number` with the peer's cumulative
    /// `hash` of it.
    pub fn set_cumulative_entropy_up_to(&mut self, packet_number: PacketNumber, hash: EntropyHash) {
        if packet_number < self.first_gap {
            return;
        }
        while self.first_gap < packet_number {
            self.packets_entropy.pop_front();
            self.first_gap += 1;
        }
        // Total becomes the peer's hash plus every received packet still tracked.
        self.packets_entropy_hash = self
            .packets_entropy
            .iter()
            .filter(|(_, received)| *received)
            .fold(hash, |acc, (h, _)| acc ^ h);
        if self.first_gap > self.largest_observed + 1 {
            self.largest_observed = self.first_gap - 1;
        }
        self.advance_first_gap();
    }

    fn advance_first_gap(&mut self) {
        while let Some(&(_, true)) = self.packets_entropy.front() {
            self.packets_entropy.pop_front();
            self.first_gap += 1;
        }
        if self.packets_entropy.is_empty() && self.first_gap <= self.largest_observed {
            self.first_gap = self.largest_observed + 1;
        }
    }
}
