//! Forward Error Correction (FEC) groups.
//!
//! A group protects a run of consecutive packets with one redundancy packet
//! carrying the XOR of their payloads. Any single lost packet of the group
//! can be rebuilt from the others and the redundancy.
//!
//! ```text
//! Data packets:    P5   P6   P7   P8
//!                   \    \    \    \
//! FEC packet P9:    P5 ⊕ P6 ⊕ P7 ⊕ P8      group 5, protects [5, 8]
//! ```
//!
//! [`FecGroup`] collects the receive side of a group; [`FecEncoder`] builds
//! the redundancy of the group being sent.

use std::collections::BTreeSet;

use crate::types::{EncryptionLevel, FecGroupNumber, PacketNumber, MAX_PACKET_SIZE};

/// XOR `payload` into `parity`, growing it as needed.
fn xor_into(parity: &mut Vec<u8>, payload: &[u8]) {
    if parity.len() < payload.len() {
        parity.resize(payload.len(), 0);
    }
    for (p, byte) in parity.iter_mut().zip(payload) {
        *p ^= byte;
    }
}

/// Receive side of one FEC group.
#[derive(Debug, Clone)]
pub struct FecGroup {
    group_number: FecGroupNumber,
    received_packets: BTreeSet<PacketNumber>,
    /// Protected range, known once the redundancy arrived
    min_protected_packet: Option<PacketNumber>,
    max_protected_packet: Option<PacketNumber>,
    parity: Vec<u8>,
    effective_encryption_level: EncryptionLevel,
}

impl FecGroup {
    /// Empty group.
    pub fn new(group_number: FecGroupNumber) -> Self {
        Self {
            group_number,
            received_packets: BTreeSet::new(),
            min_protected_packet: None,
            max_protected_packet: None,
            parity: Vec::new(),
            effective_encryption_level: EncryptionLevel::ForwardSecure,
        }
    }

    /// Group number.
    pub fn group_number(&self) -> FecGroupNumber {
        self.group_number
    }

    /// Add a protected packet's payload.
    ///
    /// Rejects duplicates, packets outside the known protected range and
    /// payloads larger than the maximum packet size.
    pub fn update(
        &mut self,
        encryption_level: EncryptionLevel,
        packet_number: PacketNumber,
        payload: &[u8],
    ) -> bool {
        if self.received_packets.contains(&packet_number) {
            return false;
        }
        if let (Some(min), Some(max)) = (self.min_protected_packet, self.max_protected_packet) {
            if packet_number < min || packet_number > max {
                return false;
            }
        }
        if payload.len() as u64 > MAX_PACKET_SIZE {
            return false;
        }
        xor_into(&mut self.parity, payload);
        self.received_packets.insert(packet_number);
        self.effective_encryption_level = self.effective_encryption_level.min(encryption_level);
        true
    }

    /// Add the group's redundancy, carried by packet `fec_packet_number`.
    ///
    /// Fails if redundancy was already received or a member already
    /// received is not below the FEC packet.
    pub fn update_fec(
        &mut self,
        encryption_level: EncryptionLevel,
        fec_packet_number: PacketNumber,
        redundancy: &[u8],
    ) -> bool {
        if self.has_received_fec() {
            return false;
        }
        if self
            .received_packets
            .last()
            .is_some_and(|&largest| largest >= fec_packet_number)
        {
            return false;
        }
        if fec_packet_number <= self.group_number || redundancy.len() as u64 > MAX_PACKET_SIZE {
            return false;
        }
        xor_into(&mut self.parity, redundancy);
        self.min_protected_packet = Some(self.group_number);
        self.max_protected_packet = Some(fec_packet_number - 1);
        self.effective_encryption_level = self.effective_encryption_level.min(encryption_level);
        true
    }

    /// Whether the redundancy packet arrived.
    pub fn has_received_fec(&self) -> bool {
        self.max_protected_packet.is_some()
    }

    /// Protected packets not yet received. Unknown until the redundancy arrives.
    pub fn num_missing_packets(&self) -> Option<u64> {
        let (min, max) = (self.min_protected_packet?, self.max_protected_packet?);
        Some(max - min + 1 - self.received_packets.len() as u64)
    }

    /// Whether exactly one protected packet is missing.
    pub fn can_revive(&self) -> bool {
        self.num_missing_packets() == Some(1)
    }

    /// Rebuild the single missing packet: its number and payload.
    pub fn revive(&self) -> Option<(PacketNumber, Vec<u8>)> {
        if !self.can_revive() {
            return None;
        }
        let (min, max) = (self.min_protected_packet?, self.max_protected_packet?);
        let missing = (min..=max).find(|pn| !self.received_packets.contains(pn))?;
        Some((missing, self.parity.clone()))
    }

    /// Whether every protected packet lies below `packet_number`.
    ///
    /// Before the redundancy arrives only the received packets are known.
    pub fn protects_packets_before(&self, packet_number: PacketNumber) -> bool {
        match self.max_protected_packet {
            Some(max) => max < packet_number,
            None => self
                .received_packets
                .last()
                .map_or(self.group_number < packet_number, |&largest| largest < packet_number),
        }
    }

    /// Lowest level any member arrived at.
    pub fn effective_encryption_level(&self) -> EncryptionLevel {
        self.effective_encryption_level
    }

    /// Number of protected packets received.
    pub fn num_received_packets(&self) -> usize {
        self.received_packets.len()
    }
}

/// Send side: accumulates the redundancy of the open FEC group.
#[derive(Debug, Clone, Default)]
pub struct FecEncoder {
    group_number: Option<FecGroupNumber>,
    packets: usize,
    parity: Vec<u8>,
}

impl FecEncoder {
    /// Encoder with no open group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a group is open.
    pub fn is_open(&self) -> bool {
        self.group_number.is_some()
    }

    /// Number of the open group.
    pub fn group_number(&self) -> Option<FecGroupNumber> {
        self.group_number
    }

    /// Open a group starting at `packet_number` if none is open.
    pub fn open(&mut self, packet_number: PacketNumber) {
        if self.group_number.is_none() {
            self.group_number = Some(packet_number);
            self.packets = 0;
            self.parity.clear();
        }
    }

    /// Add the payload of a protected packet to the open group.
    pub fn add_packet(&mut self, payload: &[u8]) {
        debug_assert!(self.is_open());
        xor_into(&mut self.parity, payload);
        self.packets += 1;
    }

    /// Protected packets in the open group.
    pub fn num_packets(&self) -> usize {
        self.packets
    }

    /// Close the open group, returning its number and redundancy.
    pub fn finish(&mut self) -> Option<(FecGroupNumber, Vec<u8>)> {
        let group_number = self.group_number.take()?;
        if self.packets == 0 {
            return None;
        }
        self.packets = 0;
        Some((group_number, std::mem::take(&mut self.parity)))
    }

    /// Drop the open group without emitting redundancy.
    pub fn reset(&mut self) {
        self.group_number = None;
        self.packets = 0;
        self.parity.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revive_single_loss() {
        let payloads: [&[u8]; 4] = [b"packet1", b"pkt2", b"packet-three", b"p4"];
        let mut encoder = FecEncoder::new();
        encoder.open(5);
        for payload in payloads {
            encoder.add_packet(payload);
        }
        let (group, redundancy) = encoder.finish().unwrap();
        assert_eq!(group, 5);
        assert!(!encoder.is_open());

        let mut receiver = FecGroup::new(5);
        assert!(receiver.update(EncryptionLevel::ForwardSecure, 5, payloads[0]));
        assert!(receiver.update(EncryptionLevel::ForwardSecure, 6, payloads[1]));
        assert!(receiver.update(EncryptionLevel::Initial, 8, payloads[3]));
        assert!(!receiver.can_revive());

        assert!(receiver.update_fec(EncryptionLevel::ForwardSecure, 9, &redundancy));
        assert!(receiver.can_revive());
        assert_eq!(receiver.effective_encryption_level(), EncryptionLevel::Initial);

        let (missing, payload) = receiver.revive().unwrap();
        assert_eq!(missing, 7);
        assert_eq!(&payload[..payloads[2].len()], payloads[2]);
        assert!(payload[payloads[2].len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_update_rejections() {
        let mut group = FecGroup::new(10);
        assert!(group.update(EncryptionLevel::None, 10, b"a"));
        assert!(!group.update(EncryptionLevel::None, 10, b"a"));
        let too_big = vec![0u8; MAX_PACKET_SIZE as usize + 1];
        assert!(!group.update(EncryptionLevel::None, 11, &too_big));

        assert!(group.update_fec(EncryptionLevel::None, 13, b"x"));
        assert!(!group.update_fec(EncryptionLevel::None, 14, b"x"));
        assert!(!group.update(EncryptionLevel::None, 13, b"b"));
        assert!(!group.update(EncryptionLevel::None, 9, b"b"));
        assert!(group.update(EncryptionLevel::None, 12, b"b"));
        assert!(group.can_revive());
    }

    #[test]
    fn test_fec_before_received_member_rejected() {
        let mut group = FecGroup::new(10);
        assert!(group.update(EncryptionLevel::None, 12, b"a"));
        assert!(!group.update_fec(EncryptionLevel::None, 12, b"x"));
        assert!(!group.has_received_fec());
    }

    #[test]
    fn test_protects_packets_before() {
        let mut group = FecGroup::new(10);
        group.update(EncryptionLevel::None, 11, b"a");
        assert!(group.protects_packets_before(12));
        assert!(!group.protects_packets_before(11));

        group.update_fec(EncryptionLevel::None, 14, b"x");
        assert!(!group.protects_packets_before(12));
        assert!(group.protects_packets_before(14));
    }

    #[test]
    fn test_encoder_reset() {
        let mut encoder = FecEncoder::new();
        encoder.open(3);
        encoder.add_packet(b"abc");
        encoder.open(4);
        assert_eq!(encoder.group_number(), Some(3));
        encoder.reset();
        assert!(encoder.finish().is_none());
    }
}
