//! Packet headers.
//!
//! ```text
//! ┌───────────┬───────────────────┬──────────────────────┬──────────────────┐
//! │ Flags (1) │ Connection ID (8) │ Version (4, if flag) │ Packet Num (8)   │
//! └───────────┴───────────────────┴──────────────────────┴──────────────────┘
//!                     authenticated, sent in the clear
//! ┌───────────────────┬──────────────────────────────┬──────────────────────┐
//! │ Private Flags (1) │ FEC Group Offset (1, if flag)│ Frames / Redundancy  │
//! └───────────────────┴──────────────────────────────┴──────────────────────┘
//!                          encrypted
//! ```

use bytes::{BufMut, BytesMut};

use crate::types::{
    ConnectionId, EntropyHash, FecGroupNumber, PacketNumber, QuicVersion,
};

/// Public (unencrypted) flags
pub mod public_flags {
    /// Version present (client) or version negotiation (server)
    pub const VERSION: u8 = 0x01;
    /// Public reset packet
    pub const RESET: u8 = 0x02;
    /// Every defined flag
    pub const ALL: u8 = VERSION | RESET;
}

/// Private (encrypted) flags
pub mod private_flags {
    /// Packet contributes entropy
    pub const ENTROPY: u8 = 0x01;
    /// Packet belongs to an FEC group
    pub const FEC_GROUP: u8 = 0x02;
    /// Packet carries FEC redundancy
    pub const FEC: u8 = 0x04;
    /// Every defined flag
    pub const ALL: u8 = ENTROPY | FEC_GROUP | FEC;
}

/// Bytes of flags plus connection id
pub const PUBLIC_FLAGS_AND_ID_SIZE: usize = 1 + 8;

/// Bytes of a version tag
pub const VERSION_SIZE: usize = 4;

/// Bytes of a packet number
pub const PACKET_NUMBER_SIZE: usize = 8;

/// Bytes of a public reset body
pub const PUBLIC_RESET_BODY_SIZE: usize = 8 + 8;

/// Size of the public header of a data packet.
pub fn public_header_size(include_version: bool) -> usize {
    PUBLIC_FLAGS_AND_ID_SIZE + if include_version { VERSION_SIZE } else { 0 } + PACKET_NUMBER_SIZE
}

/// Size of the private header.
pub fn private_header_size(in_fec_group: bool) -> usize {
    1 + in_fec_group as usize
}

/// Header fields sent in the clear.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublicHeader {
    /// Connection
    pub connection_id: ConnectionId,
    /// Public reset packet
    pub reset_flag: bool,
    /// Version present
    pub version_flag: bool,
    /// Version carried by a client packet, or offered by a negotiation packet
    pub versions: Vec<QuicVersion>,
}

impl PublicHeader {
    /// Append the flags, connection id and optional version.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut flags = 0;
        if self.version_flag {
            flags |= public_flags::VERSION;
        }
        if self.reset_flag {
            flags |= public_flags::RESET;
        }
        buf.put_u8(flags);
        buf.put_u64(self.connection_id);
        if self.version_flag && !self.reset_flag {
            for version in &self.versions {
                buf.put_u32(version.tag());
            }
        }
    }
}

/// Full header of a data or FEC packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PacketHeader {
    /// Public part
    pub public_header: PublicHeader,
    /// Packet number
    pub packet_number: PacketNumber,
    /// Packet contributes entropy
    pub entropy_flag: bool,
    /// Entropy bit derived from the flag and packet number
    pub entropy_hash: EntropyHash,
    /// Packet carries FEC redundancy
    pub fec_flag: bool,
    /// Packet belongs to an FEC group
    pub is_in_fec_group: bool,
    /// Group number, valid when `is_in_fec_group`
    pub fec_group: FecGroupNumber,
}

impl PacketHeader {
    /// Append the public header and packet number.
    pub fn encode_public(&self, buf: &mut BytesMut) {
        self.public_header.encode(buf);
        buf.put_u64(self.packet_number);
    }

    /// Append the private flags and FEC group offset.
    pub fn encode_private(&self, buf: &mut BytesMut) {
        let mut flags = 0;
        if self.entropy_flag {
            flags |= private_flags::ENTROPY;
        }
        if self.is_in_fec_group {
            flags |= private_flags::FEC_GROUP;
        }
        if self.fec_flag {
            flags |= private_flags::FEC;
        }
        buf.put_u8(flags);
        if self.is_in_fec_group {
            let offset = self.packet_number.saturating_sub(self.fec_group);
            buf.put_u8(offset.min(u8::MAX as u64) as u8);
        }
    }
}

/// Stateless reset sent by a peer that lost connection state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublicResetPacket {
    /// Public header with the reset flag
    pub public_header: PublicHeader,
    /// Proof the reset came from the peer
    pub nonce_proof: u64,
    /// Packet that triggered the reset
    pub rejected_packet_number: PacketNumber,
}

/// Server's list of supported versions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionNegotiationPacket {
    /// Connection
    pub connection_id: ConnectionId,
    /// Versions the server supports
    pub versions: Vec<QuicVersion>,
}

/// FEC redundancy payload of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FecData {
    /// Group the redundancy protects
    pub fec_group: FecGroupNumber,
    /// XOR of the protected payloads
    pub redundancy: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_sizes() {
        assert_eq!(public_header_size(false), 17);
        assert_eq!(public_header_size(true), 21);
        assert_eq!(private_header_size(false), 1);
        assert_eq!(private_header_size(true), 2);
    }

    #[test]
    fn test_encode_public_header() {
        let header = PacketHeader {
            public_header: PublicHeader {
                connection_id: 0x42,
                version_flag: true,
                versions: vec![QuicVersion::V25],
                ..PublicHeader::default()
            },
            packet_number: 7,
            ..PacketHeader::default()
        };
        let mut buf = BytesMut::new();
        header.encode_public(&mut buf);
        assert_eq!(buf.len(), public_header_size(true));
        assert_eq!(buf[0], public_flags::VERSION);
        assert_eq!(&buf[9..13], b"Q025");
    }

    #[test]
    fn test_encode_private_header() {
        let header = PacketHeader {
            packet_number: 12,
            entropy_flag: true,
            is_in_fec_group: true,
            fec_group: 10,
            ..PacketHeader::default()
        };
        let mut buf = BytesMut::new();
        header.encode_private(&mut buf);
        assert_eq!(&buf[..], &[private_flags::ENTROPY | private_flags::FEC_GROUP, 2]);
    }
}
