//! Core protocol types shared by every layer of the connection engine.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a logical connection.
pub type ConnectionId = u64;

/// Per-direction packet sequence number. Zero means "no packet".
pub type PacketNumber = u64;

/// Stream identifier.
pub type StreamId = u32;

/// Byte offset within a stream.
pub type StreamOffset = u64;

/// FEC group number: the packet number of the first packet protected by the group.
pub type FecGroupNumber = u64;

/// Byte count.
pub type ByteCount = u64;

/// Packet count.
pub type PacketCount = u64;

/// One-byte entropy hash carried by packets and acks.
pub type EntropyHash = u8;

/// The stream that carries the cryptographic handshake.
pub const CRYPTO_STREAM_ID: StreamId = 1;

/// Largest packet the engine will ever build or accept.
pub const MAX_PACKET_SIZE: ByteCount = 1452;

/// Default max packet length for clients.
pub const DEFAULT_MAX_PACKET_SIZE: ByteCount = 1350;

/// Default max packet length for servers.
pub const DEFAULT_SERVER_MAX_PACKET_SIZE: ByteCount = 1000;

/// High MTU probing target.
pub const MTU_DISCOVERY_TARGET_HIGH: ByteCount = 1450;

/// Low MTU probing target.
pub const MTU_DISCOVERY_TARGET_LOW: ByteCount = 1430;

/// Number of MTU probes before giving up.
pub const MTU_DISCOVERY_ATTEMPTS: usize = 3;

/// Packets sent between the first two MTU probes. Doubles after every probe.
pub const PACKETS_BETWEEN_MTU_PROBES_BASE: PacketCount = 100;

/// Keep-alive interval for clients with open streams.
pub const PING_TIMEOUT: Duration = Duration::from_secs(15);

/// Granularity used for the ping alarm.
pub const PING_ALARM_GRANULARITY: Duration = Duration::from_secs(1);

/// Default send algorithm packet size.
pub const DEFAULT_TCP_MSS: ByteCount = 1460;

/// Protocol version tag, e.g. `Q025`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuicVersion(pub u32);

impl QuicVersion {
    /// Version 25.
    pub const V25: QuicVersion = QuicVersion::from_number(25);
    /// Version 26.
    pub const V26: QuicVersion = QuicVersion::from_number(26);
    /// Version 27.
    pub const V27: QuicVersion = QuicVersion::from_number(27);
    /// Version 28.
    pub const V28: QuicVersion = QuicVersion::from_number(28);
    /// Version 29.
    pub const V29: QuicVersion = QuicVersion::from_number(29);
    /// Version 30.
    pub const V30: QuicVersion = QuicVersion::from_number(30);

    /// Builds the `Q0nn` tag for a version number below 100.
    pub const fn from_number(n: u32) -> Self {
        let tens = b'0' as u32 + (n / 10) % 10;
        let ones = b'0' as u32 + n % 10;
        QuicVersion((b'Q' as u32) << 24 | (b'0' as u32) << 16 | tens << 8 | ones)
    }

    /// The tag as it appears on the wire.
    pub fn tag(self) -> u32 {
        self.0
    }
}

impl fmt::Display for QuicVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        if bytes.iter().all(|b| b.is_ascii_alphanumeric()) {
            for b in bytes {
                write!(f, "{}", b as char)?;
            }
            Ok(())
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

impl fmt::Debug for QuicVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Versions supported by default, most preferred first.
pub fn supported_versions() -> Vec<QuicVersion> {
    vec![
        QuicVersion::V30,
        QuicVersion::V29,
        QuicVersion::V28,
        QuicVersion::V27,
        QuicVersion::V26,
        QuicVersion::V25,
    ]
}

/// Which side of the connection this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perspective {
    /// Accepting side.
    Server,
    /// Initiating side.
    Client,
}

impl Perspective {
    /// Log prefix used by the connection.
    pub fn log_prefix(self) -> &'static str {
        match self {
            Perspective::Server => "Server: ",
            Perspective::Client => "Client: ",
        }
    }
}

/// Packet protection level. Ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EncryptionLevel {
    /// Integrity tag only.
    None = 0,
    /// Keys from the initial handshake round trip.
    Initial = 1,
    /// Forward-secure session keys.
    ForwardSecure = 2,
}

impl EncryptionLevel {
    /// Number of levels.
    pub const COUNT: usize = 3;

    /// All levels, weakest first.
    pub const ALL: [EncryptionLevel; 3] = [
        EncryptionLevel::None,
        EncryptionLevel::Initial,
        EncryptionLevel::ForwardSecure,
    ];

    /// Index into per-level tables.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Why a packet is being (re)transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionType {
    /// First transmission.
    NotRetransmission,
    /// Retransmission of handshake data.
    HandshakeRetransmission,
    /// Retransmission of every unacked packet.
    AllUnackedRetransmission,
    /// Retransmission of every unacked initially-encrypted packet.
    AllInitialRetransmission,
    /// Retransmission after loss detection.
    LossRetransmission,
    /// Retransmission after a retransmission timeout.
    RtoRetransmission,
    /// Tail loss probe.
    TlpRetransmission,
}

/// Whether a packet carries frames that must be retransmitted on loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HasRetransmittableData {
    /// Only acks, stop-waiting, padding or FEC redundancy.
    No,
    /// At least one retransmittable frame.
    Yes,
}

/// Whether a packet carries handshake data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsHandshake {
    /// Regular data.
    No,
    /// Crypto stream data.
    Yes,
}

/// Whether outgoing stream data must be FEC protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FecProtection {
    /// Send unprotected.
    MayNotFecProtect,
    /// Open or join an FEC group.
    MustFecProtect,
}

/// When the generator closes an FEC group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FecSendPolicy {
    /// When the group is full or the FEC alarm fires.
    AnyTrigger,
    /// Only when the FEC alarm fires; full groups are reset.
    AlarmTrigger,
}

/// How a bundler scope treats a pending ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckBundling {
    /// Always send an ack.
    SendAck,
    /// Never add an ack.
    NoAck,
    /// Add an ack only if one is queued or the ack alarm is pending.
    BundlePendingAck,
}

/// Version negotiation progress. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VersionNegotiationState {
    /// Nothing exchanged yet.
    StartNegotiation,
    /// Versions offered, waiting for the peer to settle.
    NegotiationInProgress,
    /// Both sides agree.
    NegotiatedVersion,
}

/// Classification of a peer address change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddressChangeType {
    /// Same address.
    NoChange,
    /// Same IP, different port.
    NatPortRebinding,
    /// IPv4 address within the same /24.
    Ipv4SubnetRebinding,
    /// IPv4 address in a different subnet.
    Ipv4ToIpv4Change,
    /// IPv4 to IPv6.
    Ipv4ToIpv6Change,
    /// IPv6 to IPv4.
    Ipv6ToIpv4Change,
    /// Different IPv6 address.
    Ipv6ToIpv6Change,
    /// Not classifiable.
    Unknown,
}

impl PeerAddressChangeType {
    /// Classify a move from `old` to `new`.
    pub fn classify(old: &SocketAddr, new: &SocketAddr) -> Self {
        if old == new {
            return PeerAddressChangeType::NoChange;
        }
        if old.ip() == new.ip() {
            return PeerAddressChangeType::NatPortRebinding;
        }
        match (old, new) {
            (SocketAddr::V4(a), SocketAddr::V4(b)) => {
                if a.ip().octets()[..3] == b.ip().octets()[..3] {
                    PeerAddressChangeType::Ipv4SubnetRebinding
                } else {
                    PeerAddressChangeType::Ipv4ToIpv4Change
                }
            }
            (SocketAddr::V4(_), SocketAddr::V6(_)) => PeerAddressChangeType::Ipv4ToIpv6Change,
            (SocketAddr::V6(_), SocketAddr::V4(_)) => PeerAddressChangeType::Ipv6ToIpv4Change,
            (SocketAddr::V6(_), SocketAddr::V6(_)) => PeerAddressChangeType::Ipv6ToIpv6Change,
        }
    }

    /// Whether the change keeps the path's congestion state valid.
    pub fn is_nat_rebinding(self) -> bool {
        matches!(
            self,
            PeerAddressChangeType::NatPortRebinding | PeerAddressChangeType::Ipv4SubnetRebinding
        )
    }
}

/// Result of offering stream data to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumedData {
    /// Bytes taken from the offered data.
    pub bytes_consumed: usize,
    /// Whether the fin was consumed.
    pub fin_consumed: bool,
}

impl ConsumedData {
    /// Build a result.
    pub fn new(bytes_consumed: usize, fin_consumed: bool) -> Self {
        Self {
            bytes_consumed,
            fin_consumed,
        }
    }
}

/// Entropy contributed by a single packet.
pub fn packet_entropy_hash(entropy_flag: bool, packet_number: PacketNumber) -> EntropyHash {
    if entropy_flag {
        1u8 << (packet_number % 8)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_tag() {
        assert_eq!(QuicVersion::V25.tag(), u32::from_be_bytes(*b"Q025"));
        assert_eq!(QuicVersion::V30.to_string(), "Q030");
        assert_eq!(QuicVersion(0xdead_beef).to_string(), "0xdeadbeef");
    }

    #[test]
    fn test_encryption_level_ordering() {
        assert!(EncryptionLevel::None < EncryptionLevel::Initial);
        assert!(EncryptionLevel::Initial < EncryptionLevel::ForwardSecure);
        assert_eq!(EncryptionLevel::ForwardSecure.index(), 2);
    }

    #[test]
    fn test_classify_peer_address_change() {
        let a: SocketAddr = "10.0.0.1:443".parse().unwrap();
        let same_ip: SocketAddr = "10.0.0.1:444".parse().unwrap();
        let subnet: SocketAddr = "10.0.0.7:443".parse().unwrap();
        let other: SocketAddr = "10.0.9.1:443".parse().unwrap();
        let v6: SocketAddr = "[::1]:443".parse().unwrap();

        assert_eq!(PeerAddressChangeType::classify(&a, &a), PeerAddressChangeType::NoChange);
        assert_eq!(
            PeerAddressChangeType::classify(&a, &same_ip),
            PeerAddressChangeType::NatPortRebinding
        );
        assert_eq!(
            PeerAddressChangeType::classify(&a, &subnet),
            PeerAddressChangeType::Ipv4SubnetRebinding
        );
        assert_eq!(
            PeerAddressChangeType::classify(&a, &other),
            PeerAddressChangeType::Ipv4ToIpv4Change
        );
        assert_eq!(
            PeerAddressChangeType::classify(&a, &v6),
            PeerAddressChangeType::Ipv4ToIpv6Change
        );
        assert!(PeerAddressChangeType::Ipv4SubnetRebinding.is_nat_rebinding());
        assert!(!PeerAddressChangeType::Ipv6ToIpv6Change.is_nat_rebinding());
    }

    #[test]
    fn test_packet_entropy_hash() {
        assert_eq!(packet_entropy_hash(false, 3), 0);
        assert_eq!(packet_entropy_hash(true, 3), 0b1000);
        assert_eq!(packet_entropy_hash(true, 8), 1);
    }
}
