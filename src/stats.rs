//! Connection statistics.
//!
//! Counters only ever grow; nothing in the protocol reads them back.

use std::time::{Duration, Instant};

use crate::types::{ByteCount, PacketCount};

/// Per-connection counters and estimates.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// When the connection was created
    pub connection_creation_time: Option<Instant>,

    /// Bytes written, including retransmissions
    pub bytes_sent: ByteCount,
    /// Packets written, including retransmissions
    pub packets_sent: PacketCount,
    /// Bytes written as retransmissions
    pub bytes_retransmitted: ByteCount,
    /// Packets written as retransmissions
    pub packets_retransmitted: PacketCount,
    /// Packets discarded from the queue before writing
    pub packets_discarded: PacketCount,

    /// Bytes received, including undecryptable and duplicate packets
    pub bytes_received: ByteCount,
    /// Packets received, including undecryptable and duplicate packets
    pub packets_received: PacketCount,
    /// Packets fully processed
    pub packets_processed: PacketCount,
    /// Bytes of packets fully processed
    pub bytes_processed: ByteCount,
    /// Packets dropped (wrong connection id, duplicates, undecryptable)
    pub packets_dropped: PacketCount,
    /// Packets reconstructed from FEC groups
    pub packets_revived: PacketCount,
    /// Stream payload bytes received
    pub stream_bytes_received: ByteCount,

    /// Lowest RTT observed
    pub min_rtt: Duration,
    /// Smoothed RTT
    pub srtt: Duration,
    /// Bandwidth estimate, bytes per second
    pub estimated_bandwidth: u64,
    /// Current max outgoing packet length
    pub max_packet_size: ByteCount,
    /// Largest packet received
    pub max_received_packet_size: ByteCount,
    /// Retransmission timeouts
    pub rto_count: u64,
    /// Tail loss probes
    pub tlp_count: u64,
}

impl ConnectionStats {
    /// Create empty statistics stamped with the creation time.
    pub fn new(now: Instant) -> Self {
        Self {
            connection_creation_time: Some(now),
            ..Self::default()
        }
    }

    /// Fraction of sent packets that were retransmissions.
    pub fn retransmission_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_retransmitted as f64 / self.packets_sent as f64
        }
    }

    /// Fraction of received packets that were dropped.
    pub fn drop_rate(&self) -> f64 {
        if self.packets_received == 0 {
            0.0
        } else {
            self.packets_dropped as f64 / self.packets_received as f64
        }
    }

    /// Format the statistics as a simple text report.
    pub fn format_report(&self) -> String {
        format!(
            r#"Connection Statistics
=====================
Sent:
  Packets:        {}
  Bytes:          {}
  Retransmitted:  {} packets / {} bytes
  Discarded:      {}

Received:
  Packets:        {}
  Bytes:          {}
  Processed:      {} packets / {} bytes
  Dropped:        {}
  Revived:        {}
  Stream Bytes:   {}

Path:
  Min RTT:        {:?}
  Smoothed RTT:   {:?}
  Bandwidth:      {} B/s
  Max Packet:     {} bytes
  Max Received:   {} bytes
  RTOs / TLPs:    {} / {}
"#,
            self.packets_sent,
            self.bytes_sent,
            self.packets_retransmitted,
            self.bytes_retransmitted,
            self.packets_discarded,
            self.packets_received,
            self.bytes_received,
            self.packets_processed,
            self.bytes_processed,
            self.packets_dropped,
            self.packets_revived,
            self.stream_bytes_received,
            self.min_rtt,
            self.srtt,
            self.estimated_bandwidth,
            self.max_packet_size,
            self.max_received_packet_size,
            self.rto_count,
            self.tlp_count,
        )
    }
}
