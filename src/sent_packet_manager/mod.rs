//! Send-side loss recovery and congestion control.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  SentPacketManager (trait)                                   │
//! │    DefaultSentPacketManager                                  │
//! │      unacked packet map   NACK loss detection, TLP, RTO      │
//! │      RttStats             smoothed RTT and deviation         │
//! │      CongestionController window, bandwidth, pacing          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The connection owns the manager as a trait object, so tests and embedders
//! can substitute their own.

mod congestion;
mod manager;
mod rtt;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::generator::SerializedPacket;
use crate::types::{
    ByteCount, HasRetransmittableData, PacketCount, PacketNumber, PeerAddressChangeType, StreamId,
    TransmissionType,
};
use crate::wire::{AckFrame, RetransmittableFrames};

pub use congestion::{BbrState, CongestionConfig, CongestionController};
pub use manager::DefaultSentPacketManager;
pub use rtt::RttStats;

/// What changed while processing an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckOutcome {
    /// The congestion window changed
    pub cwnd_changed: bool,
    /// A new RTT sample was taken
    pub rtt_updated: bool,
    /// Size of an acked MTU probe, if one was acked
    pub acked_mtu_probe: Option<ByteCount>,
}

/// A packet whose frames must be sent again.
#[derive(Debug, Clone)]
pub struct PendingRetransmission {
    /// Packet being retransmitted
    pub packet_number: PacketNumber,
    /// Frames to resend, at their original level
    pub retransmittable_frames: RetransmittableFrames,
    /// Why it is being resent
    pub transmission_type: TransmissionType,
}

/// Receives congestion and RTT changes found while processing acks.
pub trait NetworkChangeVisitor {
    /// The congestion window changed.
    fn on_congestion_window_change(&mut self);

    /// The RTT estimate changed.
    fn on_rtt_change(&mut self);
}

/// Snapshot of path state that can seed a later connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedNetworkParameters {
    /// Bandwidth estimate, bytes per second
    pub bandwidth_estimate_bytes_per_second: u64,
    /// Largest bandwidth estimate seen
    pub max_bandwidth_estimate_bytes_per_second: u64,
    /// Lowest RTT observed, milliseconds
    pub min_rtt_ms: u64,
    /// Congestion state when the snapshot was taken
    pub previous_connection_state: PreviousConnectionState,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
}

/// Congestion state recorded in [`CachedNetworkParameters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviousConnectionState {
    /// Still probing for bandwidth
    SlowStart,
    /// Steady state
    CongestionAvoidance,
}

impl CachedNetworkParameters {
    /// Encode as an opaque blob.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a blob produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Send-side bookkeeping consulted by the connection.
pub trait SentPacketManager {
    /// Apply connection configuration.
    fn set_from_config(&mut self, config: &ConnectionConfig);

    /// Seed path state from a previous connection.
    ///
    /// Returns `false` if the parameters were not usable.
    fn resume_connection_state(
        &mut self,
        params: &CachedNetworkParameters,
        max_bandwidth_resumption: bool,
    ) -> bool;

    /// Number of open streams, for congestion control.
    fn set_num_open_streams(&mut self, num_streams: usize);

    /// The handshake is confirmed; stop handshake retransmission mode.
    fn set_handshake_confirmed(&mut self);

    /// Process an ack from the peer.
    fn on_incoming_ack(&mut self, ack: &AckFrame, ack_receive_time: Instant) -> AckOutcome;

    /// Record a written packet, taking its retransmittable frames.
    ///
    /// `original_packet_number` is set when the packet retransmits an older one.
    /// Returns whether the packet is in flight.
    #[allow(clippy::too_many_arguments)]
    fn on_packet_sent(
        &mut self,
        packet: &mut SerializedPacket,
        original_packet_number: Option<PacketNumber>,
        sent_time: Instant,
        bytes: ByteCount,
        transmission_type: TransmissionType,
        has_retransmittable_data: HasRetransmittableData,
    ) -> bool;

    /// The retransmission alarm fired.
    fn on_retransmission_timeout(&mut self);

    /// Queue a tail loss probe if one is owed. Returns whether one was queued.
    fn maybe_retransmit_tail_loss_probe(&mut self) -> bool;

    /// Queue retransmission of every unacked packet, or of the initially
    /// encrypted ones only.
    fn retransmit_unacked_packets(&mut self, retransmission_type: TransmissionType);

    /// Stop retransmitting packets sent without encryption.
    fn neuter_unencrypted_packets(&mut self);

    /// Whether retransmissions are queued.
    fn has_pending_retransmissions(&self) -> bool;

    /// Take the next queued retransmission.
    fn next_pending_retransmission(&mut self) -> Option<PendingRetransmission>;

    /// Whether the packet is still tracked.
    fn is_unacked(&self, packet_number: PacketNumber) -> bool;

    /// Whether the packet still carries frames that need delivery.
    fn has_retransmittable_frames(&self, packet_number: PacketNumber) -> bool;

    /// Whether any sent packet is still tracked.
    fn has_unacked_packets(&self) -> bool;

    /// When the retransmission alarm should fire, if at all.
    fn retransmission_time(&self) -> Option<Instant>;

    /// Delay before the next packet may be sent. `None` means not until
    /// something changes (an ack or a timeout).
    fn time_until_send(
        &self,
        now: Instant,
        retransmittable: HasRetransmittableData,
    ) -> Option<Duration>;

    /// Delay the peer is expected to hold acks for.
    fn delayed_ack_time(&self) -> Duration;

    /// Smallest packet number still tracked.
    fn least_unacked(&self) -> PacketNumber;

    /// Lowest packet the peer reported as not received.
    fn least_packet_awaited_by_peer(&self) -> PacketNumber;

    /// Largest packet number the peer acked.
    fn largest_observed(&self) -> PacketNumber;

    /// Largest packet number sent.
    fn largest_sent_packet(&self) -> PacketNumber;

    /// RTT estimates.
    fn rtt_stats(&self) -> &RttStats;

    /// Bandwidth estimate, bytes per second.
    fn bandwidth_estimate(&self) -> u64;

    /// Packets of `max_packet_length` that fit in the congestion window.
    fn estimate_max_packets_in_flight(&self, max_packet_length: ByteCount) -> PacketCount;

    /// Drop frames of a reset stream from pending data.
    fn cancel_retransmissions_for_stream(&mut self, stream_id: StreamId);

    /// The peer moved.
    fn on_connection_migration(&mut self, change_type: PeerAddressChangeType);

    /// Snapshot of the path state.
    fn cached_network_parameters(&self) -> CachedNetworkParameters;

    /// Retransmission timeouts so far.
    fn rto_count(&self) -> u64;

    /// Tail loss probes so far.
    fn tlp_count(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_parameters_blob() {
        let params = CachedNetworkParameters {
            bandwidth_estimate_bytes_per_second: 125_000,
            max_bandwidth_estimate_bytes_per_second: 250_000,
            min_rtt_ms: 42,
            previous_connection_state: PreviousConnectionState::CongestionAvoidance,
            timestamp: 1_700_000_000,
        };
        let blob = params.to_bytes().unwrap();
        assert_eq!(CachedNetworkParameters::from_bytes(&blob).unwrap(), params);
        assert!(CachedNetworkParameters::from_bytes(b"not json").is_err());
    }
}
