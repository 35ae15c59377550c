//! Connection configuration.
//!
//! [`ConnectionConfig`] is the runtime form consumed by the connection and the
//! default sent-packet manager. [`ConnectionConfigFile`] is its serialized
//! form (durations in milliseconds) for loading from JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{
    ByteCount, FecSendPolicy, PacketCount, MTU_DISCOVERY_TARGET_HIGH, MTU_DISCOVERY_TARGET_LOW,
};

/// Connection option: only send FEC redundancy when the FEC alarm fires.
pub const OPTION_FEC_ALARM_TRIGGER: &str = "FSPA";
/// Connection option: FEC alarm at a quarter RTT instead of half.
pub const OPTION_FEC_QUARTER_RTT: &str = "FRTT";
/// Connection option: probe for the high MTU target.
pub const OPTION_MTU_HIGH: &str = "MTUH";
/// Connection option: probe for the low MTU target.
pub const OPTION_MTU_LOW: &str = "MTUL";
/// Connection option: enable pacing.
pub const OPTION_PACING: &str = "PACE";

/// Runtime connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest accepted distance between a packet number and the last one seen
    pub max_packet_gap: PacketCount,
    /// Concurrent FEC groups tracked on the receive side
    pub max_fec_groups: usize,
    /// Packets received before an ack is forced
    pub max_packets_received_before_ack: PacketCount,
    /// Outstanding packets tracked in either direction before closing
    pub max_tracked_packets: PacketCount,
    /// Undecryptable packets buffered while waiting for keys
    pub max_undecryptable_packets: usize,
    /// Coalescing granularity for alarm updates
    pub alarm_granularity: Duration,
    /// Delay before a queued ack is sent
    pub delayed_ack_time: Duration,
    /// RTT assumed before the first sample
    pub initial_rtt: Duration,
    /// Overall lifetime allowed before the handshake completes
    pub max_time_before_handshake: Duration,
    /// Idle timeout before the handshake completes
    pub max_idle_time_before_handshake: Duration,
    /// Idle timeout once negotiated
    pub idle_connection_state_lifetime: Duration,
    /// Whether the values above were negotiated with the peer
    pub negotiated: bool,
    /// Skip the close frame on idle timeout
    pub silent_close: bool,
    /// Four-character connection options
    pub connection_options: Vec<String>,
    /// Packets per outgoing FEC group
    pub max_packets_per_fec_group: usize,
    /// When outgoing FEC groups are closed
    pub fec_send_policy: FecSendPolicy,
    /// FEC alarm delay as a fraction of smoothed RTT
    pub fec_rtt_multiplier: f64,
    /// Refuse to write while the send alarm is pending
    pub respect_send_alarm: bool,
    /// Close instead of writing non-crypto stream data unencrypted
    pub never_write_unencrypted_data: bool,
    /// Base the idle deadline on the last retransmittable send after the last receipt
    pub use_new_idle_timeout: bool,
    /// Reject peer migrations other than NAT rebinding
    pub disable_non_nat_address_migration: bool,
    /// Pace sends in the default sent-packet manager
    pub enable_pacing: bool,
    /// Keep encrypted crypto-stream packets as termination packets
    pub save_crypto_packets_as_termination_packets: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_packet_gap: 5000,
            max_fec_groups: 2,
            max_packets_received_before_ack: 20,
            max_tracked_packets: 5000,
            max_undecryptable_packets: 10,
            alarm_granularity: Duration::from_millis(1),
            delayed_ack_time: Duration::from_millis(25),
            initial_rtt: Duration::from_millis(100),
            max_time_before_handshake: Duration::from_secs(10),
            max_idle_time_before_handshake: Duration::from_secs(5),
            idle_connection_state_lifetime: Duration::from_secs(30),
            negotiated: false,
            silent_close: false,
            connection_options: Vec::new(),
            max_packets_per_fec_group: 10,
            fec_send_policy: FecSendPolicy::AnyTrigger,
            fec_rtt_multiplier: 0.5,
            respect_send_alarm: true,
            never_write_unencrypted_data: true,
            use_new_idle_timeout: false,
            disable_non_nat_address_migration: false,
            enable_pacing: false,
            save_crypto_packets_as_termination_packets: false,
        }
    }
}

impl ConnectionConfig {
    /// Check whether a connection option was configured.
    pub fn has_option(&self, tag: &str) -> bool {
        self.connection_options.iter().any(|o| o == tag)
    }

    /// MTU probing target requested by the options, if any.
    pub fn mtu_discovery_target(&self) -> Option<ByteCount> {
        if self.has_option(OPTION_MTU_HIGH) {
            Some(MTU_DISCOVERY_TARGET_HIGH)
        } else if self.has_option(OPTION_MTU_LOW) {
            Some(MTU_DISCOVERY_TARGET_LOW)
        } else {
            None
        }
    }

    /// FEC send policy after applying options.
    pub fn effective_fec_send_policy(&self) -> FecSendPolicy {
        if self.has_option(OPTION_FEC_ALARM_TRIGGER) {
            FecSendPolicy::AlarmTrigger
        } else {
            self.fec_send_policy
        }
    }

    /// FEC RTT multiplier after applying options.
    pub fn effective_fec_rtt_multiplier(&self) -> f64 {
        if self.has_option(OPTION_FEC_QUARTER_RTT) {
            0.25
        } else {
            self.fec_rtt_multiplier
        }
    }

    /// Whether pacing is on, by flag or option.
    pub fn pacing_enabled(&self) -> bool {
        self.enable_pacing || self.has_option(OPTION_PACING)
    }

    /// Load from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: ConnectionConfigFile = serde_json::from_str(json)?;
        let config = file.to_config();
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_packet_gap == 0 {
            return Err(Error::config("max_packet_gap must be positive"));
        }
        if self.max_fec_groups == 0 {
            return Err(Error::config("max_fec_groups must be positive"));
        }
        if self.max_packets_received_before_ack == 0 {
            return Err(Error::config(
                "max_packets_received_before_ack must be positive",
            ));
        }
        if self.max_tracked_packets == 0 {
            return Err(Error::config("max_tracked_packets must be positive"));
        }
        if self.max_idle_time_before_handshake > self.max_time_before_handshake {
            return Err(Error::config(
                "idle timeout before handshake exceeds the handshake timeout",
            ));
        }
        if !(0.0..=1.0).contains(&self.fec_rtt_multiplier) {
            return Err(Error::config("fec_rtt_multiplier must be within [0, 1]"));
        }
        if let Some(bad) = self.connection_options.iter().find(|o| o.len() != 4) {
            return Err(Error::config(format!(
                "connection option {:?} is not a four-character tag",
                bad
            )));
        }
        Ok(())
    }
}

/// Configuration file format for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfigFile {
    /// Largest accepted packet number gap
    pub max_packet_gap: PacketCount,
    /// Concurrent FEC groups
    pub max_fec_groups: usize,
    /// Packets before a forced ack
    pub max_packets_received_before_ack: PacketCount,
    /// Outstanding packet limit
    pub max_tracked_packets: PacketCount,
    /// Undecryptable packet queue size
    pub max_undecryptable_packets: usize,
    /// Alarm granularity (milliseconds)
    pub alarm_granularity_ms: u64,
    /// Delayed ack time (milliseconds)
    pub delayed_ack_time_ms: u64,
    /// Initial RTT (milliseconds)
    pub initial_rtt_ms: u64,
    /// Handshake timeout (milliseconds)
    pub max_time_before_handshake_ms: u64,
    /// Idle timeout before handshake (milliseconds)
    pub max_idle_time_before_handshake_ms: u64,
    /// Negotiated idle timeout (seconds)
    pub idle_connection_state_lifetime_secs: u64,
    /// Values were negotiated
    pub negotiated: bool,
    /// Silent close on idle timeout
    pub silent_close: bool,
    /// Connection options
    pub connection_options: Vec<String>,
    /// Packets per outgoing FEC group
    pub max_packets_per_fec_group: usize,
    /// FEC send policy
    pub fec_send_policy: FecSendPolicy,
    /// FEC RTT multiplier
    pub fec_rtt_multiplier: f64,
    /// Respect the send alarm
    pub respect_send_alarm: bool,
    /// Never write unencrypted stream data
    pub never_write_unencrypted_data: bool,
    /// Use the retransmittable-send idle deadline
    pub use_new_idle_timeout: bool,
    /// Only accept NAT rebinding migrations
    pub disable_non_nat_address_migration: bool,
    /// Enable pacing
    pub enable_pacing: bool,
    /// Save crypto packets as termination packets
    pub save_crypto_packets_as_termination_packets: bool,
}

impl Default for ConnectionConfigFile {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

impl ConnectionConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_packet_gap: self.max_packet_gap,
            max_fec_groups: self.max_fec_groups,
            max_packets_received_before_ack: self.max_packets_received_before_ack,
            max_tracked_packets: self.max_tracked_packets,
            max_undecryptable_packets: self.max_undecryptable_packets,
            alarm_granularity: Duration::from_millis(self.alarm_granularity_ms),
            delayed_ack_time: Duration::from_millis(self.delayed_ack_time_ms),
            initial_rtt: Duration::from_millis(self.initial_rtt_ms),
            max_time_before_handshake: Duration::from_millis(self.max_time_before_handshake_ms),
            max_idle_time_before_handshake: Duration::from_millis(
                self.max_idle_time_before_handshake_ms,
            ),
            idle_connection_state_lifetime: Duration::from_secs(
                self.idle_connection_state_lifetime_secs,
            ),
            negotiated: self.negotiated,
            silent_close: self.silent_close,
            connection_options: self.connection_options.clone(),
            max_packets_per_fec_group: self.max_packets_per_fec_group,
            fec_send_policy: self.fec_send_policy,
            fec_rtt_multiplier: self.fec_rtt_multiplier,
            respect_send_alarm: self.respect_send_alarm,
            never_write_unencrypted_data: self.never_write_unencrypted_data,
            use_new_idle_timeout: self.use_new_idle_timeout,
            disable_non_nat_address_migration: self.disable_non_nat_address_migration,
            enable_pacing: self.enable_pacing,
            save_crypto_packets_as_termination_packets: self
                .save_crypto_packets_as_termination_packets,
        }
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            max_packet_gap: config.max_packet_gap,
            max_fec_groups: config.max_fec_groups,
            max_packets_received_before_ack: config.max_packets_received_before_ack,
            max_tracked_packets: config.max_tracked_packets,
            max_undecryptable_packets: config.max_undecryptable_packets,
            alarm_granularity_ms: config.alarm_granularity.as_millis() as u64,
            delayed_ack_time_ms: config.delayed_ack_time.as_millis() as u64,
            initial_rtt_ms: config.initial_rtt.as_millis() as u64,
            max_time_before_handshake_ms: config.max_time_before_handshake.as_millis() as u64,
            max_idle_time_before_handshake_ms: config.max_idle_time_before_handshake.as_millis()
                as u64,
            idle_connection_state_lifetime_secs: config.idle_connection_state_lifetime.as_secs(),
            negotiated: config.negotiated,
            silent_close: config.silent_close,
            connection_options: config.connection_options.clone(),
            max_packets_per_fec_group: config.max_packets_per_fec_group,
            fec_send_policy: config.fec_send_policy,
            fec_rtt_multiplier: config.fec_rtt_multiplier,
            respect_send_alarm: config.respect_send_alarm,
            never_write_unencrypted_data: config.never_write_unencrypted_data,
            use_new_idle_timeout: config.use_new_idle_timeout,
            disable_non_nat_address_migration: config.disable_non_nat_address_migration,
            enable_pacing: config.enable_pacing,
            save_crypto_packets_as_termination_packets: config
                .save_crypto_packets_as_termination_packets,
        }
    }
}
