//! Congestion Control Implementation.
//!
//! A BBR (Bottleneck Bandwidth and Round-trip propagation time) inspired
//! window controller. Every method takes the current time explicitly, so the
//! controller runs the same under a real or a mock clock.
//!
//! ## State Machine
//!
//! ```text
//! ┌──────────┐     bandwidth     ┌──────────┐
//! │ STARTUP  │ ───────────────▶  │ DRAIN    │
//! └──────────┘    saturated      └──────────┘
//!      ▲                              │
//!      │ retransmission               │ queue drained
//!      │ timeout                      ▼
//!      │                        ┌──────────┐
//!      └─────────────────────── │ PROBE_BW │ ◀──┐
//!                               └──────────┘    │
//!                                     │         │
//!                             periodic│         │ RTT stable
//!                                     ▼         │
//!                               ┌───────────┐   │
//!                               │ PROBE_RTT │ ──┘
//!                               └───────────┘
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::types::{ByteCount, HasRetransmittableData, DEFAULT_TCP_MSS};

/// Bandwidth samples kept for the max filter
const BANDWIDTH_WINDOW: usize = 10;

/// Time spent in PROBE_RTT
const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);

/// BBR state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BbrState {
    /// Initial state: grow the window quickly to find bandwidth
    Startup,
    /// Drain the queue built during startup
    Drain,
    /// Steady state: probe for more bandwidth
    ProbeBw,
    /// Periodically probe for lower RTT
    ProbeRtt,
}

/// Congestion control configuration.
#[derive(Debug, Clone)]
pub struct CongestionConfig {
    /// Initial congestion window (packets)
    pub initial_cwnd: u64,
    /// Maximum congestion window (packets)
    pub max_cwnd: u64,
    /// Minimum congestion window (packets)
    pub min_cwnd: u64,
    /// Pacing gain during startup
    pub startup_pacing_gain: f64,
    /// Pacing gain during probe_bw
    pub probe_bw_pacing_gain: f64,
    /// RTT probe interval
    pub probe_rtt_interval: Duration,
    /// Loss rate above which a loss counts as congestion
    pub loss_threshold: f64,
    /// Ignore isolated losses below the threshold
    pub loss_tolerant: bool,
    /// Delay sends to spread them over the RTT
    pub pacing: bool,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            initial_cwnd: 10,
            max_cwnd: 1000,
            min_cwnd: 4,
            startup_pacing_gain: 2.885, // 2/ln(2)
            probe_bw_pacing_gain: 1.0,
            probe_rtt_interval: Duration::from_secs(10),
            loss_threshold: 0.02,
            loss_tolerant: false,
            pacing: false,
        }
    }
}

/// Congestion controller implementing a BBR-like algorithm.
#[derive(Debug, Clone)]
pub struct CongestionController {
    state: BbrState,
    /// Congestion window (bytes)
    cwnd: ByteCount,
    bytes_in_flight: ByteCount,
    /// Pacing rate (bytes per second)
    pacing_rate: u64,
    /// Bottleneck bandwidth estimate (bytes per second)
    btl_bw: u64,
    /// Largest bandwidth estimate seen
    max_btl_bw: u64,
    /// Minimum RTT observed (microseconds)
    min_rtt_us: u64,
    initial_rtt_us: u64,
    bw_samples: VecDeque<u64>,
    probe_rtt_time: Option<Instant>,
    packets_since_loss: u64,
    loss_events: u64,
    config: CongestionConfig,
    pacing_tokens: f64,
    last_pacing_update: Option<Instant>,
}

impl CongestionController {
    /// Create a controller assuming `initial_rtt` until the first sample.
    pub fn new(config: CongestionConfig, initial_rtt: Duration) -> Self {
        let initial_cwnd = config.initial_cwnd * DEFAULT_TCP_MSS;
        let initial_rtt_us = (initial_rtt.as_micros() as u64).max(1);
        Self {
            state: BbrState::Startup,
            cwnd: initial_cwnd,
            bytes_in_flight: 0,
            pacing_rate: initial_cwnd * 1_000_000 / initial_rtt_us,
            btl_bw: 0,
            max_btl_bw: 0,
            min_rtt_us: initial_rtt_us,
            initial_rtt_us,
            bw_samples: VecDeque::with_capacity(BANDWIDTH_WINDOW),
            probe_rtt_time: None,
            packets_since_loss: 0,
            loss_events: 0,
            pacing_tokens: initial_cwnd as f64,
            last_pacing_update: None,
            config,
        }
    }

    /// Turn pacing on or off.
    pub fn set_pacing(&mut self, pacing: bool) {
        self.config.pacing = pacing;
    }

    /// Whether pacing is on.
    pub fn pacing(&self) -> bool {
        self.config.pacing
    }

    /// Delay before a packet may be sent, `None` while the window is full.
    pub fn time_until_send(
        &self,
        now: Instant,
        retransmittable: HasRetransmittableData,
    ) -> Option<Duration> {
        if retransmittable == HasRetransmittableData::No {
            return Some(Duration::ZERO);
        }
        if self.bytes_in_flight >= self.cwnd {
            return None;
        }
        if !self.config.pacing {
            return Some(Duration::ZERO);
        }
        let tokens = self.tokens_at(now);
        if tokens >= DEFAULT_TCP_MSS as f64 {
            Some(Duration::ZERO)
        } else {
            let needed = DEFAULT_TCP_MSS as f64 - tokens;
            let wait_us = needed * 1_000_000.0 / self.pacing_rate.max(1) as f64;
            Some(Duration::from_micros(wait_us as u64))
        }
    }

    /// Record that a packet went out.
    pub fn on_packet_sent(&mut self, now: Instant, bytes: ByteCount, in_flight: bool) {
        if self.config.pacing {
            self.pacing_tokens = self.tokens_at(now) - bytes as f64;
            self.last_pacing_update = Some(now);
        }
        if in_flight {
            self.bytes_in_flight += bytes;
            self.packets_since_loss += 1;
        }
    }

    /// Record acknowledgment of an in-flight packet.
    pub fn on_packet_acked(&mut self, now: Instant, bytes: ByteCount, rtt: Duration) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);

        let rtt_us = (rtt.as_micros() as u64).max(1);
        self.min_rtt_us = self.min_rtt_us.min(rtt_us);

        let bw = bytes * 1_000_000 / rtt_us;
        self.bw_samples.push_back(bw);
        if self.bw_samples.len() > BANDWIDTH_WINDOW {
            self.bw_samples.pop_front();
        }
        self.update_bandwidth();
        self.update_state(now, bytes);
    }

    /// Record loss of an in-flight packet.
    pub fn on_packet_lost(&mut self, bytes: ByteCount) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
        self.loss_events += 1;

        let loss_rate = if self.packets_since_loss > 0 {
            self.loss_events as f64 / self.packets_since_loss as f64
        } else {
            1.0
        };

        if !self.config.loss_tolerant || loss_rate > self.config.loss_threshold {
            self.handle_congestion_loss();
        }
    }

    /// Take a packet out of flight without counting it as acked or lost.
    pub fn on_packet_abandoned(&mut self, bytes: ByteCount) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
    }

    /// Collapse the window after a retransmission timeout.
    pub fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        if !packets_retransmitted {
            return;
        }
        self.cwnd = self.min_window();
        self.state = BbrState::Startup;
        self.loss_events = 0;
        self.packets_since_loss = 0;
    }

    /// Forget the path after a migration.
    pub fn on_connection_migration(&mut self) {
        let config = self.config.clone();
        let initial_rtt = Duration::from_micros(self.initial_rtt_us);
        let bytes_in_flight = self.bytes_in_flight;
        *self = Self::new(config, initial_rtt);
        self.bytes_in_flight = bytes_in_flight;
    }

    /// Seed from a previous connection's bandwidth and RTT.
    pub fn resume(&mut self, bandwidth: u64, min_rtt: Duration) -> bool {
        let min_rtt_us = min_rtt.as_micros() as u64;
        if bandwidth == 0 || min_rtt_us == 0 {
            return false;
        }
        self.btl_bw = bandwidth;
        self.max_btl_bw = self.max_btl_bw.max(bandwidth);
        self.min_rtt_us = min_rtt_us;
        self.cwnd = (bandwidth * min_rtt_us / 1_000_000).clamp(self.min_window(), self.max_window());
        self.update_pacing_rate(self.config.probe_bw_pacing_gain);
        true
    }

    /// Congestion window in bytes.
    pub fn cwnd(&self) -> ByteCount {
        self.cwnd
    }

    /// Pacing rate in bytes per second.
    pub fn pacing_rate(&self) -> u64 {
        self.pacing_rate
    }

    /// Bottleneck bandwidth estimate in bytes per second.
    pub fn bandwidth(&self) -> u64 {
        self.btl_bw
    }

    /// Largest bandwidth estimate seen.
    pub fn max_bandwidth(&self) -> u64 {
        self.max_btl_bw
    }

    /// Minimum RTT in microseconds.
    pub fn min_rtt_us(&self) -> u64 {
        self.min_rtt_us
    }

    /// Current state.
    pub fn state(&self) -> BbrState {
        self.state
    }

    /// Whether the controller is still probing upward from the start.
    pub fn in_slow_start(&self) -> bool {
        self.state == BbrState::Startup
    }

    /// Bytes currently in flight.
    pub fn bytes_in_flight(&self) -> ByteCount {
        self.bytes_in_flight
    }

    fn min_window(&self) -> ByteCount {
        self.config.min_cwnd * DEFAULT_TCP_MSS
    }

    fn max_window(&self) -> ByteCount {
        self.config.max_cwnd * DEFAULT_TCP_MSS
    }

    fn tokens_at(&self, now: Instant) -> f64 {
        let elapsed_us = self
            .last_pacing_update
            .map_or(0.0, |last| now.saturating_duration_since(last).as_micros() as f64);
        let new_tokens = self.pacing_rate as f64 * elapsed_us / 1_000_000.0;
        (self.pacing_tokens + new_tokens).min(self.cwnd as f64)
    }

    fn update_bandwidth(&mut self) {
        let max_bw = self.bw_samples.iter().copied().max().unwrap_or(0);
        if max_bw > self.btl_bw {
            self.btl_bw = max_bw;
        }
        self.max_btl_bw = self.max_btl_bw.max(self.btl_bw);
    }

    fn update_state(&mut self, now: Instant, bytes_acked: ByteCount) {
        match self.state {
            BbrState::Startup => {
                let prev_bw = self.bw_samples.front().copied().unwrap_or(0);
                if self.bw_samples.len() == BANDWIDTH_WINDOW
                    && prev_bw > 0
                    && self.btl_bw < prev_bw * 5 / 4
                {
                    // Less than 25% growth over the window.
                    self.state = BbrState::Drain;
                }
                self.cwnd = (self.cwnd + bytes_acked).min(self.max_window());
                self.update_pacing_rate(self.config.startup_pacing_gain);
            }

            BbrState::Drain => {
                self.update_pacing_rate(0.5);
                if self.bytes_in_flight <= self.bandwidth_delay_product() {
                    self.state = BbrState::ProbeBw;
                }
            }

            BbrState::ProbeBw => {
                self.update_pacing_rate(self.config.probe_bw_pacing_gain);
                let bdp = self.bandwidth_delay_product();
                self.cwnd = (bdp + 3 * DEFAULT_TCP_MSS).clamp(self.min_window(), self.max_window());

                match self.probe_rtt_time {
                    Some(probe_time)
                        if now.saturating_duration_since(probe_time) > self.config.probe_rtt_interval =>
                    {
                        self.probe_rtt_time = Some(now);
                        self.state = BbrState::ProbeRtt;
                    }
                    Some(_) => {}
                    None => self.probe_rtt_time = Some(now),
                }
            }

            BbrState::ProbeRtt => {
                self.cwnd = self.min_window();
                if let Some(probe_time) = self.probe_rtt_time {
                    if now.saturating_duration_since(probe_time) > PROBE_RTT_DURATION {
                        self.probe_rtt_time = Some(now);
                        self.state = BbrState::ProbeBw;
                    }
                }
            }
        }
    }

    fn update_pacing_rate(&mut self, gain: f64) {
        if self.btl_bw > 0 {
            self.pacing_rate = (self.btl_bw as f64 * gain) as u64;
        } else {
            self.pacing_rate = self.cwnd * 1_000_000 / self.min_rtt_us.max(1);
        }
        self.pacing_rate = self.pacing_rate.max(DEFAULT_TCP_MSS * 10);
    }

    fn handle_congestion_loss(&mut self) {
        // Multiplicative decrease
        self.cwnd = (self.cwnd * 7 / 10).max(self.min_window());
        if self.state == BbrState::Startup {
            self.state = BbrState::ProbeBw;
        }
        self.loss_events = 0;
        self.packets_since_loss = 0;
        self.btl_bw = self.btl_bw * 9 / 10;
    }

    fn bandwidth_delay_product(&self) -> ByteCount {
        self.btl_bw * self.min_rtt_us / 1_000_000
    }
}
