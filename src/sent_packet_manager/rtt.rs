//! Round-trip time estimation.

use std::time::Duration;

/// Smoothed RTT and deviation, updated with Jacobson's algorithm.
#[derive(Debug, Clone)]
pub struct RttStats {
    latest_rtt: Duration,
    min_rtt: Duration,
    smoothed_rtt: Duration,
    mean_deviation: Duration,
    initial_rtt: Duration,
}

impl RttStats {
    /// Stats with no samples, assuming `initial_rtt` until the first one.
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            latest_rtt: Duration::ZERO,
            min_rtt: Duration::ZERO,
            smoothed_rtt: Duration::ZERO,
            mean_deviation: Duration::ZERO,
            initial_rtt,
        }
    }

    /// Add a sample. `ack_delay` is subtracted when that leaves the sample
    /// above the minimum RTT.
    pub fn update_rtt(&mut self, send_delta: Duration, ack_delay: Duration) {
        if send_delta.is_zero() {
            return;
        }
        if self.min_rtt.is_zero() || send_delta < self.min_rtt {
            self.min_rtt = send_delta;
        }

        let mut rtt_sample = send_delta;
        if rtt_sample > ack_delay && rtt_sample - ack_delay >= self.min_rtt {
            rtt_sample -= ack_delay;
        }
        self.latest_rtt = rtt_sample;

        if self.smoothed_rtt.is_zero() {
            self.smoothed_rtt = rtt_sample;
            self.mean_deviation = rtt_sample / 2;
        } else {
            // RTTVAR = 3/4 * RTTVAR + 1/4 * |SRTT - R|
            // SRTT = 7/8 * SRTT + 1/8 * R
            let diff = if self.smoothed_rtt > rtt_sample {
                self.smoothed_rtt - rtt_sample
            } else {
                rtt_sample - self.smoothed_rtt
            };
            self.mean_deviation = self.mean_deviation * 3 / 4 + diff / 4;
            self.smoothed_rtt = self.smoothed_rtt * 7 / 8 + rtt_sample / 8;
        }
    }

    /// Forget every sample; the path changed.
    pub fn on_connection_migration(&mut self) {
        self.latest_rtt = Duration::ZERO;
        self.min_rtt = Duration::ZERO;
        self.smoothed_rtt = Duration::ZERO;
        self.mean_deviation = Duration::ZERO;
    }

    /// Whether any sample was taken.
    pub fn has_updates(&self) -> bool {
        !self.smoothed_rtt.is_zero()
    }

    /// Smoothed RTT, or the initial RTT before the first sample.
    pub fn smoothed_or_initial_rtt(&self) -> Duration {
        if self.smoothed_rtt.is_zero() {
            self.initial_rtt
        } else {
            self.smoothed_rtt
        }
    }

    /// Smoothed RTT, zero before the first sample.
    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    /// Lowest sample.
    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    /// Most recent sample.
    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    /// Mean deviation.
    pub fn mean_deviation(&self) -> Duration {
        self.mean_deviation
    }

    /// RTT assumed before the first sample.
    pub fn initial_rtt(&self) -> Duration {
        self.initial_rtt
    }

    /// Change the assumed initial RTT.
    pub fn set_initial_rtt(&mut self, initial_rtt: Duration) {
        if !initial_rtt.is_zero() {
            self.initial_rtt = initial_rtt;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample() {
        let mut rtt = RttStats::new(Duration::from_millis(100));
        assert_eq!(rtt.smoothed_or_initial_rtt(), Duration::from_millis(100));
        assert!(!rtt.has_updates());

        rtt.update_rtt(Duration::from_millis(50), Duration::ZERO);
        assert_eq!(rtt.smoothed_rtt(), Duration::from_millis(50));
        assert_eq!(rtt.mean_deviation(), Duration::from_millis(25));
        assert_eq!(rtt.min_rtt(), Duration::from_millis(50));
    }

    #[test]
    fn test_smoothing() {
        let mut rtt = RttStats::new(Duration::from_millis(100));
        rtt.update_rtt(Duration::from_millis(50), Duration::ZERO);
        rtt.update_rtt(Duration::from_millis(60), Duration::ZERO);
        rtt.update_rtt(Duration::from_millis(55), Duration::ZERO);

        assert!(rtt.smoothed_rtt() > Duration::from_millis(50));
        assert!(rtt.smoothed_rtt() < Duration::from_millis(60));
        assert_eq!(rtt.min_rtt(), Duration::from_millis(50));
    }

    #[test]
    fn test_ack_delay_only_subtracted_above_min() {
        let mut rtt = RttStats::new(Duration::from_millis(100));
        rtt.update_rtt(Duration::from_millis(40), Duration::ZERO);
        rtt.update_rtt(Duration::from_millis(50), Duration::from_millis(5));
        assert_eq!(rtt.latest_rtt(), Duration::from_millis(45));
        rtt.update_rtt(Duration::from_millis(42), Duration::from_millis(20));
        assert_eq!(rtt.latest_rtt(), Duration::from_millis(42));
    }

    #[test]
    fn test_migration_resets() {
        let mut rtt = RttStats::new(Duration::from_millis(100));
        rtt.update_rtt(Duration::from_millis(30), Duration::ZERO);
        rtt.on_connection_migration();
        assert!(!rtt.has_updates());
        assert_eq!(rtt.smoothed_or_initial_rtt(), Duration::from_millis(100));
    }
}
