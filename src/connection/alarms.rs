//! Alarm handling and the timers behind them.
//!
//! The embedder drives time: it asks for [`Connection::next_alarm_deadline`],
//! waits, then calls [`Connection::fire_expired_alarms`] (or
//! [`Connection::on_alarm`] for one alarm).

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::alarm::AlarmKind;
use crate::error::ErrorCode;
use crate::types::{
    AckBundling, ByteCount, Perspective, MTU_DISCOVERY_ATTEMPTS, PING_ALARM_GRANULARITY,
    PING_TIMEOUT,
};
use crate::wire::Frame;

use super::{Connection, PacketBundler};

/// Slack a server gives a client's idle timeout.
const SERVER_IDLE_TIMEOUT_SLACK: Duration = Duration::from_secs(3);

impl Connection {
    /// Handle an expired alarm.
    ///
    /// The alarm is disarmed before its handler runs, so handlers may arm it
    /// again. Does nothing once the connection is closed.
    pub fn on_alarm(&mut self, kind: AlarmKind) {
        if !self.connected {
            return;
        }
        self.alarms.get_mut(kind).cancel();
        trace!("{}{:?} alarm fired", self.prefix(), kind);
        match kind {
            AlarmKind::Ack => {
                let _bundler = PacketBundler::new(self, AckBundling::SendAck);
            }
            AlarmKind::Retransmission => self.on_retransmission_timeout(),
            AlarmKind::Send | AlarmKind::ResumeWrites => self.write_if_not_blocked(),
            AlarmKind::Timeout => self.check_for_timeout(),
            AlarmKind::Ping => self.on_ping_timeout(),
            AlarmKind::MtuDiscovery => self.discover_mtu(),
            AlarmKind::Fec => {
                // Close the group even if it is not full.
                self.with_generator(|g| g.maybe_send_fec_packet(true));
            }
        }
    }

    /// Run every alarm whose deadline has passed, earliest first.
    pub fn fire_expired_alarms(&mut self) {
        let now = self.clock.now();
        for kind in self.alarms.expired(now) {
            // An earlier handler may have moved or cancelled it.
            if self
                .alarms
                .get(kind)
                .deadline()
                .is_some_and(|deadline| deadline <= now)
            {
                self.on_alarm(kind);
            }
        }
    }

    /// Earliest armed alarm.
    pub fn next_alarm_deadline(&self) -> Option<(AlarmKind, Instant)> {
        self.alarms.next_deadline()
    }

    /// Whether `kind` is armed.
    pub fn is_alarm_set(&self, kind: AlarmKind) -> bool {
        self.alarms.is_set(kind)
    }

    /// Deadline of `kind`, if armed.
    pub fn alarm_deadline(&self, kind: AlarmKind) -> Option<Instant> {
        self.alarms.get(kind).deadline()
    }

    /// Set the overall and idle timeouts and rearm the timeout alarm.
    ///
    /// Servers wait a little longer than the agreed idle timeout and clients
    /// a little less, so the client notices first.
    pub fn set_network_timeouts(&mut self, overall: Option<Duration>, idle: Duration) {
        let idle = match self.perspective {
            Perspective::Server => idle + SERVER_IDLE_TIMEOUT_SLACK,
            Perspective::Client if idle > Duration::from_secs(1) => idle - Duration::from_secs(1),
            Perspective::Client => idle,
        };
        self.overall_connection_timeout = overall;
        self.idle_network_timeout = idle;
        self.set_timeout_alarm();
    }

    fn on_retransmission_timeout(&mut self) {
        if !self.sent_packet_manager.has_unacked_packets() {
            return;
        }
        self.sent_packet_manager.on_retransmission_timeout();
        self.write_if_not_blocked();
        if !self.connected {
            return;
        }
        // A probe may be owed once the timeout's retransmissions are out.
        if self.sent_packet_manager.maybe_retransmit_tail_loss_probe() {
            self.write_if_not_blocked();
        }
        // Nothing was written, so nothing re-armed the alarm.
        if !self.has_queued_data() && !self.alarms.is_set(AlarmKind::Retransmission) {
            self.set_retransmission_alarm();
        }
    }

    fn on_ping_timeout(&mut self) {
        // Retransmissions already keep the path alive.
        if self.alarms.is_set(AlarmKind::Retransmission) {
            return;
        }
        let mut bundler = PacketBundler::new(self, AckBundling::NoAck);
        bundler.add_control_frame(Frame::Ping);
    }

    fn time_of_last_packet(&self) -> Instant {
        let last_send = if self.config.use_new_idle_timeout {
            self.last_send_for_timeout
        } else {
            self.time_of_last_sent_new_packet
        };
        self.time_of_last_received_packet.max(last_send)
    }

    pub(super) fn set_timeout_alarm(&mut self) {
        let mut deadline = self.time_of_last_packet() + self.idle_network_timeout;
        if let Some(overall) = self.overall_connection_timeout {
            deadline = deadline.min(self.creation_time + overall);
        }
        let alarm = self.alarms.get_mut(AlarmKind::Timeout);
        alarm.cancel();
        alarm.set(deadline);
    }

    fn check_for_timeout(&mut self) {
        let now = self.clock.approximate_now();
        let last_packet = self.time_of_last_packet();
        let idle = now.saturating_duration_since(last_packet);
        trace!(
            "{}idle for {:?} of {:?}",
            self.prefix(),
            idle,
            self.idle_network_timeout
        );
        if idle >= self.idle_network_timeout {
            debug!("{}idle timeout after {:?}", self.prefix(), idle);
            if self.silent_close_enabled {
                self.close_connection(ErrorCode::ConnectionTimedOut, false);
            } else {
                self.send_connection_close_with_details(
                    ErrorCode::ConnectionTimedOut,
                    "No recent network activity.",
                );
            }
            return;
        }
        if let Some(overall) = self.overall_connection_timeout {
            let lifetime = now.saturating_duration_since(self.creation_time);
            if lifetime >= overall {
                debug!("{}overall timeout after {:?}", self.prefix(), lifetime);
                self.send_connection_close_with_details(
                    ErrorCode::ConnectionOverallTimedOut,
                    "Overall timeout expired.",
                );
                return;
            }
        }
        self.set_timeout_alarm();
    }

    /// Keep the path alive while streams are open. Clients only.
    pub(super) fn set_ping_alarm(&mut self) {
        if self.perspective == Perspective::Server {
            return;
        }
        if !self.visitor.has_open_dynamic_streams() {
            self.alarms.get_mut(AlarmKind::Ping).cancel();
            return;
        }
        let deadline = self.clock.approximate_now() + PING_TIMEOUT;
        self.alarms
            .get_mut(AlarmKind::Ping)
            .update(Some(deadline), PING_ALARM_GRANULARITY);
    }

    pub(super) fn set_retransmission_alarm(&mut self) {
        if !self.connected {
            return;
        }
        if self.delay_setting_retransmission_alarm {
            self.pending_retransmission_alarm = true;
            return;
        }
        let deadline = self.sent_packet_manager.retransmission_time();
        self.alarms
            .get_mut(AlarmKind::Retransmission)
            .update(deadline, Duration::from_millis(1));
    }

    pub(super) fn maybe_set_mtu_alarm(&mut self) {
        if self.mtu_discovery_target <= self.max_packet_length()
            || self.mtu_probe_count >= MTU_DISCOVERY_ATTEMPTS
            || self.alarms.is_set(AlarmKind::MtuDiscovery)
        {
            return;
        }
        if self.packet_number_of_last_sent_packet >= self.next_mtu_probe_at {
            let now = self.clock.approximate_now();
            self.alarms.get_mut(AlarmKind::MtuDiscovery).set(now);
        }
    }

    fn discover_mtu(&mut self) {
        let target: ByteCount = self.mtu_discovery_target;
        if target <= self.max_packet_length() {
            return;
        }
        // Back off between probes.
        self.packets_between_mtu_probes *= 2;
        self.next_mtu_probe_at =
            self.packet_number_of_last_sent_packet + self.packets_between_mtu_probes + 1;
        self.mtu_probe_count += 1;
        debug!(
            "{}probing MTU of {} bytes, attempt {}",
            self.prefix(),
            target,
            self.mtu_probe_count
        );
        self.with_generator(|g| g.generate_mtu_discovery_packet(target));
    }
}
