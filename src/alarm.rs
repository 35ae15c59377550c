//! One-shot alarms owned by the connection.
//!
//! Each [`AlarmKind`] maps to exactly one connection method; the event loop
//! asks for [`AlarmSet::next_deadline`] and calls back into the connection
//! with the kind that expired. The connection clears an alarm before
//! dispatching it, so a handler that wants recurring behavior re-arms it
//! explicitly.

use std::time::{Duration, Instant};

/// The connection's timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmKind {
    /// Send a delayed ack.
    Ack,
    /// Retransmission or tail loss probe timeout.
    Retransmission,
    /// Pacing delay elapsed.
    Send,
    /// Give the visitor another chance to write.
    ResumeWrites,
    /// Idle or overall timeout check.
    Timeout,
    /// Keep-alive ping.
    Ping,
    /// Path MTU probe.
    MtuDiscovery,
    /// Close the open FEC group.
    Fec,
}

impl AlarmKind {
    /// Every kind, in dispatch priority order for equal deadlines.
    pub const ALL: [AlarmKind; 8] = [
        AlarmKind::Ack,
        AlarmKind::Retransmission,
        AlarmKind::Send,
        AlarmKind::ResumeWrites,
        AlarmKind::Timeout,
        AlarmKind::Ping,
        AlarmKind::MtuDiscovery,
        AlarmKind::Fec,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// A single one-shot timer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Alarm {
    deadline: Option<Instant>,
}

impl Alarm {
    /// Arm the alarm. It must not already be set.
    pub fn set(&mut self, deadline: Instant) {
        debug_assert!(!self.is_set(), "alarm already set");
        self.deadline = Some(deadline);
    }

    /// Disarm the alarm.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Move the alarm to `deadline`, or cancel it when `None`.
    ///
    /// An alarm that is already set within `granularity` of the new deadline
    /// is left untouched.
    pub fn update(&mut self, deadline: Option<Instant>, granularity: Duration) {
        let Some(deadline) = deadline else {
            self.cancel();
            return;
        };
        if let Some(current) = self.deadline {
            let delta = if current > deadline {
                current - deadline
            } else {
                deadline - current
            };
            if delta < granularity {
                return;
            }
        }
        self.deadline = Some(deadline);
    }

    /// Whether the alarm is armed.
    pub fn is_set(&self) -> bool {
        self.deadline.is_some()
    }

    /// Armed deadline.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// The fixed set of alarms of one connection.
#[derive(Debug, Default, Clone)]
pub struct AlarmSet {
    alarms: [Alarm; 8],
}

impl AlarmSet {
    /// Create a set with every alarm disarmed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Alarm of the given kind.
    pub fn get(&self, kind: AlarmKind) -> &Alarm {
        &self.alarms[kind.index()]
    }

    /// Mutable alarm of the given kind.
    pub fn get_mut(&mut self, kind: AlarmKind) -> &mut Alarm {
        &mut self.alarms[kind.index()]
    }

    /// Whether the alarm of the given kind is armed.
    pub fn is_set(&self, kind: AlarmKind) -> bool {
        self.get(kind).is_set()
    }

    /// Disarm everything.
    pub fn cancel_all(&mut self) {
        for alarm in &mut self.alarms {
            alarm.cancel();
        }
    }

    /// Earliest armed alarm.
    pub fn next_deadline(&self) -> Option<(AlarmKind, Instant)> {
        AlarmKind::ALL
            .iter()
            .filter_map(|&kind| self.get(kind).deadline().map(|d| (kind, d)))
            .min_by_key(|&(_, deadline)| deadline)
    }

    /// Alarms expired at `now`, earliest first. They stay armed.
    pub fn expired(&self, now: Instant) -> Vec<AlarmKind> {
        let mut due: Vec<(Instant, AlarmKind)> = AlarmKind::ALL
            .iter()
            .filter_map(|&kind| self.get(kind).deadline().map(|d| (d, kind)))
            .filter(|&(deadline, _)| deadline <= now)
            .collect();
        due.sort_by_key(|&(deadline, _)| deadline);
        due.into_iter().map(|(_, kind)| kind).collect()
    }

    /// Number of armed alarms.
    pub fn armed_count(&self) -> usize {
        self.alarms.iter().filter(|a| a.is_set()).count()
    }
}
