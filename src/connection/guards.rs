//! Scope guards over a connection.
//!
//! Both guards hold the connection mutably and deref to it, so work inside
//! the scope goes through the guard. Their effect happens on drop.

use std::ops::{Deref, DerefMut};

use crate::alarm::AlarmKind;
use crate::types::AckBundling;

use super::Connection;

/// Collects every frame added in its scope into as few packets as possible.
///
/// The generator is in batch mode while the bundler lives; dropping it
/// flushes what is queued. Nested bundlers leave batch mode to the
/// outermost one.
pub struct PacketBundler<'a> {
    connection: &'a mut Connection,
    already_in_batch_mode: bool,
}

impl<'a> PacketBundler<'a> {
    /// Enter batch mode, adding an ack first as `ack_mode` asks.
    pub fn new(connection: &'a mut Connection, ack_mode: AckBundling) -> Self {
        let already_in_batch_mode = connection.generator.in_batch_mode();
        if !already_in_batch_mode {
            connection.generator.start_batch_operations();
        }
        let send_ack = match ack_mode {
            AckBundling::SendAck => true,
            AckBundling::BundlePendingAck => {
                connection.alarms.is_set(AlarmKind::Ack) || connection.stop_waiting_count > 1
            }
            AckBundling::NoAck => false,
        };
        if connection.connected && send_ack {
            connection.send_ack();
        }
        Self {
            connection,
            already_in_batch_mode,
        }
    }
}

impl Deref for PacketBundler<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection
    }
}

impl DerefMut for PacketBundler<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.connection
    }
}

impl Drop for PacketBundler<'_> {
    fn drop(&mut self) {
        if self.already_in_batch_mode {
            return;
        }
        self.connection.generator.finish_batch_operations();
        self.connection.send_queued_frames();
    }
}

/// Defers arming the retransmission alarm until the scope ends, so a burst
/// of sends arms it once.
pub struct RetransmissionScheduler<'a> {
    connection: &'a mut Connection,
    already_delayed: bool,
}

impl<'a> RetransmissionScheduler<'a> {
    /// Start deferring.
    pub fn new(connection: &'a mut Connection) -> Self {
        let already_delayed = connection.delay_setting_retransmission_alarm;
        connection.delay_setting_retransmission_alarm = true;
        Self {
            connection,
            already_delayed,
        }
    }
}

impl Deref for RetransmissionScheduler<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection
    }
}

impl DerefMut for RetransmissionScheduler<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.connection
    }
}

impl Drop for RetransmissionScheduler<'_> {
    fn drop(&mut self) {
        if self.already_delayed {
            return;
        }
        let connection = &mut *self.connection;
        connection.delay_setting_retransmission_alarm = false;
        if connection.pending_retransmission_alarm {
            connection.pending_retransmission_alarm = false;
            connection.set_retransmission_alarm();
        }
    }
}
