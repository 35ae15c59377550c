//! Packet output.
//!
//! The connection writes every packet through a [`PacketWriter`]. A writer
//! that cannot take a packet right now reports [`WriteStatus::Blocked`]; the
//! connection then queues packets until [`PacketWriter::set_writable`] is
//! called and the embedder invokes `on_can_write`.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};

use tracing::{debug, warn};

use crate::types::{ByteCount, MAX_PACKET_SIZE};

/// Outcome of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Written in full
    Ok,
    /// The socket cannot take the packet now
    Blocked,
    /// The write failed
    Error,
}

/// Result of [`PacketWriter::write_packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// Outcome
    pub status: WriteStatus,
    /// Bytes written when `status` is `Ok`
    pub bytes_written: usize,
    /// OS error code when `status` is `Error`
    pub error_code: i32,
}

impl WriteResult {
    /// Successful write of `bytes_written` bytes.
    pub fn ok(bytes_written: usize) -> Self {
        Self {
            status: WriteStatus::Ok,
            bytes_written,
            error_code: 0,
        }
    }

    /// Blocked write.
    pub fn blocked() -> Self {
        Self {
            status: WriteStatus::Blocked,
            bytes_written: 0,
            error_code: 0,
        }
    }

    /// Failed write.
    pub fn error(error_code: i32) -> Self {
        Self {
            status: WriteStatus::Error,
            bytes_written: 0,
            error_code,
        }
    }
}

/// Sends packets to the peer.
pub trait PacketWriter {
    /// Send `packet` from `self_ip` to `peer`.
    fn write_packet(&mut self, packet: &[u8], self_ip: IpAddr, peer: SocketAddr) -> WriteResult;

    /// Whether the last write blocked and no writable event arrived since.
    fn is_write_blocked(&self) -> bool;

    /// Whether a blocked write still kept the packet for later delivery.
    fn is_write_blocked_data_buffered(&self) -> bool;

    /// The socket became writable again.
    fn set_writable(&mut self);

    /// Largest packet the writer can send to `peer`.
    fn max_packet_size(&self, peer: SocketAddr) -> ByteCount;
}

/// Writer over a non-blocking UDP socket.
#[derive(Debug)]
pub struct UdpPacketWriter {
    socket: UdpSocket,
    write_blocked: bool,
}

impl UdpPacketWriter {
    /// Wrap `socket`, switching it to non-blocking mode.
    pub fn new(socket: UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            write_blocked: false,
        })
    }

    /// Underlying socket.
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }
}

impl PacketWriter for UdpPacketWriter {
    fn write_packet(&mut self, packet: &[u8], _self_ip: IpAddr, peer: SocketAddr) -> WriteResult {
        debug_assert!(!self.write_blocked);
        match self.socket.send_to(packet, peer) {
            Ok(n) => WriteResult::ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("socket write blocked");
                self.write_blocked = true;
                WriteResult::blocked()
            }
            Err(e) => {
                warn!("socket write to {} failed: {}", peer, e);
                WriteResult::error(e.raw_os_error().unwrap_or(-1))
            }
        }
    }

    fn is_write_blocked(&self) -> bool {
        self.write_blocked
    }

    fn is_write_blocked_data_buffered(&self) -> bool {
        false
    }

    fn set_writable(&mut self) {
        self.write_blocked = false;
    }

    fn max_packet_size(&self, _peer: SocketAddr) -> ByteCount {
        MAX_PACKET_SIZE
    }
}
