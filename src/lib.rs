//! # qconn
//!
//! Connection-level engine of a QUIC-style transport: packet framing,
//! acknowledgment, loss recovery, forward error correction, version
//! negotiation and the timers that drive them, for a single connection.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        Session (ConnectionVisitor, DebugVisitor)         │
//! ├─────────────────────────────────────────────────────────┤
//! │  Connection   ingest · write path · alarms · guards      │
//! ├──────────────────────────┬──────────────────────────────┤
//! │  PacketGenerator         │  Framer                      │
//! │  SentPacketManager       │  ReceivedPacketManager       │
//! │  SentEntropyManager      │  FecGroup                    │
//! ├──────────────────────────┴──────────────────────────────┤
//! │  Wire format · packet protection (ChaCha20-Poly1305)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  PacketWriter · Clock · ConnectionHelper                 │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine is synchronous and single-threaded. The embedder feeds it
//! datagrams through [`Connection::process_udp_packet`], writes through a
//! [`PacketWriter`], and runs [`Connection::fire_expired_alarms`] when
//! [`Connection::next_alarm_deadline`] passes.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod alarm;
pub mod clock;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod entropy;
pub mod error;
pub mod fec;
pub mod generator;
pub mod received_packet_manager;
pub mod sent_packet_manager;
pub mod stats;
pub mod types;
pub mod visitor;
pub mod wire;
pub mod writer;

pub use alarm::AlarmKind;
pub use clock::{Clock, ConnectionHelper, DefaultHelper, MockClock, MockHelper, SystemClock};
pub use config::{ConnectionConfig, ConnectionConfigFile};
pub use connection::{Connection, PacketBundler, RetransmissionScheduler};
pub use error::{Error, ErrorCode, Result, RstStreamErrorCode};
pub use sent_packet_manager::{CachedNetworkParameters, DefaultSentPacketManager, SentPacketManager};
pub use stats::ConnectionStats;
pub use types::{
    supported_versions, ConnectionId, EncryptionLevel, PacketNumber, Perspective, QuicVersion,
    StreamId,
};
pub use visitor::{ConnectionVisitor, DebugVisitor, LoggingDebugVisitor};
pub use writer::{PacketWriter, UdpPacketWriter, WriteResult, WriteStatus};
