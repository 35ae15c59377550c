//! Wire format.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │  header   public header (clear), private header (sealed)           │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  frames   stream, ack, stop waiting, control frames                │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  framer   parse into FramerVisitor callbacks, build packets        │
//! └────────────────────────────────────────────────────────────────────┘
//! ```

pub mod framer;
pub mod frames;
pub mod header;

pub use framer::{process_packet, process_revived_packet, Framer, FramerVisitor};
pub use frames::{
    AckFrame, BlockedFrame, ConnectionCloseFrame, Frame, GoAwayFrame, RetransmittableFrames,
    RstStreamFrame, StopWaitingFrame, StreamFrame, WindowUpdateFrame,
};
pub use header::{
    FecData, PacketHeader, PublicHeader, PublicResetPacket, VersionNegotiationPacket,
};
