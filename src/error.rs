//! Error types for the connection engine.
//!
//! Two families live here: [`ErrorCode`] and [`RstStreamErrorCode`] are the
//! machine-readable codes carried on the wire and reported to visitors, while
//! [`Error`] is the crate-level error returned by fallible library operations
//! (decoding, packet protection, configuration).

use std::fmt;

use thiserror::Error;

/// Result type alias for qconn operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur outside the connection state machine.
#[derive(Error, Debug)]
pub enum Error {
    /// Packet or frame could not be decoded or encoded
    #[error("{code}: {details}")]
    Framing {
        /// Connection error the failure maps to
        code: ErrorCode,
        /// Human-readable detail
        details: String,
    },

    /// Packet protection failed
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// No encrypter installed for the requested level
    #[error("no encrypter for level {0:?}")]
    MissingEncrypter(crate::types::EncryptionLevel),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Buffer overflow/underflow
    #[error("buffer error: expected {expected} bytes, got {actual}")]
    Buffer {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Unknown wire value for an enum
    #[error("unknown {kind} value: {value}")]
    UnknownValue {
        /// Enum name
        kind: &'static str,
        /// Offending value
        value: u64,
    },

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a new framing error
    pub fn framing(code: ErrorCode, details: impl Into<String>) -> Self {
        Error::Framing {
            code,
            details: details.into(),
        }
    }

    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Connection error code this error maps to
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Framing { code, .. } => *code,
            Error::Crypto(_) => ErrorCode::DecryptionFailure,
            Error::MissingEncrypter(_) => ErrorCode::EncryptionFailure,
            Error::Buffer { .. } => ErrorCode::InvalidFrameData,
            Error::UnknownValue { .. } => ErrorCode::InvalidFrameData,
            Error::Config(_) | Error::Network(_) | Error::Json(_) => ErrorCode::InternalError,
        }
    }
}

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:expr => $label:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[repr(u32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)+
        }

        impl $name {
            /// Name as used in logs and close frames
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }

            /// Wire value
            pub fn to_wire(self) -> u32 {
                self as u32
            }
        }

        impl TryFrom<u32> for $name {
            type Error = Error;

            fn try_from(value: u32) -> Result<Self> {
                match value {
                    $(v if v == $value => Ok($name::$variant),)+
                    _ => Err(Error::UnknownValue {
                        kind: stringify!($name),
                        value: value as u64,
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum! {
    /// Connection-level error codes.
    pub enum ErrorCode {
        /// No error
        NoError = 0 => "QUIC_NO_ERROR",
        /// Internal invariant violated
        InternalError = 1 => "QUIC_INTERNAL_ERROR",
        /// Stream data arrived after the stream was terminated
        StreamDataAfterTermination = 2 => "QUIC_STREAM_DATA_AFTER_TERMINATION",
        /// Header could not be parsed or is out of bounds
        InvalidPacketHeader = 3 => "QUIC_INVALID_PACKET_HEADER",
        /// Frame data is malformed
        InvalidFrameData = 4 => "QUIC_INVALID_FRAME_DATA",
        /// FEC data is malformed
        InvalidFecData = 5 => "QUIC_INVALID_FEC_DATA",
        /// Rst stream frame is malformed
        InvalidRstStreamData = 6 => "QUIC_INVALID_RST_STREAM_DATA",
        /// Connection close frame is malformed
        InvalidConnectionCloseData = 7 => "QUIC_INVALID_CONNECTION_CLOSE_DATA",
        /// Go-away frame is malformed
        InvalidGoawayData = 8 => "QUIC_INVALID_GOAWAY_DATA",
        /// Ack frame is malformed or inconsistent
        InvalidAckData = 9 => "QUIC_INVALID_ACK_DATA",
        /// Version negotiation packet is malformed or lists our version
        InvalidVersionNegotiationPacket = 10 => "QUIC_INVALID_VERSION_NEGOTIATION_PACKET",
        /// Public reset packet is malformed
        InvalidPublicResetPacket = 11 => "QUIC_INVALID_PUBLIC_RST_PACKET",
        /// Packet could not be decrypted
        DecryptionFailure = 12 => "QUIC_DECRYPTION_FAILURE",
        /// Packet could not be encrypted
        EncryptionFailure = 13 => "QUIC_ENCRYPTION_FAILURE",
        /// Packet exceeds the maximum size
        PacketTooLarge = 14 => "QUIC_PACKET_TOO_LARGE",
        /// Peer is going away
        PeerGoingAway = 16 => "QUIC_PEER_GOING_AWAY",
        /// Stream id is invalid
        InvalidStreamId = 17 => "QUIC_INVALID_STREAM_ID",
        /// No common version, or a version-less packet before negotiation
        InvalidVersion = 20 => "QUIC_INVALID_VERSION",
        /// Network idle timeout
        ConnectionTimedOut = 25 => "QUIC_NETWORK_IDLE_TIMEOUT",
        /// Overall connection lifetime exceeded
        ConnectionOverallTimedOut = 26 => "QUIC_CONNECTION_OVERALL_TIMED_OUT",
        /// Packet write failed
        PacketWriteError = 27 => "QUIC_PACKET_WRITE_ERROR",
        /// Peer sent a public reset
        PublicReset = 19 => "QUIC_PUBLIC_RESET",
        /// Window update frame is malformed
        InvalidWindowUpdateData = 57 => "QUIC_INVALID_WINDOW_UPDATE_DATA",
        /// Blocked frame is malformed
        InvalidBlockedData = 58 => "QUIC_INVALID_BLOCKED_DATA",
        /// Stop waiting frame is malformed or inconsistent
        InvalidStopWaitingData = 60 => "QUIC_INVALID_STOP_WAITING_DATA",
        /// Stream data on a non-crypto stream without encryption
        UnencryptedStreamData = 61 => "QUIC_UNENCRYPTED_STREAM_DATA",
        /// Address migration not permitted
        ErrorMigratingAddress = 62 => "QUIC_ERROR_MIGRATING_ADDRESS",
        /// Too many unacked sent packets
        TooManyOutstandingSentPackets = 68 => "QUIC_TOO_MANY_OUTSTANDING_SENT_PACKETS",
        /// Too many tracked received packets
        TooManyOutstandingReceivedPackets = 69 => "QUIC_TOO_MANY_OUTSTANDING_RECEIVED_PACKETS",
        /// Connection cancelled by the application
        ConnectionCancelled = 70 => "QUIC_CONNECTION_CANCELLED",
        /// Frame without payload
        MissingPayload = 48 => "QUIC_MISSING_PAYLOAD",
        /// Undecryptable packet queue overflowed before keys arrived
        TooManyUndecryptablePackets = 90 => "QUIC_TOO_MANY_UNDECRYPTABLE_PACKETS",
    }
}

wire_enum! {
    /// Stream reset error codes.
    pub enum RstStreamErrorCode {
        /// Stream closed normally
        NoError = 0 => "QUIC_STREAM_NO_ERROR",
        /// Erroneous data on the stream
        ErroneousData = 1 => "QUIC_ERRONEOUS_DATA",
        /// Write of stream data failed
        PacketWriteFailure = 2 => "QUIC_PACKET_WRITE_FAILURE",
        /// Stream had a connection-level error
        StreamConnectionError = 4 => "QUIC_STREAM_CONNECTION_ERROR",
        /// Peer is going away
        StreamPeerGoingAway = 5 => "QUIC_STREAM_PEER_GOING_AWAY",
        /// Stream cancelled
        StreamCancelled = 6 => "QUIC_STREAM_CANCELLED",
        /// Stream refused
        RefusedStream = 7 => "QUIC_REFUSED_STREAM",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::framing(ErrorCode::InvalidAckData, "largest observed too high");
        assert_eq!(
            err.to_string(),
            "QUIC_INVALID_ACK_DATA: largest observed too high"
        );

        let err = Error::Buffer {
            expected: 8,
            actual: 3,
        };
        assert_eq!(err.to_string(), "buffer error: expected 8 bytes, got 3");
    }

    #[test]
    fn test_error_code_wire_values() {
        for code in [
            ErrorCode::NoError,
            ErrorCode::InvalidAckData,
            ErrorCode::ConnectionTimedOut,
            ErrorCode::TooManyUndecryptablePackets,
        ] {
            assert_eq!(ErrorCode::try_from(code.to_wire()).unwrap(), code);
        }
        assert!(ErrorCode::try_from(9999).is_err());
        assert_eq!(
            RstStreamErrorCode::try_from(6).unwrap(),
            RstStreamErrorCode::StreamCancelled
        );
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(Error::crypto("bad tag").code(), ErrorCode::DecryptionFailure);
        assert_eq!(
            Error::config("idle > overall").code(),
            ErrorCode::InternalError
        );
        assert_eq!(
            Error::MissingEncrypter(crate::types::EncryptionLevel::ForwardSecure).code(),
            ErrorCode::EncryptionFailure
        );
    }
}
