//! Error types for the sync core.

use std::io;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Wire-level violations. Always fatal to the connection that produced them.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer closed the stream cleanly before a new frame started.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The stream ended inside a frame header.
    #[error("stream ended inside frame header ({read} of {expected} bytes)")]
    Truncated {
        /// Header bytes actually read.
        read: usize,
        /// Header bytes expected.
        expected: usize,
    },

    /// The payload did not match its declared length.
    #[error("expected payload of {declared} bytes, read {read}")]
    PayloadLength {
        /// Length announced in the header.
        declared: u32,
        /// Bytes actually read before the stream ended.
        read: usize,
    },

    /// Opcode byte outside the known set.
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    /// Valid opcode that is not allowed at this point of the exchange.
    #[error("unexpected {opcode} frame, expected {expected}")]
    UnexpectedOpcode {
        /// Opcode received.
        opcode: crate::frame::Opcode,
        /// What the receiver was waiting for.
        expected: &'static str,
    },

    /// Path or path-list payload that is not UTF-8.
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    /// Path that is not a plain relative path.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath {
        /// Offending path.
        path: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Payload too large for the 4-byte length field.
    #[error("payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),

    /// Transport failure while reading or writing a frame.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while handling a connection.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed frame or frame sequence.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Path already registered or already being uploaded.
    #[error("path collision: {path}")]
    Collision {
        /// Colliding relative path.
        path: String,
    },

    /// Storage or transport I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The connection was torn down while a handler was still using it.
    #[error("connection already closed")]
    ConnectionClosed,
}

impl SyncError {
    /// Returns true for wire-level violations.
    pub fn is_protocol(&self) -> bool {
        matches!(self, SyncError::Protocol(_))
    }

    /// Returns true for registry/in-flight collisions.
    pub fn is_collision(&self) -> bool {
        matches!(self, SyncError::Collision { .. })
    }

    /// Returns true when the peer simply went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionClosed | SyncError::Protocol(ProtocolError::ConnectionClosed)
        )
    }
}
