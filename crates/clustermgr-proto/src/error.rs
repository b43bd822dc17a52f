//! Protocol error type.

use thiserror::Error;

use crate::types::DaemonType;

/// Errors raised by the report protocol and its transport.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Packed counter data ended before a declared counter.
    #[error("packed counters truncated at {path}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        path: String,
        needed: usize,
        remaining: usize,
    },

    /// A declared counter has no type in the catalog.
    #[error("counter {0} is declared but has no known type")]
    UnknownCounter(String),

    /// Malformed frame.
    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    /// Frame does not start with the protocol magic.
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    /// Peer speaks another protocol version.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    /// Payload checksum does not match the header.
    #[error("checksum mismatch: expected 0x{expected:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    /// Payload exceeds the frame size limit.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge { size: u32, max_size: u32 },

    /// Message type tag is not known.
    #[error("unknown message type: 0x{0:04X}")]
    UnknownMessageType(u16),

    /// Daemon type name is not known.
    #[error("unknown daemon type: {0}")]
    UnknownDaemonType(String),

    /// Daemon name is empty or malformed.
    #[error("invalid daemon name {name:?} for {daemon_type}")]
    InvalidDaemonName { daemon_type: DaemonType, name: String },

    /// Connect or read timed out.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    /// Message body could not be encoded or decoded.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Socket failure.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl ProtoError {
    /// Whether the byte stream can no longer be trusted after this error.
    ///
    /// Errors raised after a frame was read in full leave the stream aligned on
    /// the next header, so the connection can keep going.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtoError::InvalidMagic { .. }
                | ProtoError::VersionMismatch { .. }
                | ProtoError::PayloadTooLarge { .. }
                | ProtoError::InvalidFrame { .. }
                | ProtoError::ConnectionTimeout { .. }
                | ProtoError::IoError(_)
        )
    }
}

/// Protocol result type.
pub type Result<T> = std::result::Result<T, ProtoError>;
