//! Agent error type.

use clustermgr_proto::{MessageType, ProtoError};
use thiserror::Error;

/// Errors raised by the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// No counter is registered at this path.
    #[error("unknown counter: {0}")]
    UnknownCounter(String),

    /// An average operation was applied to a plain counter.
    #[error("counter {path} is not an average")]
    NotAnAverage { path: String },

    /// No session is open.
    #[error("no active manager session")]
    NotConnected,

    /// The manager refused the handshake.
    #[error("manager rejected authorizer: {0}")]
    HandshakeRejected(String),

    /// The manager sent something other than the expected reply.
    #[error("unexpected {0:?} during handshake")]
    UnexpectedMessage(MessageType),

    /// The manager did not answer the handshake in time.
    #[error("handshake with {addr} timed out")]
    HandshakeTimeout { addr: String },

    /// Invalid agent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport or codec failure.
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

/// Agent result type.
pub type Result<T> = std::result::Result<T, AgentError>;
