//! Manager error type.

use clustermgr_proto::ProtoError;
use thiserror::Error;

/// Errors raised by the manager.
#[derive(Debug, Error)]
pub enum MgrError {
    /// No such daemon or entry.
    #[error("not found: {0}")]
    NotFound(String),

    /// An external command returned a nonzero code.
    #[error("command {cmd} failed with {code}: {outs}")]
    CommandFailed { cmd: String, code: i32, outs: String },

    /// An external command did not finish in time.
    #[error("command {cmd} timed out after {timeout_secs}s")]
    CommandTimeout { cmd: String, timeout_secs: u64 },

    /// An external command returned unparseable output.
    #[error("malformed output from {cmd}: {reason}")]
    MalformedOutput { cmd: String, reason: String },

    /// A configured session reported after its aggregate was dropped.
    #[error("session of {0} has no aggregate; daemon must reopen")]
    StaleSession(String),

    /// The handshake authorizer was refused.
    #[error("authorizer rejected: {0}")]
    AuthRejected(String),

    /// No handler for the handshake protocol.
    #[error("no auth handler for protocol {0}")]
    NoAuthHandler(u32),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The manager is stopping.
    #[error("manager is shutting down")]
    ShuttingDown,

    /// Protocol failure.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// Socket failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MgrError {
    /// Builds a [`MgrError::MalformedOutput`] for `cmd`.
    pub fn malformed(cmd: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        MgrError::MalformedOutput {
            cmd: cmd.into(),
            reason: reason.to_string(),
        }
    }
}

/// Manager result type.
pub type Result<T> = std::result::Result<T, MgrError>;
