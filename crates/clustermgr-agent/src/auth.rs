//! Authorizers presented in the connection handshake.

use clustermgr_proto::{DaemonType, Hello, AUTH_PROTOCOL_NONE, AUTH_PROTOCOL_SHARED_SECRET};
use serde::{Deserialize, Serialize};

/// Credentials a daemon presents to the manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum Authorizer {
    /// No credentials; only accepted by managers that allow it.
    #[default]
    None,
    /// Pre-shared cluster secret.
    SharedSecret {
        /// The secret.
        secret: String,
    },
}

impl Authorizer {
    /// Protocol id announced in the handshake.
    pub fn protocol(&self) -> u32 {
        match self {
            Authorizer::None => AUTH_PROTOCOL_NONE,
            Authorizer::SharedSecret { .. } => AUTH_PROTOCOL_SHARED_SECRET,
        }
    }

    /// Builds the handshake message for a daemon of `peer_type`.
    pub fn build_hello(&self, peer_type: DaemonType) -> Hello {
        let authorizer = match self {
            Authorizer::None => Vec::new(),
            Authorizer::SharedSecret { secret } => secret.as_bytes().to_vec(),
        };
        Hello {
            peer_type,
            protocol: self.protocol(),
            authorizer,
        }
    }
}

impl std::fmt::Display for Authorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Authorizer::None => f.write_str("none"),
            Authorizer::SharedSecret { .. } => f.write_str("shared_secret"),
        }
    }
}
