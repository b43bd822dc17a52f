//! Handshake verification, keyed by authentication protocol id.

use std::collections::HashMap;
use std::sync::Arc;

use clustermgr_proto::{DaemonType, Hello, AUTH_PROTOCOL_NONE, AUTH_PROTOCOL_SHARED_SECRET};
use subtle::ConstantTimeEq;

use crate::config::AuthConfig;
use crate::error::{MgrError, Result};

/// Verifies authorizers of one protocol.
pub trait AuthHandler: Send + Sync {
    /// Protocol id this handler serves.
    fn protocol(&self) -> u32;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Accepts or rejects an authorizer.
    fn verify(&self, peer_type: DaemonType, authorizer: &[u8]) -> Result<()>;
}

/// Accepts every peer.
#[derive(Debug, Default)]
pub struct NoneAuthHandler;

impl AuthHandler for NoneAuthHandler {
    fn protocol(&self) -> u32 {
        AUTH_PROTOCOL_NONE
    }

    fn name(&self) -> &'static str {
        "none"
    }

    fn verify(&self, _peer_type: DaemonType, _authorizer: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Accepts peers presenting the cluster secret.
pub struct SharedSecretAuthHandler {
    secret: Vec<u8>,
}

impl SharedSecretAuthHandler {
    /// Handler accepting `secret`.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl AuthHandler for SharedSecretAuthHandler {
    fn protocol(&self) -> u32 {
        AUTH_PROTOCOL_SHARED_SECRET
    }

    fn name(&self) -> &'static str {
        "shared_secret"
    }

    fn verify(&self, peer_type: DaemonType, authorizer: &[u8]) -> Result<()> {
        if bool::from(self.secret.as_slice().ct_eq(authorizer)) {
            Ok(())
        } else {
            Err(MgrError::AuthRejected(format!("bad secret from {}", peer_type)))
        }
    }
}

impl std::fmt::Debug for SharedSecretAuthHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecretAuthHandler").finish_non_exhaustive()
    }
}

/// Registered handlers.
#[derive(Default, Clone)]
pub struct AuthRegistry {
    handlers: HashMap<u32, Arc<dyn AuthHandler>>,
}

impl AuthRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the registry described by the configuration.
    pub fn from_config(config: &AuthConfig) -> Self {
        let mut registry = Self::new();
        if config.allow_none {
            registry.register(Arc::new(NoneAuthHandler));
        }
        if let Some(secret) = &config.shared_secret {
            registry.register(Arc::new(SharedSecretAuthHandler::new(secret.as_bytes())));
        }
        registry
    }

    /// Adds a handler, replacing any for the same protocol.
    pub fn register(&mut self, handler: Arc<dyn AuthHandler>) {
        self.handlers.insert(handler.protocol(), handler);
    }

    /// Handler for a protocol id.
    pub fn get(&self, protocol: u32) -> Option<Arc<dyn AuthHandler>> {
        self.handlers.get(&protocol).cloned()
    }

    /// Verifies a handshake.
    pub fn verify(&self, hello: &Hello) -> Result<&'static str> {
        let handler = self
            .handlers
            .get(&hello.protocol)
            .ok_or(MgrError::NoAuthHandler(hello.protocol))?;
        handler.verify(hello.peer_type, &hello.authorizer)?;
        Ok(handler.name())
    }

    /// Registered protocol ids, sorted.
    pub fn protocols(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.handlers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for AuthRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRegistry")
            .field("protocols", &self.protocols())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(protocol: u32, authorizer: &[u8]) -> Hello {
        Hello {
            peer_type: DaemonType::Osd,
            protocol,
            authorizer: authorizer.to_vec(),
        }
    }

    #[test]
    fn test_none_gated_by_config() {
        let open = AuthRegistry::from_config(&AuthConfig {
            allow_none: true,
            shared_secret: None,
        });
        assert_eq!(open.verify(&hello(AUTH_PROTOCOL_NONE, b"")).unwrap(), "none");

        let closed = AuthRegistry::from_config(&AuthConfig {
            allow_none: false,
            shared_secret: None,
        });
        assert!(matches!(
            closed.verify(&hello(AUTH_PROTOCOL_NONE, b"")),
            Err(MgrError::NoAuthHandler(AUTH_PROTOCOL_NONE))
        ));
    }

    #[test]
    fn test_shared_secret() {
        let registry = AuthRegistry::from_config(&AuthConfig {
            allow_none: false,
            shared_secret: Some("s3cret".to_string()),
        });
        assert!(registry
            .verify(&hello(AUTH_PROTOCOL_SHARED_SECRET, b"s3cret"))
            .is_ok());
        assert!(matches!(
            registry.verify(&hello(AUTH_PROTOCOL_SHARED_SECRET, b"s3cre")),
            Err(MgrError::AuthRejected(_))
        ));
        assert!(registry
            .verify(&hello(AUTH_PROTOCOL_SHARED_SECRET, b"wrong!"))
            .is_err());
        assert_eq!(registry.protocols(), vec![AUTH_PROTOCOL_SHARED_SECRET]);
    }

    #[test]
    fn test_unknown_protocol() {
        let registry = AuthRegistry::new();
        assert!(matches!(
            registry.verify(&hello(42, b"")),
            Err(MgrError::NoAuthHandler(42))
        ));
    }
}
