//! Agent configuration.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use clustermgr_proto::{DaemonKey, DaemonType, TransportConfig};
use serde::{Deserialize, Serialize};

use crate::auth::Authorizer;
use crate::error::{AgentError, Result};
use crate::session::SessionParams;

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Type of the reporting daemon.
    pub daemon_type: DaemonType,
    /// Id of the reporting daemon.
    pub daemon_id: String,
    /// Address of the active manager.
    pub mgr_addr: Option<SocketAddr>,
    /// Credentials for the manager handshake.
    pub auth: Authorizer,
    /// TCP connect timeout.
    pub connect_timeout_ms: u64,
    /// How long to wait for the handshake verdict.
    pub handshake_timeout_secs: u64,
    /// Delay before retrying a failed session.
    pub reconnect_interval_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            daemon_type: DaemonType::Osd,
            daemon_id: String::from("0"),
            mgr_addr: None,
            auth: Authorizer::None,
            connect_timeout_ms: 5000,
            handshake_timeout_secs: 10,
            reconnect_interval_secs: 2,
        }
    }
}

impl AgentConfig {
    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// The daemon's key, rejecting ids the manager would not accept.
    pub fn daemon_key(&self) -> Result<DaemonKey> {
        DaemonKey::validated(self.daemon_type, &self.daemon_id)
            .map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Session parameters derived from this configuration.
    pub fn session_params(&self) -> Result<SessionParams> {
        let key = self.daemon_key()?;
        Ok(SessionParams {
            daemon_type: key.daemon_type,
            daemon_name: key.id,
            auth: self.auth.clone(),
            transport: TransportConfig {
                connect_timeout_ms: self.connect_timeout_ms,
                ..TransportConfig::default()
            },
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
        })
    }

    /// Delay before retrying a failed session.
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs.max(1))
    }
}
