//! Manager configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which handshake protocols the manager accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accept daemons presenting no credentials.
    pub allow_none: bool,
    /// Accept daemons presenting this secret.
    pub shared_secret: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allow_none: true,
            shared_secret: None,
        }
    }
}

/// Manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MgrConfig {
    /// Address daemons connect to.
    pub bind_addr: SocketAddr,
    /// Report interval handed to every daemon in Configure.
    pub stats_period_secs: u32,
    /// Notification worker threads.
    pub notify_workers: usize,
    /// Timeout for external commands.
    pub command_timeout_secs: u64,
    /// Prefix owned by the manager in the config-key store.
    pub config_key_prefix: String,
    /// How long startup waits for the first cluster map.
    pub map_wait_timeout_secs: u64,
    /// How long a peer has to send its handshake.
    pub handshake_timeout_secs: u64,
    /// Local cluster description used instead of a monitor.
    pub cluster_file: Option<PathBuf>,
    /// Interval between cluster file reloads.
    pub map_poll_secs: u64,
    /// Accepted handshake protocols.
    pub auth: AuthConfig,
}

impl Default for MgrConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 6810)),
            stats_period_secs: 5,
            notify_workers: 2,
            command_timeout_secs: 30,
            config_key_prefix: String::from("mgr/"),
            map_wait_timeout_secs: 30,
            handshake_timeout_secs: 10,
            cluster_file: None,
            map_poll_secs: 5,
            auth: AuthConfig::default(),
        }
    }
}

impl MgrConfig {
    /// Loads a TOML or JSON file, picked by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: MgrConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: MgrConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Command timeout as a duration.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// First-map wait as a duration.
    pub fn map_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.map_wait_timeout_secs)
    }

    /// Handshake timeout as a duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Reload interval, at least one second.
    pub fn map_poll_interval(&self) -> Duration {
        Duration::from_secs(self.map_poll_secs.max(1))
    }
}
