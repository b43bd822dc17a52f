//! A file-backed cluster for running the manager standalone.
//!
//! [`LocalCluster`] answers the same commands a real cluster would and
//! produces membership snapshots from a JSON description, which is re-read
//! on an interval so daemons can be added or removed while the manager runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use clustermgr_proto::DaemonType;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cluster_state::ClusterMapSnapshot;
use crate::command::{command_prefix, CommandResult, CommandRunner, EINVAL, ENOENT};

/// One daemon in a [`ClusterDescription`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDaemon {
    /// Daemon type.
    pub daemon_type: DaemonType,
    /// Daemon id.
    pub id: String,
    /// Address reported in its metadata.
    pub addr: String,
    /// Host the daemon runs on.
    pub hostname: String,
    /// Extra metadata fields.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Daemons, map epoch and config-key store of a local cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDescription {
    /// Map epoch.
    #[serde(default = "default_epoch")]
    pub epoch: u64,
    /// Member daemons.
    #[serde(default)]
    pub daemons: Vec<LocalDaemon>,
    /// Config-key store contents.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

fn default_epoch() -> u64 {
    1
}

impl ClusterDescription {
    /// Parses a JSON description.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let desc: ClusterDescription = serde_json::from_str(&content)?;
        Ok(desc)
    }

    fn metadata_json(d: &LocalDaemon) -> Value {
        let mut obj = Map::new();
        for (k, v) in &d.metadata {
            obj.insert(k.clone(), Value::String(v.clone()));
        }
        obj.insert("id".to_string(), Value::String(d.id.clone()));
        obj.insert("hostname".to_string(), Value::String(d.hostname.clone()));
        obj.insert(
            d.daemon_type.addr_metadata_key().to_string(),
            Value::String(d.addr.clone()),
        );
        Value::Object(obj)
    }
}

/// An in-process cluster backed by a [`ClusterDescription`].
#[derive(Debug)]
pub struct LocalCluster {
    desc: RwLock<ClusterDescription>,
    path: Option<PathBuf>,
}

impl LocalCluster {
    /// A cluster with no backing file.
    pub fn new(desc: ClusterDescription) -> Self {
        Self {
            desc: RwLock::new(desc),
            path: None,
        }
    }

    /// Loads a description from a JSON file that [`reload`](Self::reload)
    /// will re-read.
    pub fn from_file(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let desc = ClusterDescription::from_file(&path)?;
        Ok(Self {
            desc: RwLock::new(desc),
            path: Some(path),
        })
    }

    /// Current map epoch.
    pub fn epoch(&self) -> u64 {
        self.desc.read().epoch
    }

    /// Raw value of a stored config key.
    pub fn config_key(&self, key: &str) -> Option<String> {
        self.desc.read().config.get(key).cloned()
    }

    /// Replaces the daemon list, bumping the epoch if membership changed.
    pub fn set_daemons(&self, daemons: Vec<LocalDaemon>) -> bool {
        let mut desc = self.desc.write();
        if desc.daemons == daemons {
            return false;
        }
        desc.daemons = daemons;
        desc.epoch += 1;
        true
    }

    /// Re-reads the backing file. Returns whether membership changed.
    ///
    /// Config keys live in memory once loaded and are not re-read.
    pub fn reload(&self) -> anyhow::Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let fresh = ClusterDescription::from_file(path)?;
        let mut desc = self.desc.write();
        if desc.daemons == fresh.daemons {
            return Ok(false);
        }
        desc.daemons = fresh.daemons;
        desc.epoch = fresh.epoch.max(desc.epoch + 1);
        info!(epoch = desc.epoch, daemons = desc.daemons.len(), "cluster membership changed");
        Ok(true)
    }

    /// One snapshot per tracked daemon type at the current epoch.
    pub fn snapshots(&self) -> Vec<ClusterMapSnapshot> {
        let desc = self.desc.read();
        DaemonType::TRACKED
            .iter()
            .map(|&daemon_type| {
                desc.daemons
                    .iter()
                    .filter(|d| d.daemon_type == daemon_type)
                    .fold(ClusterMapSnapshot::new(daemon_type, desc.epoch), |snap, d| {
                        snap.with_daemon(d.id.as_str(), d.addr.as_str())
                    })
            })
            .collect()
    }

    /// Publishes snapshots now and again whenever a reload changes membership.
    pub async fn watch(
        &self,
        interval: Duration,
        tx: mpsc::Sender<ClusterMapSnapshot>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if !self.publish(&tx).await {
            return;
        }
        let mut tick = tokio::time::interval(interval);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.reload() {
                        Ok(true) => {
                            if !self.publish(&tx).await {
                                return;
                            }
                        }
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, "cluster description reload failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn publish(&self, tx: &mpsc::Sender<ClusterMapSnapshot>) -> bool {
        for snap in self.snapshots() {
            if tx.send(snap).await.is_err() {
                debug!("snapshot receiver closed");
                return false;
            }
        }
        true
    }

    fn metadata(&self, daemon_type: DaemonType, id: Option<&str>) -> CommandResult {
        let desc = self.desc.read();
        let mut matching = desc.daemons.iter().filter(|d| d.daemon_type == daemon_type);
        let value = match id {
            None => Value::Array(matching.map(ClusterDescription::metadata_json).collect()),
            Some(id) => match matching.find(|d| d.id == id) {
                Some(d) => ClusterDescription::metadata_json(d),
                None => {
                    return CommandResult::error(ENOENT, format!("{}.{} does not exist", daemon_type, id))
                }
            },
        };
        match serde_json::to_vec(&value) {
            Ok(out) => CommandResult::ok(out),
            Err(e) => CommandResult::error(EINVAL, e.to_string()),
        }
    }

    fn config_key_command(&self, op: &str, cmd: &Value) -> CommandResult {
        let key = cmd.get("key").and_then(Value::as_str);
        match (op, key) {
            ("get", Some(key)) => match self.desc.read().config.get(key) {
                Some(val) => CommandResult::ok(val.as_bytes()),
                None => CommandResult::error(ENOENT, format!("error obtaining '{}'", key)),
            },
            ("put", Some(key)) => {
                let val = cmd.get("val").and_then(Value::as_str).unwrap_or_default();
                self.desc
                    .write()
                    .config
                    .insert(key.to_string(), val.to_string());
                CommandResult {
                    code: 0,
                    outbl: Vec::new(),
                    outs: format!("set {}", key),
                }
            }
            ("list", _) => {
                let keys: Vec<String> = self.desc.read().config.keys().cloned().collect();
                match serde_json::to_vec(&keys) {
                    Ok(out) => CommandResult::ok(out),
                    Err(e) => CommandResult::error(EINVAL, e.to_string()),
                }
            }
            _ => CommandResult::error(EINVAL, "missing key"),
        }
    }
}

#[async_trait]
impl CommandRunner for LocalCluster {
    async fn run_command(&self, cmd: &Value) -> CommandResult {
        let prefix = command_prefix(cmd);
        let mut words = prefix.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("config-key"), Some(op), None) => self.config_key_command(op, cmd),
            (Some(ty), Some("metadata"), None) => match ty.parse::<DaemonType>() {
                Ok(daemon_type) => {
                    let id = cmd.get("id").and_then(Value::as_str);
                    self.metadata(daemon_type, id)
                }
                Err(e) => CommandResult::error(EINVAL, e.to_string()),
            },
            _ => CommandResult::error(EINVAL, format!("unrecognized command '{}'", prefix)),
        }
    }
}
