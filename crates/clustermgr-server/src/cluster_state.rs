//! Reconciles the metadata index with cluster membership maps.
//!
//! Each snapshot lists every daemon of one type with its current address.
//! A daemon with no record, or whose recorded address differs from the map,
//! gets an asynchronous metadata fetch unless one is already in flight.
//! Daemons missing from the snapshot are culled from the index and from the
//! server's aggregates in the same locked pass.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use clustermgr_proto::{DaemonKey, DaemonType};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::{metadata_command, run_checked, CommandRunner};
use crate::error::Result;
use crate::metadata::{parse_metadata_list, parse_metadata_one};
use crate::notify::NotifyDispatcher;
use crate::state::SharedState;

/// Membership of one daemon type at one map epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMapSnapshot {
    /// Daemon type the map describes.
    pub daemon_type: DaemonType,
    /// Map epoch.
    pub epoch: u64,
    /// Daemon id to network address.
    pub daemons: BTreeMap<String, String>,
}

impl ClusterMapSnapshot {
    /// An empty map.
    pub fn new(daemon_type: DaemonType, epoch: u64) -> Self {
        Self {
            daemon_type,
            epoch,
            daemons: BTreeMap::new(),
        }
    }

    /// Adds one daemon.
    pub fn with_daemon(mut self, id: impl Into<String>, addr: impl Into<String>) -> Self {
        self.daemons.insert(id.into(), addr.into());
        self
    }

    /// Ids of every daemon in the map.
    pub fn names(&self) -> BTreeSet<String> {
        self.daemons.keys().cloned().collect()
    }

    /// Event type queued for modules when this snapshot is applied.
    pub fn notify_type(&self) -> String {
        format!("{}_map", self.daemon_type)
    }
}

/// What one snapshot pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Keys whose metadata fetch was started.
    pub fetches: Vec<DaemonKey>,
    /// Keys skipped because a fetch was already in flight.
    pub skipped_updating: Vec<DaemonKey>,
    /// Keys whose metadata was erased.
    pub culled: Vec<DaemonKey>,
    /// Keys whose counter aggregate was dropped.
    pub culled_perf: Vec<DaemonKey>,
}

/// Clears a key's updating mark when the fetch finishes, however it ends.
struct UpdatingGuard {
    state: SharedState,
    key: DaemonKey,
}

impl Drop for UpdatingGuard {
    fn drop(&mut self) {
        self.state.lock().index.clear_updating(&self.key);
    }
}

/// Applies cluster maps to the metadata index and counter aggregates.
pub struct ClusterStateSync {
    state: SharedState,
    runner: Arc<dyn CommandRunner>,
    dispatcher: Arc<NotifyDispatcher>,
    command_timeout: Duration,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterStateSync {
    /// A synchronizer over the shared state.
    pub fn new(
        state: SharedState,
        runner: Arc<dyn CommandRunner>,
        dispatcher: Arc<NotifyDispatcher>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            state,
            runner,
            dispatcher,
            command_timeout,
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Loads every tracked daemon type's metadata in one command each.
    ///
    /// A type whose command fails is logged and left empty.
    pub async fn load_all_metadata(&self) -> usize {
        let mut total = 0;
        for daemon_type in DaemonType::TRACKED {
            match self.load_type(daemon_type).await {
                Ok(n) => {
                    info!(daemon_type = %daemon_type, count = n, "loaded daemon metadata");
                    total += n;
                }
                Err(e) => warn!(daemon_type = %daemon_type, error = %e, "metadata load failed"),
            }
        }
        total
    }

    async fn load_type(&self, daemon_type: DaemonType) -> Result<usize> {
        let cmd = metadata_command(daemon_type, None);
        let out = run_checked(self.runner.as_ref(), &cmd, self.command_timeout).await?;
        let records = parse_metadata_list(daemon_type, &out)?;
        let count = records.len();
        let mut state = self.state.lock();
        for dm in records {
            state.index.insert(Arc::new(dm));
        }
        Ok(count)
    }

    /// Applies one snapshot.
    pub fn handle_snapshot(&self, snapshot: &ClusterMapSnapshot) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        let names = snapshot.names();
        {
            let mut state = self.state.lock();
            for (id, addr) in &snapshot.daemons {
                let key = DaemonKey::new(snapshot.daemon_type, id.as_str());
                if state.index.is_updating(&key) {
                    outcome.skipped_updating.push(key);
                    continue;
                }
                let needs_refresh = match state.index.get(&key) {
                    Err(_) => true,
                    Ok(dm) => dm.addr() != Some(addr.as_str()),
                };
                if needs_refresh {
                    state.index.notify_updating(&key);
                    outcome.fetches.push(key);
                }
            }
            outcome.culled = state.index.cull(snapshot.daemon_type, &names);
            outcome.culled_perf = state.cull_daemon_perf_counters(snapshot.daemon_type, &names);
        }

        for key in &outcome.fetches {
            let addr = snapshot.daemons.get(&key.id).cloned().unwrap_or_default();
            self.spawn_fetch(key.clone(), addr);
        }

        if !outcome.fetches.is_empty() || !outcome.culled.is_empty() {
            info!(
                daemon_type = %snapshot.daemon_type,
                epoch = snapshot.epoch,
                fetches = outcome.fetches.len(),
                culled = outcome.culled.len(),
                "applied map snapshot"
            );
        }
        self.dispatcher
            .notify_all(&snapshot.notify_type(), &snapshot.epoch.to_string());
        outcome
    }

    fn spawn_fetch(&self, key: DaemonKey, map_addr: String) {
        let guard = UpdatingGuard {
            state: self.state.clone(),
            key: key.clone(),
        };
        let runner = self.runner.clone();
        let timeout = self.command_timeout;
        let handle = tokio::spawn(async move {
            let cmd = metadata_command(key.daemon_type, Some(&key.id));
            let fetched = run_checked(runner.as_ref(), &cmd, timeout)
                .await
                .and_then(|out| parse_metadata_one(&key, &out));
            match fetched {
                Ok(mut dm) => {
                    let addr_key = key.daemon_type.addr_metadata_key();
                    dm.metadata.entry(addr_key.to_string()).or_insert(map_addr);
                    guard.state.lock().index.insert(Arc::new(dm));
                    debug!(key = %key, "refreshed metadata");
                }
                Err(e) => warn!(key = %key, error = %e, "metadata refresh failed, will retry on next map"),
            }
            drop(guard);
        });

        let mut in_flight = self.in_flight.lock();
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(handle);
    }

    /// Number of fetches still running.
    pub fn pending_fetches(&self) -> usize {
        self.in_flight.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Waits for every fetch issued so far.
    pub async fn wait_for_fetches(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.in_flight.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for ClusterStateSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterStateSync")
            .field("pending_fetches", &self.pending_fetches())
            .finish()
    }
}
