//! State shared by the server, the synchronizer and the module handle.
//!
//! Everything here sits behind one [`parking_lot::Mutex`]. The lock is never
//! held across an await point or a call into module code.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use clustermgr_proto::{DaemonKey, DaemonType};
use parking_lot::Mutex;
use tracing::debug;

use crate::metadata::DaemonMetadataIndex;
use crate::perf::DaemonPerfCounters;

/// Data guarded by the manager lock.
#[derive(Debug, Default)]
pub struct CoreState {
    /// Daemon metadata and the updating-set.
    pub index: DaemonMetadataIndex,
    /// Per-daemon counter aggregates.
    pub perf: BTreeMap<DaemonKey, DaemonPerfCounters>,
    /// Local copy of the external config-key store.
    pub config_cache: BTreeMap<String, String>,
}

impl CoreState {
    /// Removes every aggregate of `daemon_type` whose id is not in
    /// `names_that_exist`.
    pub fn cull_daemon_perf_counters(
        &mut self,
        daemon_type: DaemonType,
        names_that_exist: &BTreeSet<String>,
    ) -> Vec<DaemonKey> {
        let victims: Vec<DaemonKey> = self
            .perf
            .keys()
            .filter(|k| k.daemon_type == daemon_type && !names_that_exist.contains(&k.id))
            .cloned()
            .collect();
        for key in &victims {
            debug!(key = %key, "culling perf counters");
            self.perf.remove(key);
        }
        victims
    }
}

/// Handle to the locked core state.
pub type SharedState = Arc<Mutex<CoreState>>;

/// Creates empty shared state.
pub fn new_shared_state() -> SharedState {
    Arc::new(Mutex::new(CoreState::default()))
}
