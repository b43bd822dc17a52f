//! Extension modules hosted by the manager.
//!
//! A module sees the manager only through the [`MgrHandle`] passed to
//! `serve`; notifications reach it through the dispatcher's workers, never
//! while the manager holds its lock.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::info;

use crate::command::{CommandResult, EINVAL};
use crate::error::Result;
use crate::handle::MgrHandle;

/// A pluggable manager extension.
#[async_trait]
pub trait MgrModule: Send + Sync + 'static {
    /// Unique module name.
    fn name(&self) -> &str;

    /// Long-running entry point; the manager aborts it at shutdown.
    async fn serve(&self, _handle: MgrHandle) -> Result<()> {
        Ok(())
    }

    /// Called on a dispatcher worker for every event.
    fn notify(&self, notify_type: &str, notify_id: &str);

    /// Handles a command addressed to this module.
    fn handle_command(&self, _cmd: &Value) -> CommandResult {
        CommandResult::error(EINVAL, format!("{} does not handle commands", self.name()))
    }
}

/// Logs every event and periodically summarizes manager state.
#[derive(Debug)]
pub struct EventLogModule {
    interval: Duration,
    counts: Mutex<BTreeMap<String, u64>>,
}

impl EventLogModule {
    /// Logs event counts every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            counts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Events seen so far, by type.
    pub fn counts(&self) -> BTreeMap<String, u64> {
        self.counts.lock().clone()
    }
}

#[async_trait]
impl MgrModule for EventLogModule {
    fn name(&self) -> &str {
        "event_log"
    }

    async fn serve(&self, handle: MgrHandle) -> Result<()> {
        let mut tick = tokio::time::interval(self.interval);
        tick.tick().await;
        loop {
            tick.tick().await;
            let servers = handle.list_servers();
            let stats = handle.get("server_stats").unwrap_or(Value::Null);
            info!(
                servers = servers.as_array().map(Vec::len).unwrap_or(0),
                reports = %stats["reports_decoded"],
                dropped = %stats["reports_dropped"],
                "cluster summary"
            );
        }
    }

    fn notify(&self, notify_type: &str, notify_id: &str) {
        info!(notify_type, notify_id, "event");
        *self.counts.lock().entry(notify_type.to_string()).or_default() += 1;
    }

    fn handle_command(&self, cmd: &Value) -> CommandResult {
        match cmd.get("prefix").and_then(Value::as_str) {
            Some("event_log counts") => match serde_json::to_vec(&self.counts()) {
                Ok(out) => CommandResult::ok(out),
                Err(e) => CommandResult::error(EINVAL, e.to_string()),
            },
            _ => CommandResult::error(EINVAL, "unknown command"),
        }
    }
}

#[cfg(test)]
pub(crate) use tests::RecordingModule;
