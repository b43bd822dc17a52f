//! Counters describing the manager's own report traffic.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of [`ServerMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerMetricsSnapshot {
    /// Accepted TCP connections.
    pub connections_accepted: u64,
    /// Connections refused at handshake.
    pub connections_rejected: u64,
    /// Connections closed.
    pub connections_closed: u64,
    /// Open messages accepted.
    pub opens: u64,
    /// Reports received.
    pub reports_received: u64,
    /// Reports applied to an aggregate.
    pub reports_decoded: u64,
    /// Reports discarded.
    pub reports_dropped: u64,
    /// Messages with no handler.
    pub unhandled_messages: u64,
    /// Frame bytes read.
    pub bytes_received: u64,
}

/// Thread-safe report traffic counters.
#[derive(Default)]
pub struct ServerMetrics {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    connections_closed: AtomicU64,
    opens: AtomicU64,
    reports_received: AtomicU64,
    reports_decoded: AtomicU64,
    reports_dropped: AtomicU64,
    unhandled_messages: AtomicU64,
    bytes_received: AtomicU64,
}

impl std::fmt::Debug for ServerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl ServerMetrics {
    /// All counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts an accepted connection.
    pub fn inc_connections_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a refused handshake.
    pub fn inc_connections_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a closed connection.
    pub fn inc_connections_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an accepted Open.
    pub fn inc_opens(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a received report.
    pub fn inc_reports_received(&self) {
        self.reports_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an applied report.
    pub fn inc_reports_decoded(&self) {
        self.reports_decoded.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a discarded report.
    pub fn inc_reports_dropped(&self) {
        self.reports_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a message with no handler.
    pub fn inc_unhandled_messages(&self) {
        self.unhandled_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts bytes read.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> ServerMetricsSnapshot {
        ServerMetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            opens: self.opens.load(Ordering::Relaxed),
            reports_received: self.reports_received.load(Ordering::Relaxed),
            reports_decoded: self.reports_decoded.load(Ordering::Relaxed),
            reports_dropped: self.reports_dropped.load(Ordering::Relaxed),
            unhandled_messages: self.unhandled_messages.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}
