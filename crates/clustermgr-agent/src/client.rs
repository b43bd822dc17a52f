//! Agent-side manager client.
//!
//! Follows the cluster's active-manager announcements, keeps at most one
//! [`ReportSession`] open, and sends reports strictly one after another: the
//! report deadline is only re-armed once the previous send has completed.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clustermgr_proto::{Configure, MgrMap, MgrMessage, ProtoError};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::counters::PerfCounters;
use crate::error::{AgentError, Result};
use crate::session::{ReportSession, SessionParams, SessionState};

/// Counters describing the client's own activity.
#[derive(Debug, Default)]
pub struct ReportStats {
    reports_sent: AtomicU64,
    report_failures: AtomicU64,
    types_declared: AtomicU64,
    sessions_opened: AtomicU64,
    connect_failures: AtomicU64,
}

impl ReportStats {
    /// Creates zeroed stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy.
    pub fn snapshot(&self) -> ReportStatsSnapshot {
        ReportStatsSnapshot {
            reports_sent: self.reports_sent.load(Ordering::Relaxed),
            report_failures: self.report_failures.load(Ordering::Relaxed),
            types_declared: self.types_declared.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`ReportStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportStatsSnapshot {
    /// Reports written to a manager.
    pub reports_sent: u64,
    /// Report sends that failed and dropped the session.
    pub report_failures: u64,
    /// Counter types declared across all sessions.
    pub types_declared: u64,
    /// Sessions successfully opened.
    pub sessions_opened: u64,
    /// Failed connection or handshake attempts.
    pub connect_failures: u64,
}

/// Follows the active manager and reports this daemon's counters to it.
pub struct MgrClient {
    params: SessionParams,
    counters: Arc<PerfCounters>,
    stats: Arc<ReportStats>,
    retry_interval: Duration,
    map: MgrMap,
    session: Option<ReportSession>,
    stats_period: u32,
    next_report: Option<Instant>,
    next_connect: Option<Instant>,
}

impl MgrClient {
    /// Creates an idle client.
    pub fn new(params: SessionParams, counters: Arc<PerfCounters>, retry_interval: Duration) -> Self {
        Self {
            params,
            counters,
            stats: Arc::new(ReportStats::new()),
            retry_interval,
            map: MgrMap::default(),
            session: None,
            stats_period: 0,
            next_report: None,
            next_connect: None,
        }
    }

    /// Shared handle to the client's stats.
    pub fn stats(&self) -> Arc<ReportStats> {
        self.stats.clone()
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|s| s.state())
            .unwrap_or(SessionState::Idle)
    }

    /// Paths declared to the current manager.
    pub fn declared_paths(&self) -> BTreeSet<String> {
        self.session
            .as_ref()
            .map(|s| s.declared().clone())
            .unwrap_or_default()
    }

    /// Report interval last configured by the manager.
    pub fn stats_period(&self) -> u32 {
        self.stats_period
    }

    /// Last accepted manager map.
    pub fn mgr_map(&self) -> MgrMap {
        self.map
    }

    /// Applies a manager map.
    ///
    /// Any change of the active address discards the current session along
    /// with its declared schema. Returns true if a connection attempt is now
    /// due.
    pub fn handle_mgr_map(&mut self, map: MgrMap) -> bool {
        if map.epoch < self.map.epoch {
            debug!(epoch = map.epoch, current = self.map.epoch, "ignoring stale mgr map");
            return false;
        }
        let changed = map.active_addr != self.map.active_addr;
        self.map = map;
        if !changed {
            return false;
        }
        match map.active_addr {
            Some(addr) => info!(epoch = map.epoch, addr = %addr, "active manager changed"),
            None => info!(epoch = map.epoch, "no active manager"),
        }
        self.reset_session();
        self.next_connect = map.active_addr.map(|_| Instant::now());
        self.next_connect.is_some()
    }

    fn reset_session(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(addr = %session.addr(), declared = session.declared().len(), "discarding session");
        }
        self.stats_period = 0;
        self.next_report = None;
    }

    /// Opens a session to the active manager, scheduling a retry on failure.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.next_connect = None;
        let Some(addr) = self.map.active_addr else {
            return Err(AgentError::NotConnected);
        };
        self.reset_session();
        match ReportSession::open(addr, &self.params).await {
            Ok(session) => {
                self.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "failed to open report session");
                self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                self.next_connect = Some(Instant::now() + self.retry_interval);
                Err(e)
            }
        }
    }

    /// Dispatches one message from the manager.
    pub async fn handle_message(&mut self, msg: MgrMessage) -> Result<()> {
        match msg {
            MgrMessage::Configure(c) => self.handle_configure(c).await,
            MgrMessage::MgrMap(m) => {
                self.handle_mgr_map(m);
                Ok(())
            }
            other => {
                debug!(msg_type = ?other.message_type(), "ignoring message from manager");
                Ok(())
            }
        }
    }

    /// Applies a reporting policy.
    ///
    /// Moving from disabled to enabled reports immediately; a zero period
    /// stops the timer.
    pub async fn handle_configure(&mut self, configure: Configure) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(AgentError::NotConnected);
        };
        session.mark_configured();
        let previous = self.stats_period;
        self.stats_period = configure.stats_period;
        info!(addr = %session.addr(), stats_period = configure.stats_period, "configured by manager");

        if configure.stats_period == 0 {
            self.next_report = None;
            return Ok(());
        }
        if previous == 0 {
            return self.send_report().await;
        }
        if self.next_report.is_none() {
            self.arm_report_timer();
        }
        Ok(())
    }

    fn arm_report_timer(&mut self) {
        self.next_report = (self.stats_period > 0)
            .then(|| Instant::now() + Duration::from_secs(u64::from(self.stats_period)));
    }

    /// Sends one report and re-arms the timer once the send has finished.
    ///
    /// A failed send drops the session and schedules a reconnect, except for
    /// a report too large to frame, which leaves the session open.
    pub async fn send_report(&mut self) -> Result<()> {
        self.next_report = None;
        let Some(session) = self.session.as_mut() else {
            return Err(AgentError::NotConnected);
        };
        let schema = self.counters.schema();
        let values = self.counters.snapshot();
        match session.send_report(&schema, &values).await {
            Ok(sent) => {
                self.stats.reports_sent.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .types_declared
                    .fetch_add(sent.declared as u64, Ordering::Relaxed);
                self.arm_report_timer();
                Ok(())
            }
            Err(e @ AgentError::Proto(ProtoError::PayloadTooLarge { .. })) => {
                // nothing reached the wire and the declared set is unchanged
                warn!(addr = %session.addr(), error = %e, "report too large to send, keeping session");
                self.stats.report_failures.fetch_add(1, Ordering::Relaxed);
                self.arm_report_timer();
                Err(e)
            }
            Err(e) => {
                warn!(addr = %session.addr(), error = %e, "report send failed, dropping session");
                self.stats.report_failures.fetch_add(1, Ordering::Relaxed);
                self.reset_session();
                self.next_connect = Some(Instant::now() + self.retry_interval);
                Err(e)
            }
        }
    }

    fn session_lost(&mut self) {
        if let Some(session) = self.session.as_ref() {
            warn!(addr = %session.addr(), "manager closed the session");
        }
        self.reset_session();
        self.next_connect = Some(Instant::now() + self.retry_interval);
    }

    /// Runs until `shutdown` flips to true or the map source goes away.
    pub async fn run(
        mut self,
        mut maps: watch::Receiver<MgrMap>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let initial = *maps.borrow_and_update();
        self.handle_mgr_map(initial);

        loop {
            tokio::select! {
                changed = maps.changed() => {
                    if changed.is_err() {
                        debug!("map source closed");
                        break;
                    }
                    let map = *maps.borrow_and_update();
                    self.handle_mgr_map(map);
                }
                msg = recv_from(&mut self.session) => match msg {
                    Some(msg) => {
                        if let Err(e) = self.handle_message(msg).await {
                            debug!(error = %e, "message handling failed");
                        }
                    }
                    None => self.session_lost(),
                },
                _ = sleep_until(self.next_report) => {
                    if let Err(e) = self.send_report().await {
                        debug!(error = %e, "scheduled report not sent");
                    }
                }
                _ = sleep_until(self.next_connect) => {
                    let _ = self.reconnect().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Some(session) = self.session.take() {
            session.close().await;
        }
        info!(stats = ?self.stats.snapshot(), "manager client stopped");
        Ok(())
    }
}

async fn recv_from(session: &mut Option<ReportSession>) -> Option<MgrMessage> {
    match session.as_mut() {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for MgrClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MgrClient")
            .field("map", &self.map)
            .field("state", &self.state())
            .field("stats_period", &self.stats_period)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clustermgr_proto::{
        DaemonType, HelloReply, MessageConnection, TransportConfig, MAX_PAYLOAD_SIZE,
    };
    use crate::auth::Authorizer;
    use tokio::net::TcpListener;

    fn client() -> MgrClient {
        let params = SessionParams {
            daemon_type: DaemonType::Osd,
            daemon_name: "0".to_string(),
            auth: Authorizer::None,
            transport: TransportConfig::default(),
            handshake_timeout: Duration::from_secs(1),
        };
        MgrClient::new(params, Arc::new(PerfCounters::new()), Duration::from_secs(1))
    }

    fn map(epoch: u64, port: Option<u16>) -> MgrMap {
        MgrMap {
            epoch,
            active_addr: port.map(|p| ([127, 0, 0, 1], p).into()),
        }
    }

    #[test]
    fn test_starts_idle() {
        let c = client();
        assert_eq!(c.state(), SessionState::Idle);
        assert!(c.declared_paths().is_empty());
        assert_eq!(c.stats_period(), 0);
    }

    #[test]
    fn test_address_change_requests_connect() {
        let mut c = client();
        assert!(c.handle_mgr_map(map(1, Some(7000))));
        assert!(!c.handle_mgr_map(map(2, Some(7000))));
        assert!(c.handle_mgr_map(map(3, Some(7001))));
        assert!(!c.handle_mgr_map(map(4, None)));
        assert_eq!(c.mgr_map().epoch, 4);
    }

    #[test]
    fn test_stale_map_ignored() {
        let mut c = client();
        c.handle_mgr_map(map(5, Some(7000)));
        assert!(!c.handle_mgr_map(map(4, Some(7001))));
        assert_eq!(c.mgr_map(), map(5, Some(7000)));
    }

    #[tokio::test]
    async fn test_report_without_session() {
        let mut c = client();
        assert!(matches!(c.send_report().await, Err(AgentError::NotConnected)));
        assert!(matches!(
            c.handle_configure(Configure { stats_period: 5 }).await,
            Err(AgentError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_failure_schedules_retry() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut c = client();
        c.handle_mgr_map(map(1, Some(port)));
        assert!(c.reconnect().await.is_err());
        assert!(c.next_connect.is_some());
        assert_eq!(c.stats.snapshot().connect_failures, 1);
        assert_eq!(c.state(), SessionState::Idle);
    }

    /// Accepts one agent and completes its handshake, then drains its frames.
    async fn accepting_manager() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let conn = MessageConnection::accept(&listener, &TransportConfig::default())
                .await
                .unwrap();
            conn.recv().await.unwrap();
            conn.send(&MgrMessage::HelloReply(HelloReply {
                is_valid: true,
                reason: None,
            }))
            .await
            .unwrap();
            while conn.recv_frame().await.is_ok() {}
        });
        port
    }

    #[tokio::test]
    async fn test_oversized_report_keeps_session() {
        let counters = PerfCounters::new();
        let huge = "x".repeat(MAX_PAYLOAD_SIZE as usize + 1);
        counters.add_u64_counter("osd.op", &huge);
        let params = SessionParams {
            daemon_type: DaemonType::Osd,
            daemon_name: "0".to_string(),
            auth: Authorizer::None,
            transport: TransportConfig::default(),
            handshake_timeout: Duration::from_secs(5),
        };
        let mut c = MgrClient::new(params, Arc::new(counters), Duration::from_secs(1));
        c.handle_mgr_map(map(1, Some(accepting_manager().await)));
        c.reconnect().await.unwrap();
        c.stats_period = 1;

        let err = c.send_report().await.unwrap_err();
        assert!(matches!(err, AgentError::Proto(ProtoError::PayloadTooLarge { .. })));
        assert_ne!(c.state(), SessionState::Idle);
        assert!(c.declared_paths().is_empty());
        assert!(c.next_report.is_some());
        assert!(c.next_connect.is_none());
        let stats = c.stats.snapshot();
        assert_eq!((stats.report_failures, stats.sessions_opened), (1, 1));
    }
}
