//! Server side of the report protocol.
//!
//! Each accepted connection first completes a Hello handshake, then moves
//! through Unknown (no Open yet) and Configured (Open accepted, Reports
//! decoded into the daemon's aggregate). Messages are dispatched on their
//! tag; anything a daemon should not send is counted and dropped.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clustermgr_proto::{
    Configure, DaemonKey, DaemonType, DecodeSummary, HelloReply, MessageConnection, MgrMessage,
    Open, PerfCounterCatalog, ProtoError, Report, TransportConfig, FRAME_HEADER_SIZE,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::auth::AuthRegistry;
use crate::error::{MgrError, Result};
use crate::metrics::ServerMetrics;
use crate::perf::DaemonPerfCounters;
use crate::state::SharedState;

/// Per-connection protocol state.
#[derive(Debug, Clone)]
pub struct DaemonSession {
    /// Type the peer announced in its handshake.
    pub peer_type: DaemonType,
    /// Remote address.
    pub peer_addr: SocketAddr,
    /// Identity accepted by Open; `None` until then.
    pub key: Option<DaemonKey>,
    /// Set when the connection must be closed so the daemon reopens.
    pub closing: bool,
}

impl DaemonSession {
    /// A session that has not sent Open yet.
    pub fn new(peer_type: DaemonType, peer_addr: SocketAddr) -> Self {
        Self {
            peer_type,
            peer_addr,
            key: None,
            closing: false,
        }
    }

    /// Whether Open was accepted.
    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }
}

/// Accepts daemon connections and aggregates their reports.
pub struct DaemonServer {
    state: SharedState,
    catalog: Arc<PerfCounterCatalog>,
    auth: AuthRegistry,
    metrics: Arc<ServerMetrics>,
    stats_period: u32,
    handshake_timeout: Duration,
    transport: TransportConfig,
}

impl DaemonServer {
    /// A server with no sessions.
    pub fn new(
        state: SharedState,
        catalog: Arc<PerfCounterCatalog>,
        auth: AuthRegistry,
        stats_period: u32,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            state,
            catalog,
            auth,
            metrics: Arc::new(ServerMetrics::new()),
            stats_period,
            handshake_timeout,
            transport: TransportConfig::default(),
        }
    }

    /// Report traffic counters.
    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    /// Counter type catalog shared by every daemon.
    pub fn catalog(&self) -> Arc<PerfCounterCatalog> {
        self.catalog.clone()
    }

    /// Accept loop; runs until `shutdown` flips to true.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(addr = %listener.local_addr()?, "daemon server listening");
        loop {
            tokio::select! {
                accepted = MessageConnection::accept(&listener, &self.transport) => match accepted {
                    Ok(conn) => {
                        self.metrics.inc_connections_accepted();
                        debug!(peer = %conn.peer_addr(), "accepted connection");
                        tokio::spawn(self.clone().handle_connection(conn));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("daemon server stopped");
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, conn: MessageConnection) {
        let peer_type = match self.handshake(&conn).await {
            Ok(t) => t,
            Err(_) => {
                self.metrics.inc_connections_rejected();
                return;
            }
        };

        let mut session = DaemonSession::new(peer_type, conn.peer_addr());
        loop {
            let frame = match conn.recv_frame().await {
                Ok(frame) => frame,
                Err(e) if e.is_fatal() => {
                    debug!(peer = %session.peer_addr, error = %e, "connection closed");
                    break;
                }
                Err(e) => {
                    warn!(peer = %session.peer_addr, error = %e, "dropping bad frame");
                    continue;
                }
            };
            self.metrics
                .add_bytes_received((FRAME_HEADER_SIZE + frame.payload.len()) as u64);

            let msg = match MgrMessage::from_frame(&frame) {
                Ok(msg) => msg,
                Err(e) => {
                    self.metrics.inc_unhandled_messages();
                    warn!(peer = %session.peer_addr, msg_type = frame.header.msg_type, error = %e, "unhandled message");
                    continue;
                }
            };
            if let Some(reply) = self.dispatch(&mut session, msg) {
                if let Err(e) = conn.send(&reply).await {
                    debug!(peer = %session.peer_addr, error = %e, "reply failed");
                    break;
                }
            }
            if session.closing {
                break;
            }
        }
        self.metrics.inc_connections_closed();
        if let Some(key) = &session.key {
            info!(key = %key, "daemon session ended");
        }
    }

    async fn handshake(&self, conn: &MessageConnection) -> Result<DaemonType> {
        let peer = conn.peer_addr();
        let hello = match tokio::time::timeout(self.handshake_timeout, conn.recv()).await {
            Ok(Ok(MgrMessage::Hello(hello))) => hello,
            Ok(Ok(other)) => {
                warn!(peer = %peer, msg_type = ?other.message_type(), "expected Hello");
                return Err(MgrError::AuthRejected("no handshake".to_string()));
            }
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "handshake read failed");
                return Err(e.into());
            }
            Err(_) => {
                warn!(peer = %peer, "handshake timed out");
                return Err(ProtoError::ConnectionTimeout {
                    addr: peer.to_string(),
                    timeout_ms: self.handshake_timeout.as_millis() as u64,
                }
                .into());
            }
        };

        let verdict = self.auth.verify(&hello);
        let reply = match &verdict {
            Ok(handler) => {
                debug!(peer = %peer, peer_type = %hello.peer_type, auth = *handler, "authorized");
                HelloReply {
                    is_valid: true,
                    reason: None,
                }
            }
            Err(MgrError::NoAuthHandler(protocol)) => {
                error!(peer = %peer, protocol = *protocol, "no auth handler for protocol, refusing connection");
                HelloReply {
                    is_valid: false,
                    reason: Some(format!("unsupported auth protocol {}", protocol)),
                }
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "authorizer rejected");
                HelloReply {
                    is_valid: false,
                    reason: Some(e.to_string()),
                }
            }
        };
        if let Err(e) = conn.send(&MgrMessage::HelloReply(reply)).await {
            debug!(peer = %peer, error = %e, "handshake reply failed");
            return Err(e.into());
        }
        verdict.map(|_| hello.peer_type)
    }

    /// Routes one message. Returns the reply to send, if any.
    pub fn dispatch(&self, session: &mut DaemonSession, msg: MgrMessage) -> Option<MgrMessage> {
        match msg {
            MgrMessage::Open(open) => self.handle_open(session, &open).map(MgrMessage::Configure),
            MgrMessage::Report(report) => {
                if let Err(MgrError::StaleSession(key)) = self.handle_report(session, &report) {
                    // a fresh Open redeclares the full schema into a new aggregate
                    info!(key = %key, peer = %session.peer_addr, "closing session to force reopen");
                    session.closing = true;
                }
                None
            }
            other @ (MgrMessage::Hello(_)
            | MgrMessage::HelloReply(_)
            | MgrMessage::Configure(_)
            | MgrMessage::MgrMap(_)) => {
                self.metrics.inc_unhandled_messages();
                warn!(peer = %session.peer_addr, msg_type = ?other.message_type(), "unhandled message");
                None
            }
        }
    }

    /// Accepts a daemon's introduction and returns its reporting policy.
    pub fn handle_open(&self, session: &mut DaemonSession, open: &Open) -> Option<Configure> {
        let key = match DaemonKey::validated(session.peer_type, &open.daemon_name) {
            Ok(key) => key,
            Err(e) => {
                warn!(peer = %session.peer_addr, error = %e, "rejecting Open");
                return None;
            }
        };
        self.state
            .lock()
            .perf
            .entry(key.clone())
            .or_default()
            .begin_session();
        self.metrics.inc_opens();
        info!(key = %key, peer = %session.peer_addr, stats_period = self.stats_period, "daemon opened session");
        session.key = Some(key);
        Some(Configure {
            stats_period: self.stats_period,
        })
    }

    /// Decodes one report into the sender's aggregate.
    ///
    /// A report that cannot be applied is dropped; the session stays up.
    pub fn handle_report(&self, session: &DaemonSession, report: &Report) -> Result<DecodeSummary> {
        self.metrics.inc_reports_received();
        let result = self.apply_report(session, report);
        match &result {
            Ok(summary) => {
                self.metrics.inc_reports_decoded();
                debug!(
                    peer = %session.peer_addr,
                    declared = summary.declared,
                    values = summary.values,
                    "applied report"
                );
            }
            Err(e) => {
                self.metrics.inc_reports_dropped();
                warn!(peer = %session.peer_addr, error = %e, "dropping report");
            }
        }
        result
    }

    fn apply_report(&self, session: &DaemonSession, report: &Report) -> Result<DecodeSummary> {
        let key = session
            .key
            .as_ref()
            .ok_or_else(|| MgrError::NotFound(format!("session for {}", session.peer_addr)))?;
        if report.daemon_name != key.id {
            return Err(MgrError::NotFound(format!(
                "{}.{} on session of {}",
                key.daemon_type, report.daemon_name, key
            )));
        }
        let mut state = self.state.lock();
        let counters = state
            .perf
            .get_mut(key)
            .ok_or_else(|| MgrError::StaleSession(key.to_string()))?;
        Ok(counters.update(report, &self.catalog)?)
    }

    /// Drops aggregates of daemons that left the cluster.
    pub fn cull_daemon_perf_counters(
        &self,
        daemon_type: DaemonType,
        names_that_exist: &BTreeSet<String>,
    ) -> Vec<DaemonKey> {
        self.state
            .lock()
            .cull_daemon_perf_counters(daemon_type, names_that_exist)
    }

    /// Copy of one daemon's aggregate.
    pub fn get_perf_counters(&self, key: &DaemonKey) -> Option<DaemonPerfCounters> {
        self.state.lock().perf.get(key).cloned()
    }
}

impl std::fmt::Debug for DaemonServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonServer")
            .field("stats_period", &self.stats_period)
            .field("auth", &self.auth)
            .field("metrics", &self.metrics)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::state::new_shared_state;
    use clustermgr_proto::{
        encode_report, PerfCounterFlags, PerfCounterInstance, PerfCounterType,
    };
    use std::collections::BTreeMap;

    fn server() -> DaemonServer {
        DaemonServer::new(
            new_shared_state(),
            Arc::new(PerfCounterCatalog::new()),
            AuthRegistry::from_config(&AuthConfig::default()),
            5,
            Duration::from_secs(5),
        )
    }

    fn session() -> DaemonSession {
        DaemonSession::new(DaemonType::Osd, SocketAddr::from(([10, 0, 0, 5], 40000)))
    }

    fn report(name: &str, declared: &mut std::collections::BTreeSet<String>, v: u64) -> Report {
        let schema: BTreeMap<String, PerfCounterType> = [PerfCounterType::new(
            "osd.op",
            PerfCounterFlags::U64 | PerfCounterFlags::COUNTER,
        )]
        .into_iter()
        .map(|t| (t.path.clone(), t))
        .collect();
        let mut values = BTreeMap::new();
        values.insert("osd.op".to_string(), PerfCounterInstance::plain(v));
        let payload = encode_report(&schema, declared, &values).unwrap();
        Report {
            daemon_name: name.to_string(),
            declare_types: payload.declare_types,
            packed: payload.packed,
        }
    }

    #[test]
    fn test_open_replies_configure() {
        let server = server();
        let mut s = session();
        let reply = server.dispatch(
            &mut s,
            MgrMessage::Open(Open {
                daemon_name: "3".to_string(),
            }),
        );
        assert_eq!(reply, Some(MgrMessage::Configure(Configure { stats_period: 5 })));
        assert_eq!(s.key, Some(DaemonKey::new(DaemonType::Osd, "3")));
        assert!(server
            .get_perf_counters(&DaemonKey::new(DaemonType::Osd, "3"))
            .is_some());
        assert_eq!(server.metrics().snapshot().opens, 1);
    }

    #[test]
    fn test_open_with_bad_name_is_ignored() {
        let server = server();
        let mut s = session();
        let reply = server.handle_open(
            &mut s,
            &Open {
                daemon_name: "bad name".to_string(),
            },
        );
        assert!(reply.is_none());
        assert!(!s.is_configured());
    }

    #[test]
    fn test_report_before_open_dropped() {
        let server = server();
        let s = session();
        let mut declared = Default::default();
        assert!(server.handle_report(&s, &report("3", &mut declared, 1)).is_err());
        let m = server.metrics().snapshot();
        assert_eq!(m.reports_received, 1);
        assert_eq!(m.reports_dropped, 1);
    }

    #[test]
    fn test_report_updates_aggregate() {
        let server = server();
        let mut s = session();
        server.handle_open(&mut s, &Open { daemon_name: "3".to_string() });
        let mut declared = Default::default();
        server.handle_report(&s, &report("3", &mut declared, 1)).unwrap();
        let summary = server.handle_report(&s, &report("3", &mut declared, 4)).unwrap();
        assert_eq!(summary.declared, 0);

        let key = DaemonKey::new(DaemonType::Osd, "3");
        let counters = server.get_perf_counters(&key).unwrap();
        assert_eq!(counters.get("osd.op"), Some(PerfCounterInstance::plain(4)));
        assert_eq!(server.metrics().snapshot().reports_decoded, 2);
    }

    #[test]
    fn test_report_with_wrong_name_dropped() {
        let server = server();
        let mut s = session();
        server.handle_open(&mut s, &Open { daemon_name: "3".to_string() });
        let mut declared = Default::default();
        assert!(server.handle_report(&s, &report("4", &mut declared, 1)).is_err());
        let counters = server
            .get_perf_counters(&DaemonKey::new(DaemonType::Osd, "3"))
            .unwrap();
        assert!(counters.instances().is_empty());
    }

    #[test]
    fn test_short_report_keeps_session() {
        let server = server();
        let mut s = session();
        server.handle_open(&mut s, &Open { daemon_name: "3".to_string() });
        let mut declared = Default::default();
        let mut r = report("3", &mut declared, 1);
        r.packed.clear();
        assert!(server.handle_report(&s, &r).is_err());
        assert!(s.is_configured());
        // the declaration still counts; the next full report decodes
        server.handle_report(&s, &report("3", &mut declared, 2)).unwrap();
    }

    #[test]
    fn test_unhandled_message_counted() {
        let server = server();
        let mut s = session();
        let reply = server.dispatch(&mut s, MgrMessage::Configure(Configure { stats_period: 1 }));
        assert!(reply.is_none());
        assert_eq!(server.metrics().snapshot().unhandled_messages, 1);
    }

    #[test]
    fn test_cull_perf_counters() {
        let server = server();
        for id in ["1", "2", "3"] {
            let mut s = session();
            server.handle_open(&mut s, &Open { daemon_name: id.to_string() });
        }
        let keep: BTreeSet<String> = ["1", "2"].iter().map(|s| s.to_string()).collect();
        let removed = server.cull_daemon_perf_counters(DaemonType::Osd, &keep);
        assert_eq!(removed, vec![DaemonKey::new(DaemonType::Osd, "3")]);
        assert!(server
            .get_perf_counters(&DaemonKey::new(DaemonType::Osd, "3"))
            .is_none());
    }

    #[test]
    fn test_report_after_cull_closes_session() {
        let server = server();
        let mut s = session();
        server.dispatch(&mut s, MgrMessage::Open(Open { daemon_name: "3".to_string() }));
        let mut declared = Default::default();
        server.dispatch(&mut s, MgrMessage::Report(report("3", &mut declared, 1)));
        assert!(!s.closing);

        server.cull_daemon_perf_counters(DaemonType::Osd, &BTreeSet::new());
        let r = report("3", &mut declared, 2);
        assert!(matches!(
            server.handle_report(&s, &r),
            Err(MgrError::StaleSession(_))
        ));
        assert!(server.dispatch(&mut s, MgrMessage::Report(r)).is_none());
        assert!(s.closing);

        // the daemon's next session starts from a fresh aggregate
        let mut reopened = session();
        server.dispatch(&mut reopened, MgrMessage::Open(Open { daemon_name: "3".to_string() }));
        let mut declared = Default::default();
        server.handle_report(&reopened, &report("3", &mut declared, 5)).unwrap();
        let counters = server
            .get_perf_counters(&DaemonKey::new(DaemonType::Osd, "3"))
            .unwrap();
        assert_eq!(counters.get("osd.op"), Some(PerfCounterInstance::plain(5)));
        assert!(!reopened.closing);
    }
}
