//! One report session with one manager instance.
//!
//! The declared-path set lives here and nowhere else: dropping the session
//! forgets every declaration, so the next manager receives the full schema.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clustermgr_proto::{
    encode_report, DaemonType, MessageConnection, MgrMessage, Open, PerfCounterInstance,
    PerfCounterType, Report, TransportConfig,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::Authorizer;
use crate::error::{AgentError, Result};

const INBOUND_QUEUE: usize = 64;

/// Agent-side session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No active manager known, or no session to it.
    Idle,
    /// Open sent, waiting for Configure.
    Opening,
    /// Configure received; reports flow every `stats_period` seconds.
    Reporting,
}

/// Parameters for opening a session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Our daemon type.
    pub daemon_type: DaemonType,
    /// Our daemon id.
    pub daemon_name: String,
    /// Credentials for the handshake.
    pub auth: Authorizer,
    /// Transport settings.
    pub transport: TransportConfig,
    /// How long to wait for the handshake verdict.
    pub handshake_timeout: Duration,
}

/// Outcome of one report send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentReport {
    /// Types declared by this report.
    pub declared: usize,
    /// Size of the positional stream.
    pub packed_bytes: usize,
}

/// An open session to the active manager.
pub struct ReportSession {
    addr: SocketAddr,
    daemon_name: String,
    conn: Arc<MessageConnection>,
    declared: BTreeSet<String>,
    configured: bool,
    inbound: mpsc::Receiver<MgrMessage>,
    reader: JoinHandle<()>,
}

impl ReportSession {
    /// Connects, completes the handshake, and sends Open.
    pub async fn open(addr: SocketAddr, params: &SessionParams) -> Result<Self> {
        let conn = Arc::new(MessageConnection::connect(addr, &params.transport).await?);

        let hello = params.auth.build_hello(params.daemon_type);
        conn.send(&MgrMessage::Hello(hello)).await?;
        let reply = tokio::time::timeout(params.handshake_timeout, conn.recv())
            .await
            .map_err(|_| AgentError::HandshakeTimeout {
                addr: addr.to_string(),
            })??;
        match reply {
            MgrMessage::HelloReply(r) if r.is_valid => {}
            MgrMessage::HelloReply(r) => {
                return Err(AgentError::HandshakeRejected(
                    r.reason.unwrap_or_else(|| "no reason given".to_string()),
                ))
            }
            other => return Err(AgentError::UnexpectedMessage(other.message_type())),
        }

        let (tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        let reader = tokio::spawn(read_loop(conn.clone(), tx));

        conn.send(&MgrMessage::Open(Open {
            daemon_name: params.daemon_name.clone(),
        }))
        .await?;
        info!(addr = %addr, auth = %params.auth, "opened report session");

        Ok(Self {
            addr,
            daemon_name: params.daemon_name.clone(),
            conn,
            declared: BTreeSet::new(),
            configured: false,
            inbound,
            reader,
        })
    }

    /// Address of the manager this session talks to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        if self.configured {
            SessionState::Reporting
        } else {
            SessionState::Opening
        }
    }

    /// Marks the session configured.
    pub fn mark_configured(&mut self) {
        self.configured = true;
    }

    /// Paths declared to this manager so far.
    pub fn declared(&self) -> &BTreeSet<String> {
        &self.declared
    }

    /// Next inbound message; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<MgrMessage> {
        self.inbound.recv().await
    }

    /// Encodes and sends one report.
    ///
    /// The declared set is only advanced if the send succeeds.
    pub async fn send_report(
        &mut self,
        schema: &BTreeMap<String, PerfCounterType>,
        values: &BTreeMap<String, PerfCounterInstance>,
    ) -> Result<SentReport> {
        let mut declared = self.declared.clone();
        let payload = encode_report(schema, &mut declared, values)?;
        let sent = SentReport {
            declared: payload.declare_types.len(),
            packed_bytes: payload.packed.len(),
        };
        self.conn
            .send(&MgrMessage::Report(Report {
                daemon_name: self.daemon_name.clone(),
                declare_types: payload.declare_types,
                packed: payload.packed,
            }))
            .await?;
        self.declared = declared;
        debug!(addr = %self.addr, declared = sent.declared, bytes = sent.packed_bytes, "sent report");
        Ok(sent)
    }

    /// Closes the write side; the reader stops when the manager hangs up.
    pub async fn close(&self) {
        if let Err(e) = self.conn.shutdown().await {
            debug!(addr = %self.addr, error = %e, "shutdown failed");
        }
    }
}

impl Drop for ReportSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for ReportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportSession")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .field("declared", &self.declared.len())
            .finish()
    }
}

async fn read_loop(conn: Arc<MessageConnection>, tx: mpsc::Sender<MgrMessage>) {
    loop {
        match conn.recv().await {
            Ok(msg) => {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            Err(e) if e.is_fatal() => {
                debug!(peer = %conn.peer_addr(), error = %e, "session reader stopping");
                break;
            }
            Err(e) => {
                warn!(peer = %conn.peer_addr(), error = %e, "dropping undecodable message");
            }
        }
    }
}
