//! Agent behavior when the active manager moves.

use std::sync::Arc;
use std::time::Duration;

use clustermgr_agent::{Authorizer, MgrClient, PerfCounters, SessionParams};
use clustermgr_proto::{
    Configure, DaemonType, HelloReply, MessageConnection, MgrMap, MgrMessage, Report,
    TransportConfig,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

/// Accepts one agent, configures it, and forwards every report it sends.
async fn fake_manager(stats_period: u32) -> (std::net::SocketAddr, mpsc::Receiver<Report>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let conn = MessageConnection::accept(&listener, &TransportConfig::default())
            .await
            .unwrap();
        assert!(matches!(conn.recv().await.unwrap(), MgrMessage::Hello(_)));
        conn.send(&MgrMessage::HelloReply(HelloReply {
            is_valid: true,
            reason: None,
        }))
        .await
        .unwrap();
        assert!(matches!(conn.recv().await.unwrap(), MgrMessage::Open(_)));
        conn.send(&MgrMessage::Configure(Configure { stats_period }))
            .await
            .unwrap();
        while let Ok(msg) = conn.recv().await {
            if let MgrMessage::Report(r) = msg {
                if tx.send(r).await.is_err() {
                    break;
                }
            }
        }
    });
    (addr, rx)
}

async fn next_report(rx: &mut mpsc::Receiver<Report>) -> Report {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for report")
        .expect("manager went away")
}

fn counters() -> Arc<PerfCounters> {
    let c = PerfCounters::new();
    c.add_u64_counter("osd.op", "ops");
    c.add_time_avg("osd.op_latency", "latency");
    c.inc("osd.op", 3).unwrap();
    c.tinc("osd.op_latency", 1000).unwrap();
    Arc::new(c)
}

fn params() -> SessionParams {
    SessionParams {
        daemon_type: DaemonType::Osd,
        daemon_name: "3".to_string(),
        auth: Authorizer::None,
        transport: TransportConfig::default(),
        handshake_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn test_new_manager_receives_full_schema() {
    let (addr_a, mut reports_a) = fake_manager(1).await;
    let (addr_b, mut reports_b) = fake_manager(1).await;

    let client = MgrClient::new(params(), counters(), Duration::from_millis(200));
    let stats = client.stats();
    let (map_tx, map_rx) = watch::channel(MgrMap {
        epoch: 1,
        active_addr: Some(addr_a),
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(client.run(map_rx, shutdown_rx));

    // enabling reports sends one right away, carrying the whole schema
    let first = next_report(&mut reports_a).await;
    assert_eq!(first.daemon_name, "3");
    assert_eq!(first.declare_types.len(), 2);
    assert_eq!(first.packed.len(), 4 * 8);

    let second = next_report(&mut reports_a).await;
    assert!(second.declare_types.is_empty());
    assert_eq!(second.packed.len(), 4 * 8);

    map_tx
        .send(MgrMap {
            epoch: 2,
            active_addr: Some(addr_b),
        })
        .unwrap();

    let on_b = next_report(&mut reports_b).await;
    let mut paths: Vec<_> = on_b.declare_types.iter().map(|t| t.path.as_str()).collect();
    paths.sort();
    assert_eq!(paths, vec!["osd.op", "osd.op_latency"]);

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();

    let snap = stats.snapshot();
    assert_eq!(snap.sessions_opened, 2);
    assert!(snap.reports_sent >= 3);
    assert_eq!(snap.types_declared, 4);
}

#[tokio::test]
async fn test_zero_period_sends_nothing() {
    let (addr, mut reports) = fake_manager(0).await;

    let client = MgrClient::new(params(), counters(), Duration::from_millis(200));
    let stats = client.stats();
    let (_map_tx, map_rx) = watch::channel(MgrMap {
        epoch: 1,
        active_addr: Some(addr),
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(client.run(map_rx, shutdown_rx));

    let waited = tokio::time::timeout(Duration::from_millis(500), reports.recv()).await;
    assert!(waited.is_err());

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();
    assert_eq!(stats.snapshot().reports_sent, 0);
    assert_eq!(stats.snapshot().sessions_opened, 1);
}
