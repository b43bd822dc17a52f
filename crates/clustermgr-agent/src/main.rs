#![warn(missing_docs)]

//! `cmgr-agent`: reports a demo counter set to a manager.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use clustermgr_agent::{AgentConfig, Authorizer, MgrClient, PerfCounters};
use clustermgr_proto::{DaemonType, MgrMap};
use rand::Rng;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cmgr-agent")]
#[command(about = "Reports daemon perf counters to the cluster manager", long_about = None)]
struct Cli {
    /// Config file (.toml or .json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    daemon_type: Option<DaemonType>,

    #[arg(long)]
    daemon_id: Option<String>,

    /// Address of the active manager.
    #[arg(short, long, env = "CMGR_ADDR")]
    mgr_addr: Option<SocketAddr>,

    /// Shared cluster secret; without it the agent authenticates as `none`.
    #[arg(long, env = "CMGR_SECRET")]
    secret: Option<String>,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    tracing_subscriber::registry()
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .with(EnvFilter::from_default_env())
        .init();
}

fn load_config(cli: &Cli) -> Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AgentConfig::default(),
    };
    if let Some(t) = cli.daemon_type {
        config.daemon_type = t;
    }
    if let Some(id) = &cli.daemon_id {
        config.daemon_id = id.clone();
    }
    if cli.mgr_addr.is_some() {
        config.mgr_addr = cli.mgr_addr;
    }
    if let Some(secret) = &cli.secret {
        config.auth = Authorizer::SharedSecret {
            secret: secret.clone(),
        };
    }
    Ok(config)
}

fn demo_counters(prefix: &str) -> PerfCounters {
    let counters = PerfCounters::new();
    counters.add_u64_counter(&format!("{prefix}.op"), "client operations");
    counters.add_u64_counter(&format!("{prefix}.op_in_bytes"), "client bytes written");
    counters.add_u64(&format!("{prefix}.numpg"), "placement groups");
    counters.add_time_avg(&format!("{prefix}.op_latency"), "client op latency");
    counters
}

async fn simulate_load(counters: Arc<PerfCounters>, prefix: String) {
    let mut tick = tokio::time::interval(Duration::from_millis(200));
    loop {
        tick.tick().await;
        let (ops, bytes, pgs, latency) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(1..50u64),
                rng.gen_range(4096..1 << 20u64),
                rng.gen_range(90..110u64),
                rng.gen_range(100_000..5_000_000u64),
            )
        };
        let results = [
            counters.inc(&format!("{prefix}.op"), ops),
            counters.inc(&format!("{prefix}.op_in_bytes"), bytes),
            counters.set(&format!("{prefix}.numpg"), pgs),
            counters.tinc(&format!("{prefix}.op_latency"), latency),
        ];
        if let Some(Err(e)) = results.into_iter().find(|r| r.is_err()) {
            tracing::error!(error = %e, "demo counter update failed");
            return;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(&cli)?;
    let key = config.daemon_key()?;
    let mgr_addr = config
        .mgr_addr
        .context("no manager address configured (--mgr-addr or mgr_addr)")?;
    tracing::info!(daemon = %key, mgr = %mgr_addr, auth = %config.auth, "cmgr-agent starting");

    let prefix = key.daemon_type.name().to_string();
    let counters = Arc::new(demo_counters(&prefix));
    let load = tokio::spawn(simulate_load(counters.clone(), prefix));

    let client = MgrClient::new(config.session_params()?, counters, config.reconnect_interval());
    let stats = client.stats();
    let (_map_tx, map_rx) = watch::channel(MgrMap {
        epoch: 1,
        active_addr: Some(mgr_addr),
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let run = tokio::spawn(client.run(map_rx, shutdown_rx));
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    run.await??;
    load.abort();
    tracing::info!(stats = ?stats.snapshot(), "cmgr-agent stopped");
    Ok(())
}
