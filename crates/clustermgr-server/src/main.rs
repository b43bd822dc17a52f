#![warn(missing_docs)]

//! `cmgr-server`: the cluster manager daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clustermgr_server::{ClusterDescription, EventLogModule, LocalCluster, Mgr, MgrConfig};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cmgr-server")]
#[command(about = "Aggregates daemon telemetry and metadata for the cluster", long_about = None)]
struct Cli {
    /// Config file (.toml or .json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the manager.
    Serve {
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// JSON cluster description to serve metadata and maps from.
        #[arg(long)]
        cluster_file: Option<PathBuf>,

        /// Report interval sent to daemons, in seconds.
        #[arg(long)]
        stats_period: Option<u32>,

        /// Accept daemons presenting this secret.
        #[arg(long, env = "CMGR_SECRET")]
        secret: Option<String>,

        /// Summary log interval of the event_log module, in seconds.
        #[arg(long, default_value_t = 30)]
        summary_secs: u64,
    },
    /// Print the effective configuration as TOML.
    ShowConfig,
}

fn init_tracing(json: bool) {
    tracing_subscriber::registry()
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .with(EnvFilter::from_default_env())
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<MgrConfig> {
    match path {
        Some(path) => {
            MgrConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
        }
        None => Ok(MgrConfig::default()),
    }
}

async fn serve(config: MgrConfig, summary: Duration) -> Result<()> {
    let cluster = Arc::new(match &config.cluster_file {
        Some(path) => LocalCluster::from_file(path)
            .with_context(|| format!("loading cluster description {}", path.display()))?,
        None => {
            tracing::warn!("no cluster_file configured, starting with an empty cluster");
            LocalCluster::new(ClusterDescription::default())
        }
    });
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    let poll = config.map_poll_interval();
    let mgr = Mgr::new(config, cluster.clone());
    mgr.register_module(Arc::new(EventLogModule::new(summary)));

    let (map_tx, map_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watcher = {
        let cluster = cluster.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { cluster.watch(poll, map_tx, shutdown).await })
    };
    let stop = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
        }
        let _ = shutdown_tx.send(true);
    });

    mgr.run(listener, map_rx, shutdown_rx).await?;
    stop.abort();
    watcher.await?;
    let handle = mgr.handle();
    tracing::info!(
        stats = %handle.get("server_stats").unwrap_or_default(),
        "cmgr-server stopped"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Serve {
            bind,
            cluster_file,
            stats_period,
            secret,
            summary_secs,
        } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if cluster_file.is_some() {
                config.cluster_file = cluster_file;
            }
            if let Some(period) = stats_period {
                config.stats_period_secs = period;
            }
            if secret.is_some() {
                config.auth.shared_secret = secret;
            }
            tracing::info!(
                bind = %config.bind_addr,
                stats_period = config.stats_period_secs,
                "cmgr-server starting"
            );
            serve(config, Duration::from_secs(summary_secs.max(1))).await
        }
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
