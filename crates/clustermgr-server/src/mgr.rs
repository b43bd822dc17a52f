//! Top-level manager: wires the server, synchronizer, dispatcher and modules
//! around one shared core state.

use std::sync::Arc;

use clustermgr_proto::PerfCounterCatalog;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::auth::AuthRegistry;
use crate::cluster_state::{ClusterMapSnapshot, ClusterStateSync};
use crate::command::CommandRunner;
use crate::config::MgrConfig;
use crate::config_keys::ConfigKeyStore;
use crate::error::Result;
use crate::handle::{MgrContext, MgrHandle};
use crate::module::MgrModule;
use crate::notify::NotifyDispatcher;
use crate::server::DaemonServer;
use crate::state::{new_shared_state, SharedState};

/// The manager process: report server, map synchronizer, dispatcher and modules.
pub struct Mgr {
    config: MgrConfig,
    state: SharedState,
    server: Arc<DaemonServer>,
    dispatcher: Arc<NotifyDispatcher>,
    sync: Arc<ClusterStateSync>,
    config_keys: ConfigKeyStore,
    handle: MgrHandle,
}

impl Mgr {
    /// Builds every component. Must be called inside a Tokio runtime.
    pub fn new(config: MgrConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let state = new_shared_state();
        let catalog = Arc::new(PerfCounterCatalog::new());
        let server = Arc::new(DaemonServer::new(
            state.clone(),
            catalog.clone(),
            AuthRegistry::from_config(&config.auth),
            config.stats_period_secs,
            config.handshake_timeout(),
        ));
        let dispatcher = NotifyDispatcher::start(config.notify_workers);
        let sync = Arc::new(ClusterStateSync::new(
            state.clone(),
            runner.clone(),
            dispatcher.clone(),
            config.command_timeout(),
        ));
        let config_keys = ConfigKeyStore::new(
            runner.clone(),
            state.clone(),
            config.config_key_prefix.clone(),
            config.command_timeout(),
        );
        let handle = MgrHandle::new(MgrContext {
            state: state.clone(),
            catalog,
            metrics: server.metrics(),
            dispatcher: dispatcher.clone(),
            runner,
            config_keys: config_keys.clone(),
            command_timeout: config.command_timeout(),
        });

        Self {
            config,
            state,
            server,
            dispatcher,
            sync,
            config_keys,
            handle,
        }
    }

    /// Adds a module to the dispatcher.
    pub fn register_module(&self, module: Arc<dyn MgrModule>) {
        info!(module = module.name(), "loading module");
        self.dispatcher.register(module);
    }

    /// Active configuration.
    pub fn config(&self) -> &MgrConfig {
        &self.config
    }

    /// Shared core state.
    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    /// Handle given to modules.
    pub fn handle(&self) -> MgrHandle {
        self.handle.clone()
    }

    /// Report server.
    pub fn server(&self) -> Arc<DaemonServer> {
        self.server.clone()
    }

    /// Cluster map synchronizer.
    pub fn sync(&self) -> Arc<ClusterStateSync> {
        self.sync.clone()
    }

    /// Notification dispatcher.
    pub fn dispatcher(&self) -> Arc<NotifyDispatcher> {
        self.dispatcher.clone()
    }

    /// Loads daemon metadata and the config-key cache. Failures are logged;
    /// the manager starts with whatever loaded.
    pub async fn init(&self) {
        let loaded = self.sync.load_all_metadata().await;
        info!(daemons = loaded, "initial metadata loaded");
        if let Err(e) = self.config_keys.load_config().await {
            warn!(error = %e, "config-key cache not loaded");
        }
    }

    /// Runs until `shutdown` flips to true.
    ///
    /// Waits up to `map_wait_timeout_secs` for the first snapshot before
    /// accepting daemons, so reports land on an index that reflects the
    /// current membership.
    pub async fn run(
        &self,
        listener: TcpListener,
        mut maps: mpsc::Receiver<ClusterMapSnapshot>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.init().await;

        let mut maps_open = true;
        match tokio::time::timeout(self.config.map_wait_timeout(), maps.recv()).await {
            Ok(Some(snapshot)) => {
                self.sync.handle_snapshot(&snapshot);
            }
            Ok(None) => {
                warn!("map source closed before the first snapshot");
                maps_open = false;
            }
            Err(_) => warn!(
                timeout_secs = self.config.map_wait_timeout_secs,
                "no cluster map yet, starting anyway"
            ),
        }

        let server = tokio::spawn(self.server.clone().serve(listener, shutdown.clone()));
        let modules = self.spawn_modules();

        loop {
            tokio::select! {
                snapshot = maps.recv(), if maps_open => match snapshot {
                    Some(snapshot) => {
                        self.sync.handle_snapshot(&snapshot);
                    }
                    None => {
                        warn!("map source closed");
                        maps_open = false;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("manager shutting down");
        for module in &modules {
            module.abort();
        }
        let served = match server.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "daemon server task failed");
                Ok(())
            }
        };
        self.sync.wait_for_fetches().await;
        self.dispatcher.shutdown().await;
        served
    }

    fn spawn_modules(&self) -> Vec<JoinHandle<()>> {
        self.dispatcher
            .listeners()
            .into_iter()
            .map(|module| {
                let handle = self.handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = module.serve(handle).await {
                        warn!(module = module.name(), error = %e, "module exited with error");
                    }
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for Mgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mgr")
            .field("bind_addr", &self.config.bind_addr)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{ClusterDescription, LocalCluster, LocalDaemon};
    use crate::module::RecordingModule;
    use clustermgr_proto::{DaemonKey, DaemonType};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn osd(id: &str, addr: &str) -> LocalDaemon {
        LocalDaemon {
            daemon_type: DaemonType::Osd,
            id: id.to_string(),
            addr: addr.to_string(),
            hostname: "node-a".to_string(),
            metadata: BTreeMap::new(),
        }
    }

    fn test_config() -> MgrConfig {
        MgrConfig {
            map_wait_timeout_secs: 1,
            ..MgrConfig::default()
        }
    }

    #[tokio::test]
    async fn test_init_loads_metadata_and_config() {
        let mut desc = ClusterDescription::default();
        desc.daemons.push(osd("0", "10.0.0.1:6800"));
        desc.config.insert("mgr/k".to_string(), "v".to_string());
        let mgr = Mgr::new(test_config(), Arc::new(LocalCluster::new(desc)));
        mgr.init().await;

        let key = DaemonKey::new(DaemonType::Osd, "0");
        assert!(mgr.state().lock().index.exists(&key));
        assert_eq!(mgr.handle().get_config("k").as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_run_applies_snapshots_until_shutdown() {
        let cluster = Arc::new(LocalCluster::new(ClusterDescription {
            epoch: 1,
            daemons: vec![osd("0", "10.0.0.1:6800"), osd("1", "10.0.0.2:6800")],
            config: BTreeMap::new(),
        }));
        let mgr = Arc::new(Mgr::new(test_config(), cluster.clone()));
        let module = Arc::new(RecordingModule::new("rec"));
        mgr.register_module(module.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (map_tx, map_rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let running = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.run(listener, map_rx, stop_rx).await })
        };

        for snap in cluster.snapshots() {
            map_tx.send(snap).await.unwrap();
        }
        cluster.set_daemons(vec![osd("0", "10.0.0.1:6800")]);
        for snap in cluster.snapshots() {
            map_tx.send(snap).await.unwrap();
        }

        let gone = DaemonKey::new(DaemonType::Osd, "1");
        tokio::time::timeout(Duration::from_secs(5), async {
            while mgr.state().lock().index.exists(&gone)
                || !module.events().contains(&("osd_map".to_string(), "2".to_string()))
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(mgr
            .state()
            .lock()
            .index
            .exists(&DaemonKey::new(DaemonType::Osd, "0")));

        stop_tx.send(true).unwrap();
        running.await.unwrap().unwrap();
    }
}
