//! The context object handed to modules.

use std::sync::Arc;
use std::time::Duration;

use clustermgr_proto::{DaemonKey, DaemonType, PerfCounterCatalog};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::command::{run_with_timeout, CommandResult, CommandRunner};
use crate::config_keys::ConfigKeyStore;
use crate::error::Result;
use crate::metadata::DaemonMetadataCollection;
use crate::metrics::ServerMetrics;
use crate::notify::NotifyDispatcher;
use crate::state::SharedState;

pub(crate) struct MgrContext {
    pub(crate) state: SharedState,
    pub(crate) catalog: Arc<PerfCounterCatalog>,
    pub(crate) metrics: Arc<ServerMetrics>,
    pub(crate) dispatcher: Arc<NotifyDispatcher>,
    pub(crate) runner: Arc<dyn CommandRunner>,
    pub(crate) config_keys: ConfigKeyStore,
    pub(crate) command_timeout: Duration,
}

/// Cheap, cloneable access to manager state for modules.
#[derive(Clone)]
pub struct MgrHandle {
    ctx: Arc<MgrContext>,
}

impl MgrHandle {
    pub(crate) fn new(ctx: MgrContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    /// Named views of manager state as JSON; `None` for unknown names.
    pub fn get(&self, what: &str) -> Option<Value> {
        match what {
            "osd_metadata" => Some(self.metadata_json(DaemonType::Osd)),
            "mds_metadata" => Some(self.metadata_json(DaemonType::Mds)),
            "mon_metadata" => Some(self.metadata_json(DaemonType::Mon)),
            "config" => serde_json::to_value(self.ctx.config_keys.get_all()).ok(),
            "server_stats" => serde_json::to_value(self.ctx.metrics.snapshot()).ok(),
            "dispatcher_stats" => serde_json::to_value(self.ctx.dispatcher.stats()).ok(),
            "perf_counters" => Some(self.perf_counters_json()),
            "perf_schema" => serde_json::to_value(self.ctx.catalog.snapshot()).ok(),
            _ => {
                warn!(what, "module requested unknown data");
                None
            }
        }
    }

    fn metadata_json(&self, daemon_type: DaemonType) -> Value {
        let dmc = self.ctx.state.lock().index.get_by_type(daemon_type);
        let mut out = Map::new();
        for (key, dm) in dmc {
            out.insert(key.id, dm.to_json());
        }
        Value::Object(out)
    }

    fn perf_counters_json(&self) -> Value {
        let state = self.ctx.state.lock();
        let mut out = Map::new();
        for (key, counters) in &state.perf {
            out.insert(key.to_string(), counters.to_json(&self.ctx.catalog));
        }
        Value::Object(out)
    }

    /// Latest decoded counters of one daemon.
    pub fn get_perf_counters(&self, key: &DaemonKey) -> Option<Value> {
        let state = self.ctx.state.lock();
        state.perf.get(key).map(|c| c.to_json(&self.ctx.catalog))
    }

    /// Services running on one host.
    pub fn get_server(&self, hostname: &str) -> Value {
        let dmc = self.ctx.state.lock().index.get_by_server(hostname);
        dump_server(hostname, &dmc)
    }

    /// Every host with at least one known daemon.
    pub fn list_servers(&self) -> Value {
        let servers = self.ctx.state.lock().index.get_all_servers().clone();
        Value::Array(
            servers
                .iter()
                .map(|(hostname, dmc)| dump_server(hostname, dmc))
                .collect(),
        )
    }

    /// Cached config value under the manager prefix.
    pub fn get_config(&self, key: &str) -> Option<String> {
        self.ctx.config_keys.get_config(key)
    }

    /// Stores a config value and updates the cache.
    pub async fn set_config(&self, key: &str, val: &str) -> Result<()> {
        self.ctx.config_keys.set_config(key, val).await
    }

    /// Runs a command in the background.
    ///
    /// `completion` receives the reply on a dispatcher worker; afterwards
    /// every module is notified with `("command", tag)`.
    pub fn send_command<F>(&self, cmd: Value, tag: impl Into<String>, completion: F)
    where
        F: FnOnce(CommandResult) + Send + 'static,
    {
        let tag = tag.into();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let result = run_with_timeout(ctx.runner.as_ref(), &cmd, ctx.command_timeout).await;
            debug!(tag = %tag, code = result.code, "command completed");
            let dispatcher = ctx.dispatcher.clone();
            let queued = ctx.dispatcher.queue(move || {
                completion(result);
                dispatcher.notify_all("command", &tag);
            });
            if let Err(e) = queued {
                warn!(error = %e, "command completion dropped");
            }
        });
    }

    /// Routes a command to the named module.
    pub fn handle_module_command(&self, module: &str, cmd: &Value) -> CommandResult {
        match self
            .ctx
            .dispatcher
            .listeners()
            .into_iter()
            .find(|m| m.name() == module)
        {
            Some(m) => m.handle_command(cmd),
            None => CommandResult::error(crate::command::ENOENT, format!("no module {}", module)),
        }
    }
}

impl std::fmt::Debug for MgrHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MgrHandle")
            .field("config_keys", &self.ctx.config_keys)
            .finish()
    }
}

/// `{hostname, services: [{type, id}], version}` for one host. The version is
/// the highest `version` attribute among its daemons.
pub fn dump_server(hostname: &str, dmc: &DaemonMetadataCollection) -> Value {
    let services: Vec<Value> = dmc
        .keys()
        .map(|key| json!({ "type": key.daemon_type.name(), "id": key.id }))
        .collect();
    let version = dmc
        .values()
        .filter_map(|dm| dm.metadata.get("version"))
        .max()
        .cloned()
        .unwrap_or_default();
    json!({
        "hostname": hostname,
        "services": services,
        "version": version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ENOENT;
    use crate::local::{ClusterDescription, LocalCluster};
    use crate::metadata::DaemonMetadata;
    use crate::module::RecordingModule;
    use crate::state::new_shared_state;

    fn handle() -> (MgrHandle, Arc<NotifyDispatcher>, SharedState) {
        let state = new_shared_state();
        let dispatcher = NotifyDispatcher::start(1);
        let mut desc = ClusterDescription::default();
        desc.config.insert("mgr/a".to_string(), "1".to_string());
        let runner: Arc<dyn CommandRunner> = Arc::new(LocalCluster::new(desc));
        let ctx = MgrContext {
            state: state.clone(),
            catalog: Arc::new(PerfCounterCatalog::new()),
            metrics: Arc::new(ServerMetrics::new()),
            dispatcher: dispatcher.clone(),
            runner: runner.clone(),
            config_keys: ConfigKeyStore::new(runner, state.clone(), "mgr/", Duration::from_secs(5)),
            command_timeout: Duration::from_secs(5),
        };
        (MgrHandle::new(ctx), dispatcher, state)
    }

    fn insert(state: &SharedState, t: DaemonType, id: &str, host: &str, version: &str) {
        let dm = DaemonMetadata::new(DaemonKey::new(t, id), host).with_attr("version", version);
        state.lock().index.insert(Arc::new(dm));
    }

    #[tokio::test]
    async fn test_get_metadata_views() {
        let (handle, _, state) = handle();
        insert(&state, DaemonType::Osd, "0", "node-a", "1.0");
        insert(&state, DaemonType::Mon, "a", "node-a", "1.0");

        let osds = handle.get("osd_metadata").unwrap();
        assert_eq!(osds["0"]["hostname"], "node-a");
        assert!(handle.get("mon_metadata").unwrap().get("a").is_some());
        assert_eq!(handle.get("mds_metadata").unwrap(), json!({}));
        assert!(handle.get("no_such_thing").is_none());
        assert_eq!(handle.get("server_stats").unwrap()["opens"], 0);
    }

    #[tokio::test]
    async fn test_servers() {
        let (handle, _, state) = handle();
        insert(&state, DaemonType::Osd, "0", "node-a", "1.2");
        insert(&state, DaemonType::Osd, "1", "node-a", "1.10");
        insert(&state, DaemonType::Mds, "x", "node-b", "1.2");

        let a = handle.get_server("node-a");
        assert_eq!(a["services"].as_array().unwrap().len(), 2);
        assert_eq!(a["services"][0], json!({"type": "osd", "id": "0"}));
        // plain string ordering
        assert_eq!(a["version"], "1.2");

        let all = handle.list_servers();
        assert_eq!(all.as_array().unwrap().len(), 2);
        assert_eq!(all[1]["hostname"], "node-b");

        assert_eq!(handle.get_server("nowhere")["services"], json!([]));
    }

    #[tokio::test]
    async fn test_config_through_handle() {
        let (handle, _, _) = handle();
        assert!(handle.get_config("a").is_none());
        handle.ctx.config_keys.load_config().await.unwrap();
        assert_eq!(handle.get_config("a").as_deref(), Some("1"));
        handle.set_config("b", "2").await.unwrap();
        assert_eq!(handle.get("config").unwrap(), json!({"a": "1", "b": "2"}));
    }

    #[tokio::test]
    async fn test_send_command_completes_then_notifies() {
        let (handle, dispatcher, _) = handle();
        let module = Arc::new(RecordingModule::new("rec"));
        dispatcher.register(module.clone());

        let (tx, rx) = tokio::sync::oneshot::channel();
        handle.send_command(
            crate::command::config_key_get("missing"),
            "tag-7",
            move |r| {
                let _ = tx.send(r);
            },
        );
        let result = rx.await.unwrap();
        assert_eq!(result.code, ENOENT);

        // completion and notification are queued in order on the pool
        tokio::time::timeout(Duration::from_secs(5), async {
            while module.events().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(module.events(), vec![("command".to_string(), "tag-7".to_string())]);
    }

    #[tokio::test]
    async fn test_module_command_routing() {
        let (handle, dispatcher, _) = handle();
        dispatcher.register(Arc::new(RecordingModule::new("rec")));
        let r = handle.handle_module_command("rec", &json!({"prefix": "x"}));
        assert_eq!(r.code, crate::command::EINVAL);
        let r = handle.handle_module_command("nope", &json!({"prefix": "x"}));
        assert_eq!(r.code, ENOENT);
    }
}
