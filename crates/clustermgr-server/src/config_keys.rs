//! Local cache over the external config-key store.
//!
//! Keys are cached without the manager's prefix. Reads come from the cache;
//! writes go to the store first and reach the cache only once accepted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::command::{config_key_get, config_key_list, config_key_put, run_checked, CommandRunner};
use crate::error::{MgrError, Result};
use crate::state::SharedState;

/// Cached view of the keys under the manager prefix.
#[derive(Clone)]
pub struct ConfigKeyStore {
    runner: Arc<dyn CommandRunner>,
    state: SharedState,
    prefix: String,
    timeout: Duration,
}

impl ConfigKeyStore {
    /// A store with an empty cache.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        state: SharedState,
        prefix: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            state,
            prefix: prefix.into(),
            timeout,
        }
    }

    /// Prefix stripped from stored keys.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Rebuilds the cache from every stored key under the prefix.
    pub async fn load_config(&self) -> Result<usize> {
        let list_cmd = config_key_list();
        let out = run_checked(self.runner.as_ref(), &list_cmd, self.timeout).await?;
        let keys: Vec<String> =
            serde_json::from_slice(&out).map_err(|e| MgrError::malformed("config-key list", e))?;

        let mut loaded = BTreeMap::new();
        for full_key in keys.iter().filter(|k| k.starts_with(&self.prefix)) {
            let get_cmd = config_key_get(full_key);
            match run_checked(self.runner.as_ref(), &get_cmd, self.timeout).await {
                Ok(val) => {
                    let val = String::from_utf8_lossy(&val).into_owned();
                    loaded.insert(full_key[self.prefix.len()..].to_string(), val);
                }
                Err(e) => warn!(key = %full_key, error = %e, "skipping unreadable config key"),
            }
        }

        let count = loaded.len();
        self.state.lock().config_cache = loaded;
        info!(count, prefix = %self.prefix, "loaded config keys");
        Ok(count)
    }

    /// Cached value of `key`.
    pub fn get_config(&self, key: &str) -> Option<String> {
        self.state.lock().config_cache.get(key).cloned()
    }

    /// Every cached key and value.
    pub fn get_all(&self) -> BTreeMap<String, String> {
        self.state.lock().config_cache.clone()
    }

    /// Writes through to the store, then updates the cache.
    pub async fn set_config(&self, key: &str, val: &str) -> Result<()> {
        let full_key = format!("{}{}", self.prefix, key);
        let cmd = config_key_put(&full_key, val);
        run_checked(self.runner.as_ref(), &cmd, self.timeout).await?;
        self.state
            .lock()
            .config_cache
            .insert(key.to_string(), val.to_string());
        debug!(key = %full_key, "stored config key");
        Ok(())
    }
}

impl std::fmt::Debug for ConfigKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigKeyStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}
