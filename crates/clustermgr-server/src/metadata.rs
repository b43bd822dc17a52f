//! Per-daemon static metadata and its two-way index.
//!
//! Records are looked up by [`DaemonKey`] through the flat map, or grouped by
//! the host they run on. Updates always replace a whole record.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use clustermgr_proto::{DaemonKey, DaemonType};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{MgrError, Result};

/// Static description of one daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonMetadata {
    /// Identity.
    pub key: DaemonKey,
    /// Host the daemon runs on.
    pub hostname: String,
    /// Every other reported attribute.
    pub metadata: BTreeMap<String, String>,
}

/// Shared handle to a record.
pub type DaemonMetadataPtr = Arc<DaemonMetadata>;

/// Records keyed by daemon.
pub type DaemonMetadataCollection = BTreeMap<DaemonKey, DaemonMetadataPtr>;

impl DaemonMetadata {
    /// Creates a record with no attributes.
    pub fn new(key: DaemonKey, hostname: impl Into<String>) -> Self {
        Self {
            key,
            hostname: hostname.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Adds one attribute.
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }

    /// Builds a record from one element of a `<type> metadata` reply.
    ///
    /// The id comes from `id` (number or string) or `name`, and falls back to
    /// `fallback_id` when the element carries neither.
    pub fn from_json(
        daemon_type: DaemonType,
        fallback_id: Option<&str>,
        value: &Value,
    ) -> Result<Self> {
        let cmd = format!("{} metadata", daemon_type);
        let obj = value
            .as_object()
            .ok_or_else(|| MgrError::malformed(&cmd, "element is not an object"))?;

        let id = match obj.get("id").or_else(|| obj.get("name")) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => return Err(MgrError::malformed(&cmd, format!("bad id {}", other))),
            None => match fallback_id {
                Some(id) => id.to_string(),
                None => return Err(MgrError::malformed(&cmd, "element has no id")),
            },
        };
        let key = DaemonKey::validated(daemon_type, &id)?;

        let hostname = obj
            .get("hostname")
            .and_then(Value::as_str)
            .ok_or_else(|| MgrError::malformed(&cmd, format!("{} has no hostname", key)))?
            .to_string();

        let metadata = obj
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "id" | "name" | "hostname"))
            .map(|(k, v)| (k.clone(), stringify(v)))
            .collect();

        Ok(Self {
            key,
            hostname,
            metadata,
        })
    }

    /// The network address the cluster map reports for this daemon type.
    pub fn addr(&self) -> Option<&str> {
        self.metadata
            .get(self.key.daemon_type.addr_metadata_key())
            .map(String::as_str)
    }

    /// Flat JSON form: hostname plus every attribute.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("hostname".to_string(), Value::String(self.hostname.clone()));
        for (k, v) in &self.metadata {
            obj.insert(k.clone(), Value::String(v.clone()));
        }
        Value::Object(obj)
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parses a `<type> metadata` reply listing every daemon of the type.
pub fn parse_metadata_list(daemon_type: DaemonType, outbl: &[u8]) -> Result<Vec<DaemonMetadata>> {
    let cmd = format!("{} metadata", daemon_type);
    let value: Value = serde_json::from_slice(outbl).map_err(|e| MgrError::malformed(&cmd, e))?;
    let list = value
        .as_array()
        .ok_or_else(|| MgrError::malformed(&cmd, "expected a JSON array"))?;
    list.iter()
        .map(|v| DaemonMetadata::from_json(daemon_type, None, v))
        .collect()
}

/// Parses a `<type> metadata` reply for a single daemon.
pub fn parse_metadata_one(key: &DaemonKey, outbl: &[u8]) -> Result<DaemonMetadata> {
    let cmd = format!("{} metadata", key.daemon_type);
    let value: Value = serde_json::from_slice(outbl).map_err(|e| MgrError::malformed(&cmd, e))?;
    let dm = DaemonMetadata::from_json(key.daemon_type, Some(&key.id), &value)?;
    if dm.key != *key {
        return Err(MgrError::malformed(
            &cmd,
            format!("asked for {} but got {}", key, dm.key),
        ));
    }
    Ok(dm)
}

/// Metadata records indexed by key and by host, plus the set of keys with a
/// refresh in flight.
#[derive(Debug, Default)]
pub struct DaemonMetadataIndex {
    all: DaemonMetadataCollection,
    by_server: BTreeMap<String, DaemonMetadataCollection>,
    updating: BTreeSet<DaemonKey>,
}

impl DaemonMetadataIndex {
    /// An empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record, replacing any record with the same key.
    pub fn insert(&mut self, dm: DaemonMetadataPtr) {
        if self.all.contains_key(&dm.key) {
            self.erase(&dm.key);
        }
        self.by_server
            .entry(dm.hostname.clone())
            .or_default()
            .insert(dm.key.clone(), dm.clone());
        self.all.insert(dm.key.clone(), dm);
    }

    /// Removes a record from both maps, dropping its host bucket if it
    /// was the last one there.
    pub fn erase(&mut self, key: &DaemonKey) -> Option<DaemonMetadataPtr> {
        let dm = self.all.remove(key)?;
        if let Some(bucket) = self.by_server.get_mut(&dm.hostname) {
            bucket.remove(key);
            if bucket.is_empty() {
                self.by_server.remove(&dm.hostname);
            }
        }
        Some(dm)
    }

    /// Whether a record exists for `key`.
    pub fn exists(&self, key: &DaemonKey) -> bool {
        self.all.contains_key(key)
    }

    /// The record for `key`.
    pub fn get(&self, key: &DaemonKey) -> Result<DaemonMetadataPtr> {
        self.all
            .get(key)
            .cloned()
            .ok_or_else(|| MgrError::NotFound(key.to_string()))
    }

    /// Records of one daemon type.
    pub fn get_by_type(&self, daemon_type: DaemonType) -> DaemonMetadataCollection {
        self.all
            .iter()
            .filter(|(k, _)| k.daemon_type == daemon_type)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Records on one host.
    pub fn get_by_server(&self, hostname: &str) -> DaemonMetadataCollection {
        self.by_server.get(hostname).cloned().unwrap_or_default()
    }

    /// Every record, by key.
    pub fn get_all(&self) -> &DaemonMetadataCollection {
        &self.all
    }

    /// Every record, by host.
    pub fn get_all_servers(&self) -> &BTreeMap<String, DaemonMetadataCollection> {
        &self.by_server
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.all.len()
    }

    /// Whether the index holds no records.
    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Erases every record of `daemon_type` whose id is not in
    /// `names_that_exist`. Keys with a refresh in flight are kept.
    pub fn cull(
        &mut self,
        daemon_type: DaemonType,
        names_that_exist: &BTreeSet<String>,
    ) -> Vec<DaemonKey> {
        let victims: Vec<DaemonKey> = self
            .all
            .keys()
            .filter(|k| k.daemon_type == daemon_type)
            .filter(|k| !names_that_exist.contains(&k.id))
            .filter(|k| !self.updating.contains(*k))
            .cloned()
            .collect();
        for key in &victims {
            debug!(key = %key, "culling metadata");
            self.erase(key);
        }
        victims
    }

    /// Marks a refresh in flight. Returns false if one already was.
    pub fn notify_updating(&mut self, key: &DaemonKey) -> bool {
        self.updating.insert(key.clone())
    }

    /// Ends a refresh.
    pub fn clear_updating(&mut self, key: &DaemonKey) {
        self.updating.remove(key);
    }

    /// Whether a refresh is in flight for `key`.
    pub fn is_updating(&self, key: &DaemonKey) -> bool {
        self.updating.contains(key)
    }

    /// Number of refreshes in flight.
    pub fn updating_count(&self) -> usize {
        self.updating.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn osd(id: &str, host: &str) -> DaemonMetadataPtr {
        Arc::new(
            DaemonMetadata::new(DaemonKey::new(DaemonType::Osd, id), host)
                .with_attr("front_addr", format!("10.0.0.{}:6800", id)),
        )
    }

    fn names(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut idx = DaemonMetadataIndex::new();
        idx.insert(osd("1", "node-a"));
        idx.insert(osd("2", "node-a"));
        idx.insert(osd("3", "node-b"));

        assert_eq!(idx.len(), 3);
        assert!(idx.exists(&DaemonKey::new(DaemonType::Osd, "2")));
        assert_eq!(idx.get_by_server("node-a").len(), 2);
        assert_eq!(idx.get_by_server("node-b").len(), 1);
        assert!(idx.get_by_server("node-z").is_empty());
        assert_eq!(idx.get_by_type(DaemonType::Osd).len(), 3);
        assert!(idx.get_by_type(DaemonType::Mon).is_empty());
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let idx = DaemonMetadataIndex::new();
        let err = idx.get(&DaemonKey::new(DaemonType::Mds, "a")).unwrap_err();
        assert!(matches!(err, MgrError::NotFound(ref k) if k == "mds.a"));
    }

    #[test]
    fn test_insert_replaces_and_moves_host() {
        let mut idx = DaemonMetadataIndex::new();
        idx.insert(osd("1", "node-a"));
        idx.insert(osd("1", "node-b"));
        assert_eq!(idx.len(), 1);
        assert!(!idx.get_all_servers().contains_key("node-a"));
        assert_eq!(idx.get_by_server("node-b").len(), 1);
    }

    #[test]
    fn test_erase_drops_empty_bucket() {
        let mut idx = DaemonMetadataIndex::new();
        idx.insert(osd("1", "node-a"));
        idx.insert(osd("2", "node-b"));
        let key = DaemonKey::new(DaemonType::Osd, "1");
        assert!(idx.erase(&key).is_some());
        assert!(!idx.exists(&key));
        assert!(!idx.get_all_servers().contains_key("node-a"));
        assert!(idx.get_all_servers().contains_key("node-b"));
        assert!(idx.erase(&key).is_none());
    }

    #[test]
    fn test_cull_removes_only_missing() {
        let mut idx = DaemonMetadataIndex::new();
        for id in ["1", "2", "3"] {
            idx.insert(osd(id, "node-a"));
        }
        idx.insert(Arc::new(DaemonMetadata::new(
            DaemonKey::new(DaemonType::Mon, "a"),
            "node-a",
        )));

        let removed = idx.cull(DaemonType::Osd, &names(&["1", "2"]));
        assert_eq!(removed, vec![DaemonKey::new(DaemonType::Osd, "3")]);
        assert_eq!(idx.get_by_type(DaemonType::Osd).len(), 2);
        assert!(idx.exists(&DaemonKey::new(DaemonType::Mon, "a")));

        assert!(idx.cull(DaemonType::Osd, &names(&["1", "2"])).is_empty());
        assert_eq!(idx.len(), 3);
    }

    #[test]
    fn test_cull_skips_updating() {
        let mut idx = DaemonMetadataIndex::new();
        idx.insert(osd("1", "node-a"));
        let key = DaemonKey::new(DaemonType::Osd, "1");
        assert!(idx.notify_updating(&key));
        assert!(!idx.notify_updating(&key));

        assert!(idx.cull(DaemonType::Osd, &BTreeSet::new()).is_empty());
        assert!(idx.exists(&key));

        idx.clear_updating(&key);
        assert!(!idx.is_updating(&key));
        assert_eq!(idx.cull(DaemonType::Osd, &BTreeSet::new()), vec![key]);
    }

    #[test]
    fn test_from_json_stringifies_attributes() {
        let v = json!({"id": 3, "hostname": "node-a", "front_addr": "10.0.0.5:6800", "osd_objectstore": "bluestore", "weight": 1.5});
        let dm = DaemonMetadata::from_json(DaemonType::Osd, None, &v).unwrap();
        assert_eq!(dm.key, DaemonKey::new(DaemonType::Osd, "3"));
        assert_eq!(dm.hostname, "node-a");
        assert_eq!(dm.addr(), Some("10.0.0.5:6800"));
        assert_eq!(dm.metadata["weight"], "1.5");
        assert!(!dm.metadata.contains_key("id"));
        assert!(!dm.metadata.contains_key("hostname"));
    }

    #[test]
    fn test_from_json_uses_name_and_fallback() {
        let v = json!({"name": "a", "hostname": "h", "addr": "10.0.0.1:6789"});
        let dm = DaemonMetadata::from_json(DaemonType::Mon, None, &v).unwrap();
        assert_eq!(dm.key.id, "a");
        assert_eq!(dm.addr(), Some("10.0.0.1:6789"));

        let v = json!({"hostname": "h"});
        let dm = DaemonMetadata::from_json(DaemonType::Mds, Some("b"), &v).unwrap();
        assert_eq!(dm.key.id, "b");
        assert!(DaemonMetadata::from_json(DaemonType::Mds, None, &v).is_err());
    }

    #[test]
    fn test_parse_metadata_list() {
        let out = br#"[{"id": 0, "hostname": "a"}, {"id": 1, "hostname": "b"}]"#;
        let list = parse_metadata_list(DaemonType::Osd, out).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].hostname, "b");

        assert!(matches!(
            parse_metadata_list(DaemonType::Osd, b"{\"id\": 0}"),
            Err(MgrError::MalformedOutput { .. })
        ));
        assert!(parse_metadata_list(DaemonType::Osd, b"not json").is_err());
    }

    #[test]
    fn test_parse_metadata_one_checks_key() {
        let key = DaemonKey::new(DaemonType::Osd, "3");
        let dm = parse_metadata_one(&key, br#"{"id": 3, "hostname": "a"}"#).unwrap();
        assert_eq!(dm.key, key);
        assert!(parse_metadata_one(&key, br#"{"id": 4, "hostname": "a"}"#).is_err());
        assert!(parse_metadata_one(&key, br#"{"id": 3}"#).is_err());
    }

    #[test]
    fn test_to_json() {
        let dm = DaemonMetadata::new(DaemonKey::new(DaemonType::Osd, "1"), "h").with_attr("ceph_version", "v1");
        assert_eq!(dm.to_json(), json!({"hostname": "h", "ceph_version": "v1"}));
    }
}
