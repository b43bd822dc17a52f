//! Daemon identity types shared by both ends.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProtoError;

/// Kind of cluster daemon, encoded with the cluster's entity type bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonType {
    /// Monitor process.
    Mon,
    /// Metadata server.
    Mds,
    /// Storage node.
    Osd,
    /// Client library instance.
    Client,
    /// Manager process.
    Mgr,
}

impl DaemonType {
    /// Daemon types whose membership is tracked from cluster maps.
    pub const TRACKED: [DaemonType; 3] = [DaemonType::Mon, DaemonType::Osd, DaemonType::Mds];

    /// Returns the entity type bit for this daemon type.
    pub fn as_u8(self) -> u8 {
        match self {
            DaemonType::Mon => 0x01,
            DaemonType::Mds => 0x02,
            DaemonType::Osd => 0x04,
            DaemonType::Client => 0x08,
            DaemonType::Mgr => 0x10,
        }
    }

    /// Parses an entity type bit.
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(DaemonType::Mon),
            0x02 => Some(DaemonType::Mds),
            0x04 => Some(DaemonType::Osd),
            0x08 => Some(DaemonType::Client),
            0x10 => Some(DaemonType::Mgr),
            _ => None,
        }
    }

    /// Short lowercase name, as used in command prefixes and log output.
    pub fn name(self) -> &'static str {
        match self {
            DaemonType::Mon => "mon",
            DaemonType::Mds => "mds",
            DaemonType::Osd => "osd",
            DaemonType::Client => "client",
            DaemonType::Mgr => "mgr",
        }
    }

    /// Metadata attribute holding the daemon's advertised network address.
    pub fn addr_metadata_key(self) -> &'static str {
        match self {
            DaemonType::Osd => "front_addr",
            _ => "addr",
        }
    }
}

impl fmt::Display for DaemonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DaemonType {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mon" => Ok(DaemonType::Mon),
            "mds" => Ok(DaemonType::Mds),
            "osd" => Ok(DaemonType::Osd),
            "client" => Ok(DaemonType::Client),
            "mgr" => Ok(DaemonType::Mgr),
            _ => Err(ProtoError::UnknownDaemonType(s.to_string())),
        }
    }
}

/// Identity of one daemon instance: its type plus the name it reports.
///
/// Ordering is by type first, then by id as a string, so `osd.10` sorts
/// before `osd.2`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DaemonKey {
    /// Daemon type component.
    pub daemon_type: DaemonType,
    /// Daemon id component.
    pub id: String,
}

impl DaemonKey {
    /// Creates a key from a type and id.
    pub fn new(daemon_type: DaemonType, id: impl Into<String>) -> Self {
        Self {
            daemon_type,
            id: id.into(),
        }
    }

    /// Creates a key, rejecting ids that cannot name a daemon.
    pub fn validated(daemon_type: DaemonType, id: &str) -> Result<Self, ProtoError> {
        if id.is_empty() || id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ProtoError::InvalidDaemonName {
                daemon_type,
                name: id.to_string(),
            });
        }
        Ok(Self::new(daemon_type, id))
    }
}

impl fmt::Display for DaemonKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.daemon_type, self.id)
    }
}

impl FromStr for DaemonKey {
    type Err = ProtoError;

    /// Parses the `type.id` form, e.g. `osd.3` or `mds.a`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ty, id) = s
            .split_once('.')
            .ok_or_else(|| ProtoError::UnknownDaemonType(s.to_string()))?;
        let daemon_type: DaemonType = ty.parse()?;
        DaemonKey::validated(daemon_type, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_bits_roundtrip() {
        for ty in [
            DaemonType::Mon,
            DaemonType::Mds,
            DaemonType::Osd,
            DaemonType::Client,
            DaemonType::Mgr,
        ] {
            assert_eq!(DaemonType::from_u8(ty.as_u8()), Some(ty));
        }
        assert_eq!(DaemonType::from_u8(0x03), None);
    }

    #[test]
    fn test_key_display_and_parse() {
        let key = DaemonKey::new(DaemonType::Osd, "3");
        assert_eq!(key.to_string(), "osd.3");
        let parsed: DaemonKey = "osd.3".parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_key_parse_keeps_dots_in_id() {
        let parsed: DaemonKey = "mds.host.a".parse().unwrap();
        assert_eq!(parsed.daemon_type, DaemonType::Mds);
        assert_eq!(parsed.id, "host.a");
    }

    #[test]
    fn test_key_parse_rejects_garbage() {
        assert!("osd".parse::<DaemonKey>().is_err());
        assert!("disk.1".parse::<DaemonKey>().is_err());
        assert!("osd.".parse::<DaemonKey>().is_err());
    }

    #[test]
    fn test_validated_rejects_whitespace() {
        assert!(DaemonKey::validated(DaemonType::Osd, "a b").is_err());
        assert!(DaemonKey::validated(DaemonType::Osd, "").is_err());
        assert!(DaemonKey::validated(DaemonType::Osd, "12").is_ok());
    }

    #[test]
    fn test_key_ordering_groups_by_type() {
        let mut keys = vec![
            DaemonKey::new(DaemonType::Osd, "2"),
            DaemonKey::new(DaemonType::Mon, "b"),
            DaemonKey::new(DaemonType::Osd, "10"),
        ];
        keys.sort();
        assert_eq!(keys[0].daemon_type, DaemonType::Mon);
        assert_eq!(keys[1].id, "10");
        assert_eq!(keys[2].id, "2");
    }

    #[test]
    fn test_daemon_type_serde_name() {
        assert_eq!(serde_json::to_string(&DaemonType::Osd).unwrap(), "\"osd\"");
        let t: DaemonType = serde_json::from_str("\"mds\"").unwrap();
        assert_eq!(t, DaemonType::Mds);
    }
}
