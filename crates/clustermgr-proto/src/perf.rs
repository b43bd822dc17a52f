//! Perf-counter schema and the process-wide type catalog.
//!
//! A counter is identified by its `path` (e.g. `osd.op_r_latency`). The
//! catalog only ever grows: once a path is known, its flags are fixed for the
//! life of the process.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Type flags for a perf counter.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PerfCounterFlags(u8);

impl PerfCounterFlags {
    /// Value is a time in nanoseconds.
    pub const TIME: Self = Self(0x01);
    /// Value is a plain unsigned integer.
    pub const U64: Self = Self(0x02);
    /// Long-running average: reported as (sum, count, count2).
    pub const LONGRUNAVG: Self = Self(0x04);
    /// Monotonic counter rather than a gauge.
    pub const COUNTER: Self = Self(0x08);

    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bit representation.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Builds flags from raw bits, keeping unknown bits as-is.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Whether the counter is encoded as an average triple.
    pub const fn is_average(self) -> bool {
        self.contains(Self::LONGRUNAVG)
    }

    /// Number of u64 words this counter occupies in the packed stream.
    pub const fn encoded_words(self) -> usize {
        if self.is_average() {
            3
        } else {
            1
        }
    }
}

impl std::ops::BitOr for PerfCounterFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Schema of one named metric.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfCounterType {
    /// Unique dotted path of the counter.
    pub path: String,
    /// Type flags.
    pub flags: PerfCounterFlags,
    /// Human readable description.
    pub description: Option<String>,
    /// Short display name.
    pub nick: Option<String>,
}

impl PerfCounterType {
    /// Creates a counter type without description or nick.
    pub fn new(path: impl Into<String>, flags: PerfCounterFlags) -> Self {
        Self {
            path: path.into(),
            flags,
            description: None,
            nick: None,
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the nick.
    pub fn with_nick(mut self, nick: impl Into<String>) -> Self {
        self.nick = Some(nick.into());
        self
    }
}

/// Latest decoded value of one counter for one daemon.
///
/// Only the most recent sample is kept.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfCounterInstance {
    /// Value, or running sum for averages.
    pub value: u64,
    /// Sample count for averages, zero otherwise.
    pub avgcount: u64,
    /// Second copy of the sample count, used by readers to detect torn reads.
    pub avgcount2: u64,
}

impl PerfCounterInstance {
    /// An instantaneous value.
    pub fn plain(value: u64) -> Self {
        Self {
            value,
            avgcount: 0,
            avgcount2: 0,
        }
    }

    /// An average sample triple.
    pub fn average(sum: u64, count: u64) -> Self {
        Self {
            value: sum,
            avgcount: count,
            avgcount2: count,
        }
    }

    /// Mean of an average counter, if any samples were taken.
    pub fn mean(&self) -> Option<f64> {
        if self.avgcount == 0 {
            None
        } else {
            Some(self.value as f64 / self.avgcount as f64)
        }
    }
}

/// Result of declaring a type into the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclareOutcome {
    /// The path was new.
    Inserted,
    /// The path existed with the same flags; description and nick were refreshed.
    Refreshed,
    /// The path existed with different flags; the declaration was ignored.
    Conflict {
        /// Flags already in the catalog.
        existing: PerfCounterFlags,
    },
}

/// Append-only catalog of counter types shared by every session.
#[derive(Debug, Default)]
pub struct PerfCounterCatalog {
    types: RwLock<BTreeMap<String, PerfCounterType>>,
}

impl PerfCounterCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a counter type.
    pub fn declare(&self, t: &PerfCounterType) -> DeclareOutcome {
        let mut types = self.types.write();
        match types.get_mut(&t.path) {
            None => {
                types.insert(t.path.clone(), t.clone());
                DeclareOutcome::Inserted
            }
            Some(existing) if existing.flags == t.flags => {
                existing.description = t.description.clone();
                existing.nick = t.nick.clone();
                DeclareOutcome::Refreshed
            }
            Some(existing) => DeclareOutcome::Conflict {
                existing: existing.flags,
            },
        }
    }

    /// Looks up a type by path.
    pub fn get(&self, path: &str) -> Option<PerfCounterType> {
        self.types.read().get(path).cloned()
    }

    /// Looks up the flags of a type by path.
    pub fn flags(&self, path: &str) -> Option<PerfCounterFlags> {
        self.types.read().get(path).map(|t| t.flags)
    }

    /// Whether a path is known.
    pub fn contains(&self, path: &str) -> bool {
        self.types.read().contains_key(path)
    }

    /// Number of known types.
    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    /// Returns true if no types are known.
    pub fn is_empty(&self) -> bool {
        self.types.read().is_empty()
    }

    /// Snapshot of all known types, sorted by path.
    pub fn snapshot(&self) -> Vec<PerfCounterType> {
        self.types.read().values().cloned().collect()
    }
}
