//! Manager-side counter aggregates, one per reporting daemon.

use std::collections::BTreeMap;

use clustermgr_proto::{
    decode_report, DecodeSummary, PerfCounterCatalog, PerfCounterFlags, PerfCounterInstance,
    Report,
};
use serde_json::{json, Map, Value};

use crate::error::Result;

/// Latest counter values reported by one daemon.
///
/// Values survive reconnects; the declared-path set belongs to the current
/// session and is reset when the daemon opens a new one.
#[derive(Debug, Default, Clone)]
pub struct DaemonPerfCounters {
    declared: BTreeMap<String, PerfCounterFlags>,
    instances: BTreeMap<String, PerfCounterInstance>,
    reports: u64,
}

impl DaemonPerfCounters {
    /// An empty aggregate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets the declarations of the previous session.
    pub fn begin_session(&mut self) {
        self.declared.clear();
    }

    /// Applies one report.
    pub fn update(&mut self, report: &Report, catalog: &PerfCounterCatalog) -> Result<DecodeSummary> {
        let summary = decode_report(
            &report.declare_types,
            &report.packed,
            &mut self.declared,
            catalog,
            &mut self.instances,
        )?;
        self.reports += 1;
        Ok(summary)
    }

    /// Latest value of one counter.
    pub fn get(&self, path: &str) -> Option<PerfCounterInstance> {
        self.instances.get(path).copied()
    }

    /// Every counter value, by path.
    pub fn instances(&self) -> &BTreeMap<String, PerfCounterInstance> {
        &self.instances
    }

    /// Paths declared in the current session.
    pub fn declared_len(&self) -> usize {
        self.declared.len()
    }

    /// Number of reports applied.
    pub fn reports(&self) -> u64 {
        self.reports
    }

    /// JSON view keyed by path; averages also carry their count and mean.
    pub fn to_json(&self, catalog: &PerfCounterCatalog) -> Value {
        let mut out = Map::new();
        for (path, v) in &self.instances {
            let flags = catalog
                .flags(path)
                .or_else(|| self.declared.get(path).copied())
                .unwrap_or_default();
            let entry = if flags.is_average() {
                json!({
                    "sum": v.value,
                    "avgcount": v.avgcount,
                    "mean": v.mean(),
                })
            } else {
                json!({ "value": v.value })
            };
            out.insert(path.clone(), entry);
        }
        Value::Object(out)
    }
}
