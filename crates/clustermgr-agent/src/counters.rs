//! Daemon-side perf counter registry.
//!
//! Updates are lock-free on the hot path: the registry lock is only taken for
//! writing when a counter is added.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clustermgr_proto::{PerfCounterFlags, PerfCounterInstance, PerfCounterType};
use parking_lot::RwLock;

use crate::error::{AgentError, Result};

struct CounterSlot {
    ty: PerfCounterType,
    value: AtomicU64,
    avgcount: AtomicU64,
    avgcount2: AtomicU64,
}

impl CounterSlot {
    fn new(ty: PerfCounterType) -> Self {
        Self {
            ty,
            value: AtomicU64::new(0),
            avgcount: AtomicU64::new(0),
            avgcount2: AtomicU64::new(0),
        }
    }

    fn read(&self) -> PerfCounterInstance {
        if !self.ty.flags.is_average() {
            return PerfCounterInstance::plain(self.value.load(Ordering::Acquire));
        }
        // writers bump avgcount, then the sum, then avgcount2; reading in the
        // reverse order and comparing means no update was in flight
        loop {
            let avgcount2 = self.avgcount2.load(Ordering::Acquire);
            let value = self.value.load(Ordering::Acquire);
            let avgcount = self.avgcount.load(Ordering::Acquire);
            if avgcount == avgcount2 {
                return PerfCounterInstance {
                    value,
                    avgcount,
                    avgcount2,
                };
            }
            std::hint::spin_loop();
        }
    }
}

/// Registry of the counters one daemon exposes.
#[derive(Default)]
pub struct PerfCounters {
    slots: RwLock<BTreeMap<String, Arc<CounterSlot>>>,
}

impl PerfCounters {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a counter type. Returns false if the path already exists.
    pub fn add(&self, ty: PerfCounterType) -> bool {
        let mut slots = self.slots.write();
        if slots.contains_key(&ty.path) {
            return false;
        }
        slots.insert(ty.path.clone(), Arc::new(CounterSlot::new(ty)));
        true
    }

    /// Registers a gauge.
    pub fn add_u64(&self, path: &str, description: &str) -> bool {
        self.add(PerfCounterType::new(path, PerfCounterFlags::U64).with_description(description))
    }

    /// Registers a monotonic counter.
    pub fn add_u64_counter(&self, path: &str, description: &str) -> bool {
        self.add(
            PerfCounterType::new(path, PerfCounterFlags::U64 | PerfCounterFlags::COUNTER)
                .with_description(description),
        )
    }

    /// Registers a long-running average of nanosecond timings.
    pub fn add_time_avg(&self, path: &str, description: &str) -> bool {
        self.add(
            PerfCounterType::new(path, PerfCounterFlags::TIME | PerfCounterFlags::LONGRUNAVG)
                .with_description(description),
        )
    }

    fn slot(&self, path: &str) -> Result<Arc<CounterSlot>> {
        self.slots
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| AgentError::UnknownCounter(path.to_string()))
    }

    /// Adds to a counter or gauge.
    pub fn inc(&self, path: &str, amount: u64) -> Result<()> {
        let slot = self.slot(path)?;
        slot.value.fetch_add(amount, Ordering::AcqRel);
        Ok(())
    }

    /// Subtracts from a gauge, saturating at zero.
    pub fn dec(&self, path: &str, amount: u64) -> Result<()> {
        let slot = self.slot(path)?;
        let _ = slot
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(amount))
            });
        Ok(())
    }

    /// Sets a gauge.
    pub fn set(&self, path: &str, value: u64) -> Result<()> {
        let slot = self.slot(path)?;
        slot.value.store(value, Ordering::Release);
        Ok(())
    }

    /// Records one sample into an average.
    pub fn tinc(&self, path: &str, amount: u64) -> Result<()> {
        let slot = self.slot(path)?;
        if !slot.ty.flags.is_average() {
            return Err(AgentError::NotAnAverage {
                path: path.to_string(),
            });
        }
        slot.avgcount.fetch_add(1, Ordering::AcqRel);
        slot.value.fetch_add(amount, Ordering::AcqRel);
        slot.avgcount2.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Current value of one counter.
    pub fn get(&self, path: &str) -> Option<PerfCounterInstance> {
        self.slots.read().get(path).map(|s| s.read())
    }

    /// All registered types keyed by path.
    pub fn schema(&self) -> BTreeMap<String, PerfCounterType> {
        self.slots
            .read()
            .iter()
            .map(|(path, slot)| (path.clone(), slot.ty.clone()))
            .collect()
    }

    /// Consistent-per-counter snapshot of every value.
    pub fn snapshot(&self) -> BTreeMap<String, PerfCounterInstance> {
        self.slots
            .read()
            .iter()
            .map(|(path, slot)| (path.clone(), slot.read()))
            .collect()
    }

    /// Number of registered counters.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

impl std::fmt::Debug for PerfCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerfCounters")
            .field("counters", &self.len())
            .finish()
    }
}
