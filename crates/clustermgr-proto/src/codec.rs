//! Incremental perf-counter wire codec.
//!
//! Values travel as a positional stream of little-endian u64 words with no
//! per-field markers. Both ends walk the session's declared paths in sorted
//! order; a plain counter takes one word, an average takes three
//! (sum, count, count2). Types the manager has not seen yet are sent in full
//! in `declare_types` ahead of the stream, and are part of the walk for the
//! same report.

use bytes::{Buf, BufMut};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::error::{ProtoError, Result};
use crate::perf::{
    DeclareOutcome, PerfCounterCatalog, PerfCounterFlags, PerfCounterInstance, PerfCounterType,
};

const WORD: usize = std::mem::size_of::<u64>();

/// Encoded body of one report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportPayload {
    /// Types declared for the first time in this session.
    pub declare_types: Vec<PerfCounterType>,
    /// Positional value stream.
    pub packed: Vec<u8>,
}

/// What a decode applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeSummary {
    /// Number of types newly declared by this report.
    pub declared: usize,
    /// Declarations that disagreed with the shared catalog.
    pub conflicts: usize,
    /// Number of counter values updated.
    pub values: usize,
    /// Bytes left over after the last declared path.
    pub trailing_bytes: usize,
}

/// Encodes the live values of a daemon against the session's declared set.
///
/// Every path of `schema` that is not yet in `declared` is emitted in
/// `declare_types` and added to `declared` before values are written. Paths
/// without a live value are sent as zero.
pub fn encode_report(
    schema: &BTreeMap<String, PerfCounterType>,
    declared: &mut BTreeSet<String>,
    values: &BTreeMap<String, PerfCounterInstance>,
) -> Result<ReportPayload> {
    if let Some(missing) = declared.iter().find(|p| !schema.contains_key(*p)) {
        return Err(ProtoError::UnknownCounter(missing.clone()));
    }

    let declare_types: Vec<PerfCounterType> = schema
        .values()
        .filter(|t| !declared.contains(&t.path))
        .cloned()
        .collect();
    for t in &declare_types {
        declared.insert(t.path.clone());
    }

    let words: usize = declared
        .iter()
        .filter_map(|p| schema.get(p))
        .map(|t| t.flags.encoded_words())
        .sum();
    let mut packed = Vec::with_capacity(words * WORD);
    for path in declared.iter() {
        let flags = match schema.get(path) {
            Some(t) => t.flags,
            None => return Err(ProtoError::UnknownCounter(path.clone())),
        };
        let v = values.get(path).copied().unwrap_or_default();
        packed.put_u64_le(v.value);
        if flags.is_average() {
            packed.put_u64_le(v.avgcount);
            packed.put_u64_le(v.avgcount2);
        }
    }

    Ok(ReportPayload {
        declare_types,
        packed,
    })
}

/// Decodes one report into a daemon's counter instances.
///
/// `declared` maps each path this session has declared to the flags it was
/// declared with; the positional walk uses those flags so that a conflicting
/// catalog entry cannot misalign the stream. Declarations are applied even
/// when the value stream is short; values are only committed if the whole
/// stream decodes.
pub fn decode_report(
    declare_types: &[PerfCounterType],
    packed: &[u8],
    declared: &mut BTreeMap<String, PerfCounterFlags>,
    catalog: &PerfCounterCatalog,
    instances: &mut BTreeMap<String, PerfCounterInstance>,
) -> Result<DecodeSummary> {
    let mut summary = DecodeSummary::default();

    for t in declare_types {
        match catalog.declare(t) {
            DeclareOutcome::Inserted | DeclareOutcome::Refreshed => {}
            DeclareOutcome::Conflict { existing } => {
                warn!(
                    path = %t.path,
                    declared = t.flags.bits(),
                    existing = existing.bits(),
                    "counter redeclared with different flags, keeping catalog entry"
                );
                summary.conflicts += 1;
            }
        }
        if declared.insert(t.path.clone(), t.flags).is_none() {
            summary.declared += 1;
        }
    }

    let mut buf = packed;
    let mut staged = Vec::with_capacity(declared.len());
    for (path, flags) in declared.iter() {
        let needed = flags.encoded_words() * WORD;
        if buf.remaining() < needed {
            return Err(ProtoError::Truncated {
                path: path.clone(),
                needed,
                remaining: buf.remaining(),
            });
        }
        let value = buf.get_u64_le();
        let instance = if flags.is_average() {
            let avgcount = buf.get_u64_le();
            let avgcount2 = buf.get_u64_le();
            PerfCounterInstance {
                value,
                avgcount,
                avgcount2,
            }
        } else {
            PerfCounterInstance::plain(value)
        };
        staged.push((path, instance));
    }

    summary.values = staged.len();
    summary.trailing_bytes = buf.remaining();
    if summary.trailing_bytes > 0 {
        debug!(bytes = summary.trailing_bytes, "ignoring trailing packed bytes");
    }
    for (path, instance) in staged {
        instances.insert(path.clone(), instance);
    }
    Ok(summary)
}
