//! Change detection: compares incoming canonical records against persisted state.
//!
//! Everything here is pure. Store lookups happen in the coordinator, once per batch.

use crate::sync::models::{
    CanonicalRecord, Change, ChangeSet, Classification, PersistedRecord, RecordKey, RecordKind,
    SyncMode,
};
use std::collections::{HashMap, HashSet};

/// Classified batch plus the counts the run report needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub changes: ChangeSet,
    pub unchanged: u64,
}

/// Drop earlier duplicates of the same key, keeping the last delivered record.
///
/// Survivors keep the relative order of their last occurrence. Returns the number dropped.
pub fn dedupe_latest(records: Vec<CanonicalRecord>) -> (Vec<CanonicalRecord>, u64) {
    let mut last_index: HashMap<RecordKey, usize> = HashMap::with_capacity(records.len());
    for (idx, rec) in records.iter().enumerate() {
        last_index.insert(rec.key.clone(), idx);
    }
    let total = records.len();
    let kept: Vec<CanonicalRecord> = records
        .into_iter()
        .enumerate()
        .filter(|(idx, rec)| last_index.get(&rec.key) == Some(idx))
        .map(|(_, rec)| rec)
        .collect();
    let dropped = (total - kept.len()) as u64;
    (kept, dropped)
}

/// Fingerprint comparison is the only authority for "changed"; revision markers are ignored.
pub fn classify(incoming: CanonicalRecord, existing: Option<&PersistedRecord>) -> Classification {
    match existing {
        None => Classification::Insert(incoming),
        Some(row) if row.fingerprint != incoming.fingerprint => Classification::Update(incoming),
        Some(_) => Classification::NoOp(incoming.key),
    }
}

#[derive(Debug, Copy, Clone)]
pub struct ChangeDetector {
    mode: SyncMode,
}

impl ChangeDetector {
    pub fn new(mode: SyncMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Classify a deduplicated batch. `existing` holds the batched lookup result.
    #[tracing::instrument(level = "debug", skip_all, fields(kind = %kind, incoming = incoming.len()))]
    pub fn detect(
        &self,
        kind: &RecordKind,
        source: &str,
        incoming: Vec<CanonicalRecord>,
        existing: &HashMap<RecordKey, PersistedRecord>,
    ) -> Detection {
        let mut changes = ChangeSet::new(kind.clone(), source);
        let mut unchanged = 0u64;
        for rec in incoming {
            let row = existing.get(&rec.key);
            match classify(rec, row) {
                Classification::Insert(r) => changes.changes.push(Change::Insert(r)),
                Classification::Update(r) => changes.changes.push(Change::Update(r)),
                Classification::Delete(k) => changes.changes.push(Change::Delete(k)),
                Classification::NoOp(_) => unchanged += 1,
            }
        }
        Detection { changes, unchanged }
    }

    /// Rows in the full-sync window that the run never saw. Always empty for incremental runs.
    pub fn detect_deletes(
        &self,
        seen: &HashSet<RecordKey>,
        window: Vec<RecordKey>,
    ) -> Vec<Classification> {
        if self.mode != SyncMode::Full {
            return Vec::new();
        }
        window
            .into_iter()
            .filter(|key| !seen.contains(key))
            .map(Classification::Delete)
            .collect()
    }
}
