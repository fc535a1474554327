use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::ApplyError;
use crate::sync::models::{
    CanonicalRecord, Change, DeleteWindow, Fields, JobId, PersistedRecord, RecordKey,
    RecordKind, SyncCheckpoint,
};
use crate::sync::traits::{CheckpointStore, RecordStore, RunLease, RunLock};
use crate::{Error, Result};

/// A stored row with its canonical fields.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub record: PersistedRecord,
    pub fields: Fields,
}

/// Observable store operations, in commit order.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Applied { kind: RecordKind, keys: Vec<RecordKey> },
    CheckpointSaved { job_id: JobId, batches_committed: u64 },
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<RecordKind, BTreeMap<RecordKey, StoredRow>>,
    checkpoints: HashMap<JobId, SyncCheckpoint>,
    locks: HashSet<JobId>,
    poisoned: HashSet<RecordKey>,
    unavailable_applies: u32,
    unavailable_reads: u32,
    failing_checkpoint_saves: bool,
    writes: u64,
    events: Vec<StoreEvent>,
}

/// In-memory record, checkpoint and lock store for local development and unit tests.
///
/// Semantics match the Postgres store: one transaction per `apply_changes` call, no-op
/// writes when fingerprints match, and a non-reentrant lock per job id. Failures can be
/// injected per key (rejected writes), per call (store outages) and for checkpoint saves.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all rows of `kind`, ordered by key.
    pub async fn rows(&self, kind: &RecordKind) -> Vec<StoredRow> {
        self.state
            .lock()
            .await
            .tables
            .get(kind)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn row(&self, kind: &RecordKind, key: &RecordKey) -> Option<StoredRow> {
        self.state
            .lock()
            .await
            .tables
            .get(kind)
            .and_then(|t| t.get(key).cloned())
    }

    /// Write a row directly, bypassing the executor.
    pub async fn seed(&self, source: &str, record: &CanonicalRecord, synced_at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        write_row(&mut state, source, record, synced_at);
    }

    /// Number of row writes that actually changed state.
    pub async fn writes(&self) -> u64 {
        self.state.lock().await.writes
    }

    pub async fn events(&self) -> Vec<StoreEvent> {
        self.state.lock().await.events.clone()
    }

    /// Any transaction containing `key` is rejected.
    pub async fn poison(&self, key: RecordKey) {
        self.state.lock().await.poisoned.insert(key);
    }

    /// The next `n` `apply_changes` calls fail with `ApplyError::Unavailable`.
    pub async fn fail_next_applies(&self, n: u32) {
        self.state.lock().await.unavailable_applies = n;
    }

    /// The next `n` reads (`fetch_persisted`, `list_keys`) fail with `ApplyError::Unavailable`.
    pub async fn fail_next_reads(&self, n: u32) {
        self.state.lock().await.unavailable_reads = n;
    }

    pub async fn fail_checkpoint_saves(&self, failing: bool) {
        self.state.lock().await.failing_checkpoint_saves = failing;
    }

    /// Mark `job_id` as held by another process.
    pub async fn hold_lock(&self, job_id: &JobId) {
        self.state.lock().await.locks.insert(job_id.clone());
    }

    pub async fn is_locked(&self, job_id: &JobId) -> bool {
        self.state.lock().await.locks.contains(job_id)
    }
}

fn take_read_failure(state: &mut MemoryState) -> Result<()> {
    if state.unavailable_reads > 0 {
        state.unavailable_reads -= 1;
        return Err(ApplyError::Unavailable("memory store offline".to_string()).into());
    }
    Ok(())
}

fn write_row(
    state: &mut MemoryState,
    source: &str,
    record: &CanonicalRecord,
    synced_at: DateTime<Utc>,
) {
    let table = state.tables.entry(record.kind.clone()).or_default();
    if table
        .get(&record.key)
        .is_some_and(|row| row.record.fingerprint == record.fingerprint)
    {
        return;
    }
    table.insert(
        record.key.clone(),
        StoredRow {
            record: PersistedRecord {
                key: record.key.clone(),
                source: source.to_string(),
                fingerprint: record.fingerprint.clone(),
                last_synced_at: synced_at,
            },
            fields: record.fields.clone(),
        },
    );
    state.writes += 1;
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn fetch_persisted(
        &self,
        kind: &RecordKind,
        keys: &[RecordKey],
    ) -> Result<HashMap<RecordKey, PersistedRecord>> {
        let mut state = self.state.lock().await;
        take_read_failure(&mut state)?;
        let Some(table) = state.tables.get(kind) else {
            return Ok(HashMap::new());
        };
        Ok(keys
            .iter()
            .filter_map(|k| table.get(k).map(|row| (k.clone(), row.record.clone())))
            .collect())
    }

    async fn list_keys(
        &self,
        kind: &RecordKind,
        source: &str,
        window: &DeleteWindow,
    ) -> Result<Vec<RecordKey>> {
        let mut state = self.state.lock().await;
        take_read_failure(&mut state)?;
        Ok(state
            .tables
            .get(kind)
            .map(|t| {
                t.values()
                    .filter(|row| row.record.source == source && window.contains(&row.fields))
                    .map(|row| row.record.key.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn apply_changes(
        &self,
        kind: &RecordKind,
        source: &str,
        changes: &[Change],
        synced_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.unavailable_applies > 0 {
            state.unavailable_applies -= 1;
            return Err(ApplyError::Unavailable("memory store offline".to_string()).into());
        }
        // Validate the whole transaction before touching any row.
        if let Some(bad) = changes.iter().find(|c| state.poisoned.contains(c.key())) {
            return Err(
                ApplyError::Rejected(format!("constraint violation on key {}", bad.key())).into(),
            );
        }

        for change in changes {
            match change {
                Change::Insert(record) | Change::Update(record) => {
                    if record.kind != *kind {
                        return Err(Error::InvalidInput(format!(
                            "record of kind {} in change set for {kind}",
                            record.kind
                        )));
                    }
                }
                Change::Delete(_) => {}
            }
        }

        for change in changes {
            match change {
                Change::Insert(record) | Change::Update(record) => {
                    write_row(&mut state, source, record, synced_at)
                }
                Change::Delete(key) => {
                    let removed = state
                        .tables
                        .get_mut(kind)
                        .and_then(|t| t.remove(key))
                        .is_some();
                    if removed {
                        state.writes += 1;
                    }
                }
            }
        }
        state.events.push(StoreEvent::Applied {
            kind: kind.clone(),
            keys: changes.iter().map(|c| c.key().clone()).collect(),
        });
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load_checkpoint(&self, job_id: &JobId) -> Result<Option<SyncCheckpoint>> {
        Ok(self.state.lock().await.checkpoints.get(job_id).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.failing_checkpoint_saves {
            return Err(Error::BackendMessage(
                "memory checkpoint store offline".to_string(),
            ));
        }
        state
            .checkpoints
            .insert(checkpoint.job_id.clone(), checkpoint.clone());
        state.events.push(StoreEvent::CheckpointSaved {
            job_id: checkpoint.job_id.clone(),
            batches_committed: checkpoint.batches_committed,
        });
        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<SyncCheckpoint>> {
        let mut out: Vec<SyncCheckpoint> =
            self.state.lock().await.checkpoints.values().cloned().collect();
        out.sort_by(|a, b| a.job_id.as_str().cmp(b.job_id.as_str()));
        Ok(out)
    }
}

struct MemoryLease {
    state: Arc<Mutex<MemoryState>>,
    job_id: Option<JobId>,
}

#[async_trait]
impl RunLease for MemoryLease {
    async fn release(mut self: Box<Self>) -> Result<()> {
        if let Some(job_id) = self.job_id.take() {
            self.state.lock().await.locks.remove(&job_id);
        }
        Ok(())
    }
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        if let Some(job_id) = self.job_id.take() {
            if let Ok(mut state) = self.state.try_lock() {
                state.locks.remove(&job_id);
            }
        }
    }
}

#[async_trait]
impl RunLock for MemoryStore {
    async fn try_lock(&self, job_id: &JobId) -> Result<Option<Box<dyn RunLease>>> {
        let mut state = self.state.lock().await;
        if !state.locks.insert(job_id.clone()) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryLease {
            state: self.state.clone(),
            job_id: Some(job_id.clone()),
        })))
    }
}
