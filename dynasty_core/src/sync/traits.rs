use crate::Result;
use crate::error::ValidationError;
use crate::sync::models::{
    CanonicalRecord, Change, DeleteWindow, JobId, PersistedRecord, RawRecord, RecordKey,
    RecordKind, SyncCheckpoint,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use std::collections::HashMap;
use std::pin::Pin;

/// Lazy, finite stream of raw records. Items are `Err` on mid-stream source failures.
pub type RawRecordStream = Pin<Box<dyn Stream<Item = Result<RawRecord>> + Send + 'static>>;

/// Pulls raw records from an upstream system.
///
/// Implementations live in `dynasty_integrations` or test code.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Stable source identifier. Recorded as the owner of every row the source writes.
    fn id(&self) -> &str;

    /// Start a stream that resumes after `checkpoint.cursor`.
    ///
    /// Delivery is at-least-once: re-emitting records around the resume point is allowed.
    /// Connectivity failures must surface as `Error::SourceUnavailable`.
    async fn fetch(&self, checkpoint: &SyncCheckpoint) -> Result<RawRecordStream>;
}

/// Pure mapping from raw upstream records to canonical records.
pub trait Transformer: Send + Sync {
    fn kind(&self) -> &RecordKind;

    fn transform(&self, raw: &RawRecord) -> std::result::Result<CanonicalRecord, ValidationError>;

    /// Field that partitions the kind into snapshots, such as a ranking date. A full sync
    /// only deletes rows in partitions it observed. `None` means the source owns one
    /// snapshot covering all of its rows.
    fn window_field(&self) -> Option<&str> {
        None
    }
}

/// Relational store of canonical records.
///
/// Only the upsert executor writes; the change detector reads via `fetch_persisted`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Batched lookup of current rows. Keys without a row are absent from the map.
    ///
    /// Read failures caused by an unreachable store surface as `ApplyError::Unavailable`.
    async fn fetch_persisted(
        &self,
        kind: &RecordKind,
        keys: &[RecordKey],
    ) -> Result<HashMap<RecordKey, PersistedRecord>>;

    /// Keys of `kind` owned by `source` inside `window` (the full-sync delete candidates).
    ///
    /// Read failures caused by an unreachable store surface as `ApplyError::Unavailable`.
    async fn list_keys(
        &self,
        kind: &RecordKind,
        source: &str,
        window: &DeleteWindow,
    ) -> Result<Vec<RecordKey>>;

    /// Apply `changes` in a single transaction: all commit or none do.
    ///
    /// Inserts and updates use the record key as the conflict key and skip rows whose
    /// fingerprint already matches, so replaying a batch writes nothing.
    /// Fails with `ApplyError::Rejected` or `ApplyError::Unavailable`.
    async fn apply_changes(
        &self,
        kind: &RecordKind,
        source: &str,
        changes: &[Change],
        synced_at: DateTime<Utc>,
    ) -> Result<()>;
}

/// Durable checkpoint storage, one row per job.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_checkpoint(&self, job_id: &JobId) -> Result<Option<SyncCheckpoint>>;

    async fn save_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()>;

    async fn list_checkpoints(&self) -> Result<Vec<SyncCheckpoint>>;
}

/// Run-level mutual exclusion keyed by job identity.
#[async_trait]
pub trait RunLock: Send + Sync {
    /// Returns `None` when another process holds the lock.
    async fn try_lock(&self, job_id: &JobId) -> Result<Option<Box<dyn RunLease>>>;
}

/// A held run lock. Must be released explicitly; dropping it releases on a best-effort basis.
#[async_trait]
pub trait RunLease: Send {
    async fn release(self: Box<Self>) -> Result<()>;
}
