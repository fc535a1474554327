//! Import engine: pulls records from a source, normalizes them, detects changes against the
//! store, applies them transactionally and advances a durable checkpoint.

pub mod coordinator;
pub mod detector;
pub mod executor;
pub mod memory;
pub mod models;
pub mod retry;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{SyncCoordinator, SyncJob, SyncSettings};
pub use detector::{ChangeDetector, Detection, classify, dedupe_latest};
pub use executor::{ApplyOutcome, ApplyPolicy, UpsertExecutor};
pub use memory::MemoryStore;
pub use retry::RetryPolicy;
pub use traits::{CheckpointStore, RawRecordStream, RecordSource, RecordStore, RunLease, RunLock, Transformer};
