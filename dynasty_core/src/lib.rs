//! Dynasty core library: the record import engine, its Postgres store and shared domain types.

pub mod error;
pub mod models;
pub mod o11y;
pub mod store;
pub mod sync;
pub mod util;

pub use error::{ApplyError, Error, Result, ValidationError};
pub use models::{LeagueType, PLAYERS_KIND, PlayerPosition, RANKINGS_KIND, RankingSet, Team};
pub use store::{PgStore, PostgresConfig};
pub use sync::models::{
    CanonicalRecord, Change, ChangeOp, ChangeSet, Classification, DeleteWindow, FieldValue, Fields, Fingerprint,
    JobId, PersistedRecord, RawRecord, RecordKey, RecordKind, RejectedChange, RunReport,
    RunStatus, SyncCheckpoint, SyncCursor, SyncMode, SyncPhase,
};
pub use sync::{
    CheckpointStore, RawRecordStream, RecordSource, RecordStore, RunLease, RunLock,
    SyncCoordinator, SyncJob, SyncSettings, Transformer,
};
