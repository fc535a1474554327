use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};

use crate::error::ApplyError;
use crate::models::{LeagueType, RANKINGS_KIND, RankingSet};
use crate::store::config::PostgresConfig;
use crate::sync::models::{
    Change, DeleteWindow, Fingerprint, JobId, PersistedRecord, RecordKey, RecordKind,
    SyncCheckpoint, SyncCursor,
};
use crate::sync::traits::{CheckpointStore, RecordStore, RunLease, RunLock};
use crate::{Error, Result};

const MIGRATION_0001: &str = include_str!("../../migrations/0001_init.sql");

/// First key of the two-key advisory lock, so job locks never collide with other users.
const LOCK_NAMESPACE: i32 = 0x4459_4e41;

/// One point of a ranking time series, as exported to CSV.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RankingPoint {
    pub player_id: String,
    pub date: NaiveDate,
    pub value: i64,
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[tracing::instrument(level = "debug", skip(cfg))]
    pub async fn connect(cfg: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(cfg.acquire_timeout)
            .connect(&cfg.url)
            .await
            .map_err(|e| Error::backend("connect postgres", e))?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the checkpoint table and one table per record kind. Idempotent.
    #[tracing::instrument(level = "info", skip_all, fields(kinds = kinds.len()))]
    pub async fn migrate(&self, kinds: &[RecordKind]) -> Result<()> {
        sqlx::raw_sql(MIGRATION_0001)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::backend("apply migrations", e))?;
        for kind in kinds {
            sqlx::raw_sql(&record_table_ddl(kind))
                .execute(&self.pool)
                .await
                .map_err(|e| Error::backend(format!("create table {kind}"), e))?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::backend("ping postgres", e))?;
        Ok(())
    }

    /// Player ids that appear in at least one stored ranking.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn ranked_player_ids(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT data->>'player_id' AS player_id FROM {RANKINGS_KIND} \
             WHERE data->>'player_id' IS NOT NULL"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list ranked player ids", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("player_id")
                    .map_err(|e| Error::backend("player_id", e))
            })
            .collect()
    }

    /// Ranking values for one set and league type since `since`, ordered by date.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn ranking_history(
        &self,
        ranking_set: RankingSet,
        league_type: LeagueType,
        since: NaiveDate,
    ) -> Result<Vec<RankingPoint>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT data->>'player_id' AS player_id,
                   (data->>'date')::date AS date,
                   (data->>'value')::bigint AS value
            FROM {RANKINGS_KIND}
            WHERE data->>'ranking_set' = $1
              AND data->>'league_type' = $2
              AND (data->>'date')::date >= $3
            ORDER BY date ASC, player_id ASC
            "#
        ))
        .bind(ranking_set.as_str())
        .bind(league_type.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("query ranking history", e))?;

        rows.iter().map(Self::ranking_point_from_row).collect()
    }

    fn ranking_point_from_row(row: &PgRow) -> Result<RankingPoint> {
        Ok(RankingPoint {
            player_id: row
                .try_get("player_id")
                .map_err(|e| Error::backend("player_id", e))?,
            date: row.try_get("date").map_err(|e| Error::backend("date", e))?,
            value: row
                .try_get("value")
                .map_err(|e| Error::backend("value", e))?,
        })
    }

    fn persisted_from_row(row: &PgRow) -> Result<PersistedRecord> {
        let key: String = row
            .try_get("record_key")
            .map_err(|e| Error::backend("record_key", e))?;
        let fingerprint: String = row
            .try_get("fingerprint")
            .map_err(|e| Error::backend("fingerprint", e))?;
        Ok(PersistedRecord {
            key: RecordKey::new(key)?,
            source: row
                .try_get("source")
                .map_err(|e| Error::backend("source", e))?,
            fingerprint: Fingerprint::from_stored(fingerprint),
            last_synced_at: row
                .try_get("last_synced_at")
                .map_err(|e| Error::backend("last_synced_at", e))?,
        })
    }

    fn checkpoint_from_row(row: &PgRow) -> Result<SyncCheckpoint> {
        let job_id: String = row
            .try_get("job_id")
            .map_err(|e| Error::backend("job_id", e))?;
        let cursor: Option<Json<SyncCursor>> = row
            .try_get("cursor")
            .map_err(|e| Error::backend("cursor", e))?;
        let batches: i64 = row
            .try_get("batches_committed")
            .map_err(|e| Error::backend("batches_committed", e))?;
        let records: i64 = row
            .try_get("records_committed")
            .map_err(|e| Error::backend("records_committed", e))?;
        Ok(SyncCheckpoint {
            job_id: JobId::new(job_id)?,
            cursor: cursor.map(|c| c.0),
            batches_committed: batches.max(0) as u64,
            records_committed: records.max(0) as u64,
            updated_at: row
                .try_get("updated_at")
                .map_err(|e| Error::backend("updated_at", e))?,
        })
    }
}

fn record_table_ddl(kind: &RecordKind) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {kind} (
            record_key     TEXT PRIMARY KEY,
            source         TEXT NOT NULL,
            fingerprint    TEXT NOT NULL,
            data           JSONB NOT NULL,
            last_synced_at TIMESTAMPTZ NOT NULL
        );
        CREATE INDEX IF NOT EXISTS {kind}_source_idx ON {kind} (source);
        "#
    )
}

enum FailureClass {
    Rejected,
    Unavailable,
    Other,
}

fn classify_sqlx(err: &sqlx::Error) -> FailureClass {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            // 22: data exception, 23: integrity constraint violation.
            if code.starts_with("22") || code.starts_with("23") {
                FailureClass::Rejected
            // 08: connection exception, 53: insufficient resources, 57P: operator intervention,
            // 40001/40P01: serialization failure and deadlock.
            } else if code.starts_with("08")
                || code.starts_with("53")
                || code.starts_with("57P")
                || code == "40001"
                || code == "40P01"
            {
                FailureClass::Unavailable
            } else {
                FailureClass::Other
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => FailureClass::Unavailable,
        _ => FailureClass::Other,
    }
}

fn apply_error(context: &str, err: sqlx::Error) -> Error {
    match classify_sqlx(&err) {
        FailureClass::Rejected => ApplyError::Rejected(format!("{context}: {err}")).into(),
        FailureClass::Unavailable => ApplyError::Unavailable(format!("{context}: {err}")).into(),
        FailureClass::Other => Error::backend(context.to_string(), err),
    }
}

/// Reads are never rejected; an unreachable store is transient, anything else is not.
fn read_error(context: &str, err: sqlx::Error) -> Error {
    match classify_sqlx(&err) {
        FailureClass::Unavailable => ApplyError::Unavailable(format!("{context}: {err}")).into(),
        FailureClass::Rejected | FailureClass::Other => Error::backend(context.to_string(), err),
    }
}

fn lock_key(job_id: &JobId) -> i32 {
    let digest = Sha256::digest(job_id.as_str().as_bytes());
    i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[async_trait]
impl RecordStore for PgStore {
    #[tracing::instrument(level = "debug", skip(self, keys), fields(keys = keys.len()))]
    async fn fetch_persisted(
        &self,
        kind: &RecordKind,
        keys: &[RecordKey],
    ) -> Result<HashMap<RecordKey, PersistedRecord>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let raw_keys: Vec<String> = keys.iter().map(|k| k.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            "SELECT record_key, source, fingerprint, last_synced_at FROM {kind} \
             WHERE record_key = ANY($1)"
        ))
        .bind(&raw_keys)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| read_error("fetch persisted records", e))?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let record = Self::persisted_from_row(row)?;
            out.insert(record.key.clone(), record);
        }
        Ok(out)
    }

    #[tracing::instrument(level = "debug", skip(self, window), fields(window = ?window.field))]
    async fn list_keys(
        &self,
        kind: &RecordKind,
        source: &str,
        window: &DeleteWindow,
    ) -> Result<Vec<RecordKey>> {
        if window.is_closed() {
            return Ok(Vec::new());
        }
        let sql = match &window.field {
            None => format!("SELECT record_key FROM {kind} WHERE source = $1 ORDER BY record_key"),
            Some(_) => format!(
                "SELECT record_key FROM {kind} \
                 WHERE source = $1 AND data ->> $2 = ANY($3) ORDER BY record_key"
            ),
        };
        let mut query = sqlx::query(&sql).bind(source);
        if let Some(field) = &window.field {
            let values: Vec<String> = window.values.iter().cloned().collect();
            query = query.bind(field.clone()).bind(values);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| read_error("list record keys", e))?;

        rows.iter()
            .map(|row| {
                let key: String = row
                    .try_get("record_key")
                    .map_err(|e| Error::backend("record_key", e))?;
                RecordKey::new(key)
            })
            .collect()
    }

    #[tracing::instrument(level = "debug", skip(self, changes), fields(changes = changes.len()))]
    async fn apply_changes(
        &self,
        kind: &RecordKind,
        source: &str,
        changes: &[Change],
        synced_at: DateTime<Utc>,
    ) -> Result<()> {
        let upsert = format!(
            r#"
            INSERT INTO {kind} (record_key, source, fingerprint, data, last_synced_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (record_key) DO UPDATE
              SET source = EXCLUDED.source,
                  fingerprint = EXCLUDED.fingerprint,
                  data = EXCLUDED.data,
                  last_synced_at = EXCLUDED.last_synced_at
              WHERE {kind}.fingerprint IS DISTINCT FROM EXCLUDED.fingerprint
            "#
        );
        let delete = format!("DELETE FROM {kind} WHERE record_key = $1");

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| apply_error("begin transaction", e))?;

        for change in changes {
            match change {
                Change::Insert(record) | Change::Update(record) => {
                    sqlx::query(&upsert)
                        .bind(record.key.as_str())
                        .bind(source)
                        .bind(record.fingerprint.as_str())
                        .bind(Json(&record.fields))
                        .bind(synced_at)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| apply_error("upsert record", e))?;
                }
                Change::Delete(key) => {
                    sqlx::query(&delete)
                        .bind(key.as_str())
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| apply_error("delete record", e))?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| apply_error("commit transaction", e))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PgStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn load_checkpoint(&self, job_id: &JobId) -> Result<Option<SyncCheckpoint>> {
        let row = sqlx::query(
            r#"
            SELECT job_id, cursor, batches_committed, records_committed, updated_at
            FROM sync_checkpoints
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::backend("load checkpoint", e))?;
        row.as_ref().map(Self::checkpoint_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self, checkpoint), fields(job = %checkpoint.job_id))]
    async fn save_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (job_id, cursor, batches_committed, records_committed, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_id) DO UPDATE
              SET cursor = EXCLUDED.cursor,
                  batches_committed = EXCLUDED.batches_committed,
                  records_committed = EXCLUDED.records_committed,
                  updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(checkpoint.job_id.as_str())
        .bind(checkpoint.cursor.as_ref().map(Json))
        .bind(i64::try_from(checkpoint.batches_committed).unwrap_or(i64::MAX))
        .bind(i64::try_from(checkpoint.records_committed).unwrap_or(i64::MAX))
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::checkpoint_persist(checkpoint.job_id.as_str(), e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_checkpoints(&self) -> Result<Vec<SyncCheckpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, cursor, batches_committed, records_committed, updated_at
            FROM sync_checkpoints
            ORDER BY job_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list checkpoints", e))?;
        rows.iter().map(Self::checkpoint_from_row).collect()
    }
}

/// A held session advisory lock. The lock lives on `conn`, so the connection stays out of
/// the pool until release.
pub struct PgRunLease {
    conn: Option<PoolConnection<Postgres>>,
    job_id: JobId,
    key: i32,
}

#[async_trait]
impl RunLease for PgRunLease {
    async fn release(mut self: Box<Self>) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let (released,): (bool,) = sqlx::query_as("SELECT pg_advisory_unlock($1, $2)")
            .bind(LOCK_NAMESPACE)
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| Error::backend("release advisory lock", e))?;
        if !released {
            tracing::warn!(job = %self.job_id, "advisory lock was not held at release");
        }
        Ok(())
    }
}

impl Drop for PgRunLease {
    fn drop(&mut self) {
        // Unreleased: close the session instead of returning a locked connection to the pool.
        if let Some(conn) = self.conn.take() {
            tracing::warn!(job = %self.job_id, "run lease dropped without release; closing connection");
            drop(conn.detach());
        }
    }
}

#[async_trait]
impl RunLock for PgStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn try_lock(&self, job_id: &JobId) -> Result<Option<Box<dyn RunLease>>> {
        let key = lock_key(job_id);
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| Error::backend("acquire lock connection", e))?;
        let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1, $2)")
            .bind(LOCK_NAMESPACE)
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| Error::backend("try advisory lock", e))?;
        if !acquired {
            return Ok(None);
        }
        Ok(Some(Box::new(PgRunLease {
            conn: Some(conn),
            job_id: job_id.clone(),
            key,
        })))
    }
}
