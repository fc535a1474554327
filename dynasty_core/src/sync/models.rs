use crate::error::ValidationError;
use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Durable resume position passed to/from sources. Semantics are source-defined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub value: serde_json::Value,
}

impl SyncCursor {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }
}

/// A raw record as delivered by a source. Opaque until transformed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawRecord {
    /// Stable identifier in the external system.
    pub upstream_id: String,
    /// Source-defined payload.
    pub payload: serde_json::Value,
    /// Upstream revision marker (timestamp or version token), when the source has one.
    pub revision: Option<String>,
    /// Position to resume from once this record has been committed.
    pub cursor: Option<SyncCursor>,
}

impl RawRecord {
    #[tracing::instrument(level = "trace", skip(payload))]
    pub fn new(
        upstream_id: impl Into<String> + std::fmt::Debug,
        payload: serde_json::Value,
    ) -> Result<Self> {
        let upstream_id = upstream_id.into();
        if upstream_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "raw record upstream_id is empty".to_string(),
            ));
        }
        Ok(Self {
            upstream_id,
            payload,
            revision: None,
            cursor: None,
        })
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_cursor(mut self, cursor: SyncCursor) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

/// Canonical record type. Doubles as the backing table name, so it is restricted to
/// lowercase SQL identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKind(String);

impl RecordKind {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let mut chars = name.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
        let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid_start || !valid_rest || name.len() > 63 {
            return Err(Error::InvalidInput(format!(
                "record kind '{name}' is not a valid table name"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable primary key of a canonical record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(Error::InvalidInput("record key is empty".to_string()));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed canonical field value. Serializes untagged into the JSONB `data` column.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Uuid(Uuid),
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(v: NaiveDate) -> Self {
        FieldValue::Date(v)
    }
}

impl From<Uuid> for FieldValue {
    fn from(v: Uuid) -> Self {
        FieldValue::Uuid(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

impl FieldValue {
    /// Text form, as Postgres renders `data->>'field'` for the stored JSONB. `None` for null.
    pub fn as_text(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Bool(v) => Some(v.to_string()),
            FieldValue::Int(v) => Some(v.to_string()),
            FieldValue::Float(v) => Some(serde_json::Number::from_f64(*v)?.to_string()),
            FieldValue::Text(v) => Some(v.clone()),
            FieldValue::Date(v) => Some(v.to_string()),
            FieldValue::Uuid(v) => Some(v.to_string()),
        }
    }
}

pub type Fields = BTreeMap<String, FieldValue>;

/// Rows a full sync may delete.
///
/// Always limited to rows the source owns. With a `field`, further limited to rows whose
/// field value the run actually observed, so a daily snapshot only replaces its own day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteWindow {
    pub field: Option<String>,
    pub values: BTreeSet<String>,
}

impl DeleteWindow {
    pub fn new(field: Option<&str>) -> Self {
        Self {
            field: field.map(str::to_string),
            values: BTreeSet::new(),
        }
    }

    /// Note the window value of a record the run saw.
    pub fn observe(&mut self, fields: &Fields) {
        let value = self
            .field
            .as_ref()
            .and_then(|f| fields.get(f))
            .and_then(FieldValue::as_text);
        if let Some(value) = value {
            self.values.insert(value);
        }
    }

    pub fn contains(&self, fields: &Fields) -> bool {
        match &self.field {
            None => true,
            Some(field) => fields
                .get(field)
                .and_then(FieldValue::as_text)
                .is_some_and(|v| self.values.contains(&v)),
        }
    }

    /// True when the window can match no row at all.
    pub fn is_closed(&self) -> bool {
        self.field.is_some() && self.values.is_empty()
    }
}

/// Lowercase hex SHA-256 over the canonical field set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fields live in a `BTreeMap`, so serialization order is fixed by key and independent
    /// of the order upstream delivered them in.
    pub fn of(fields: &Fields) -> Result<Self> {
        let bytes = serde_json::to_vec(fields)
            .map_err(|e| Error::backend("serialize canonical fields", e))?;
        let digest = Sha256::digest(&bytes);
        Ok(Self(hex_lower(&digest)))
    }

    /// Wrap a fingerprint read back from the store.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Normalized record produced by a `Transformer`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRecord {
    pub kind: RecordKind,
    pub key: RecordKey,
    pub fields: Fields,
    pub fingerprint: Fingerprint,
}

impl CanonicalRecord {
    pub fn new(kind: RecordKind, key: RecordKey, fields: Fields) -> Result<Self> {
        let fingerprint = Fingerprint::of(&fields)?;
        Ok(Self {
            kind,
            key,
            fields,
            fingerprint,
        })
    }
}

/// The store's current row for a key, as seen by the change detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub key: RecordKey,
    pub source: String,
    pub fingerprint: Fingerprint,
    pub last_synced_at: DateTime<Utc>,
}

/// Outcome of comparing one incoming record against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Insert(CanonicalRecord),
    Update(CanonicalRecord),
    Delete(RecordKey),
    NoOp(RecordKey),
}

/// A write the upsert executor must perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Insert(CanonicalRecord),
    Update(CanonicalRecord),
    Delete(RecordKey),
}

impl Change {
    pub fn key(&self) -> &RecordKey {
        match self {
            Change::Insert(r) | Change::Update(r) => &r.key,
            Change::Delete(k) => k,
        }
    }

    pub fn op(&self) -> ChangeOp {
        match self {
            Change::Insert(_) => ChangeOp::Insert,
            Change::Update(_) => ChangeOp::Update,
            Change::Delete(_) => ChangeOp::Delete,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// Batch of classified writes for one record kind and source.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub kind: RecordKind,
    pub source: String,
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new(kind: RecordKind, source: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            changes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }
}

/// Identity of an import job. Keys the checkpoint row and the run lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidInput("job id is empty".to_string()));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable sync progress for a job. Advanced only after a batch commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub job_id: JobId,
    pub cursor: Option<SyncCursor>,
    pub batches_committed: u64,
    pub records_committed: u64,
    pub updated_at: DateTime<Utc>,
}

impl SyncCheckpoint {
    pub fn initial(job_id: JobId, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            cursor: None,
            batches_committed: 0,
            records_committed: 0,
            updated_at: now,
        }
    }

    /// Next checkpoint after a committed batch. A batch without a cursor keeps the old one.
    pub fn advance(&self, cursor: Option<SyncCursor>, records: u64, now: DateTime<Utc>) -> Self {
        Self {
            job_id: self.job_id.clone(),
            cursor: cursor.or_else(|| self.cursor.clone()),
            batches_committed: self.batches_committed + 1,
            records_committed: self.records_committed + records,
            updated_at: now,
        }
    }

    /// Same counters, no cursor: the source reads from the beginning.
    pub fn rewound(&self) -> Self {
        Self {
            cursor: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Only records the source yields are considered; deletes are never inferred.
    #[default]
    Incremental,
    /// The whole upstream dataset is considered; stored rows the source no longer yields
    /// are deleted.
    Full,
}

impl SyncMode {
    pub fn parse_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "incremental" => Some(SyncMode::Incremental),
            "full" => Some(SyncMode::Full),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Incremental => "incremental",
            SyncMode::Full => "full",
        }
    }
}

/// Coordinator state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Transforming,
    Detecting,
    Applying,
    Checkpointing,
    /// Terminal. Entered when a run stops on an error.
    Failed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Cancelled,
    Failed,
}

/// A change the store refused even as a single-record batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedChange {
    pub key: RecordKey,
    pub op: ChangeOp,
    pub reason: String,
}

/// Structured end-of-run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub job_id: JobId,
    pub mode: SyncMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub records_fetched: u64,
    pub duplicates_dropped: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub unchanged: u64,
    pub batches_committed: u64,
    pub validation_error_count: u64,
    /// Capped sample of validation failures; the count above is exact.
    pub validation_errors: Vec<ValidationError>,
    pub rejected: Vec<RejectedChange>,
    pub failed_phase: Option<SyncPhase>,
    pub error: Option<String>,
}

impl RunReport {
    pub fn new_running(job_id: JobId, mode: SyncMode, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job_id,
            mode,
            status: RunStatus::Running,
            started_at,
            finished_at: None,
            records_fetched: 0,
            duplicates_dropped: 0,
            inserted: 0,
            updated: 0,
            deleted: 0,
            unchanged: 0,
            batches_committed: 0,
            validation_error_count: 0,
            validation_errors: Vec::new(),
            rejected: Vec::new(),
            failed_phase: None,
            error: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }

    pub fn writes(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    const LUT: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(LUT[(b >> 4) as usize] as char);
        out.push(LUT[(b & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, FieldValue)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn fingerprint_ignores_field_insertion_order() {
        let a = fields(&[("value", 10i64.into()), ("name", "a".into())]);
        let b = fields(&[("name", "a".into()), ("value", 10i64.into())]);
        assert_eq!(Fingerprint::of(&a).unwrap(), Fingerprint::of(&b).unwrap());
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let a = fields(&[("value", 10i64.into())]);
        let b = fields(&[("value", 11i64.into())]);
        let fa = Fingerprint::of(&a).unwrap();
        assert_ne!(fa, Fingerprint::of(&b).unwrap());
        assert_eq!(fa.as_str().len(), 64);
    }

    #[test]
    fn record_kind_must_be_a_table_identifier() {
        assert!(RecordKind::new("player_rankings").is_ok());
        assert!(RecordKind::new("Players").is_err());
        assert!(RecordKind::new("players; drop table x").is_err());
        assert!(RecordKind::new("").is_err());
        assert!(RecordKind::new("1abc").is_err());
    }

    #[test]
    fn checkpoint_advance_keeps_cursor_when_batch_has_none() {
        let now = Utc::now();
        let cp = SyncCheckpoint::initial(JobId::new("job").unwrap(), now);
        let cur = SyncCursor::new(serde_json::json!({"position": 3}));
        let cp = cp.advance(Some(cur.clone()), 4, now);
        let cp = cp.advance(None, 0, now);
        assert_eq!(cp.cursor, Some(cur));
        assert_eq!(cp.batches_committed, 2);
        assert_eq!(cp.records_committed, 4);
        assert!(cp.rewound().cursor.is_none());
    }

    #[test]
    fn option_fields_become_null() {
        let v: FieldValue = Option::<i64>::None.into();
        assert_eq!(v, FieldValue::Null);
        assert_eq!(
            serde_json::to_value(FieldValue::from(Some(3i64))).unwrap(),
            serde_json::json!(3)
        );
    }

    #[test]
    fn delete_window_covers_observed_dates_only() {
        let day = |d: u32| fields(&[("date", NaiveDate::from_ymd_opt(2024, 9, d).unwrap().into())]);

        let mut window = DeleteWindow::new(Some("date"));
        assert!(window.is_closed());
        window.observe(&day(2));
        assert!(!window.is_closed());
        assert!(window.contains(&day(2)));
        assert!(!window.contains(&day(1)));
        assert!(!window.contains(&fields(&[])));

        let owned = DeleteWindow::new(None);
        assert!(owned.contains(&day(1)));
        assert!(!owned.is_closed());
    }

    #[test]
    fn field_text_matches_jsonb_rendering() {
        assert_eq!(FieldValue::Int(7012).as_text().as_deref(), Some("7012"));
        assert_eq!(FieldValue::from("QB").as_text().as_deref(), Some("QB"));
        assert_eq!(FieldValue::Null.as_text(), None);
    }
}
