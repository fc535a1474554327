use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::sync::detector::{ChangeDetector, dedupe_latest};
use crate::sync::executor::{ApplyOutcome, ApplyPolicy, UpsertExecutor};
use crate::sync::models::{
    Change, ChangeSet, Classification, DeleteWindow, JobId, RawRecord, RecordKey, RunReport,
    RunStatus, SyncCheckpoint, SyncCursor, SyncMode, SyncPhase,
};
use crate::sync::retry::RetryPolicy;
use crate::sync::traits::{CheckpointStore, RecordSource, RecordStore, RunLock, Transformer};
use crate::error::{ApplyError, ValidationError};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Records per batch. One batch is one transaction plus one checkpoint.
    pub batch_size: usize,
    /// Batches the fetcher may buffer ahead of the applier.
    pub pipeline_depth: usize,
    pub source_retry: RetryPolicy,
    pub apply: ApplyPolicy,
    /// Validation errors kept verbatim in the report. The count is always exact.
    pub max_reported_errors: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            pipeline_depth: 1,
            source_retry: RetryPolicy::default(),
            apply: ApplyPolicy::default(),
            max_reported_errors: 50,
        }
    }
}

/// One import job: a source, the transformer for its records, and a sync mode.
#[derive(Clone)]
pub struct SyncJob {
    pub id: JobId,
    pub mode: SyncMode,
    pub source: Arc<dyn RecordSource>,
    pub transformer: Arc<dyn Transformer>,
}

impl std::fmt::Debug for SyncJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncJob")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("source", &self.source.id())
            .field("kind", self.transformer.kind())
            .finish()
    }
}

/// Drives a job through fetch, transform, detect, apply and checkpoint, one batch at a time.
///
/// Guarantees:
/// - a job runs at most once at a time (run lock keyed by job id)
/// - the checkpoint only moves after the batch it covers has committed
/// - per-record failures land in the report; only source/store outages and checkpoint
///   persistence failures stop the run
pub struct SyncCoordinator {
    records: Arc<dyn RecordStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    locks: Arc<dyn RunLock>,
    executor: UpsertExecutor,
    settings: SyncSettings,
}

struct RunState {
    phase: SyncPhase,
    checkpoint: SyncCheckpoint,
    seen: HashSet<RecordKey>,
    window: DeleteWindow,
    report: RunReport,
}

impl RunState {
    /// `Failed` is terminal.
    fn enter(&mut self, phase: SyncPhase) {
        if self.phase != phase && self.phase != SyncPhase::Failed {
            tracing::trace!(from = ?self.phase, to = ?phase, "phase");
            self.phase = phase;
        }
    }

    fn record_validation(&mut self, error: ValidationError, cap: usize) {
        tracing::debug!(upstream_id = %error.upstream_id, field = %error.field, reason = %error.reason, "record failed validation");
        self.report.validation_error_count += 1;
        if self.report.validation_errors.len() < cap {
            self.report.validation_errors.push(error);
        }
    }

    fn absorb(&mut self, outcome: ApplyOutcome) {
        self.report.inserted += outcome.inserted;
        self.report.updated += outcome.updated;
        self.report.deleted += outcome.deleted;
        self.report.rejected.extend(outcome.rejected);
    }
}

/// Aborts the fetcher task when the run ends, however it ends.
struct FetcherGuard(JoinHandle<()>);

impl Drop for FetcherGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum Flow {
    Continue,
    Cancelled,
}

impl SyncCoordinator {
    pub fn new(
        records: Arc<dyn RecordStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        locks: Arc<dyn RunLock>,
        settings: SyncSettings,
    ) -> Self {
        let executor = UpsertExecutor::new(records.clone(), settings.apply);
        Self {
            records,
            checkpoints,
            locks,
            executor,
            settings,
        }
    }

    /// Build from one backend that stores records and checkpoints and hands out locks.
    pub fn from_store<S>(store: Arc<S>, settings: SyncSettings) -> Self
    where
        S: RecordStore + CheckpointStore + RunLock + 'static,
    {
        Self::new(store.clone(), store.clone(), store, settings)
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Run `job` to completion, cancellation or failure. Never panics on job errors;
    /// the outcome is in the returned report.
    #[tracing::instrument(
        level = "info",
        name = "dynasty.sync.run",
        skip_all,
        fields(job = %job.id, mode = job.mode.as_str(), source = job.source.id())
    )]
    pub async fn run(&self, job: &SyncJob, cancel: CancellationToken) -> RunReport {
        let started_at = Utc::now();
        let mut state = RunState {
            phase: SyncPhase::Idle,
            checkpoint: SyncCheckpoint::initial(job.id.clone(), started_at),
            seen: HashSet::new(),
            window: DeleteWindow::new(job.transformer.window_field()),
            report: RunReport::new_running(job.id.clone(), job.mode, started_at),
        };

        let result = match self.locks.try_lock(&job.id).await {
            Ok(Some(lease)) => {
                let result = self.run_locked(job, &cancel, &mut state).await;
                if let Err(e) = lease.release().await {
                    tracing::warn!(error = %e, "failed to release run lock");
                }
                result
            }
            Ok(None) => Err(Error::Conflict(format!(
                "job '{}' is already running",
                job.id
            ))),
            Err(e) => Err(e),
        };

        let status = match result {
            Ok(status) => status,
            Err(e) => {
                let failed_in = state.phase;
                state.enter(SyncPhase::Failed);
                tracing::error!(phase = ?failed_in, error = %e, "import run failed");
                state.report.failed_phase = Some(failed_in);
                state.report.error = Some(e.to_string());
                RunStatus::Failed
            }
        };
        let mut report = state.report;
        report.status = status;
        report.finished_at = Some(Utc::now());

        tracing::info!(
            run_id = %report.run_id,
            status = ?report.status,
            fetched = report.records_fetched,
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            unchanged = report.unchanged,
            duplicates = report.duplicates_dropped,
            batches = report.batches_committed,
            validation_errors = report.validation_error_count,
            rejected = report.rejected.len(),
            "import run finished"
        );
        report
    }

    async fn run_locked(
        &self,
        job: &SyncJob,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Result<RunStatus> {
        if let Some(stored) = self.checkpoints.load_checkpoint(&job.id).await? {
            state.checkpoint = stored;
        }
        // A full sync must observe the whole dataset to infer deletes.
        let fetch_from = match job.mode {
            SyncMode::Incremental => state.checkpoint.clone(),
            SyncMode::Full => state.checkpoint.rewound(),
        };
        tracing::debug!(cursor = ?fetch_from.cursor, "resuming");

        let (tx, mut rx) = mpsc::channel(self.settings.pipeline_depth.max(1));
        let _fetcher = FetcherGuard(tokio::spawn(fetch_batches(
            job.source.clone(),
            fetch_from,
            self.settings.batch_size.max(1),
            self.settings.source_retry,
            tx,
        )));

        loop {
            if cancel.is_cancelled() {
                return Ok(RunStatus::Cancelled);
            }
            state.enter(SyncPhase::Fetching);
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(RunStatus::Cancelled),
                next = rx.recv() => next,
            };
            let Some(batch) = next else { break };
            let raws = batch?;
            self.process_batch(job, raws, state).await?;
            state.enter(SyncPhase::Idle);
        }

        if job.mode == SyncMode::Full {
            if let Flow::Cancelled = self.apply_deletes(job, cancel, state).await? {
                return Ok(RunStatus::Cancelled);
            }
        }
        state.enter(SyncPhase::Idle);
        Ok(RunStatus::Succeeded)
    }

    async fn process_batch(
        &self,
        job: &SyncJob,
        raws: Vec<RawRecord>,
        state: &mut RunState,
    ) -> Result<()> {
        let fetched = raws.len() as u64;
        state.report.records_fetched += fetched;
        let cursor = raws.iter().rev().find_map(|r| r.cursor.clone());

        state.enter(SyncPhase::Transforming);
        let mut canonical = Vec::with_capacity(raws.len());
        for raw in &raws {
            match job.transformer.transform(raw) {
                Ok(record) => canonical.push(record),
                Err(e) => state.record_validation(e, self.settings.max_reported_errors),
            }
        }

        state.enter(SyncPhase::Detecting);
        let (canonical, dropped) = dedupe_latest(canonical);
        state.report.duplicates_dropped += dropped;
        let kind = job.transformer.kind();
        let keys: Vec<RecordKey> = canonical.iter().map(|r| r.key.clone()).collect();
        if job.mode == SyncMode::Full {
            state.seen.extend(keys.iter().cloned());
            for record in &canonical {
                state.window.observe(&record.fields);
            }
        }
        let existing = if keys.is_empty() {
            HashMap::new()
        } else {
            let records = &self.records;
            let keys = &keys;
            self.read_with_retry("fetch persisted records", move || {
                records.fetch_persisted(kind, keys)
            })
            .await?
        };
        let detection =
            ChangeDetector::new(job.mode).detect(kind, job.source.id(), canonical, &existing);
        state.report.unchanged += detection.unchanged;

        self.commit(job, detection.changes, cursor, fetched, state)
            .await
    }

    /// Apply then checkpoint. The checkpoint advances even when nothing changed so the
    /// next run skips records already compared.
    async fn commit(
        &self,
        job: &SyncJob,
        changes: ChangeSet,
        cursor: Option<SyncCursor>,
        records: u64,
        state: &mut RunState,
    ) -> Result<()> {
        state.enter(SyncPhase::Applying);
        let outcome = self.executor.apply(changes, Utc::now()).await?;
        state.absorb(outcome);

        state.enter(SyncPhase::Checkpointing);
        let next = state.checkpoint.advance(cursor, records, Utc::now());
        self.checkpoints
            .save_checkpoint(&next)
            .await
            .map_err(|e| match e {
                Error::CheckpointPersist { .. } => e,
                other => Error::checkpoint_persist(job.id.as_str(), other),
            })?;
        state.checkpoint = next;
        state.report.batches_committed += 1;
        Ok(())
    }

    /// Store reads retry on `ApplyError::Unavailable` under the same policy as writes.
    async fn read_with_retry<T, F, Fut>(&self, what: &str, mut read: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let retry = self.settings.apply.retry;
        let mut attempt = 0u32;
        loop {
            match read().await {
                Err(Error::Apply(ApplyError::Unavailable(msg))) if retry.allows(attempt) => {
                    let delay = retry.delay(attempt);
                    tracing::warn!(what, attempt, ?delay, error = %msg, "store unavailable; retrying read");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Full sync: delete rows owned by the source, inside the observed window, that this
    /// run never saw.
    async fn apply_deletes(
        &self,
        job: &SyncJob,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Result<Flow> {
        state.enter(SyncPhase::Detecting);
        if state.report.validation_error_count > 0 {
            tracing::warn!(
                validation_errors = state.report.validation_error_count,
                "skipping delete detection: some upstream records could not be identified"
            );
            return Ok(Flow::Continue);
        }

        let kind = job.transformer.kind();
        let records = &self.records;
        let source = job.source.id();
        let window = &state.window;
        let candidates = self
            .read_with_retry("list record keys", move || {
                records.list_keys(kind, source, window)
            })
            .await?;
        let deletes: Vec<RecordKey> = ChangeDetector::new(job.mode)
            .detect_deletes(&state.seen, candidates)
            .into_iter()
            .filter_map(|c| match c {
                Classification::Delete(key) => Some(key),
                _ => None,
            })
            .collect();
        tracing::info!(count = deletes.len(), "deleting rows missing upstream");

        for chunk in deletes.chunks(self.settings.batch_size.max(1)) {
            if cancel.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            let mut set = ChangeSet::new(kind.clone(), job.source.id());
            set.changes = chunk.iter().cloned().map(Change::Delete).collect();
            self.commit(job, set, None, 0, state).await?;
        }
        Ok(Flow::Continue)
    }
}

/// Fetch side of the pipeline: pulls records, cuts batches, and reconnects on transient
/// source failures from the cursor of the last batch handed to the applier.
async fn fetch_batches(
    source: Arc<dyn RecordSource>,
    mut resume: SyncCheckpoint,
    batch_size: usize,
    retry: RetryPolicy,
    tx: mpsc::Sender<Result<Vec<RawRecord>>>,
) {
    let mut attempt = 0u32;
    let mut batch: Vec<RawRecord> = Vec::with_capacity(batch_size);

    'connect: loop {
        let mut stream = match source.fetch(&resume).await {
            Ok(stream) => stream,
            Err(e) if e.is_transient() && retry.allows(attempt) => {
                let delay = retry.delay(attempt);
                tracing::warn!(source = source.id(), attempt, ?delay, error = %e, "source unavailable; reconnecting");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue 'connect;
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        while let Some(item) = stream.next().await {
            match item {
                Ok(raw) => {
                    batch.push(raw);
                    if batch.len() >= batch_size {
                        let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                        // The retry budget only resets once the resume point moves.
                        if let Some(cursor) = full.iter().rev().find_map(|r| r.cursor.clone()) {
                            resume.cursor = Some(cursor);
                            attempt = 0;
                        }
                        if tx.send(Ok(full)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) if e.is_transient() && retry.allows(attempt) => {
                    // Unsent records are re-read from the resume point.
                    batch.clear();
                    let delay = retry.delay(attempt);
                    tracing::warn!(source = source.id(), attempt, ?delay, error = %e, "source stream failed; reconnecting");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue 'connect;
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
        break;
    }

    if !batch.is_empty() {
        let _ = tx.send(Ok(batch)).await;
    }
}
