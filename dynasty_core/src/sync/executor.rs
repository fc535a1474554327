use crate::error::ApplyError;
use crate::sync::models::{Change, ChangeSet, RecordKind, RejectedChange};
use crate::sync::retry::RetryPolicy;
use crate::sync::traits::RecordStore;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ApplyPolicy {
    /// Upper bound on binary splits per change set. Halving always terminates at one
    /// record; this caps the number of transactions a poisoned batch can cost.
    pub max_splits: u32,
    /// Backoff for `ApplyError::Unavailable`.
    pub retry: RetryPolicy,
}

impl Default for ApplyPolicy {
    fn default() -> Self {
        Self {
            max_splits: 64,
            retry: RetryPolicy::new(3, std::time::Duration::from_millis(200)),
        }
    }
}

/// What a change set did once it reached the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub rejected: Vec<RejectedChange>,
    pub transactions: u64,
}

impl ApplyOutcome {
    fn record_committed(&mut self, chunk: &[Change]) {
        self.transactions += 1;
        for change in chunk {
            match change {
                Change::Insert(_) => self.inserted += 1,
                Change::Update(_) => self.updated += 1,
                Change::Delete(_) => self.deleted += 1,
            }
        }
    }

    fn record_rejected(&mut self, chunk: &[Change], reason: &str) {
        self.rejected
            .extend(chunk.iter().map(|change| RejectedChange {
                key: change.key().clone(),
                op: change.op(),
                reason: reason.to_string(),
            }));
    }
}

/// Sole writer to the record store.
#[derive(Clone)]
pub struct UpsertExecutor {
    store: Arc<dyn RecordStore>,
    policy: ApplyPolicy,
}

impl UpsertExecutor {
    pub fn new(store: Arc<dyn RecordStore>, policy: ApplyPolicy) -> Self {
        Self { store, policy }
    }

    /// Apply a change set, one transaction per chunk.
    ///
    /// The whole set is tried first. A rejected chunk is halved and both halves retried,
    /// down to single records; a single record that is still rejected is reported in the
    /// outcome and skipped. Store outages are retried with backoff and then returned.
    #[tracing::instrument(level = "debug", skip_all, fields(kind = %set.kind, changes = set.len()))]
    pub async fn apply(&self, set: ChangeSet, synced_at: DateTime<Utc>) -> Result<ApplyOutcome> {
        let ChangeSet {
            kind,
            source,
            changes,
        } = set;
        let mut outcome = ApplyOutcome::default();
        if changes.is_empty() {
            return Ok(outcome);
        }

        let mut pending: Vec<Vec<Change>> = vec![changes];
        let mut splits = 0u32;
        while let Some(mut chunk) = pending.pop() {
            match self.commit_with_retry(&kind, &source, &chunk, synced_at).await {
                Ok(()) => outcome.record_committed(&chunk),
                Err(Error::Apply(ApplyError::Rejected(reason))) => {
                    if chunk.len() > 1 && splits < self.policy.max_splits {
                        splits += 1;
                        let right = chunk.split_off(chunk.len() / 2);
                        tracing::debug!(
                            kind = %kind,
                            left = chunk.len(),
                            right = right.len(),
                            %reason,
                            "batch rejected; splitting"
                        );
                        // Stack: push right first so the left half runs first.
                        pending.push(right);
                        pending.push(chunk);
                    } else {
                        tracing::warn!(
                            kind = %kind,
                            records = chunk.len(),
                            %reason,
                            "store rejected changes; skipping"
                        );
                        outcome.record_rejected(&chunk, &reason);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    async fn commit_with_retry(
        &self,
        kind: &RecordKind,
        source: &str,
        chunk: &[Change],
        synced_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self
                .store
                .apply_changes(kind, source, chunk, synced_at)
                .await
            {
                Ok(()) => return Ok(()),
                Err(Error::Apply(ApplyError::Unavailable(msg)))
                    if self.policy.retry.allows(attempt) =>
                {
                    let delay = self.policy.retry.delay(attempt);
                    tracing::warn!(kind = %kind, attempt, ?delay, error = %msg, "store unavailable; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
