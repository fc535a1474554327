use std::error::Error as StdError;

/// Per-record validation failure raised by a `Transformer`.
///
/// Never fatal: the coordinator collects these into the run report and moves on.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[error("invalid record '{upstream_id}': field '{field}' {reason}")]
pub struct ValidationError {
    pub upstream_id: String,
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(
        upstream_id: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            upstream_id: upstream_id.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn missing(upstream_id: impl Into<String>, field: impl Into<String>) -> Self {
        Self::new(upstream_id, field, "is missing")
    }
}

/// Failure talking to the record store. Reads only ever fail with `Unavailable`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// The store refused the batch (constraint or data error). Retried by splitting the batch.
    #[error("batch rejected: {0}")]
    Rejected(String),

    /// The store could not be reached. Retried with backoff, fatal once retries run out.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Common error type for `dynasty_core`.
///
/// Store and source implementations should preserve the underlying error chain
/// where possible via `Error::backend`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("source '{source_id}' unavailable: {message}")]
    SourceUnavailable { source_id: String, message: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("failed to persist checkpoint for job '{job_id}'")]
    CheckpointPersist {
        job_id: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    #[tracing::instrument(level = "debug", name = "dynasty.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn source_unavailable(
        source_id: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::SourceUnavailable {
            source_id: source_id.into(),
            message: message.to_string(),
        }
    }

    pub fn checkpoint_persist(
        job_id: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::CheckpointPersist {
            job_id: job_id.into(),
            source: Box::new(source),
        }
    }

    /// Transient errors are worth retrying after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable { .. } | Self::Apply(ApplyError::Unavailable(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
