//! Runner seams between the queue and kind-specific job logic.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use contactsync_events::AbandonReason;

use super::types::{JobKind, JobRecord};

/// Failure of a single job run, classified by how the queue must react.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Network or storage trouble; the same input may succeed later.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The payload can never be processed.
    #[error("malformed payload: {0}")]
    Structural(String),
    /// Something the run depends on is missing.
    #[error("precondition failed: {message}")]
    Precondition { message: String, retryable: bool },
    /// The run observed cancellation and rolled back its open batch.
    #[error("run cancelled")]
    Cancelled,
}

impl JobError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn structural(message: impl Into<String>) -> Self {
        Self::Structural(message.into())
    }

    pub fn precondition(message: impl Into<String>, retryable: bool) -> Self {
        Self::Precondition {
            message: message.into(),
            retryable,
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Transient(_) => true,
            JobError::Precondition { retryable, .. } => *retryable,
            JobError::Structural(_) | JobError::Cancelled => false,
        }
    }

    /// Why a job that failed with this error is dropped, once it is dropped.
    pub fn abandon_reason(&self) -> AbandonReason {
        match self {
            JobError::Structural(_) => AbandonReason::MalformedPayload,
            JobError::Precondition {
                retryable: false, ..
            } => AbandonReason::PreconditionFailed,
            JobError::Transient(_) | JobError::Precondition { .. } | JobError::Cancelled => {
                AbandonReason::RetriesExhausted
            }
        }
    }
}

/// Executes one run of a job. Runners hold no state between runs.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn execute(&self, job: &JobRecord, cancel: &CancellationToken) -> Result<(), JobError>;
}

/// Builds a fresh runner for every run of one job kind.
pub trait JobRunnerFactory: Send + Sync + 'static {
    type Runner: JobRunner;

    fn kind(&self) -> JobKind;

    fn build_runner(&self) -> Self::Runner;

    /// Called once after the queue drops a job for good.
    fn did_abandon(&self, _job: &JobRecord, _error: &JobError) {}
}
