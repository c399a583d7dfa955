//! Core job types and policies.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use contactsync_core::{DomainError, JobId};

/// Job kind, used to route persisted records to the queue that runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    IncomingContactSync,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::IncomingContactSync => "incoming_contact_sync",
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming_contact_sync" => Ok(JobKind::IncomingContactSync),
            other => Err(DomainError::validation(format!("unknown job kind: {other}"))),
        }
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up (first run or retry)
    Pending,
    /// Currently being executed, or interrupted by a crash while executing
    Running,
    /// Completed successfully; the record is deleted
    Succeeded,
    /// Abandoned; the record is deleted
    PermanentlyFailed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::PermanentlyFailed => "permanently_failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "permanently_failed" => Ok(JobStatus::PermanentlyFailed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt (0 = run once)
    pub retry_limit: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to spread retries of many clients
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_limit: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            retry_limit: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(retry_limit: u32, delay: Duration) -> Self {
        Self {
            retry_limit,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(retry_limit: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            retry_limit,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the retry that follows attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
        };

        // Deterministic jitter derived from the attempt number
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether a job that just failed its `attempt`-th run may run again.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.retry_limit
    }
}

/// Descriptor for an attachment that still has to be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPointer {
    pub cdn_key: String,
    pub cdn_number: u32,
    /// Encryption key material, base64 as received.
    pub key: String,
    pub digest: Option<String>,
    pub size: Option<u64>,
}

/// Where the bytes of a contact sync payload come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PayloadDescriptor {
    /// Plaintext already downloaded to local disk.
    Downloaded { path: PathBuf },
    /// A previously stored local attachment.
    LegacyAttachment { attachment_id: String },
    /// Must be downloaded and decrypted before use.
    Transient { pointer: AttachmentPointer },
    /// The sync message referenced nothing usable.
    Invalid,
}

/// Kind-specific job parameters, one variant per job kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    IncomingContactSync {
        descriptor: PayloadDescriptor,
        is_complete_sync: bool,
    },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::IncomingContactSync { .. } => JobKind::IncomingContactSync,
        }
    }
}

/// A persisted unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub payload: JobPayload,
    pub status: JobStatus,
    /// Number of runs started so far (starts at 0)
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time of the next run after a failure
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Error of the most recent failed run
    pub last_error: Option<String>,
}

impl JobRecord {
    pub fn new(payload: JobPayload) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            payload,
            status: JobStatus::Pending,
            attempt: 0,
            created_at: now,
            updated_at: now,
            next_attempt_at: None,
            last_error: None,
        }
    }

    pub fn incoming_contact_sync(descriptor: PayloadDescriptor, is_complete_sync: bool) -> Self {
        Self::new(JobPayload::IncomingContactSync {
            descriptor,
            is_complete_sync,
        })
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    /// Mark job as running.
    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.next_attempt_at = None;
        self.updated_at = Utc::now();
    }

    /// Put the job back in the queue after a failed run.
    pub fn mark_retrying(&mut self, error: impl Into<String>, next_attempt_at: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.last_error = Some(error.into());
        self.next_attempt_at = Some(next_attempt_at);
        self.updated_at = Utc::now();
    }

    /// Return an interrupted run to the queue without charging an attempt.
    pub fn mark_released(&mut self) {
        self.status = JobStatus::Pending;
        self.attempt = self.attempt.saturating_sub(1);
        self.updated_at = Utc::now();
    }
}
