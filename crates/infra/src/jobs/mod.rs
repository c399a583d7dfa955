//! Durable background jobs with retry, backoff and abandonment.
//!
//! ## Design
//!
//! - A job is persisted before it is queued and deleted when it finishes,
//!   successfully or not
//! - One worker per job kind; runs are strictly serialized
//! - Transient failures retry with exponential backoff, up to a retry limit
//! - Parked retries run early when network reachability is regained
//! - Malformed payloads are abandoned without retrying
//!
//! ## Components
//!
//! - `JobRecord`: persisted unit of work with a typed payload
//! - `JobRecordStore`: SQLite persistence for records
//! - `JobQueue`: runs records through a `JobRunnerFactory`
//! - `ContactSyncJobRunnerFactory`: the incoming contact sync job

pub mod contact_sync;
pub mod executor;
pub mod runner;
pub mod store;
pub mod types;

pub use contact_sync::{ContactSyncJobRunner, ContactSyncJobRunnerFactory};
pub use executor::{JobQueue, JobQueueConfig, JobQueueHandle, QueueError, QueueSnapshot, QueueStats};
pub use runner::{JobError, JobRunner, JobRunnerFactory};
pub use store::{JobRecordStore, JobStats, JobStoreError};
pub use types::{
    AttachmentPointer, BackoffStrategy, JobKind, JobPayload, JobRecord, JobStatus,
    PayloadDescriptor, RetryPolicy,
};
