//! Infrastructure layer: storage, the persistent job queue, the contact stream
//! decoder and the reconciliation engine that applies contact syncs.

pub mod capabilities;
pub mod config;
pub mod contact_stream;
pub mod jobs;
pub mod reconcile;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::ContactSyncConfig;
pub use storage::{Database, StorageError};
