//! Events published by the incoming contact sync job.

use serde::{Deserialize, Serialize};

use contactsync_core::{JobId, ThreadId};

use crate::event::Event;

/// A contact thread created during a sync run, with its desired inbox position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertedThread {
    pub thread_id: ThreadId,
    /// Inbox sort order hint; `u32::MAX` when the sync record carried none.
    pub sort_order: u32,
}

/// Why a contact sync job was dropped without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    /// Transient failures (network/download) exhausted the retry limit.
    RetriesExhausted,
    /// The payload could not be decoded or referenced nothing usable.
    MalformedPayload,
    /// A precondition such as device registration does not hold.
    PreconditionFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContactSyncEvent {
    /// A sync run finished and its job record was deleted.
    IncomingContactSyncDidComplete { inserted_threads: Vec<InsertedThread> },
    /// Known contacts were inserted, updated or pruned (fired at most once per run).
    ContactsChanged,
    /// Recipient identity state may have changed (fired once per run).
    IdentityStateChanged,
    /// The job was deleted without completing. Diagnostics only.
    SyncAbandoned { job_id: JobId, reason: AbandonReason },
}

impl Event for ContactSyncEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ContactSyncEvent::IncomingContactSyncDidComplete { .. } => "contact_sync.completed",
            ContactSyncEvent::ContactsChanged => "contact_sync.contacts_changed",
            ContactSyncEvent::IdentityStateChanged => "contact_sync.identity_state_changed",
            ContactSyncEvent::SyncAbandoned { .. } => "contact_sync.abandoned",
        }
    }
}
