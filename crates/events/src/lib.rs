//! `contactsync-events`
//!
//! Typed, process-local events emitted by the contact sync engine and the
//! pub/sub mechanics used to deliver them.

pub mod bus;
pub mod contact_sync;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use contact_sync::{AbandonReason, ContactSyncEvent, InsertedThread};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
