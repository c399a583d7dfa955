//! `contactsync-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, identity values exchanged with the contact sync stream, and the
//! domain error model.

pub mod error;
pub mod id;
pub mod identity;

pub use error::{DomainError, DomainResult};
pub use id::{AccountId, JobId, RecipientId, ThreadId};
pub use identity::{Aci, E164, LocalIdentifiers};
