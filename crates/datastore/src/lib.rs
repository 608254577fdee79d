//! # DBV Datastore
//!
//! Typed, versioned access to the desired and observed state of every
//! entity in the control plane. The datastore is the single source of
//! truth: controllers read snapshots out of it, write mutations back into
//! it, and coordinate with each other through its change notifications.
//!
//! ## Guarantees
//!
//! - **Optimistic concurrency**: every write carries the resource version
//!   the writer read; a stale version fails with [`DatastoreError::Conflict`]
//!   and the caller re-reads and requeues.
//! - **Snapshot reads**: reads return owned clones; no reader ever observes
//!   a half-applied write.
//! - **Two-phase deletion**: objects with finalizers are only marked with a
//!   deletion timestamp; physical removal happens when the last finalizer
//!   is cleared.
//! - **Change stream**: every committed write emits one [`WatchEvent`].

mod error;
mod event;
mod store;

pub use error::DatastoreError;
pub use event::{ObjectKind, WatchEvent, WatchOp};
pub use store::DataStore;
