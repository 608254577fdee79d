//! Datastore error taxonomy.
//!
//! Callers branch on these variants: `Conflict` is swallowed and requeued,
//! `NotFound` means "create it" on the forward path and "already gone" on
//! teardown. Everything else is a real failure.

use thiserror::Error;

use crate::event::ObjectKind;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DatastoreError {
    /// The object does not exist (or was physically removed).
    #[error("{kind} {name:?} not found")]
    NotFound { kind: ObjectKind, name: String },

    /// The write lost an optimistic-concurrency race; re-read and retry.
    #[error("conflict writing {kind} {name:?}: object has been modified")]
    Conflict { kind: ObjectKind, name: String },

    /// Create of an object that already exists.
    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: ObjectKind, name: String },

    /// The write is structurally invalid (empty name, bad setting value).
    #[error("invalid {kind} write: {reason}")]
    Invalid { kind: ObjectKind, reason: String },
}

impl DatastoreError {
    /// True for the variant a reconciler treats as "must create".
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, DatastoreError::NotFound { .. })
    }

    /// True for the variant a reconciler swallows and requeues.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, DatastoreError::Conflict { .. })
    }
}
