//! Controller error taxonomy.

use thiserror::Error;

use dbv_datastore::DatastoreError;
use dbv_orchestrator::OrchestratorError;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Datastore(#[from] DatastoreError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// A remote call exceeded the per-pass deadline; requeue and retry.
    #[error("orchestrator call for {0} exceeded the reconcile deadline")]
    Deadline(String),
}

impl ControllerError {
    /// Conflicts are swallowed by workers: re-enqueue, no user-visible error.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::Datastore(e) if e.is_conflict())
    }
}
