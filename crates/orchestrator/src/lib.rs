//! # DBV Instance Orchestrator Adapter
//!
//! The control plane never talks to process runtimes directly; it goes
//! through the [`InstanceOrchestrator`] trait. Implementations target a
//! concrete runtime backend, report observed instance state, and stay
//! stateless with respect to the control plane: everything a caller needs
//! is read back from the datastore, never from the adapter.
//!
//! ## Instance state machine
//!
//! ```text
//! Stopped ──▶ Starting ──▶ Running
//!    ▲                        │
//!    └──────── Stopping ◀─────┘
//! (any) ──▶ Error   (terminal; caller recreates the instance)
//! ```
//!
//! This crate ships two in-memory pieces:
//! - [`SimOrchestrator`]: deterministic process-table simulation used by
//!   controller tests and local single-node runs.
//! - [`enginesim::EngineSimCollection`]: simulated engine data path
//!   (replica modes, add/remove). `SimOrchestrator` keeps one simulator
//!   per running engine and serves replica-mode reports from it.

pub mod enginesim;
mod sim;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use dbv_common::{InstanceState, ReplicaMode};

pub use sim::SimOrchestrator;

// ════════════════════════════════════════════════════════════════════════════
// TYPES
// ════════════════════════════════════════════════════════════════════════════

/// What kind of process an instance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceKind {
    Engine,
    Replica,
}

/// Everything a backend needs to run one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceProcessSpec {
    /// Instance name, `<volume>-e-<id>` or `<volume>-r-<id>`.
    pub name: String,
    pub kind: InstanceKind,
    pub volume_name: String,
    /// Node the process must run on.
    pub node_id: String,
    pub image: String,
    /// Replica addresses an engine is launched against; empty for
    /// replicas. Re-ensuring a running engine with a changed list makes
    /// the engine adjust its quorum membership.
    pub replica_addresses: Vec<String>,
}

/// Observed state of one instance as the backend reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedInstance {
    pub state: InstanceState,
    pub ip: String,
    pub port: u16,
    pub current_image: String,
    /// Block-device path, engines only, empty unless running with a frontend.
    pub endpoint: String,
}

/// Orchestrator failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The named instance is not known to the backend.
    #[error("instance {0} not found")]
    InstanceNotFound(String),

    /// The target node cannot run instances right now.
    #[error("node {0} unavailable: {1}")]
    NodeUnavailable(String, String),

    /// Backend-specific failure.
    #[error("orchestrator backend error: {0}")]
    Backend(String),
}

// ════════════════════════════════════════════════════════════════════════════
// TRAIT
// ════════════════════════════════════════════════════════════════════════════

/// Adapter contract for engine/replica process lifecycle.
///
/// All operations are idempotent: `ensure_instance` of an existing
/// instance reports its current state, `stop_instance` of a stopped
/// instance is a no-op, `delete_instance` of an unknown instance succeeds.
#[async_trait]
pub trait InstanceOrchestrator: Send + Sync {
    /// Create the process if absent and report its observed state.
    async fn ensure_instance(
        &self,
        spec: &InstanceProcessSpec,
    ) -> Result<ObservedInstance, OrchestratorError>;

    /// Drive the process toward Stopped.
    async fn stop_instance(&self, name: &str) -> Result<ObservedInstance, OrchestratorError>;

    /// Remove every trace of the instance.
    async fn delete_instance(&self, name: &str) -> Result<(), OrchestratorError>;

    /// Opportunistic log capture before an errored instance is destroyed.
    /// Best effort; failures are logged and swallowed by callers.
    async fn request_log(&self, name: &str) -> Result<(), OrchestratorError>;

    /// Modes of a running engine's quorum, keyed by replica address.
    /// Empty when the engine is not running; the instance reporter maps
    /// addresses back to replica names before writing engine status.
    async fn engine_replica_modes(
        &self,
        engine_name: &str,
    ) -> Result<BTreeMap<String, ReplicaMode>, OrchestratorError>;
}
