//! Instance state machine shared by engines and replicas.
//!
//! Both engines and replicas are user-space processes managed through the
//! orchestrator adapter. Their specs embed [`InstanceSpec`] (what the
//! control plane wants) and their statuses embed [`InstanceStatus`] (what
//! the reporter last observed).
//!
//! ## State machine
//!
//! ```text
//! Unknown ──▶ Stopped ──▶ Starting ──▶ Running
//!                ▲                        │
//!                └──── Stopping ◀─────────┘
//!           (any state) ──▶ Error   (terminal per instance)
//! ```
//!
//! `Error` is not retriable for a given instance; the owning controller
//! must tear the instance down and create a replacement.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Observed or desired lifecycle state of an engine/replica process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    /// Not yet reported by the orchestrator.
    #[default]
    Unknown,
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Unknown => "unknown",
            InstanceState::Stopped => "stopped",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Mode the engine reports for one replica in its quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaMode {
    /// Full read-write member.
    RW,
    /// Write-only: rebuilding, not yet serving reads.
    WO,
    /// Errored; must be dropped from the quorum.
    Err,
}

/// Desired-state fields common to engine and replica specs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub volume_name: String,
    pub volume_size: u64,
    /// Node the instance must run on; empty means unscheduled/stopped.
    #[serde(default)]
    pub node_id: String,
    pub engine_image: String,
    pub desire_state: InstanceState,
}

/// Observed-state fields common to engine and replica statuses.
///
/// Written only by the instance reporter, never by the volume reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub current_state: InstanceState,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub current_image: String,
}

impl InstanceStatus {
    /// Whether the instance is running and has a usable address.
    #[must_use]
    pub fn running_with_address(&self) -> bool {
        self.current_state == InstanceState::Running && !self.ip.is_empty() && self.port != 0
    }

    /// `ip:port` address, empty when no address has been reported.
    #[must_use]
    pub fn address(&self) -> String {
        if self.ip.is_empty() || self.port == 0 {
            return String::new();
        }
        format!("{}:{}", self.ip, self.port)
    }
}
