//! The volume entity: a user-declared replicated block device.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::meta::ObjectMeta;
use crate::Timestamp;

// ════════════════════════════════════════════════════════════════════════════
// STATE AND ROBUSTNESS
// ════════════════════════════════════════════════════════════════════════════

/// Volume lifecycle state, driven exclusively by the volume reconciler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeState {
    #[default]
    Creating,
    Detached,
    Attaching,
    Attached,
    Detaching,
    Deleting,
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumeState::Creating => "creating",
            VolumeState::Detached => "detached",
            VolumeState::Attaching => "attaching",
            VolumeState::Attached => "attached",
            VolumeState::Detaching => "detaching",
            VolumeState::Deleting => "deleting",
        };
        write!(f, "{}", s)
    }
}

/// Fault-tolerance classification of an attached volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeRobustness {
    #[default]
    Unknown,
    /// Every desired replica is read-write.
    Healthy,
    /// At least one read-write replica, but fewer than desired.
    Degraded,
    /// No usable replica remains.
    Faulted,
}

impl fmt::Display for VolumeRobustness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumeRobustness::Unknown => "unknown",
            VolumeRobustness::Healthy => "healthy",
            VolumeRobustness::Degraded => "degraded",
            VolumeRobustness::Faulted => "faulted",
        };
        write!(f, "{}", s)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// SPEC / STATUS
// ════════════════════════════════════════════════════════════════════════════

/// Desired state of a volume, declared by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Logical size in bytes.
    pub size: u64,

    /// Desired replica count, >= 1.
    pub number_of_replicas: usize,

    /// Desired attach target; empty means detached.
    #[serde(default)]
    pub node_id: String,

    /// Engine image; empty means use the `default-engine-image` setting.
    #[serde(default)]
    pub engine_image: String,

    /// Backup URL to restore from on first attach; empty for blank volumes.
    #[serde(default)]
    pub from_backup: String,

    /// Keep following the backup chain instead of detaching after restore.
    #[serde(default)]
    pub standby: bool,

    /// Run engine and replicas without revision counters.
    #[serde(default)]
    pub revision_counter_disabled: bool,

    /// Minutes before a failed, inactive replica is reaped. Zero disables.
    #[serde(default)]
    pub stale_replica_timeout: u64,

    /// Attach without exposing the frontend block device.
    #[serde(default)]
    pub disable_frontend: bool,

    /// Node tags a hosting node must carry (superset match).
    #[serde(default)]
    pub node_tags: Vec<String>,

    /// Disk tags a hosting disk must carry (superset match).
    #[serde(default)]
    pub disk_tags: Vec<String>,
}

/// Observed state of a volume, produced by the volume reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStatus {
    /// Controller instance currently responsible for this volume.
    #[serde(default)]
    pub owner_id: String,

    pub state: VolumeState,
    pub robustness: VolumeRobustness,

    /// Node the volume is attached to (or attaching toward).
    #[serde(default)]
    pub current_node_id: String,

    /// Deferred attach target while a detach-then-attach cycle runs.
    #[serde(default)]
    pub pending_node_id: String,

    /// Engine image the volume is actually running.
    #[serde(default)]
    pub current_image: String,

    /// Name of the most recent backup seen on the backup target.
    #[serde(default)]
    pub last_backup: String,

    /// Stamped on each Healthy -> Degraded transition.
    #[serde(default)]
    pub last_degraded_at: Option<Timestamp>,

    /// A restore must run (or is running) before normal use.
    #[serde(default)]
    pub restore_required: bool,

    /// The restore attach cycle has been initiated.
    #[serde(default)]
    pub restore_initiated: bool,

    /// The volume tracks a remote backup chain.
    #[serde(default)]
    pub is_standby: bool,

    /// Frontend is suppressed (restores, standby volumes).
    #[serde(default)]
    pub frontend_disabled: bool,

    /// Set when a salvage wants the workload remounted.
    #[serde(default)]
    pub remount_requested_at: Option<Timestamp>,

    #[serde(default)]
    pub conditions: BTreeMap<String, Condition>,
}

/// A user-declared replicated block device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub meta: ObjectMeta,
    pub spec: VolumeSpec,
    pub status: VolumeStatus,
}

impl Volume {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Whether the volume is in (or entering) a backup-restore cycle.
    #[must_use]
    pub fn restore_pending(&self) -> bool {
        !self.spec.from_backup.is_empty() && (!self.status.restore_initiated || self.status.restore_required)
    }
}
