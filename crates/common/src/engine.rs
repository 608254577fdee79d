//! The engine entity: the process presenting the block device.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::instance::{InstanceSpec, InstanceStatus, ReplicaMode};
use crate::meta::ObjectMeta;

/// Desired state of an engine process.
///
/// At most one engine per volume is active; a second may exist briefly
/// while a live image upgrade cuts over.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSpec {
    #[serde(flatten)]
    pub instance: InstanceSpec,

    /// Replica name -> "ip:port" of the current quorum.
    #[serde(default)]
    pub replica_address_map: BTreeMap<String, String>,

    /// Replacement quorum handed over during a live upgrade.
    #[serde(default)]
    pub upgraded_replica_address_map: BTreeMap<String, String>,

    /// Backup volume name on the backup target, set while restoring.
    #[serde(default)]
    pub backup_volume: String,

    /// Backup the engine must restore into its replicas.
    #[serde(default)]
    pub requested_backup_restore: String,

    #[serde(default)]
    pub disable_frontend: bool,

    #[serde(default)]
    pub revision_counter_disabled: bool,

    /// Ask the engine to pick an authoritative replica on next start.
    #[serde(default)]
    pub salvage_requested: bool,

    /// Capture logs before the instance is torn down.
    #[serde(default)]
    pub log_requested: bool,
}

/// Per-replica restore progress as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreStatus {
    #[serde(default)]
    pub is_restoring: bool,
    #[serde(default)]
    pub last_restored: String,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub error: String,
}

/// Observed state of an engine process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    #[serde(flatten)]
    pub instance: InstanceStatus,

    /// Block device path exposed on the attach node, e.g. `/dev/vol-1`.
    #[serde(default)]
    pub endpoint: String,

    /// Replica name -> mode, for the quorum the engine actually holds.
    #[serde(default)]
    pub replica_mode_map: BTreeMap<String, ReplicaMode>,

    /// Replica name -> restore progress while a restore runs.
    #[serde(default)]
    pub restore_status: BTreeMap<String, RestoreStatus>,

    /// Most recent backup every replica has fully restored.
    #[serde(default)]
    pub last_restored_backup: String,

    /// The engine completed a requested salvage on its last start.
    #[serde(default)]
    pub salvage_executed: bool,
}

/// The process that presents a volume's block device and replicates writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Engine {
    pub meta: ObjectMeta,
    pub spec: EngineSpec,
    pub status: EngineStatus,
}

impl Engine {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Count of replicas the engine reports as read-write.
    #[must_use]
    pub fn rw_replica_count(&self) -> usize {
        self.status
            .replica_mode_map
            .values()
            .filter(|m| **m == ReplicaMode::RW)
            .count()
    }
}
