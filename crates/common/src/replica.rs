//! The replica entity: one copy of a volume's data on one disk.

use serde::{Deserialize, Serialize};

use crate::instance::{InstanceSpec, InstanceStatus};
use crate::meta::ObjectMeta;
use crate::Timestamp;

/// Desired state of a replica process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSpec {
    #[serde(flatten)]
    pub instance: InstanceSpec,

    /// Engine this replica was created for.
    #[serde(default)]
    pub engine_name: String,

    /// Disk the replica is scheduled on; empty while unscheduled.
    #[serde(default)]
    pub disk_id: String,

    /// Mount path of the scheduled disk.
    #[serde(default)]
    pub disk_path: String,

    /// Directory under `<disk_path>/replicas/` holding the data.
    #[serde(default)]
    pub data_directory_name: String,

    /// Legacy combined path; split into `disk_path` +
    /// `data_directory_name` by the startup migration and then cleared.
    #[serde(default)]
    pub data_path: String,

    /// Last time the engine reported this replica read-write.
    #[serde(default)]
    pub healthy_at: Option<Timestamp>,

    /// Most recent failure mark; a failed replica never restarts unless
    /// salvage clears this first.
    #[serde(default)]
    pub failed_at: Option<Timestamp>,

    /// Inactive replicas are retired copies kept for rollback only.
    #[serde(default)]
    pub active: bool,

    #[serde(default)]
    pub revision_counter_disabled: bool,

    /// Capture logs before the instance is torn down.
    #[serde(default)]
    pub log_requested: bool,
}

impl ReplicaSpec {
    /// Full on-disk data path for a scheduled replica.
    #[must_use]
    pub fn data_path(&self) -> String {
        if self.disk_path.is_empty() || self.data_directory_name.is_empty() {
            return String::new();
        }
        format!(
            "{}/replicas/{}",
            self.disk_path.trim_end_matches('/'),
            self.data_directory_name
        )
    }

    /// Scheduled means the scheduler has assigned a node and disk.
    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        !self.instance.node_id.is_empty() && !self.disk_id.is_empty()
    }
}

/// Observed state of a replica process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    #[serde(flatten)]
    pub instance: InstanceStatus,

    /// An operator asked for this replica to be moved off its disk.
    #[serde(default)]
    pub eviction_requested: bool,
}

/// One copy of a volume's data on one disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub meta: ObjectMeta,
    pub spec: ReplicaSpec,
    pub status: ReplicaStatus,
}

impl Replica {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Active and not failure-marked: counts toward the desired replica set.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.spec.active && self.spec.failed_at.is_none()
    }
}
