//! Storage nodes and the disks they expose.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::condition::{is_condition_true, Condition, NODE_CONDITION_READY};
use crate::meta::ObjectMeta;

// ════════════════════════════════════════════════════════════════════════════
// NODE
// ════════════════════════════════════════════════════════════════════════════

/// Desired state of a storage node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Gate for new replica placement on this node.
    #[serde(default)]
    pub allow_scheduling: bool,

    /// Tags matched against volume node-tag requirements.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Disk id -> mount path for every disk registered on this node.
    #[serde(default)]
    pub disk_path_map: BTreeMap<String, String>,
}

/// Observed state of a storage node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub conditions: BTreeMap<String, Condition>,
}

/// A node in the cluster that can host engine and replica processes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub meta: ObjectMeta,
    pub spec: NodeSpec,
    pub status: NodeStatus,
}

impl Node {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// The node is alive and reporting.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        is_condition_true(&self.status.conditions, NODE_CONDITION_READY)
    }

    /// Reason attached to a not-Ready condition, empty when Ready.
    #[must_use]
    pub fn not_ready_reason(&self) -> &str {
        match self.status.conditions.get(NODE_CONDITION_READY) {
            Some(c) if c.status != crate::condition::ConditionStatus::True => &c.reason,
            _ => "",
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// DISK
// ════════════════════════════════════════════════════════════════════════════

/// Health of a disk as tracked by the node agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskState {
    #[default]
    Unknown,
    Schedulable,
    Unschedulable,
}

/// Desired state of a storage pool on one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Node hosting this disk.
    pub node_id: String,

    /// Mount path of the disk on its node.
    pub path: String,

    /// Bytes held back from scheduling on this disk.
    #[serde(default)]
    pub storage_reserved: u64,

    #[serde(default)]
    pub allow_scheduling: bool,

    /// Tags matched against volume disk-tag requirements.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Observed state of a disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStatus {
    pub state: DiskState,

    /// Free bytes reported by the filesystem.
    #[serde(default)]
    pub storage_available: u64,

    /// Bytes already promised to scheduled replicas.
    #[serde(default)]
    pub storage_scheduled: u64,

    #[serde(default)]
    pub conditions: BTreeMap<String, Condition>,
}

/// A storage pool on a node, identified by a stable id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub meta: ObjectMeta,
    pub spec: DiskSpec,
    pub status: DiskStatus,
}

impl Disk {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Bytes still available for new replicas after reservations,
    /// committed schedules and the requested size are accounted for.
    #[must_use]
    pub fn schedulable_bytes(&self) -> u64 {
        self.status
            .storage_available
            .saturating_sub(self.status.storage_scheduled)
            .saturating_sub(self.spec.storage_reserved)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// DEFAULT-DISK ANNOTATION PAYLOAD
// ════════════════════════════════════════════════════════════════════════════

/// One entry of the `default-disks-config` node annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultDiskConfig {
    pub path: String,
    #[serde(default)]
    pub storage_reserved: u64,
    #[serde(default = "default_true")]
    pub allow_scheduling: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Parse the JSON list carried by the default-disks annotation.
pub fn parse_default_disk_annotation(raw: &str) -> Result<Vec<DefaultDiskConfig>, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Parse the JSON string list carried by the default-node-tags annotation.
pub fn parse_node_tag_annotation(raw: &str) -> Result<Vec<String>, serde_json::Error> {
    serde_json::from_str(raw)
}
