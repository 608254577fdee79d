//! Status conditions with transition tracking.
//!
//! A condition records one observable aspect of an entity (scheduling,
//! restore progress, node readiness) as a `True`/`False`/`Unknown` status
//! plus a machine-readable reason and a human message. The transition
//! timestamp only moves when the status value actually changes, so
//! repeated reconciles of an unchanged condition are idempotent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Timestamp;

// ════════════════════════════════════════════════════════════════════════════
// CONDITION TYPES AND REASONS
// ════════════════════════════════════════════════════════════════════════════

/// Volume condition: every replica has a node/disk assignment.
pub const VOLUME_CONDITION_SCHEDULED: &str = "Scheduled";
/// Volume condition: backup restoration progress.
pub const VOLUME_CONDITION_RESTORE: &str = "Restore";

pub const REASON_REPLICA_SCHEDULING_FAILURE: &str = "ReplicaSchedulingFailure";
pub const REASON_RESTORE_IN_PROGRESS: &str = "RestoreInProgress";
pub const REASON_RESTORE_FAILURE: &str = "RestoreFailure";

/// Node condition: the node is alive and reporting.
pub const NODE_CONDITION_READY: &str = "Ready";
/// Node condition: the node may receive new replicas.
pub const NODE_CONDITION_SCHEDULABLE: &str = "Schedulable";
/// Node condition: bind mounts propagate into managed processes.
pub const NODE_CONDITION_MOUNT_PROPAGATION: &str = "MountPropagation";

pub const REASON_NODE_GONE: &str = "NodeGone";
pub const REASON_MANAGER_DOWN: &str = "ManagerDown";

// ════════════════════════════════════════════════════════════════════════════
// CONDITION
// ════════════════════════════════════════════════════════════════════════════

/// Tri-state status of a condition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// One observed aspect of an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    /// Timestamp of the last status flip; untouched on same-status updates.
    #[serde(default)]
    pub last_transition_time: Option<Timestamp>,
}

/// Set `condition_type` on `conditions`, bumping the transition time only
/// when the status value changes.
pub fn set_condition(
    conditions: &mut BTreeMap<String, Condition>,
    condition_type: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    now: Timestamp,
) {
    let transitioned = conditions
        .get(condition_type)
        .map(|existing| existing.status != status)
        .unwrap_or(true);

    let previous_transition = conditions
        .get(condition_type)
        .and_then(|existing| existing.last_transition_time);

    conditions.insert(
        condition_type.to_string(),
        Condition {
            condition_type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: if transitioned {
                Some(now)
            } else {
                previous_transition
            },
        },
    );
}

/// Whether `condition_type` is present with status `True`.
#[must_use]
pub fn is_condition_true(conditions: &BTreeMap<String, Condition>, condition_type: &str) -> bool {
    conditions
        .get(condition_type)
        .map(|c| c.status == ConditionStatus::True)
        .unwrap_or(false)
}
