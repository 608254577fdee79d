//! # DBV Replica Scheduler
//!
//! Chooses a (node, disk) placement for an unscheduled replica.
//!
//! ## Algorithm
//!
//! 1. Filter nodes: scheduling allowed, Ready, node tags ⊇ volume node tags.
//! 2. Filter disks: on an accepted node, scheduling allowed, schedulable,
//!    disk tags ⊇ volume disk tags, and enough free capacity for
//!    `size × overprovision ratio` after reservations and prior schedules.
//! 3. Anti-affinity: drop nodes already hosting a usable replica of the
//!    volume. If that empties the candidate set and soft anti-affinity is
//!    enabled, fall back to collocation. Disks already used by another
//!    usable replica are excluded in both modes.
//! 4. Rank surviving disks: most free capacity first, then lowest
//!    scheduled bytes, then lexicographic disk id. The ordering is total,
//!    so repeated scheduling decisions are deterministic.
//!
//! The scheduler is pure: it never writes to the datastore. The caller
//! commits the returned placement onto the replica spec.

use tracing::debug;

use dbv_common::{Disk, Node, Replica, Volume};

// ════════════════════════════════════════════════════════════════════════════
// RESULT TYPES
// ════════════════════════════════════════════════════════════════════════════

/// A committed placement decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub node_id: String,
    pub disk_id: String,
    pub disk_path: String,
    /// Directory name under `<disk_path>/replicas/`; the replica's own name.
    pub data_directory_name: String,
}

/// Why no placement could be produced. The reason string ends up in the
/// volume's Scheduled condition message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unschedulable: {reason}")]
pub struct Unschedulable {
    pub reason: String,
}

/// Policy knobs resolved from settings by the caller.
#[derive(Debug, Clone, Copy)]
pub struct SchedulingPolicy {
    /// Permit collocation when strict spreading is infeasible.
    pub soft_anti_affinity: bool,
    /// Multiplier applied to the volume size for the capacity check.
    pub overprovision_ratio: u64,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self {
            soft_anti_affinity: false,
            overprovision_ratio: 1,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// SCHEDULER
// ════════════════════════════════════════════════════════════════════════════

/// Stateless placement engine.
#[derive(Debug, Default)]
pub struct ReplicaScheduler;

impl ReplicaScheduler {
    pub fn new() -> Self {
        Self
    }

    /// Pick a placement for `replica` of `volume`.
    ///
    /// `existing_replicas` must contain every replica of the volume
    /// (including `replica` itself, which is ignored by name) so
    /// anti-affinity can see current occupancy.
    pub fn schedule(
        &self,
        volume: &Volume,
        replica: &Replica,
        nodes: &[Node],
        disks: &[Disk],
        existing_replicas: &[Replica],
        policy: SchedulingPolicy,
    ) -> Result<Placement, Unschedulable> {
        let candidate_nodes: Vec<&Node> = nodes
            .iter()
            .filter(|n| n.spec.allow_scheduling)
            .filter(|n| n.is_ready())
            .filter(|n| tags_satisfied(&n.spec.tags, &volume.spec.node_tags))
            .collect();
        if candidate_nodes.is_empty() {
            return Err(Unschedulable {
                reason: format!(
                    "no ready schedulable node matches volume {} requirements",
                    volume.name()
                ),
            });
        }

        let required = volume
            .spec
            .size
            .saturating_mul(policy.overprovision_ratio.max(1));
        let candidate_disks: Vec<&Disk> = disks
            .iter()
            .filter(|d| candidate_nodes.iter().any(|n| n.name() == d.spec.node_id))
            .filter(|d| d.spec.allow_scheduling)
            .filter(|d| d.status.state != dbv_common::node::DiskState::Unschedulable)
            .filter(|d| tags_satisfied(&d.spec.tags, &volume.spec.disk_tags))
            .filter(|d| d.schedulable_bytes() >= required)
            .collect();
        if candidate_disks.is_empty() {
            return Err(Unschedulable {
                reason: format!(
                    "no disk with {} schedulable bytes for volume {}",
                    required,
                    volume.name()
                ),
            });
        }

        // Occupancy of the volume's other usable replicas.
        let occupied: Vec<(&str, &str)> = existing_replicas
            .iter()
            .filter(|r| r.name() != replica.name())
            .filter(|r| r.is_usable() && r.spec.is_scheduled())
            .map(|r| (r.spec.instance.node_id.as_str(), r.spec.disk_id.as_str()))
            .collect();

        // Used disks are never reused, regardless of anti-affinity mode.
        let disk_free: Vec<&Disk> = candidate_disks
            .iter()
            .copied()
            .filter(|d| !occupied.iter().any(|(_, disk)| *disk == d.name()))
            .collect();

        let spread: Vec<&Disk> = disk_free
            .iter()
            .copied()
            .filter(|d| !occupied.iter().any(|(node, _)| *node == d.spec.node_id))
            .collect();

        let survivors = if !spread.is_empty() {
            spread
        } else if policy.soft_anti_affinity {
            debug!(
                volume = volume.name(),
                "falling back to soft anti-affinity collocation"
            );
            disk_free
        } else {
            return Err(Unschedulable {
                reason: format!(
                    "every candidate node already hosts a replica of volume {} \
                     and soft anti-affinity is disabled",
                    volume.name()
                ),
            });
        };

        if survivors.is_empty() {
            return Err(Unschedulable {
                reason: format!("every candidate disk already holds volume {}", volume.name()),
            });
        }

        let best = survivors
            .into_iter()
            .min_by(|a, b| {
                b.schedulable_bytes()
                    .cmp(&a.schedulable_bytes())
                    .then(a.status.storage_scheduled.cmp(&b.status.storage_scheduled))
                    .then(a.name().cmp(b.name()))
            })
            .ok_or_else(|| Unschedulable {
                reason: "no candidate disk".to_string(),
            })?;

        Ok(Placement {
            node_id: best.spec.node_id.clone(),
            disk_id: best.name().to_string(),
            disk_path: best.spec.path.clone(),
            data_directory_name: replica.name().to_string(),
        })
    }
}

/// `have ⊇ want`: every requested tag is present.
fn tags_satisfied(have: &[String], want: &[String]) -> bool {
    want.iter().all(|tag| have.contains(tag))
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use dbv_common::condition::{set_condition, ConditionStatus, NODE_CONDITION_READY};
    use dbv_common::meta::ObjectMeta;
    use dbv_common::node::DiskState;
    use dbv_common::{DiskSpec, DiskStatus, NodeSpec, VolumeSpec};

    const GIB: u64 = 1 << 30;

    fn make_node(name: &str, ready: bool, allow: bool) -> Node {
        let mut node = Node {
            meta: ObjectMeta::named(name),
            spec: NodeSpec {
                allow_scheduling: allow,
                ..Default::default()
            },
            status: Default::default(),
        };
        set_condition(
            &mut node.status.conditions,
            NODE_CONDITION_READY,
            if ready {
                ConditionStatus::True
            } else {
                ConditionStatus::False
            },
            "",
            "",
            1,
        );
        node
    }

    fn make_disk(id: &str, node: &str, available: u64) -> Disk {
        Disk {
            meta: ObjectMeta::named(id),
            spec: DiskSpec {
                node_id: node.to_string(),
                path: format!("/var/lib/dbv/{}", id),
                storage_reserved: 0,
                allow_scheduling: true,
                tags: vec![],
            },
            status: DiskStatus {
                state: DiskState::Schedulable,
                storage_available: available,
                storage_scheduled: 0,
                conditions: Default::default(),
            },
        }
    }

    fn make_volume(size: u64, replicas: usize) -> Volume {
        Volume {
            meta: ObjectMeta::named("vol-1"),
            spec: VolumeSpec {
                size,
                number_of_replicas: replicas,
                ..Default::default()
            },
            status: Default::default(),
        }
    }

    fn make_replica(name: &str) -> Replica {
        let mut replica = Replica {
            meta: ObjectMeta::named(name),
            ..Default::default()
        };
        replica.spec.active = true;
        replica
    }

    fn make_scheduled_replica(name: &str, node: &str, disk: &str) -> Replica {
        let mut replica = make_replica(name);
        replica.spec.instance.node_id = node.to_string();
        replica.spec.disk_id = disk.to_string();
        replica.spec.disk_path = format!("/var/lib/dbv/{}", disk);
        replica
    }

    #[test]
    fn test_picks_biggest_free_disk() {
        let scheduler = ReplicaScheduler::new();
        let nodes = vec![make_node("node-1", true, true), make_node("node-2", true, true)];
        let disks = vec![
            make_disk("disk-1", "node-1", 10 * GIB),
            make_disk("disk-2", "node-2", 40 * GIB),
        ];
        let volume = make_volume(GIB, 2);
        let replica = make_replica("vol-1-r-new");

        let placement = scheduler
            .schedule(&volume, &replica, &nodes, &disks, &[], SchedulingPolicy::default())
            .unwrap();
        assert_eq!(placement.node_id, "node-2");
        assert_eq!(placement.disk_id, "disk-2");
        assert_eq!(placement.disk_path, "/var/lib/dbv/disk-2");
        assert_eq!(placement.data_directory_name, "vol-1-r-new");
    }

    #[test]
    fn test_deterministic_tie_break() {
        let scheduler = ReplicaScheduler::new();
        let nodes = vec![make_node("node-1", true, true), make_node("node-2", true, true)];
        // Identical capacity: the lexicographically smaller disk id wins.
        let disks = vec![
            make_disk("disk-b", "node-2", 10 * GIB),
            make_disk("disk-a", "node-1", 10 * GIB),
        ];
        let volume = make_volume(GIB, 2);
        let replica = make_replica("vol-1-r-new");

        for _ in 0..3 {
            let placement = scheduler
                .schedule(&volume, &replica, &nodes, &disks, &[], SchedulingPolicy::default())
                .unwrap();
            assert_eq!(placement.disk_id, "disk-a");
        }
    }

    #[test]
    fn test_unschedulable_without_nodes() {
        let scheduler = ReplicaScheduler::new();
        let nodes = vec![
            make_node("node-1", true, false),
            make_node("node-2", false, true),
        ];
        let disks = vec![make_disk("disk-1", "node-1", 10 * GIB)];
        let volume = make_volume(GIB, 2);
        let replica = make_replica("vol-1-r-new");

        let err = scheduler
            .schedule(&volume, &replica, &nodes, &disks, &[], SchedulingPolicy::default())
            .unwrap_err();
        assert!(err.reason.contains("no ready schedulable node"));
    }

    #[test]
    fn test_capacity_accounts_for_reservation_and_scheduled() {
        let scheduler = ReplicaScheduler::new();
        let nodes = vec![make_node("node-1", true, true)];
        let mut disk = make_disk("disk-1", "node-1", 4 * GIB);
        disk.spec.storage_reserved = 2 * GIB;
        disk.status.storage_scheduled = GIB;
        let volume = make_volume(2 * GIB, 1);
        let replica = make_replica("vol-1-r-new");

        // 4 - 2 - 1 = 1 GiB free < 2 GiB requested.
        let err = scheduler
            .schedule(
                &volume,
                &replica,
                &nodes,
                &[disk.clone()],
                &[],
                SchedulingPolicy::default(),
            )
            .unwrap_err();
        assert!(err.reason.contains("schedulable bytes"));

        disk.status.storage_scheduled = 0;
        scheduler
            .schedule(&volume, &replica, &nodes, &[disk], &[], SchedulingPolicy::default())
            .unwrap();
    }

    #[test]
    fn test_hard_anti_affinity_excludes_occupied_node() {
        let scheduler = ReplicaScheduler::new();
        let nodes = vec![make_node("node-1", true, true), make_node("node-2", true, true)];
        let disks = vec![
            make_disk("disk-1", "node-1", 50 * GIB),
            make_disk("disk-2", "node-2", 10 * GIB),
        ];
        let volume = make_volume(GIB, 2);
        let existing = vec![make_scheduled_replica("vol-1-r-old", "node-1", "disk-1")];
        let replica = make_replica("vol-1-r-new");

        // disk-1 is bigger but node-1 is occupied.
        let placement = scheduler
            .schedule(
                &volume,
                &replica,
                &nodes,
                &disks,
                &existing,
                SchedulingPolicy::default(),
            )
            .unwrap();
        assert_eq!(placement.node_id, "node-2");
    }

    #[test]
    fn test_soft_anti_affinity_falls_back_to_collocation() {
        let scheduler = ReplicaScheduler::new();
        let nodes = vec![make_node("node-1", true, true)];
        let disks = vec![
            make_disk("disk-1", "node-1", 50 * GIB),
            make_disk("disk-1b", "node-1", 20 * GIB),
        ];
        let volume = make_volume(GIB, 2);
        let existing = vec![make_scheduled_replica("vol-1-r-old", "node-1", "disk-1")];
        let replica = make_replica("vol-1-r-new");

        // Hard mode: nothing left.
        assert!(scheduler
            .schedule(
                &volume,
                &replica,
                &nodes,
                &disks,
                &existing,
                SchedulingPolicy::default(),
            )
            .is_err());

        // Soft mode: collocate on the same node, but never the same disk.
        let placement = scheduler
            .schedule(
                &volume,
                &replica,
                &nodes,
                &disks,
                &existing,
                SchedulingPolicy {
                    soft_anti_affinity: true,
                    overprovision_ratio: 1,
                },
            )
            .unwrap();
        assert_eq!(placement.node_id, "node-1");
        assert_eq!(placement.disk_id, "disk-1b");
    }

    #[test]
    fn test_tag_requirements() {
        let scheduler = ReplicaScheduler::new();
        let mut node = make_node("node-1", true, true);
        node.spec.tags = vec!["fast".to_string()];
        let mut disk = make_disk("disk-1", "node-1", 50 * GIB);
        disk.spec.tags = vec!["ssd".to_string(), "local".to_string()];

        let mut volume = make_volume(GIB, 1);
        volume.spec.node_tags = vec!["fast".to_string()];
        volume.spec.disk_tags = vec!["ssd".to_string()];
        let replica = make_replica("vol-1-r-new");

        scheduler
            .schedule(
                &volume,
                &replica,
                std::slice::from_ref(&node),
                std::slice::from_ref(&disk),
                &[],
                SchedulingPolicy::default(),
            )
            .unwrap();

        volume.spec.disk_tags = vec!["nvme".to_string()];
        let err = scheduler
            .schedule(
                &volume,
                &replica,
                std::slice::from_ref(&node),
                std::slice::from_ref(&disk),
                &[],
                SchedulingPolicy::default(),
            )
            .unwrap_err();
        assert!(err.reason.contains("disk"));
    }

    #[test]
    fn test_failed_replicas_do_not_block_placement() {
        let scheduler = ReplicaScheduler::new();
        let nodes = vec![make_node("node-1", true, true)];
        let disks = vec![make_disk("disk-1", "node-1", 50 * GIB)];
        let volume = make_volume(GIB, 2);
        let mut failed = make_scheduled_replica("vol-1-r-old", "node-1", "disk-1");
        failed.spec.failed_at = Some(1_700_000_000);
        let replica = make_replica("vol-1-r-new");

        // The failed replica no longer occupies its node for anti-affinity.
        let placement = scheduler
            .schedule(
                &volume,
                &replica,
                &nodes,
                &disks,
                &[failed],
                SchedulingPolicy::default(),
            )
            .unwrap();
        assert_eq!(placement.node_id, "node-1");
    }
}
