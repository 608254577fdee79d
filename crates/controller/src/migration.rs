//! Startup migrations for records written by older releases.
//!
//! Runs once before the controllers start. Two upgrades:
//!
//! - Replicas used to carry one combined `data_path`; it is split on the
//!   literal `"/replicas/"` separator into `disk_path` +
//!   `data_directory_name`, and the disk id is re-resolved from the disks
//!   registered on the replica's node. A replica whose path or disk cannot
//!   be resolved is marked failed rather than guessed at.
//! - Degraded volumes predating the `last_degraded_at` field get it
//!   stamped so staleness accounting starts now instead of never.

use tracing::{info, warn};

use dbv_common::{Timestamp, VolumeRobustness};
use dbv_datastore::DataStore;

use crate::error::ControllerError;

/// Split a legacy combined data path into (disk path, directory name).
#[must_use]
pub fn split_legacy_data_path(data_path: &str) -> Option<(String, String)> {
    let trimmed = data_path.trim_end_matches('/');
    let (disk_path, directory) = trimmed.split_once("/replicas/")?;
    if disk_path.is_empty() || directory.is_empty() || directory.contains("/replicas/") {
        return None;
    }
    Some((disk_path.to_string(), directory.to_string()))
}

/// Upgrade every replica still carrying a combined data path.
/// Returns how many replicas were rewritten.
pub fn migrate_legacy_replicas(ds: &DataStore, now: Timestamp) -> Result<usize, ControllerError> {
    let mut migrated = 0usize;
    for replica in ds.list_replicas() {
        if replica.spec.data_path.is_empty() {
            continue;
        }
        let mut replica = replica;
        let mut failed = false;

        match split_legacy_data_path(&replica.spec.data_path) {
            Some((disk_path, directory)) => {
                let disk = ds
                    .list_disks_by_node(&replica.spec.instance.node_id)
                    .into_iter()
                    .find(|d| d.spec.path == disk_path);
                match disk {
                    Some(disk) => {
                        replica.spec.disk_id = disk.name().to_string();
                        replica.spec.disk_path = disk_path;
                        replica.spec.data_directory_name = directory;
                    }
                    None => {
                        warn!(
                            replica = replica.name(),
                            path = disk_path,
                            "no registered disk matches legacy data path"
                        );
                        failed = true;
                    }
                }
            }
            None => {
                warn!(
                    replica = replica.name(),
                    path = replica.spec.data_path,
                    "invalid legacy data path"
                );
                failed = true;
            }
        }

        if failed && replica.spec.failed_at.is_none() {
            replica.spec.failed_at = Some(now);
        }
        replica.spec.data_path = String::new();
        ds.update_replica(replica)?;
        migrated += 1;
    }
    if migrated > 0 {
        info!(count = migrated, "migrated legacy replica data paths");
    }
    Ok(migrated)
}

/// Stamp `last_degraded_at` on degraded volumes that predate the field.
pub fn stamp_degraded_volumes(ds: &DataStore, now: Timestamp) -> Result<usize, ControllerError> {
    let mut stamped = 0usize;
    for volume in ds.list_volumes() {
        if volume.status.robustness != VolumeRobustness::Degraded
            || volume.status.last_degraded_at.is_some()
        {
            continue;
        }
        let mut volume = volume;
        volume.status.last_degraded_at = Some(now);
        ds.update_volume_status(volume)?;
        stamped += 1;
    }
    Ok(stamped)
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
