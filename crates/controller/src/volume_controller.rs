//! The volume reconciliation engine.
//!
//! One [`VolumeController::reconcile`] pass per queue key drives a volume
//! toward its declared state: replica provisioning and placement,
//! attach/detach ordering, failure handling, backup restore, auto-salvage
//! and live engine-image upgrades. Every observable mutation of the
//! volume's children happens here; observed instance state is written by
//! the instance reporter, never by this controller.
//!
//! ## Lifecycle ordering invariants
//!
//! - Replicas start before the engine: the engine's desired state only
//!   becomes Running once every scheduled replica reports a usable
//!   address.
//! - The engine stops before replicas: on detach, replicas keep running
//!   until the engine is observed Stopped.
//! - A failure-marked replica is never asked to run again; only salvage
//!   clears the mark.
//!
//! ## State machine
//!
//! ```text
//! Creating ──▶ Detached ──▶ Attaching ──▶ Attached
//!                 ▲                           │
//!                 └──────── Detaching ◀───────┘
//! (deletion requested) ──▶ Deleting
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use dbv_common::condition::{
    set_condition, ConditionStatus, REASON_NODE_GONE, REASON_REPLICA_SCHEDULING_FAILURE,
    REASON_RESTORE_FAILURE, REASON_RESTORE_IN_PROGRESS, VOLUME_CONDITION_RESTORE,
    VOLUME_CONDITION_SCHEDULED,
};
use dbv_common::labels::{
    generate_engine_name, generate_replica_name, parse_backup_url, CORE_FINALIZER, DISK_KEY,
    NODE_KEY, VOLUME_KEY,
};
use dbv_common::meta::ObjectMeta;
use dbv_common::settings::SettingName;
use dbv_common::{
    Disk, Engine, InstanceState, Node, Replica, ReplicaMode, Timestamp, Volume, VolumeRobustness,
    VolumeState,
};
use dbv_datastore::{DataStore, ObjectKind};
use dbv_scheduler::{ReplicaScheduler, SchedulingPolicy};

use crate::error::ControllerError;
use crate::events::{
    EventRecorder, REASON_ATTACHED, REASON_DELETION_COMPLETED, REASON_DETACHED, REASON_FAULTED,
    REASON_SALVAGE, REASON_SCHEDULING_FAILURE,
};
use crate::owner;

const RESTORE_FAILURE_MESSAGE: &str = "All replica restore failed and the volume became Faulted";

// ════════════════════════════════════════════════════════════════════════════
// CONTROLLER
// ════════════════════════════════════════════════════════════════════════════

type NowFn = Arc<dyn Fn() -> Timestamp + Send + Sync>;

/// Drives every volume it owns through its lifecycle.
pub struct VolumeController {
    ds: DataStore,
    scheduler: ReplicaScheduler,
    recorder: Arc<dyn EventRecorder>,
    controller_id: String,
    /// Refuse auto-salvage when revision counters are disabled; see the
    /// daemon config flag of the same name.
    salvage_requires_revision_counters: bool,
    now_fn: NowFn,
}

impl VolumeController {
    pub fn new(ds: DataStore, controller_id: impl Into<String>, recorder: Arc<dyn EventRecorder>) -> Self {
        Self {
            ds,
            scheduler: ReplicaScheduler::new(),
            recorder,
            controller_id: controller_id.into(),
            salvage_requires_revision_counters: false,
            now_fn: Arc::new(|| {
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0)
            }),
        }
    }

    /// Replace the clock (tests pin it).
    pub fn with_now_fn(mut self, now_fn: NowFn) -> Self {
        self.now_fn = now_fn;
        self
    }

    pub fn with_salvage_requires_revision_counters(mut self, required: bool) -> Self {
        self.salvage_requires_revision_counters = required;
        self
    }

    /// One reconcile pass. Returns an optional delay after which the key
    /// should be re-enqueued (standby backup polling).
    pub fn reconcile(&self, volume_name: &str) -> Result<Option<Duration>, ControllerError> {
        let volume = match self.ds.get_volume(volume_name) {
            Ok(v) => v,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let engines = self.ds.list_engines_by_volume(volume_name);
        let replicas = self.ds.list_replicas_by_volume(volume_name);
        let nodes = self.ds.list_nodes();

        // Ownership election: non-owners observe but never mutate.
        let Some(elected) = owner::elect_owner(&volume, &engines, &nodes) else {
            return Ok(None);
        };
        if elected != self.controller_id {
            return Ok(None);
        }

        if volume.meta.deletion_requested() {
            self.finalize_volume(volume, engines, replicas)?;
            return Ok(None);
        }

        let disks = self.ds.list_disks();
        let mut pass = Pass::new(volume, engines, replicas, nodes, disks, (self.now_fn)());
        pass.volume.status.owner_id = elected;

        if pass.volume.status.current_image.is_empty() {
            pass.volume.status.current_image = self.effective_image(&pass.volume);
        }

        self.ensure_engine(&mut pass)?;
        self.sync_engine_flags(&mut pass);
        self.provision_replicas(&mut pass)?;
        self.sync_replica_failures(&mut pass)?;
        self.reconcile_restore_init(&mut pass);
        self.reconcile_restore_progress(&mut pass);
        self.reconcile_state(&mut pass);
        self.reconcile_salvage(&mut pass)?;
        self.reconcile_image_upgrade(&mut pass)?;
        self.cleanup_replicas(&mut pass)?;
        self.write_back(pass)
    }

    fn effective_image(&self, volume: &Volume) -> String {
        if volume.spec.engine_image.is_empty() {
            self.ds.get_setting_value(SettingName::DefaultEngineImage)
        } else {
            volume.spec.engine_image.clone()
        }
    }

    // ════════════════════════════════════════════════════════════════════════
    // DELETION
    // ════════════════════════════════════════════════════════════════════════

    /// Tear down children, then release the finalizer once none remain.
    fn finalize_volume(
        &self,
        mut volume: Volume,
        engines: Vec<Engine>,
        replicas: Vec<Replica>,
    ) -> Result<(), ControllerError> {
        if volume.status.state != VolumeState::Deleting {
            volume.status.state = VolumeState::Deleting;
            volume = self.ds.update_volume_status(volume)?;
        }

        if engines.is_empty() && replicas.is_empty() {
            self.ds
                .remove_volume_finalizer(volume.name(), CORE_FINALIZER)?;
            self.recorder.normal(
                ObjectKind::Volume,
                volume.name(),
                REASON_DELETION_COMPLETED,
                "volume and all of its replicas are gone",
            );
            return Ok(());
        }

        for engine in &engines {
            self.ds.delete_engine(engine.name())?;
        }
        for replica in &replicas {
            self.ds.delete_replica(replica.name())?;
        }
        debug!(
            volume = volume.name(),
            engines = engines.len(),
            replicas = replicas.len(),
            "deleting volume children"
        );
        Ok(())
    }

    // ════════════════════════════════════════════════════════════════════════
    // CHILD PROVISIONING
    // ════════════════════════════════════════════════════════════════════════

    /// Every volume has exactly one engine record from birth.
    fn ensure_engine(&self, pass: &mut Pass) -> Result<(), ControllerError> {
        if pass.engine.is_some() {
            return Ok(());
        }
        let volume = &pass.volume;
        let mut engine = Engine {
            meta: ObjectMeta::named(generate_engine_name(volume.name()))
                .with_label(VOLUME_KEY, volume.name()),
            ..Default::default()
        };
        engine.spec.instance.volume_name = volume.name().to_string();
        engine.spec.instance.volume_size = volume.spec.size;
        engine.spec.instance.engine_image = self.effective_image(volume);
        engine.spec.instance.desire_state = InstanceState::Stopped;
        engine.spec.revision_counter_disabled = volume.spec.revision_counter_disabled;

        let created = self.ds.create_engine(engine)?;
        pass.orig_engine = Some(created.clone());
        pass.engine = Some(created);
        Ok(())
    }

    /// Book-keeping the engine reports back to us.
    fn sync_engine_flags(&self, pass: &mut Pass) {
        if let Some(engine) = pass.engine.as_mut() {
            // Salvage is one-shot: drop the request once the engine ran it.
            if engine.spec.salvage_requested && engine.status.salvage_executed {
                engine.spec.salvage_requested = false;
            }
        }
    }

    /// Create missing replicas and give every unscheduled one a placement.
    fn provision_replicas(&self, pass: &mut Pass) -> Result<(), ControllerError> {
        let desired = pass.volume.spec.number_of_replicas;

        // Fresh volumes get their full replica set; an attached volume
        // replenishes what failure handling took away, but never while a
        // restore is still running.
        let missing = if pass.replicas.is_empty() {
            desired
        } else if pass.volume.status.state == VolumeState::Attached
            && !pass.volume.status.restore_required
        {
            desired.saturating_sub(pass.usable_replicas().len())
        } else {
            0
        };

        for _ in 0..missing {
            let replica = self.new_replica_for_volume(pass, &self.effective_image(&pass.volume))?;
            pass.track_created_replica(replica);
        }

        // Placement for anything unscheduled, whether just created or left
        // over from an earlier failed attempt.
        let policy = SchedulingPolicy {
            soft_anti_affinity: self
                .ds
                .get_setting_as_bool(SettingName::ReplicaSoftAntiAffinity)?,
            overprovision_ratio: self.ds.get_setting_as_u64(SettingName::OverprovisionRatio)?,
        };

        let mut failure: Option<String> = None;
        let replica_names: Vec<String> = pass
            .replicas
            .iter()
            .filter(|r| r.spec.active && !r.spec.is_scheduled() && r.spec.failed_at.is_none())
            .map(|r| r.name().to_string())
            .collect();
        for name in replica_names {
            let (volume, nodes, disks, replicas) =
                (&pass.volume, &pass.nodes, &pass.disks, &pass.replicas);
            let Some(replica) = replicas.iter().find(|r| r.name() == name) else {
                continue;
            };
            match self
                .scheduler
                .schedule(volume, replica, nodes, disks, replicas, policy)
            {
                Ok(placement) => {
                    let Some(replica) = pass.replicas.iter_mut().find(|r| r.name() == name) else {
                        continue;
                    };
                    replica.spec.instance.node_id = placement.node_id.clone();
                    replica.spec.disk_id = placement.disk_id.clone();
                    replica.spec.disk_path = placement.disk_path;
                    replica.spec.data_directory_name = placement.data_directory_name;
                    replica
                        .meta
                        .labels
                        .insert(NODE_KEY.to_string(), placement.node_id);
                    replica
                        .meta
                        .labels
                        .insert(DISK_KEY.to_string(), placement.disk_id);
                }
                Err(unschedulable) => {
                    debug!(
                        volume = pass.volume.name(),
                        replica = %name,
                        "{}",
                        unschedulable
                    );
                    failure = Some(unschedulable.reason);
                }
            }
        }

        match failure {
            Some(reason) => {
                set_condition(
                    &mut pass.volume.status.conditions,
                    VOLUME_CONDITION_SCHEDULED,
                    ConditionStatus::False,
                    REASON_REPLICA_SCHEDULING_FAILURE,
                    &reason,
                    pass.now,
                );
                self.recorder.warning(
                    ObjectKind::Volume,
                    pass.volume.name(),
                    REASON_SCHEDULING_FAILURE,
                    &reason,
                );
            }
            None => {
                set_condition(
                    &mut pass.volume.status.conditions,
                    VOLUME_CONDITION_SCHEDULED,
                    ConditionStatus::True,
                    "",
                    "",
                    pass.now,
                );
            }
        }
        Ok(())
    }

    fn new_replica_for_volume(
        &self,
        pass: &Pass,
        image: &str,
    ) -> Result<Replica, ControllerError> {
        let volume = &pass.volume;
        let engine_name = pass
            .engine
            .as_ref()
            .map(|e| e.name().to_string())
            .unwrap_or_default();
        let mut replica = Replica {
            meta: ObjectMeta::named(generate_replica_name(volume.name()))
                .with_label(VOLUME_KEY, volume.name()),
            ..Default::default()
        };
        replica.spec.instance.volume_name = volume.name().to_string();
        replica.spec.instance.volume_size = volume.spec.size;
        replica.spec.instance.engine_image = image.to_string();
        replica.spec.instance.desire_state = InstanceState::Stopped;
        replica.spec.engine_name = engine_name;
        replica.spec.active = true;
        replica.spec.revision_counter_disabled = volume.spec.revision_counter_disabled;
        Ok(self.ds.create_replica(replica)?)
    }

    // ════════════════════════════════════════════════════════════════════════
    // FAILURE HANDLING
    // ════════════════════════════════════════════════════════════════════════

    /// Mark errored replicas failed, drop them from the engine's quorum,
    /// and reclaim dataless replicas stranded on vanished nodes.
    fn sync_replica_failures(&self, pass: &mut Pass) -> Result<(), ControllerError> {
        let now = pass.now;
        let restoring = pass.volume.status.restore_required;

        // Engine-reported ERR modes.
        let errored: Vec<String> = pass
            .engine
            .as_ref()
            .map(|e| {
                e.status
                    .replica_mode_map
                    .iter()
                    .filter(|(_, mode)| **mode == ReplicaMode::Err)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();

        for name in &errored {
            if let Some(engine) = pass.engine.as_mut() {
                engine.spec.replica_address_map.remove(name);
                engine.spec.log_requested = true;
            }
            if restoring {
                // A half-restored copy has nothing worth salvaging.
                self.ds.delete_replica(name)?;
                pass.mark_deleted(name);
                continue;
            }
            if let Some(replica) = pass.replica_mut(name) {
                if replica.spec.failed_at.is_none() {
                    replica.spec.failed_at = Some(now);
                }
                replica.spec.instance.desire_state = InstanceState::Stopped;
                replica.spec.log_requested = true;
            }
        }

        // Orchestrator-reported instance errors.
        let crashed: Vec<String> = pass
            .replicas
            .iter()
            .filter(|r| r.status.instance.current_state == InstanceState::Error)
            .filter(|r| r.spec.failed_at.is_none())
            .map(|r| r.name().to_string())
            .collect();
        for name in crashed {
            warn!(
                volume = pass.volume.name(),
                replica = %name,
                "replica instance errored"
            );
            if let Some(engine) = pass.engine.as_mut() {
                engine.spec.replica_address_map.remove(&name);
            }
            if let Some(replica) = pass.replica_mut(&name) {
                replica.spec.failed_at = Some(now);
                replica.spec.instance.desire_state = InstanceState::Stopped;
                replica.spec.log_requested = true;
            }
        }

        // A replica that never held data and whose node is gone cannot be
        // salvaged later; reclaim it now.
        let stranded: Vec<String> = pass
            .replicas
            .iter()
            .filter(|r| r.spec.active && r.spec.healthy_at.is_none() && r.spec.failed_at.is_none())
            .filter(|r| !r.spec.instance.node_id.is_empty())
            .filter(|r| {
                pass.nodes
                    .iter()
                    .find(|n| n.name() == r.spec.instance.node_id)
                    .map(|n| !n.is_ready() && n.not_ready_reason() == REASON_NODE_GONE)
                    .unwrap_or(false)
            })
            .map(|r| r.name().to_string())
            .collect();
        for name in stranded {
            info!(
                volume = pass.volume.name(),
                replica = %name,
                "reclaiming dataless replica from vanished node"
            );
            self.ds.delete_replica(&name)?;
            pass.mark_deleted(&name);
        }
        Ok(())
    }

    // ════════════════════════════════════════════════════════════════════════
    // RESTORE LIFECYCLE
    // ════════════════════════════════════════════════════════════════════════

    /// Bootstrap the restore attach cycle exactly once per volume.
    fn reconcile_restore_init(&self, pass: &mut Pass) {
        let volume = &mut pass.volume;
        if volume.spec.from_backup.is_empty() || volume.status.restore_initiated {
            return;
        }
        let Some((backup, _)) = parse_backup_url(&volume.spec.from_backup) else {
            warn!(
                volume = volume.name(),
                url = %volume.spec.from_backup,
                "unparseable backup source"
            );
            return;
        };
        volume.status.restore_initiated = true;
        volume.status.restore_required = true;
        volume.status.frontend_disabled = true;
        volume.status.is_standby = volume.spec.standby;
        volume.status.last_backup = backup;
        // Force-attach to a concrete node even though spec.node_id is empty.
        if volume.status.current_node_id.is_empty() {
            volume.status.current_node_id = if volume.spec.node_id.is_empty() {
                self.controller_id.clone()
            } else {
                volume.spec.node_id.clone()
            };
        }
        info!(volume = volume.name(), "starting restore attach cycle");
    }

    /// Completion, standby polling and failure of a running restore.
    fn reconcile_restore_progress(&self, pass: &mut Pass) {
        let now = pass.now;
        let Some(engine) = pass.engine.as_mut() else {
            return;
        };
        if engine.spec.requested_backup_restore.is_empty() {
            return;
        }

        // Every replica failing its restore is unrecoverable without an
        // operator: no retry, surface and tear down.
        let restores = &engine.status.restore_status;
        if !restores.is_empty() && restores.values().all(|rs| !rs.error.is_empty()) {
            engine.spec.log_requested = true;
            engine.spec.requested_backup_restore = String::new();
            pass.volume.status.robustness = VolumeRobustness::Faulted;
            set_condition(
                &mut pass.volume.status.conditions,
                VOLUME_CONDITION_RESTORE,
                ConditionStatus::False,
                REASON_RESTORE_FAILURE,
                RESTORE_FAILURE_MESSAGE,
                now,
            );
            for replica in pass.replicas.iter_mut() {
                replica.spec.failed_at = Some(now);
                replica.spec.instance.desire_state = InstanceState::Stopped;
                replica.spec.log_requested = true;
            }
            pass.force_detach = Some(DetachKind::Faulted);
            self.recorder.warning(
                ObjectKind::Volume,
                pass.volume.name(),
                REASON_RESTORE_FAILURE,
                RESTORE_FAILURE_MESSAGE,
            );
            return;
        }

        let requested = engine.spec.requested_backup_restore.clone();
        if engine.status.last_restored_backup != requested {
            return;
        }

        // Restored everything it was asked to.
        if pass.volume.status.is_standby {
            // Keep following the chain; best effort, one poll per interval.
            pass.volume.status.last_backup = engine.status.last_restored_backup.clone();
            let interval = self
                .ds
                .get_setting_as_u64(SettingName::StandbyPollInterval)
                .unwrap_or(300);
            pass.requeue_after = Some(Duration::from_secs(interval));
            return;
        }

        if pass.volume.status.restore_required {
            pass.volume.status.restore_required = false;
            engine.spec.requested_backup_restore = String::new();
            engine.spec.backup_volume = String::new();
            pass.volume.status.frontend_disabled = pass.volume.spec.disable_frontend;
            set_condition(
                &mut pass.volume.status.conditions,
                VOLUME_CONDITION_RESTORE,
                ConditionStatus::False,
                "",
                "",
                now,
            );
            info!(volume = pass.volume.name(), "restore completed");
        }
    }

    // ════════════════════════════════════════════════════════════════════════
    // STATE MACHINE
    // ════════════════════════════════════════════════════════════════════════

    fn reconcile_state(&self, pass: &mut Pass) {
        let target = self.attach_target(pass);

        let wants_detach = pass.force_detach.is_some()
            || (pass.volume.status.state != VolumeState::Detached && target.is_empty())
            || (!target.is_empty()
                && !pass.volume.status.current_node_id.is_empty()
                && target != pass.volume.status.current_node_id);

        if !wants_detach && !target.is_empty() {
            self.reconcile_attach(pass, &target);
        } else if wants_detach {
            let switching = !target.is_empty()
                && !pass.volume.status.current_node_id.is_empty()
                && target != pass.volume.status.current_node_id;
            if switching {
                pass.volume.status.pending_node_id = target;
            }
            self.reconcile_detach(pass);
        }
    }

    /// Where the volume should be attached, empty for "nowhere".
    fn attach_target(&self, pass: &Pass) -> String {
        let volume = &pass.volume;
        if !volume.spec.node_id.is_empty() {
            return volume.spec.node_id.clone();
        }
        // Restores and standby volumes hold their forced attachment.
        if (volume.status.restore_required || volume.status.is_standby)
            && !volume.status.current_node_id.is_empty()
        {
            return volume.status.current_node_id.clone();
        }
        String::new()
    }

    fn reconcile_attach(&self, pass: &mut Pass, target: &str) {
        // A volume whose entire replica set is failure-marked cannot be
        // brought up. If it was up, it faults and comes down; otherwise it
        // stays down for salvage or operator action.
        if pass.usable_replicas().is_empty() {
            if matches!(
                pass.volume.status.state,
                VolumeState::Attached | VolumeState::Attaching
            ) {
                pass.volume.status.robustness = VolumeRobustness::Faulted;
                self.recorder.warning(
                    ObjectKind::Volume,
                    pass.volume.name(),
                    REASON_FAULTED,
                    "every replica is failure-marked",
                );
                pass.force_detach = Some(DetachKind::Faulted);
                self.reconcile_detach(pass);
            }
            return;
        }
        if !pass.had_children_at_start {
            return;
        }

        if matches!(
            pass.volume.status.state,
            VolumeState::Creating | VolumeState::Detached
        ) {
            pass.volume.status.current_node_id = target.to_string();
            pass.volume.status.state = VolumeState::Attaching;
        }
        if pass.volume.status.state == VolumeState::Detaching {
            // Let the detach cycle finish; pending_node_id resumes it.
            self.reconcile_detach(pass);
            return;
        }

        // Replicas start first.
        let mut startable = 0usize;
        let mut running = 0usize;
        for replica in pass.replicas.iter_mut() {
            if !replica.is_usable() || !replica.spec.is_scheduled() {
                continue;
            }
            startable += 1;
            replica.spec.instance.desire_state = InstanceState::Running;
            if replica.status.instance.running_with_address() {
                running += 1;
            }
        }

        let upgrading = self.is_upgrading(pass);
        let volume = &mut pass.volume;
        let Some(engine) = pass.engine.as_mut() else {
            return;
        };

        // The engine starts only on a fully running replica set.
        if startable > 0 && running == startable {
            engine.spec.instance.node_id = volume.status.current_node_id.clone();
            engine.spec.instance.desire_state = InstanceState::Running;
            engine.spec.disable_frontend = volume.status.frontend_disabled;
            if volume.status.restore_required {
                if let Some((backup, backup_volume)) = parse_backup_url(&volume.spec.from_backup) {
                    engine.spec.requested_backup_restore = backup;
                    engine.spec.backup_volume = backup_volume;
                }
            }
            if !upgrading {
                let addresses: BTreeMap<String, String> = pass
                    .replicas
                    .iter()
                    .filter(|r| r.is_usable() && r.spec.is_scheduled())
                    .filter(|r| r.status.instance.running_with_address())
                    .filter(|r| r.spec.instance.engine_image == engine.spec.instance.engine_image)
                    .map(|r| (r.name().to_string(), r.status.instance.address()))
                    .collect();
                engine.spec.replica_address_map = addresses;
            }
        }

        // Attached once the engine runs and holds at least one live copy.
        let engine_running = engine.status.instance.current_state == InstanceState::Running;
        let rw_count = engine.rw_replica_count();
        if engine_running && rw_count > 0 && startable > 0 && running == startable {
            if volume.status.state != VolumeState::Attached {
                volume.status.state = VolumeState::Attached;
                self.recorder.normal(
                    ObjectKind::Volume,
                    volume.name(),
                    REASON_ATTACHED,
                    &format!("volume attached to {}", volume.status.current_node_id),
                );
                if volume.status.restore_required {
                    set_condition(
                        &mut volume.status.conditions,
                        VOLUME_CONDITION_RESTORE,
                        ConditionStatus::True,
                        REASON_RESTORE_IN_PROGRESS,
                        "",
                        pass.now,
                    );
                }
            }
        }

        if volume.status.state == VolumeState::Attached {
            self.classify_robustness(pass);
        }
    }

    /// Robustness from the engine's reported replica modes, plus the
    /// healthy-at bookkeeping those modes imply.
    fn classify_robustness(&self, pass: &mut Pass) {
        let Some(engine) = pass.engine.as_ref() else {
            return;
        };
        let rw_names: HashSet<String> = engine
            .status
            .replica_mode_map
            .iter()
            .filter(|(_, m)| **m == ReplicaMode::RW)
            .map(|(n, _)| n.clone())
            .collect();
        let rw_count = rw_names.len();
        let desired = pass.volume.spec.number_of_replicas;
        let now = pass.now;

        for replica in pass.replicas.iter_mut() {
            if rw_names.contains(replica.name()) {
                replica.spec.healthy_at = Some(now);
            }
        }

        let volume = &mut pass.volume;
        if rw_count == 0 {
            volume.status.robustness = VolumeRobustness::Faulted;
            self.recorder.warning(
                ObjectKind::Volume,
                volume.name(),
                REASON_FAULTED,
                "no read-write replica remains",
            );
            pass.force_detach = Some(DetachKind::Faulted);
            self.reconcile_detach(pass);
        } else if rw_count >= desired {
            volume.status.robustness = VolumeRobustness::Healthy;
        } else {
            if volume.status.robustness != VolumeRobustness::Degraded {
                volume.status.last_degraded_at = Some(now);
            }
            volume.status.robustness = VolumeRobustness::Degraded;
        }
    }

    fn reconcile_detach(&self, pass: &mut Pass) {
        let faulted = matches!(pass.force_detach, Some(DetachKind::Faulted));
        let children_active = pass_children_active(pass.engine.as_ref(), &pass.replicas);
        let children_stopped = pass.children_confirmed_stopped();
        let volume = &mut pass.volume;

        if children_active {
            if volume.status.state != VolumeState::Detaching {
                volume.status.state = VolumeState::Detaching;
                volume.status.current_node_id = String::new();
                if faulted {
                    volume.status.robustness = VolumeRobustness::Faulted;
                } else {
                    volume.status.robustness = VolumeRobustness::Unknown;
                    volume.status.frontend_disabled = volume.spec.disable_frontend;
                }
            }

            // The engine stops first; replicas follow once it is down.
            let engine_stopped = match pass.engine.as_mut() {
                Some(engine) => {
                    engine.spec.instance.node_id = String::new();
                    engine.spec.instance.desire_state = InstanceState::Stopped;
                    engine.status.instance.current_state == InstanceState::Stopped
                }
                None => true,
            };
            if engine_stopped {
                for replica in pass.replicas.iter_mut() {
                    if replica.spec.active {
                        replica.spec.instance.desire_state = InstanceState::Stopped;
                    }
                }
            }
            return;
        }

        if children_stopped && volume.status.state != VolumeState::Detached {
            volume.status.state = VolumeState::Detached;
            volume.status.current_node_id = String::new();
            if !faulted && volume.status.robustness != VolumeRobustness::Faulted {
                volume.status.robustness = VolumeRobustness::Unknown;
            }
            // A deferred attach target resumes the cycle.
            if !volume.status.pending_node_id.is_empty() {
                volume.status.current_node_id = volume.status.pending_node_id.clone();
                volume.status.pending_node_id = String::new();
            }
            self.recorder.normal(
                ObjectKind::Volume,
                volume.name(),
                REASON_DETACHED,
                "volume detached",
            );
        }
    }

    // ════════════════════════════════════════════════════════════════════════
    // AUTO-SALVAGE
    // ════════════════════════════════════════════════════════════════════════

    /// Revive a faulted, detached volume by clearing the failure marks of
    /// its most recent replica cohort and letting the engine pick an
    /// authoritative copy on its next start.
    fn reconcile_salvage(&self, pass: &mut Pass) -> Result<(), ControllerError> {
        let volume = &pass.volume;
        if volume.status.state != VolumeState::Detached
            || volume.status.robustness != VolumeRobustness::Faulted
            || !volume.spec.from_backup.is_empty()
        {
            return Ok(());
        }
        if !self.ds.get_setting_as_bool(SettingName::AutoSalvage)? {
            return Ok(());
        }
        if !pass.usable_replicas().is_empty() {
            return Ok(());
        }
        if volume.spec.revision_counter_disabled && self.salvage_requires_revision_counters {
            // Without revision counters the engine cannot rank candidates;
            // the operator has to decide which copy wins.
            warn!(
                volume = volume.name(),
                "auto-salvage declined: revision counters disabled"
            );
            return Ok(());
        }

        let Some(latest) = pass
            .replicas
            .iter()
            .filter(|r| r.spec.active)
            .filter_map(|r| r.spec.failed_at)
            .max()
        else {
            return Ok(());
        };
        let window = self.ds.get_setting_as_u64(SettingName::SalvageWindow)?;
        let cutoff = latest.saturating_sub(window);

        let mut salvaged = 0usize;
        for replica in pass.replicas.iter_mut() {
            if !replica.spec.active {
                continue;
            }
            if let Some(failed_at) = replica.spec.failed_at {
                if failed_at >= cutoff {
                    replica.spec.failed_at = None;
                    salvaged += 1;
                }
            }
        }
        if salvaged == 0 {
            return Ok(());
        }

        if let Some(engine) = pass.engine.as_mut() {
            engine.spec.salvage_requested = true;
        }
        let now = pass.now;
        let volume = &mut pass.volume;
        volume.status.robustness = VolumeRobustness::Unknown;
        volume.status.remount_requested_at = Some(now);
        volume.status.pending_node_id = String::new();
        if volume.status.current_node_id.is_empty() {
            // Reattach to the last requested target.
            volume.status.current_node_id = volume.spec.node_id.clone();
        }
        self.recorder.normal(
            ObjectKind::Volume,
            volume.name(),
            REASON_SALVAGE,
            &format!("salvaging {} replicas from the latest failure cohort", salvaged),
        );
        Ok(())
    }

    // ════════════════════════════════════════════════════════════════════════
    // LIVE ENGINE-IMAGE UPGRADE
    // ════════════════════════════════════════════════════════════════════════

    fn is_upgrading(&self, pass: &Pass) -> bool {
        let volume = &pass.volume;
        !volume.spec.engine_image.is_empty()
            && !volume.status.current_image.is_empty()
            && volume.spec.engine_image != volume.status.current_image
    }

    fn reconcile_image_upgrade(&self, pass: &mut Pass) -> Result<(), ControllerError> {
        if !self.is_upgrading(pass) {
            return Ok(());
        }
        let new_image = pass.volume.spec.engine_image.clone();

        match pass.volume.status.state {
            // Offline upgrade: nothing is running, flip images in place.
            VolumeState::Detached => {
                if let Some(engine) = pass.engine.as_mut() {
                    engine.spec.instance.engine_image = new_image.clone();
                }
                for replica in pass.replicas.iter_mut() {
                    if replica.is_usable() {
                        replica.spec.instance.engine_image = new_image.clone();
                    }
                }
                pass.volume.status.current_image = new_image;
            }

            // Live upgrade: run a second replica set on the new image,
            // hand the engine the replacement quorum, then retire the old.
            VolumeState::Attached => {
                let desired = pass.volume.spec.number_of_replicas;
                let new_replicas: Vec<&Replica> = pass
                    .replicas
                    .iter()
                    .filter(|r| r.is_usable())
                    .filter(|r| r.spec.instance.engine_image == new_image)
                    .collect();

                if new_replicas.len() < desired {
                    let missing = desired - new_replicas.len();
                    for _ in 0..missing {
                        let replica = self.new_replica_for_volume(pass, &new_image)?;
                        pass.track_created_replica(replica);
                    }
                    // Placement runs next pass; anti-affinity only against
                    // the new-image set so collocation with the old copies
                    // stays possible.
                    self.schedule_upgrade_replicas(pass, &new_image)?;
                    return Ok(());
                }

                let all_running = new_replicas
                    .iter()
                    .all(|r| r.status.instance.running_with_address());
                let addresses: BTreeMap<String, String> = new_replicas
                    .iter()
                    .map(|r| (r.name().to_string(), r.status.instance.address()))
                    .collect();

                // Start the new set before the cutover.
                let new_names: HashSet<String> =
                    addresses.keys().cloned().collect();
                for replica in pass.replicas.iter_mut() {
                    if new_names.contains(replica.name()) {
                        replica.spec.instance.desire_state = InstanceState::Running;
                    }
                }

                let Some(engine) = pass.engine.as_mut() else {
                    return Ok(());
                };
                if all_running && engine.spec.instance.engine_image != new_image {
                    engine.spec.upgraded_replica_address_map = addresses.clone();
                    engine.spec.instance.engine_image = new_image.clone();
                }
                if engine.status.instance.current_image == new_image {
                    // Cutover confirmed: retire the old image's replicas.
                    engine.spec.replica_address_map = addresses;
                    engine.spec.upgraded_replica_address_map = BTreeMap::new();
                    for replica in pass.replicas.iter_mut() {
                        if replica.spec.active
                            && replica.spec.instance.engine_image != new_image
                        {
                            replica.spec.active = false;
                            replica.spec.instance.desire_state = InstanceState::Stopped;
                        }
                    }
                    pass.volume.status.current_image = new_image;
                    info!(
                        volume = pass.volume.name(),
                        image = %pass.volume.status.current_image,
                        "engine image upgrade completed"
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn schedule_upgrade_replicas(
        &self,
        pass: &mut Pass,
        new_image: &str,
    ) -> Result<(), ControllerError> {
        let policy = SchedulingPolicy {
            soft_anti_affinity: self
                .ds
                .get_setting_as_bool(SettingName::ReplicaSoftAntiAffinity)?,
            overprovision_ratio: self.ds.get_setting_as_u64(SettingName::OverprovisionRatio)?,
        };
        let names: Vec<String> = pass
            .replicas
            .iter()
            .filter(|r| r.spec.instance.engine_image == new_image)
            .filter(|r| r.spec.active && !r.spec.is_scheduled())
            .map(|r| r.name().to_string())
            .collect();
        for name in names {
            let peers: Vec<Replica> = pass
                .replicas
                .iter()
                .filter(|r| r.spec.instance.engine_image == new_image)
                .cloned()
                .collect();
            let Some(replica) = pass.replicas.iter().find(|r| r.name() == name) else {
                continue;
            };
            if let Ok(placement) = self.scheduler.schedule(
                &pass.volume,
                replica,
                &pass.nodes,
                &pass.disks,
                &peers,
                policy,
            ) {
                if let Some(replica) = pass.replicas.iter_mut().find(|r| r.name() == name) {
                    replica.spec.instance.node_id = placement.node_id.clone();
                    replica.spec.disk_id = placement.disk_id;
                    replica.spec.disk_path = placement.disk_path;
                    replica.spec.data_directory_name = placement.data_directory_name;
                }
            }
        }
        Ok(())
    }

    // ════════════════════════════════════════════════════════════════════════
    // REPLICA CLEANUP
    // ════════════════════════════════════════════════════════════════════════

    /// Reap stale failed replicas, evict surplus healthy ones and delete
    /// retired copies left behind by image upgrades.
    fn cleanup_replicas(&self, pass: &mut Pass) -> Result<(), ControllerError> {
        let now = pass.now;
        let upgrading = self.is_upgrading(pass);

        // Stale failed replicas are reaped only while detached and only
        // when at least one usable copy remains.
        let timeout_minutes = pass.volume.spec.stale_replica_timeout;
        if pass.volume.status.state == VolumeState::Detached
            && timeout_minutes > 0
            && !pass.usable_replicas().is_empty()
        {
            let stale: Vec<String> = pass
                .replicas
                .iter()
                .filter(|r| r.spec.active)
                .filter(|r| {
                    r.spec
                        .failed_at
                        .map(|failed| now.saturating_sub(failed) > timeout_minutes * 60)
                        .unwrap_or(false)
                })
                .map(|r| r.name().to_string())
                .collect();
            for name in stale {
                info!(
                    volume = pass.volume.name(),
                    replica = %name,
                    "reaping stale failed replica"
                );
                self.ds.delete_replica(&name)?;
                pass.mark_deleted(&name);
            }
        }

        // Surplus healthy replicas are retired, newest and quorum-external
        // first, until the desired count is restored.
        if !upgrading {
            let desired = pass.volume.spec.number_of_replicas;
            let usable = pass.usable_replicas();
            if usable.len() > desired {
                let in_quorum: HashSet<String> = pass
                    .engine
                    .as_ref()
                    .map(|e| e.status.replica_mode_map.keys().cloned().collect())
                    .unwrap_or_default();
                let mut candidates: Vec<String> = usable;
                candidates.sort_by(|a, b| {
                    let a_quorum = in_quorum.contains(a);
                    let b_quorum = in_quorum.contains(b);
                    a_quorum.cmp(&b_quorum).then(b.cmp(a))
                });
                let surplus = candidates.len() - desired;
                let victims: Vec<String> = candidates.into_iter().take(surplus).collect();
                for name in victims {
                    if let Some(engine) = pass.engine.as_mut() {
                        engine.spec.replica_address_map.remove(&name);
                    }
                    if let Some(replica) = pass.replica_mut(&name) {
                        info!(
                            volume = %replica.spec.instance.volume_name,
                            replica = %name,
                            "evicting surplus replica"
                        );
                        replica.spec.active = false;
                        replica.spec.instance.desire_state = InstanceState::Stopped;
                    }
                }
            }

            // Retired copies are deleted once they are down and no quorum
            // references them.
            let referenced: HashSet<String> = pass
                .engine
                .as_ref()
                .map(|e| {
                    e.spec
                        .replica_address_map
                        .keys()
                        .chain(e.spec.upgraded_replica_address_map.keys())
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            let retired: Vec<String> = pass
                .replicas
                .iter()
                .filter(|r| !r.spec.active)
                .filter(|r| r.status.instance.current_state == InstanceState::Stopped)
                .filter(|r| !referenced.contains(r.name()))
                .map(|r| r.name().to_string())
                .collect();
            for name in retired {
                self.ds.delete_replica(&name)?;
                pass.mark_deleted(&name);
            }
        }
        Ok(())
    }

    // ════════════════════════════════════════════════════════════════════════
    // WRITE-BACK
    // ════════════════════════════════════════════════════════════════════════

    /// Commit every dirty child, then one consolidated volume status write.
    fn write_back(&self, pass: Pass) -> Result<Option<Duration>, ControllerError> {
        let Pass {
            volume,
            orig_volume,
            engine,
            orig_engine,
            replicas,
            orig_replicas,
            deleted_replicas,
            requeue_after,
            ..
        } = pass;

        if let Some(engine) = engine {
            let changed = orig_engine
                .as_ref()
                .map(|orig| *orig != engine)
                .unwrap_or(true);
            if changed {
                self.ds.update_engine(engine)?;
            }
        }

        for replica in replicas {
            if deleted_replicas.contains(replica.name()) {
                continue;
            }
            let changed = orig_replicas
                .get(replica.name())
                .map(|orig| *orig != replica)
                .unwrap_or(true);
            if changed {
                self.ds.update_replica(replica)?;
            }
        }

        if volume != orig_volume {
            self.ds.update_volume_status(volume)?;
        }
        Ok(requeue_after)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// PASS STATE
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetachKind {
    Faulted,
}

/// Working set of one reconcile pass.
struct Pass {
    now: Timestamp,
    volume: Volume,
    orig_volume: Volume,
    engine: Option<Engine>,
    orig_engine: Option<Engine>,
    replicas: Vec<Replica>,
    orig_replicas: HashMap<String, Replica>,
    deleted_replicas: HashSet<String>,
    nodes: Vec<Node>,
    disks: Vec<Disk>,
    /// Children listed at pass start; children created during the pass do
    /// not count toward state transitions until the next pass observes
    /// them.
    had_children_at_start: bool,
    force_detach: Option<DetachKind>,
    requeue_after: Option<Duration>,
}

impl Pass {
    fn new(
        volume: Volume,
        engines: Vec<Engine>,
        replicas: Vec<Replica>,
        nodes: Vec<Node>,
        disks: Vec<Disk>,
        now: Timestamp,
    ) -> Self {
        let had_children_at_start = !engines.is_empty() && !replicas.is_empty();
        let engine = engines.into_iter().next();
        let orig_replicas = replicas
            .iter()
            .map(|r| (r.name().to_string(), r.clone()))
            .collect();
        Self {
            now,
            orig_volume: volume.clone(),
            volume,
            orig_engine: engine.clone(),
            engine,
            orig_replicas,
            replicas,
            deleted_replicas: HashSet::new(),
            nodes,
            disks,
            had_children_at_start,
            force_detach: None,
            requeue_after: None,
        }
    }

    fn track_created_replica(&mut self, replica: Replica) {
        self.orig_replicas
            .insert(replica.name().to_string(), replica.clone());
        self.replicas.push(replica);
    }

    fn mark_deleted(&mut self, name: &str) {
        self.deleted_replicas.insert(name.to_string());
        self.replicas.retain(|r| r.name() != name);
    }

    fn replica_mut(&mut self, name: &str) -> Option<&mut Replica> {
        self.replicas.iter_mut().find(|r| r.name() == name)
    }

    /// Names of replicas counting toward the desired set.
    fn usable_replicas(&self) -> Vec<String> {
        self.replicas
            .iter()
            .filter(|r| r.is_usable())
            .map(|r| r.name().to_string())
            .collect()
    }

    /// Engine and every active replica observed Stopped.
    fn children_confirmed_stopped(&self) -> bool {
        let engine_stopped = self
            .engine
            .as_ref()
            .map(|e| e.status.instance.current_state == InstanceState::Stopped)
            .unwrap_or(true);
        engine_stopped
            && self
                .replicas
                .iter()
                .filter(|r| r.spec.active)
                .all(|r| r.status.instance.current_state == InstanceState::Stopped)
    }
}

/// Anything still running or asked to run.
fn pass_children_active(engine: Option<&Engine>, replicas: &[Replica]) -> bool {
    let lively = |desire: InstanceState, current: InstanceState| {
        desire == InstanceState::Running
            || matches!(
                current,
                InstanceState::Starting | InstanceState::Running | InstanceState::Stopping
            )
    };
    if let Some(engine) = engine {
        if lively(
            engine.spec.instance.desire_state,
            engine.status.instance.current_state,
        ) {
            return true;
        }
    }
    replicas.iter().any(|r| {
        r.spec.active
            && lively(
                r.spec.instance.desire_state,
                r.status.instance.current_state,
            )
    })
}
