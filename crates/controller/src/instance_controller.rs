//! Bridges engine/replica desired state to the orchestrator adapter.
//!
//! The volume reconciler only writes *desired* instance state; this
//! controller owns the conversation with the orchestrator and is the sole
//! writer of *observed* instance status — including the engine's
//! replica-mode map, which it translates from the address-keyed quorum
//! report back to replica names. Orchestrator calls are bounded by a
//! per-pass deadline; on expiry the pass fails and the key is requeued
//! rather than a worker being held.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use dbv_common::{Engine, InstanceState, Replica};
use dbv_datastore::DataStore;
use dbv_orchestrator::{
    InstanceKind, InstanceOrchestrator, InstanceProcessSpec, ObservedInstance, OrchestratorError,
};

use crate::error::ControllerError;

pub struct InstanceController {
    ds: DataStore,
    orchestrator: Arc<dyn InstanceOrchestrator>,
    call_deadline: Duration,
}

impl InstanceController {
    pub fn new(
        ds: DataStore,
        orchestrator: Arc<dyn InstanceOrchestrator>,
        call_deadline: Duration,
    ) -> Self {
        Self {
            ds,
            orchestrator,
            call_deadline,
        }
    }

    async fn call<T>(
        &self,
        name: &str,
        fut: impl std::future::Future<Output = Result<T, OrchestratorError>>,
    ) -> Result<T, ControllerError> {
        match timeout(self.call_deadline, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ControllerError::Deadline(name.to_string())),
        }
    }

    // ── engines ─────────────────────────────────────────────────────────────

    pub async fn reconcile_engine(&self, name: &str) -> Result<(), ControllerError> {
        let engine = match self.ds.get_engine(name) {
            Ok(engine) => engine,
            Err(e) if e.is_not_found() => {
                // Record gone: tear the process down.
                self.call(name, self.orchestrator.delete_instance(name))
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let observed = self.drive(&engine_process_spec(&engine), &engine.spec.instance, name)
            .await?;

        let mut updated = engine.clone();
        updated.status.instance.current_state = observed.state;
        updated.status.instance.ip = observed.ip;
        updated.status.instance.port = observed.port;
        updated.status.instance.current_image = observed.current_image;
        updated.status.endpoint = if engine.spec.disable_frontend {
            String::new()
        } else {
            observed.endpoint
        };
        if observed.state == InstanceState::Running {
            // The engine reports its quorum by replica address; records
            // key replica modes by name.
            let modes = self
                .call(name, self.orchestrator.engine_replica_modes(name))
                .await?;
            let mut replica_modes = BTreeMap::new();
            for (replica_name, addr) in engine
                .spec
                .replica_address_map
                .iter()
                .chain(engine.spec.upgraded_replica_address_map.iter())
            {
                if let Some(mode) = modes.get(addr) {
                    replica_modes.insert(replica_name.clone(), *mode);
                }
            }
            updated.status.replica_mode_map = replica_modes;
        }
        if observed.state == InstanceState::Stopped {
            updated.status.replica_mode_map.clear();
            updated.status.endpoint = String::new();
        }
        if updated.spec.log_requested && observed.state == InstanceState::Error {
            if let Err(e) = self
                .call(name, self.orchestrator.request_log(name))
                .await
            {
                warn!(engine = name, "log capture failed: {}", e);
            }
            updated.spec.log_requested = false;
        }

        if updated != engine {
            self.ds.update_engine_status(updated)?;
        }
        Ok(())
    }

    // ── replicas ────────────────────────────────────────────────────────────

    pub async fn reconcile_replica(&self, name: &str) -> Result<(), ControllerError> {
        let replica = match self.ds.get_replica(name) {
            Ok(replica) => replica,
            Err(e) if e.is_not_found() => {
                self.call(name, self.orchestrator.delete_instance(name))
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let observed = self
            .drive(&replica_process_spec(&replica), &replica.spec.instance, name)
            .await?;

        let mut updated = replica.clone();
        updated.status.instance.current_state = observed.state;
        updated.status.instance.ip = observed.ip;
        updated.status.instance.port = observed.port;
        updated.status.instance.current_image = observed.current_image;
        if updated.spec.log_requested && observed.state == InstanceState::Error {
            if let Err(e) = self
                .call(name, self.orchestrator.request_log(name))
                .await
            {
                warn!(replica = name, "log capture failed: {}", e);
            }
            updated.spec.log_requested = false;
        }

        if updated != replica {
            self.ds.update_replica_status(updated)?;
        }
        Ok(())
    }

    /// Desired-state dispatch shared by engines and replicas.
    async fn drive(
        &self,
        process: &InstanceProcessSpec,
        desired: &dbv_common::InstanceSpec,
        name: &str,
    ) -> Result<ObservedInstance, ControllerError> {
        match desired.desire_state {
            InstanceState::Running if !desired.node_id.is_empty() => {
                self.call(name, self.orchestrator.ensure_instance(process))
                    .await
            }
            InstanceState::Running => {
                // Asked to run but unscheduled: report what exists, if
                // anything, without creating a nodeless process.
                debug!(instance = name, "desired running but no node assigned");
                self.call(name, self.orchestrator.stop_instance(name)).await
            }
            _ => self.call(name, self.orchestrator.stop_instance(name)).await,
        }
    }
}

fn engine_process_spec(engine: &Engine) -> InstanceProcessSpec {
    InstanceProcessSpec {
        name: engine.name().to_string(),
        kind: InstanceKind::Engine,
        volume_name: engine.spec.instance.volume_name.clone(),
        node_id: engine.spec.instance.node_id.clone(),
        image: engine.spec.instance.engine_image.clone(),
        replica_addresses: engine
            .spec
            .replica_address_map
            .values()
            .chain(engine.spec.upgraded_replica_address_map.values())
            .cloned()
            .collect(),
    }
}

fn replica_process_spec(replica: &Replica) -> InstanceProcessSpec {
    InstanceProcessSpec {
        name: replica.name().to_string(),
        kind: InstanceKind::Replica,
        volume_name: replica.spec.instance.volume_name.clone(),
        node_id: replica.spec.instance.node_id.clone(),
        image: replica.spec.instance.engine_image.clone(),
        replica_addresses: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbv_common::labels::VOLUME_KEY;
    use dbv_common::meta::ObjectMeta;
    use dbv_common::ReplicaMode;
    use dbv_orchestrator::SimOrchestrator;

    fn setup() -> (DataStore, Arc<SimOrchestrator>, InstanceController) {
        let ds = DataStore::new();
        let sim = Arc::new(SimOrchestrator::new());
        let controller = InstanceController::new(
            ds.clone(),
            sim.clone() as Arc<dyn InstanceOrchestrator>,
            Duration::from_secs(5),
        );
        (ds, sim, controller)
    }

    fn make_replica(name: &str, desire: InstanceState) -> Replica {
        let mut replica = Replica {
            meta: ObjectMeta::named(name).with_label(VOLUME_KEY, "vol-1"),
            ..Default::default()
        };
        replica.spec.active = true;
        replica.spec.instance.volume_name = "vol-1".to_string();
        replica.spec.instance.node_id = "node-1".to_string();
        replica.spec.instance.engine_image = "dbv-engine:v1".to_string();
        replica.spec.instance.desire_state = desire;
        replica
    }

    #[tokio::test]
    async fn test_replica_started_and_status_reported() {
        let (ds, sim, controller) = setup();
        ds.create_replica(make_replica("vol-1-r-aaa", InstanceState::Running))
            .unwrap();

        controller.reconcile_replica("vol-1-r-aaa").await.unwrap();
        assert_eq!(
            ds.get_replica("vol-1-r-aaa").unwrap().status.instance.current_state,
            InstanceState::Starting
        );

        sim.tick();
        controller.reconcile_replica("vol-1-r-aaa").await.unwrap();
        let replica = ds.get_replica("vol-1-r-aaa").unwrap();
        assert_eq!(replica.status.instance.current_state, InstanceState::Running);
        assert!(replica.status.instance.running_with_address());
    }

    #[tokio::test]
    async fn test_stop_and_error_log_capture() {
        let (ds, sim, controller) = setup();
        ds.create_replica(make_replica("vol-1-r-aaa", InstanceState::Running))
            .unwrap();
        controller.reconcile_replica("vol-1-r-aaa").await.unwrap();
        sim.tick();

        sim.fail_instance("vol-1-r-aaa");
        let mut replica = ds.get_replica("vol-1-r-aaa").unwrap();
        replica.spec.instance.desire_state = InstanceState::Stopped;
        replica.spec.log_requested = true;
        ds.update_replica(replica).unwrap();

        controller.reconcile_replica("vol-1-r-aaa").await.unwrap();
        let replica = ds.get_replica("vol-1-r-aaa").unwrap();
        assert_eq!(replica.status.instance.current_state, InstanceState::Error);
        // Logs captured exactly once, request flag reset.
        assert_eq!(sim.log_requests("vol-1-r-aaa"), 1);
        assert!(!replica.spec.log_requested);
    }

    fn make_engine(name: &str, desire: InstanceState) -> Engine {
        let mut engine = Engine {
            meta: ObjectMeta::named(name).with_label(VOLUME_KEY, "vol-1"),
            ..Default::default()
        };
        engine.spec.instance.volume_name = "vol-1".to_string();
        engine.spec.instance.node_id = "node-1".to_string();
        engine.spec.instance.engine_image = "dbv-engine:v1".to_string();
        engine.spec.instance.desire_state = desire;
        engine
    }

    #[tokio::test]
    async fn test_engine_replica_modes_reported_by_name() {
        let (ds, sim, controller) = setup();
        ds.create_replica(make_replica("vol-1-r-aaa", InstanceState::Running))
            .unwrap();
        controller.reconcile_replica("vol-1-r-aaa").await.unwrap();
        sim.tick();
        controller.reconcile_replica("vol-1-r-aaa").await.unwrap();
        let addr = ds
            .get_replica("vol-1-r-aaa")
            .unwrap()
            .status
            .instance
            .address();

        let mut engine = make_engine("vol-1-e-aaa", InstanceState::Running);
        engine
            .spec
            .replica_address_map
            .insert("vol-1-r-aaa".to_string(), addr.clone());
        ds.create_engine(engine).unwrap();

        controller.reconcile_engine("vol-1-e-aaa").await.unwrap();
        sim.tick();
        controller.reconcile_engine("vol-1-e-aaa").await.unwrap();

        // The address-keyed quorum report lands in status keyed by name.
        let engine = ds.get_engine("vol-1-e-aaa").unwrap();
        assert_eq!(engine.status.instance.current_state, InstanceState::Running);
        assert_eq!(
            engine.status.replica_mode_map.get("vol-1-r-aaa"),
            Some(&ReplicaMode::RW)
        );

        // A data-path failure surfaces on the next report.
        sim.engine_sim("vol-1")
            .unwrap()
            .set_replica_mode(&addr, ReplicaMode::Err);
        controller.reconcile_engine("vol-1-e-aaa").await.unwrap();
        let engine = ds.get_engine("vol-1-e-aaa").unwrap();
        assert_eq!(
            engine.status.replica_mode_map.get("vol-1-r-aaa"),
            Some(&ReplicaMode::Err)
        );

        // Stopping the engine clears the reported quorum.
        let mut engine = ds.get_engine("vol-1-e-aaa").unwrap();
        engine.spec.instance.desire_state = InstanceState::Stopped;
        ds.update_engine(engine).unwrap();
        controller.reconcile_engine("vol-1-e-aaa").await.unwrap();
        sim.tick();
        controller.reconcile_engine("vol-1-e-aaa").await.unwrap();
        let engine = ds.get_engine("vol-1-e-aaa").unwrap();
        assert_eq!(engine.status.instance.current_state, InstanceState::Stopped);
        assert!(engine.status.replica_mode_map.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_record_tears_down_process() {
        let (ds, sim, controller) = setup();
        ds.create_replica(make_replica("vol-1-r-aaa", InstanceState::Running))
            .unwrap();
        controller.reconcile_replica("vol-1-r-aaa").await.unwrap();
        sim.tick();

        ds.delete_replica("vol-1-r-aaa").unwrap();
        controller.reconcile_replica("vol-1-r-aaa").await.unwrap();

        // Process is gone: re-ensuring starts from scratch.
        let observed = sim
            .stop_instance("vol-1-r-aaa")
            .await
            .unwrap();
        assert_eq!(observed.state, InstanceState::Stopped);
    }
}
