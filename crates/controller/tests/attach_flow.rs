//! Multi-pass flows through the real orchestrator adapter.
//!
//! These tests run the volume reconciler and the instance controller
//! together against the in-memory orchestrator, the way the daemon wires
//! them, and assert the ordering invariants over whole attach/detach
//! cycles rather than single passes. Replica modes are not injected into
//! the datastore by hand: they travel engine data path -> orchestrator
//! report -> instance controller -> engine status, like in production.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use fixtures::*;

use dbv_common::{InstanceState, ReplicaMode, VolumeRobustness, VolumeState};
use dbv_controller::instance_controller::InstanceController;
use dbv_orchestrator::{InstanceOrchestrator, SimOrchestrator};

struct Harness {
    cluster: TestCluster,
    sim: Arc<SimOrchestrator>,
    instances: InstanceController,
}

fn harness() -> Harness {
    let cluster = default_cluster();
    let sim = Arc::new(SimOrchestrator::new());
    let instances = InstanceController::new(
        cluster.ds.clone(),
        sim.clone() as Arc<dyn InstanceOrchestrator>,
        Duration::from_secs(5),
    );
    Harness {
        cluster,
        sim,
        instances,
    }
}

impl Harness {
    /// One control-plane round: volume pass, instance passes, runtime tick.
    async fn step(&self) {
        self.cluster.reconcile();
        for engine in self.cluster.ds.list_engines_by_volume(VOLUME_NAME) {
            self.instances.reconcile_engine(engine.name()).await.unwrap();
        }
        for replica in self.cluster.ds.list_replicas_by_volume(VOLUME_NAME) {
            self.instances
                .reconcile_replica(replica.name())
                .await
                .unwrap();
        }
        self.sim.tick();
    }

    async fn step_until<F: Fn(&TestCluster) -> bool>(&self, what: &str, done: F) {
        for _ in 0..20 {
            if done(&self.cluster) {
                return;
            }
            self.step().await;
        }
        panic!("never reached: {}", what);
    }

    /// Seed the base volume and walk it to Detached.
    async fn provision_detached(&self) {
        self.cluster.seed_volume(base_volume());
        self.step_until("volume detached", |c| {
            c.volume().status.state == VolumeState::Detached
        })
        .await;
    }

    /// Request an attach and walk the cluster until Attached.
    async fn attach_to(&self, node: &str) {
        let mut volume = self.cluster.volume();
        volume.spec.node_id = node.to_string();
        self.cluster.ds.update_volume(volume).unwrap();
        self.step_until("volume attached", |c| {
            c.volume().status.state == VolumeState::Attached
        })
        .await;
    }
}

#[tokio::test]
async fn test_create_to_detached_flow() {
    let h = harness();
    h.provision_detached().await;

    let volume = h.cluster.volume();
    assert_eq!(volume.status.robustness, VolumeRobustness::Unknown);
    let replicas = h.cluster.replicas();
    assert_eq!(replicas.len(), 2);
    for replica in &replicas {
        assert!(replica.spec.is_scheduled());
        assert_eq!(
            replica.status.instance.current_state,
            InstanceState::Stopped
        );
    }
}

#[tokio::test]
async fn test_full_attach_flow_orders_children() {
    let h = harness();
    h.provision_detached().await;

    // Request an attach and walk the cluster forward; the engine's quorum
    // report drives the mode map with no hand-injection.
    let mut volume = h.cluster.volume();
    volume.spec.node_id = NODE1.to_string();
    h.cluster.ds.update_volume(volume).unwrap();

    for _ in 0..20 {
        if h.cluster.volume().status.state == VolumeState::Attached {
            break;
        }
        h.step().await;

        // Ordering invariant: the engine never runs ahead of its replicas.
        let engine = h.cluster.engine();
        if engine.spec.instance.desire_state == InstanceState::Running {
            let running = h
                .cluster
                .replicas()
                .iter()
                .filter(|r| r.status.instance.running_with_address())
                .count();
            assert_eq!(running, 2, "engine asked to run before its replicas");
        }
    }

    let volume = h.cluster.volume();
    assert_eq!(volume.status.state, VolumeState::Attached);
    assert_eq!(volume.status.robustness, VolumeRobustness::Healthy);
    assert_eq!(volume.status.current_node_id, NODE1);

    let engine = h.cluster.engine();
    // The engine sits on the attach node and exposes the device there.
    assert_eq!(engine.spec.instance.node_id, NODE1);
    assert_eq!(engine.status.instance.current_state, InstanceState::Running);
    assert_eq!(engine.status.endpoint, format!("/dev/{}", VOLUME_NAME));
    assert_eq!(engine.spec.replica_address_map.len(), 2);
    assert_eq!(engine.status.replica_mode_map.len(), 2);
    assert!(engine
        .status
        .replica_mode_map
        .values()
        .all(|m| *m == ReplicaMode::RW));
    for replica in h.cluster.replicas() {
        assert_eq!(replica.spec.healthy_at, Some(TEST_NOW));
    }
}

#[tokio::test]
async fn test_full_detach_flow_stops_engine_before_replicas() {
    let h = harness();
    h.provision_detached().await;
    h.attach_to(NODE1).await;

    // Detach and verify replicas outlive the engine at every step.
    let mut volume = h.cluster.volume();
    volume.spec.node_id = String::new();
    h.cluster.ds.update_volume(volume).unwrap();

    for _ in 0..20 {
        if h.cluster.volume().status.state == VolumeState::Detached {
            break;
        }
        let engine = h.cluster.engine();
        if engine.status.instance.current_state == InstanceState::Running {
            for replica in h.cluster.replicas() {
                assert_ne!(
                    replica.spec.instance.desire_state,
                    InstanceState::Stopped,
                    "replica asked to stop while the engine still runs"
                );
            }
        }
        h.step().await;
    }

    let volume = h.cluster.volume();
    assert_eq!(volume.status.state, VolumeState::Detached);
    for replica in h.cluster.replicas() {
        assert_eq!(
            replica.status.instance.current_state,
            InstanceState::Stopped
        );
    }
    assert_eq!(
        h.cluster.engine().status.instance.current_state,
        InstanceState::Stopped
    );
}

#[tokio::test]
async fn test_replica_failure_recovers_through_rebuild() {
    let h = harness();
    h.provision_detached().await;
    h.attach_to(NODE1).await;

    // Break one replica inside the engine's data path; the failure must
    // travel the report pipeline, not a direct status write.
    let engine = h.cluster.engine();
    let (victim, victim_addr) = engine
        .spec
        .replica_address_map
        .iter()
        .next()
        .map(|(name, addr)| (name.clone(), addr.clone()))
        .expect("quorum member");
    h.sim
        .engine_sim(VOLUME_NAME)
        .unwrap()
        .set_replica_mode(&victim_addr, ReplicaMode::Err);

    h.step_until("replica failure marked", |c| {
        c.replica(&victim).spec.failed_at.is_some()
    })
    .await;
    let failed = h.cluster.replica(&victim);
    assert_eq!(failed.spec.instance.desire_state, InstanceState::Stopped);
    assert!(!h
        .cluster
        .engine()
        .spec
        .replica_address_map
        .contains_key(&victim));

    // Degraded triggers a rebuild; the replacement joins the quorum
    // write-only and is promoted, restoring Healthy.
    h.step_until("volume healthy again", |c| {
        let volume = c.volume();
        volume.status.state == VolumeState::Attached
            && volume.status.robustness == VolumeRobustness::Healthy
    })
    .await;

    let volume = h.cluster.volume();
    assert_eq!(volume.status.last_degraded_at, Some(TEST_NOW));
    let engine = h.cluster.engine();
    assert_eq!(engine.spec.replica_address_map.len(), 2);
    assert!(!engine.spec.replica_address_map.contains_key(&victim));
    assert_eq!(
        h.cluster
            .replicas()
            .iter()
            .filter(|r| r.is_usable())
            .count(),
        2
    );
    // The failed copy is kept for potential salvage, not deleted.
    assert!(h.cluster.replica(&victim).spec.failed_at.is_some());
}

#[tokio::test]
async fn test_deletion_leaves_no_children() {
    let h = harness();
    h.provision_detached().await;

    h.cluster.ds.delete_volume(VOLUME_NAME, TEST_NOW).unwrap();
    h.step_until("volume gone", |c| c.ds.get_volume(VOLUME_NAME).is_err())
        .await;

    assert!(h.cluster.ds.list_engines_by_volume(VOLUME_NAME).is_empty());
    assert!(h.cluster.ds.list_replicas_by_volume(VOLUME_NAME).is_empty());
}
