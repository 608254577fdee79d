//! Shared fixtures for controller integration tests.
//!
//! Mirrors a two-node cluster with one disk per node and a two-replica
//! volume. Every test pins the clock to [`TEST_NOW`] so timestamp fields
//! compare exactly.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use dbv_common::condition::{
    set_condition, ConditionStatus, NODE_CONDITION_READY, VOLUME_CONDITION_RESTORE,
    VOLUME_CONDITION_SCHEDULED,
};
use dbv_common::labels::{backup_url, generate_engine_name, generate_replica_name, CORE_FINALIZER, VOLUME_KEY};
use dbv_common::meta::ObjectMeta;
use dbv_common::node::DiskState;
use dbv_common::{
    Disk, DiskSpec, DiskStatus, Engine, InstanceState, Node, Replica, Volume,
};
use dbv_controller::events::MemoryRecorder;
use dbv_controller::owner;
use dbv_controller::VolumeController;
use dbv_datastore::DataStore;

pub const TEST_NOW: u64 = 1_700_000_000;
pub const OWNER: &str = "node-1";
pub const NODE1: &str = "node-1";
pub const NODE2: &str = "node-2";
pub const DISK1: &str = "disk-1";
pub const DISK2: &str = "disk-2";
pub const IMAGE: &str = "dbv-engine:v1.0.0";
pub const IMAGE_V2: &str = "dbv-engine:v1.1.0";
pub const GIB: u64 = 1 << 30;
pub const VOLUME_NAME: &str = "vol-1";
pub const BACKUP_TARGET: &str = "s3://backups@us-east-1/dbv";
pub const BACKUP_NAME: &str = "backup-0001";
pub const BACKUP_VOLUME: &str = "vol-src";

pub fn test_backup_url() -> String {
    backup_url(BACKUP_TARGET, BACKUP_NAME, BACKUP_VOLUME)
}

pub fn make_node(name: &str, allow_scheduling: bool, ready: bool, reason: &str) -> Node {
    let mut node = Node {
        meta: ObjectMeta::named(name),
        ..Default::default()
    };
    node.spec.allow_scheduling = allow_scheduling;
    set_condition(
        &mut node.status.conditions,
        NODE_CONDITION_READY,
        if ready {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        },
        reason,
        "",
        TEST_NOW,
    );
    node
}

pub fn make_disk(id: &str, node: &str) -> Disk {
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
            storage_available: 40 * GIB,
            storage_scheduled: 0,
            conditions: Default::default(),
        },
    }
}

/// A two-replica volume the way the API server would create it.
pub fn base_volume() -> Volume {
    let mut volume = Volume {
        meta: ObjectMeta::named(VOLUME_NAME).with_finalizer(CORE_FINALIZER),
        ..Default::default()
    };
    volume.spec.size = GIB;
    volume.spec.number_of_replicas = 2;
    volume.spec.engine_image = IMAGE.to_string();
    volume.spec.stale_replica_timeout = 20;
    volume.status.owner_id = OWNER.to_string();
    set_condition(
        &mut volume.status.conditions,
        VOLUME_CONDITION_SCHEDULED,
        ConditionStatus::True,
        "",
        "",
        TEST_NOW,
    );
    set_condition(
        &mut volume.status.conditions,
        VOLUME_CONDITION_RESTORE,
        ConditionStatus::False,
        "",
        "",
        TEST_NOW,
    );
    volume
}

pub fn new_engine_for(volume: &Volume) -> Engine {
    let mut engine = Engine {
        meta: ObjectMeta::named(generate_engine_name(volume.name()))
            .with_label(VOLUME_KEY, volume.name()),
        ..Default::default()
    };
    engine.spec.instance.volume_name = volume.name().to_string();
    engine.spec.instance.volume_size = volume.spec.size;
    engine.spec.instance.engine_image = volume.spec.engine_image.clone();
    engine.spec.instance.desire_state = InstanceState::Stopped;
    engine.spec.revision_counter_disabled = volume.spec.revision_counter_disabled;
    engine
}

pub fn new_replica_for(volume: &Volume, engine: &Engine, node: &str, disk: &str) -> Replica {
    let name = generate_replica_name(volume.name());
    let mut replica = Replica {
        meta: ObjectMeta::named(&name).with_label(VOLUME_KEY, volume.name()),
        ..Default::default()
    };
    replica.spec.instance.volume_name = volume.name().to_string();
    replica.spec.instance.volume_size = volume.spec.size;
    replica.spec.instance.engine_image = volume.spec.engine_image.clone();
    replica.spec.instance.desire_state = InstanceState::Stopped;
    replica.spec.instance.node_id = node.to_string();
    replica.spec.engine_name = engine.name().to_string();
    replica.spec.disk_id = disk.to_string();
    replica.spec.disk_path = format!("/var/lib/dbv/{}", disk);
    replica.spec.data_directory_name = name;
    replica.spec.active = true;
    replica.spec.revision_counter_disabled = volume.spec.revision_counter_disabled;
    replica
}

/// Give a child instance a running status with a unique address.
pub fn set_running(state: &mut dbv_common::InstanceStatus, index: u16) {
    state.current_state = InstanceState::Running;
    state.ip = format!("10.240.0.{}", index);
    state.port = 10_000 + index;
    state.current_image = IMAGE.to_string();
}

pub struct TestCluster {
    pub ds: DataStore,
    /// One controller instance per cluster node, as each daemon runs one.
    controllers: HashMap<String, VolumeController>,
    pub recorder: Arc<MemoryRecorder>,
}

/// Two ready, schedulable nodes with one disk each.
pub fn default_cluster() -> TestCluster {
    cluster_with(
        vec![
            make_node(NODE1, true, true, ""),
            make_node(NODE2, true, true, ""),
        ],
        vec![make_disk(DISK1, NODE1), make_disk(DISK2, NODE2)],
    )
}

pub fn cluster_with(nodes: Vec<Node>, disks: Vec<Disk>) -> TestCluster {
    let ds = DataStore::new();
    let recorder = MemoryRecorder::new();
    let mut controllers = HashMap::new();
    for node in &nodes {
        controllers.insert(
            node.name().to_string(),
            VolumeController::new(ds.clone(), node.name(), recorder.clone())
                .with_now_fn(Arc::new(|| TEST_NOW)),
        );
    }
    for node in nodes {
        ds.create_node(node).expect("seed node");
    }
    for disk in disks {
        ds.create_disk(disk).expect("seed disk");
    }
    TestCluster {
        ds,
        controllers,
        recorder,
    }
}

impl TestCluster {
    pub fn seed_volume(&self, volume: Volume) -> Volume {
        self.ds.create_volume(volume).expect("seed volume")
    }

    pub fn seed_engine(&self, engine: Engine) -> Engine {
        self.ds.create_engine(engine).expect("seed engine")
    }

    pub fn seed_replica(&self, replica: Replica) -> Replica {
        self.ds.create_replica(replica).expect("seed replica")
    }

    /// Whom the cluster would elect for the volume right now.
    pub fn elected_owner(&self) -> String {
        let volume = self.ds.get_volume(VOLUME_NAME).expect("volume");
        let engines = self.ds.list_engines_by_volume(VOLUME_NAME);
        let nodes = self.ds.list_nodes();
        owner::elect_owner(&volume, &engines, &nodes).expect("a ready node")
    }

    /// One reconcile pass, run by the elected owner's controller the way
    /// the daemons would between them.
    pub fn reconcile(&self) -> Option<std::time::Duration> {
        let owner = self.elected_owner();
        self.controllers
            .get(&owner)
            .unwrap_or_else(|| panic!("no controller for owner {}", owner))
            .reconcile(VOLUME_NAME)
            .expect("reconcile")
    }

    pub fn volume(&self) -> Volume {
        self.ds.get_volume(VOLUME_NAME).expect("volume")
    }

    pub fn engine(&self) -> Engine {
        let engines = self.ds.list_engines_by_volume(VOLUME_NAME);
        assert_eq!(engines.len(), 1, "expected exactly one engine");
        engines.into_iter().next().expect("engine")
    }

    pub fn replicas(&self) -> Vec<Replica> {
        self.ds.list_replicas_by_volume(VOLUME_NAME)
    }

    pub fn replica(&self, name: &str) -> Replica {
        self.ds.get_replica(name).expect("replica")
    }
}
