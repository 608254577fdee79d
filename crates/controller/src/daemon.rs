//! Daemon wiring: queues, workers, event pump and the HTTP surface.
//!
//! Startup order:
//!
//! 1. run startup migrations;
//! 2. register the local node record;
//! 3. start the change-notification pump feeding the work queues;
//! 4. seed the queues with every existing key (initial resync), then
//!    release the cache-sync gate;
//! 5. start the workers and the observability HTTP server.
//!
//! Shutdown drains the queues and lets in-flight reconciles finish.

mod handlers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use dbv_common::condition::{set_condition, ConditionStatus, NODE_CONDITION_READY};
use dbv_common::config::DaemonConfig;
use dbv_common::meta::ObjectMeta;
use dbv_common::{Node, Timestamp};
use dbv_datastore::{DataStore, ObjectKind};
use dbv_orchestrator::InstanceOrchestrator;

use crate::events::{EventRecorder, TracingRecorder, REASON_RETRIES_EXHAUSTED};
use crate::instance_controller::InstanceController;
use crate::migration;
use crate::node_controller::NodeController;
use crate::queue::{CacheSyncGate, WorkQueue, MAX_RETRIES};
use crate::volume_controller::VolumeController;

/// Run the control-plane daemon until interrupted.
pub async fn run(
    config: DaemonConfig,
    ds: DataStore,
    orchestrator: Arc<dyn InstanceOrchestrator>,
) -> anyhow::Result<()> {
    let recorder: Arc<dyn EventRecorder> = Arc::new(TracingRecorder);
    let now = unix_now();

    migration::migrate_legacy_replicas(&ds, now).context("legacy replica migration")?;
    migration::stamp_degraded_volumes(&ds, now).context("degraded volume stamping")?;
    ensure_local_node(&ds, &config.node_id, now)?;

    let volume_controller = Arc::new(
        VolumeController::new(ds.clone(), config.node_id.clone(), Arc::clone(&recorder))
            .with_salvage_requires_revision_counters(config.salvage_requires_revision_counters()),
    );
    let node_controller = Arc::new(NodeController::new(
        ds.clone(),
        config.node_id.clone(),
        Arc::clone(&recorder),
    ));
    let instance_controller = Arc::new(InstanceController::new(
        ds.clone(),
        orchestrator,
        Duration::from_secs(config.instance_call_timeout_secs()),
    ));

    let volume_queue = WorkQueue::new();
    let node_queue = WorkQueue::new();
    let engine_queue = WorkQueue::new();
    let replica_queue = WorkQueue::new();
    let gate = Arc::new(CacheSyncGate::new());
    let shutdown = Arc::new(Notify::new());

    spawn_event_pump(
        &ds,
        &config.node_id,
        volume_queue.clone(),
        node_queue.clone(),
        engine_queue.clone(),
        replica_queue.clone(),
    );

    // Initial resync before workers start.
    for volume in ds.list_volumes() {
        volume_queue.add(volume.name());
    }
    for node in ds.list_nodes() {
        node_queue.add(node.name());
    }
    for engine in ds.list_engines() {
        engine_queue.add(engine.name());
    }
    for replica in ds.list_replicas() {
        replica_queue.add(replica.name());
    }
    gate.mark_synced();

    for worker in 0..config.workers() {
        spawn_volume_worker(
            worker,
            volume_queue.clone(),
            Arc::clone(&volume_controller),
            Arc::clone(&recorder),
            Arc::clone(&gate),
        );
    }
    spawn_node_worker(node_queue.clone(), node_controller, Arc::clone(&gate));
    spawn_instance_workers(
        engine_queue.clone(),
        replica_queue.clone(),
        instance_controller,
        Arc::clone(&gate),
    );

    let server = handlers::serve(
        config.listen_addr().to_string(),
        ds.clone(),
        Arc::clone(&shutdown),
    );
    let server_handle = tokio::spawn(server);

    info!(
        node = %config.node_id,
        listen = config.listen_addr(),
        "control plane started"
    );
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");

    volume_queue.shut_down();
    node_queue.shut_down();
    engine_queue.shut_down();
    replica_queue.shut_down();
    shutdown.notify_waiters();
    server_handle.await.ok();
    Ok(())
}

fn unix_now() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Register (or refresh) this daemon's node record.
fn ensure_local_node(ds: &DataStore, node_id: &str, now: Timestamp) -> anyhow::Result<()> {
    let mut node = match ds.get_node(node_id) {
        Ok(node) => node,
        Err(e) if e.is_not_found() => {
            let mut node = Node {
                meta: ObjectMeta::named(node_id),
                ..Default::default()
            };
            node.spec.allow_scheduling = true;
            ds.create_node(node.clone()).context("register local node")?;
            ds.get_node(node_id)?
        }
        Err(e) => return Err(e.into()),
    };
    set_condition(
        &mut node.status.conditions,
        NODE_CONDITION_READY,
        ConditionStatus::True,
        "",
        "",
        now,
    );
    ds.update_node_status(node).context("refresh local node")?;
    Ok(())
}

/// Fan change notifications out to the per-controller queues.
fn spawn_event_pump(
    ds: &DataStore,
    node_id: &str,
    volume_queue: WorkQueue,
    node_queue: WorkQueue,
    engine_queue: WorkQueue,
    replica_queue: WorkQueue,
) {
    let mut events = ds.subscribe();
    let ds = ds.clone();
    let node_id = node_id.to_string();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    // Dropped notifications heal via the next full resync.
                    warn!(missed, "event stream lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };
            match event.kind {
                ObjectKind::Volume => volume_queue.add(&event.name),
                ObjectKind::Engine => {
                    engine_queue.add(&event.name);
                    if let Some(volume) = &event.volume {
                        volume_queue.add(volume);
                    }
                }
                ObjectKind::Replica => {
                    replica_queue.add(&event.name);
                    if let Some(volume) = &event.volume {
                        volume_queue.add(volume);
                    }
                }
                ObjectKind::Node => {
                    node_queue.add(&event.name);
                    // Node liveness moves ownership and scheduling for
                    // every volume.
                    for volume in ds.list_volumes() {
                        volume_queue.add(volume.name());
                    }
                }
                ObjectKind::Disk => {}
                ObjectKind::Setting => node_queue.add(&node_id),
            }
        }
    });
}

fn spawn_volume_worker(
    index: usize,
    queue: WorkQueue,
    controller: Arc<VolumeController>,
    recorder: Arc<dyn EventRecorder>,
    gate: Arc<CacheSyncGate>,
) {
    tokio::spawn(async move {
        gate.wait_synced().await;
        debug!(worker = index, "volume worker started");
        while let Some(key) = queue.get().await {
            match controller.reconcile(&key) {
                Ok(requeue) => {
                    queue.forget(&key);
                    if let Some(delay) = requeue {
                        queue.add_after(&key, delay);
                    }
                }
                Err(e) if e.is_conflict() => {
                    debug!(volume = %key, "write conflict, requeueing");
                    queue.add(&key);
                }
                Err(e) => {
                    if queue.num_requeues(&key) < MAX_RETRIES {
                        warn!(volume = %key, "reconcile failed: {}", e);
                        queue.add_rate_limited(&key);
                    } else {
                        error!(volume = %key, "dropping after {} retries: {}", MAX_RETRIES, e);
                        recorder.warning(
                            ObjectKind::Volume,
                            &key,
                            REASON_RETRIES_EXHAUSTED,
                            &e.to_string(),
                        );
                        queue.forget(&key);
                    }
                }
            }
            queue.done(&key);
        }
    });
}

fn spawn_node_worker(
    queue: WorkQueue,
    controller: Arc<NodeController>,
    gate: Arc<CacheSyncGate>,
) {
    tokio::spawn(async move {
        gate.wait_synced().await;
        while let Some(key) = queue.get().await {
            match controller.reconcile(&key) {
                Ok(()) => queue.forget(&key),
                Err(e) if e.is_conflict() => queue.add(&key),
                Err(e) => {
                    if queue.num_requeues(&key) < MAX_RETRIES {
                        warn!(node = %key, "node reconcile failed: {}", e);
                        queue.add_rate_limited(&key);
                    } else {
                        error!(node = %key, "dropping node key: {}", e);
                        queue.forget(&key);
                    }
                }
            }
            queue.done(&key);
        }
    });
}

fn spawn_instance_workers(
    engine_queue: WorkQueue,
    replica_queue: WorkQueue,
    controller: Arc<InstanceController>,
    gate: Arc<CacheSyncGate>,
) {
    {
        let controller = Arc::clone(&controller);
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            gate.wait_synced().await;
            while let Some(key) = engine_queue.get().await {
                match controller.reconcile_engine(&key).await {
                    Ok(()) => engine_queue.forget(&key),
                    Err(e) if e.is_conflict() => engine_queue.add(&key),
                    Err(e) => {
                        if engine_queue.num_requeues(&key) < MAX_RETRIES {
                            warn!(engine = %key, "instance reconcile failed: {}", e);
                            engine_queue.add_rate_limited(&key);
                        } else {
                            engine_queue.forget(&key);
                        }
                    }
                }
                engine_queue.done(&key);
            }
        });
    }
    tokio::spawn(async move {
        gate.wait_synced().await;
        while let Some(key) = replica_queue.get().await {
            match controller.reconcile_replica(&key).await {
                Ok(()) => replica_queue.forget(&key),
                Err(e) if e.is_conflict() => replica_queue.add(&key),
                Err(e) => {
                    if replica_queue.num_requeues(&key) < MAX_RETRIES {
                        warn!(replica = %key, "instance reconcile failed: {}", e);
                        replica_queue.add_rate_limited(&key);
                    } else {
                        replica_queue.forget(&key);
                    }
                }
            }
            replica_queue.done(&key);
        }
    });
}
