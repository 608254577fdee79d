//! The versioned in-process object store.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use dbv_common::labels::VOLUME_KEY;
use dbv_common::meta::ObjectMeta;
use dbv_common::settings::{self, Setting, SettingName};
use dbv_common::{Disk, Engine, Node, Replica, Timestamp, Volume};

use crate::error::DatastoreError;
use crate::event::{ObjectKind, WatchEvent, WatchOp};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

// ════════════════════════════════════════════════════════════════════════════
// STORED ENTITY PLUMBING
// ════════════════════════════════════════════════════════════════════════════

/// Implemented by every entity the store can hold.
trait Stored: Clone {
    const KIND: ObjectKind;
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    /// Owning volume, for child-event enrichment.
    fn volume_of(&self) -> Option<String> {
        None
    }
}

impl Stored for Volume {
    const KIND: ObjectKind = ObjectKind::Volume;
    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
    fn volume_of(&self) -> Option<String> {
        Some(self.meta.name.clone())
    }
}

impl Stored for Engine {
    const KIND: ObjectKind = ObjectKind::Engine;
    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
    fn volume_of(&self) -> Option<String> {
        self.meta.labels.get(VOLUME_KEY).cloned()
    }
}

impl Stored for Replica {
    const KIND: ObjectKind = ObjectKind::Replica;
    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
    fn volume_of(&self) -> Option<String> {
        self.meta.labels.get(VOLUME_KEY).cloned()
    }
}

impl Stored for Node {
    const KIND: ObjectKind = ObjectKind::Node;
    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

impl Stored for Disk {
    const KIND: ObjectKind = ObjectKind::Disk;
    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

impl Stored for Setting {
    const KIND: ObjectKind = ObjectKind::Setting;
    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

/// One kind's objects plus the shared event sender.
struct Bucket<T: Stored> {
    objects: RwLock<HashMap<String, T>>,
    events: broadcast::Sender<WatchEvent>,
}

impl<T: Stored> Bucket<T> {
    fn new(events: broadcast::Sender<WatchEvent>) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn emit(&self, obj: &T, op: WatchOp) {
        // Nobody listening is fine; controllers also resync periodically.
        let _ = self.events.send(WatchEvent {
            kind: T::KIND,
            name: obj.meta().name.clone(),
            op,
            volume: obj.volume_of(),
        });
    }

    fn create(&self, mut obj: T) -> Result<T, DatastoreError> {
        if obj.meta().name.is_empty() {
            return Err(DatastoreError::Invalid {
                kind: T::KIND,
                reason: "empty object name".to_string(),
            });
        }
        let mut objects = self.objects.write();
        if objects.contains_key(&obj.meta().name) {
            return Err(DatastoreError::AlreadyExists {
                kind: T::KIND,
                name: obj.meta().name.clone(),
            });
        }
        obj.meta_mut().resource_version = 1;
        objects.insert(obj.meta().name.clone(), obj.clone());
        drop(objects);
        self.emit(&obj, WatchOp::Added);
        Ok(obj)
    }

    fn get(&self, name: &str) -> Result<T, DatastoreError> {
        self.objects
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DatastoreError::NotFound {
                kind: T::KIND,
                name: name.to_string(),
            })
    }

    fn list(&self) -> Vec<T> {
        let mut items: Vec<T> = self.objects.read().values().cloned().collect();
        items.sort_by(|a, b| a.meta().name.cmp(&b.meta().name));
        items
    }

    /// Commit `obj` if its resource version still matches the stored one.
    fn update(&self, mut obj: T) -> Result<T, DatastoreError> {
        let mut objects = self.objects.write();
        let stored = objects
            .get(&obj.meta().name)
            .ok_or_else(|| DatastoreError::NotFound {
                kind: T::KIND,
                name: obj.meta().name.clone(),
            })?;
        if stored.meta().resource_version != obj.meta().resource_version {
            return Err(DatastoreError::Conflict {
                kind: T::KIND,
                name: obj.meta().name.clone(),
            });
        }
        obj.meta_mut().resource_version += 1;
        objects.insert(obj.meta().name.clone(), obj.clone());
        drop(objects);
        self.emit(&obj, WatchOp::Updated);
        Ok(obj)
    }

    /// Physically remove the object, emitting a Deleted event.
    fn remove(&self, name: &str) -> Result<(), DatastoreError> {
        let removed = self.objects.write().remove(name);
        match removed {
            Some(obj) => {
                self.emit(&obj, WatchOp::Deleted);
                Ok(())
            }
            None => Err(DatastoreError::NotFound {
                kind: T::KIND,
                name: name.to_string(),
            }),
        }
    }

    /// Two-phase delete: stamp the deletion timestamp when finalizers are
    /// present, remove outright when none are.
    fn delete(&self, name: &str, now: Timestamp) -> Result<(), DatastoreError> {
        let mut objects = self.objects.write();
        let obj = match objects.get_mut(name) {
            Some(obj) => obj,
            // Teardown treats a missing object as already deleted.
            None => return Ok(()),
        };
        if obj.meta().finalizers.is_empty() {
            if let Some(obj) = objects.remove(name) {
                drop(objects);
                self.emit(&obj, WatchOp::Deleted);
            }
            return Ok(());
        }
        if obj.meta().deletion_timestamp.is_none() {
            obj.meta_mut().deletion_timestamp = Some(now);
            obj.meta_mut().resource_version += 1;
            let cloned = obj.clone();
            drop(objects);
            self.emit(&cloned, WatchOp::Updated);
        }
        Ok(())
    }

    /// Clear one finalizer token; removes the object once deletion has been
    /// requested and no tokens remain.
    fn remove_finalizer(&self, name: &str, token: &str) -> Result<(), DatastoreError> {
        let mut objects = self.objects.write();
        let obj = objects
            .get_mut(name)
            .ok_or_else(|| DatastoreError::NotFound {
                kind: T::KIND,
                name: name.to_string(),
            })?;
        obj.meta_mut().finalizers.retain(|t| t != token);
        obj.meta_mut().resource_version += 1;
        if obj.meta().deletion_requested() && obj.meta().finalizers.is_empty() {
            if let Some(obj) = objects.remove(name) {
                drop(objects);
                self.emit(&obj, WatchOp::Deleted);
            }
        } else {
            let cloned = obj.clone();
            drop(objects);
            self.emit(&cloned, WatchOp::Updated);
        }
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// DATASTORE
// ════════════════════════════════════════════════════════════════════════════

/// Typed, versioned store for every control-plane entity.
///
/// Cheap to clone; clones share the same underlying state.
#[derive(Clone)]
pub struct DataStore {
    inner: Arc<Inner>,
}

struct Inner {
    events: broadcast::Sender<WatchEvent>,
    volumes: Bucket<Volume>,
    engines: Bucket<Engine>,
    replicas: Bucket<Replica>,
    nodes: Bucket<Node>,
    disks: Bucket<Disk>,
    settings: Bucket<Setting>,
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                volumes: Bucket::new(events.clone()),
                engines: Bucket::new(events.clone()),
                replicas: Bucket::new(events.clone()),
                nodes: Bucket::new(events.clone()),
                disks: Bucket::new(events.clone()),
                settings: Bucket::new(events.clone()),
                events,
            }),
        }
    }

    /// Subscribe to the change stream. Slow subscribers may observe lag;
    /// controllers tolerate that by resyncing on their own cadence.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.inner.events.subscribe()
    }

    // ── volumes ─────────────────────────────────────────────────────────────

    pub fn create_volume(&self, volume: Volume) -> Result<Volume, DatastoreError> {
        self.inner.volumes.create(volume)
    }

    pub fn get_volume(&self, name: &str) -> Result<Volume, DatastoreError> {
        self.inner.volumes.get(name)
    }

    pub fn list_volumes(&self) -> Vec<Volume> {
        self.inner.volumes.list()
    }

    pub fn update_volume(&self, volume: Volume) -> Result<Volume, DatastoreError> {
        self.inner.volumes.update(volume)
    }

    /// Status writes go through the same versioned commit; the separate
    /// entry point keeps the spec/status write authority split visible.
    pub fn update_volume_status(&self, volume: Volume) -> Result<Volume, DatastoreError> {
        self.inner.volumes.update(volume)
    }

    pub fn delete_volume(&self, name: &str, now: Timestamp) -> Result<(), DatastoreError> {
        debug!(volume = name, "deletion requested");
        self.inner.volumes.delete(name, now)
    }

    pub fn remove_volume_finalizer(&self, name: &str, token: &str) -> Result<(), DatastoreError> {
        self.inner.volumes.remove_finalizer(name, token)
    }

    // ── engines ─────────────────────────────────────────────────────────────

    pub fn create_engine(&self, engine: Engine) -> Result<Engine, DatastoreError> {
        self.inner.engines.create(engine)
    }

    pub fn get_engine(&self, name: &str) -> Result<Engine, DatastoreError> {
        self.inner.engines.get(name)
    }

    pub fn list_engines(&self) -> Vec<Engine> {
        self.inner.engines.list()
    }

    pub fn list_engines_by_volume(&self, volume_name: &str) -> Vec<Engine> {
        self.inner
            .engines
            .list()
            .into_iter()
            .filter(|e| e.meta.labels.get(VOLUME_KEY).map(String::as_str) == Some(volume_name))
            .collect()
    }

    pub fn update_engine(&self, engine: Engine) -> Result<Engine, DatastoreError> {
        self.inner.engines.update(engine)
    }

    pub fn update_engine_status(&self, engine: Engine) -> Result<Engine, DatastoreError> {
        self.inner.engines.update(engine)
    }

    /// Engines carry no finalizers; deletion is immediate.
    pub fn delete_engine(&self, name: &str) -> Result<(), DatastoreError> {
        match self.inner.engines.remove(name) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── replicas ────────────────────────────────────────────────────────────

    pub fn create_replica(&self, replica: Replica) -> Result<Replica, DatastoreError> {
        self.inner.replicas.create(replica)
    }

    pub fn get_replica(&self, name: &str) -> Result<Replica, DatastoreError> {
        self.inner.replicas.get(name)
    }

    pub fn list_replicas(&self) -> Vec<Replica> {
        self.inner.replicas.list()
    }

    pub fn list_replicas_by_volume(&self, volume_name: &str) -> Vec<Replica> {
        self.inner
            .replicas
            .list()
            .into_iter()
            .filter(|r| r.meta.labels.get(VOLUME_KEY).map(String::as_str) == Some(volume_name))
            .collect()
    }

    pub fn update_replica(&self, replica: Replica) -> Result<Replica, DatastoreError> {
        self.inner.replicas.update(replica)
    }

    pub fn update_replica_status(&self, replica: Replica) -> Result<Replica, DatastoreError> {
        self.inner.replicas.update(replica)
    }

    /// Replicas carry no finalizers; deletion is immediate.
    pub fn delete_replica(&self, name: &str) -> Result<(), DatastoreError> {
        match self.inner.replicas.remove(name) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── nodes ───────────────────────────────────────────────────────────────

    pub fn create_node(&self, node: Node) -> Result<Node, DatastoreError> {
        self.inner.nodes.create(node)
    }

    pub fn get_node(&self, name: &str) -> Result<Node, DatastoreError> {
        self.inner.nodes.get(name)
    }

    pub fn list_nodes(&self) -> Vec<Node> {
        self.inner.nodes.list()
    }

    pub fn update_node(&self, node: Node) -> Result<Node, DatastoreError> {
        self.inner.nodes.update(node)
    }

    pub fn update_node_status(&self, node: Node) -> Result<Node, DatastoreError> {
        self.inner.nodes.update(node)
    }

    pub fn delete_node(&self, name: &str) -> Result<(), DatastoreError> {
        match self.inner.nodes.remove(name) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── disks ───────────────────────────────────────────────────────────────

    pub fn create_disk(&self, disk: Disk) -> Result<Disk, DatastoreError> {
        self.inner.disks.create(disk)
    }

    pub fn get_disk(&self, name: &str) -> Result<Disk, DatastoreError> {
        self.inner.disks.get(name)
    }

    pub fn list_disks(&self) -> Vec<Disk> {
        self.inner.disks.list()
    }

    pub fn list_disks_by_node(&self, node_name: &str) -> Vec<Disk> {
        self.inner
            .disks
            .list()
            .into_iter()
            .filter(|d| d.spec.node_id == node_name)
            .collect()
    }

    pub fn update_disk(&self, disk: Disk) -> Result<Disk, DatastoreError> {
        self.inner.disks.update(disk)
    }

    pub fn update_disk_status(&self, disk: Disk) -> Result<Disk, DatastoreError> {
        self.inner.disks.update(disk)
    }

    pub fn delete_disk(&self, name: &str) -> Result<(), DatastoreError> {
        match self.inner.disks.remove(name) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── settings ────────────────────────────────────────────────────────────

    /// Write a setting value, creating the record if needed.
    pub fn set_setting(&self, name: SettingName, value: &str) -> Result<(), DatastoreError> {
        match self.inner.settings.get(name.as_str()) {
            Ok(mut setting) => {
                setting.value = value.to_string();
                self.inner.settings.update(setting)?;
            }
            Err(e) if e.is_not_found() => {
                self.inner.settings.create(Setting {
                    meta: ObjectMeta::named(name.as_str()),
                    value: value.to_string(),
                })?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Raw value of a setting, falling back to the registry default.
    pub fn get_setting_value(&self, name: SettingName) -> String {
        match self.inner.settings.get(name.as_str()) {
            Ok(setting) if !setting.value.is_empty() => setting.value,
            _ => name.default_value().to_string(),
        }
    }

    pub fn get_setting_as_bool(&self, name: SettingName) -> Result<bool, DatastoreError> {
        let value = self.get_setting_value(name);
        settings::value_as_bool(name, &value).map_err(|e| DatastoreError::Invalid {
            kind: ObjectKind::Setting,
            reason: e.to_string(),
        })
    }

    pub fn get_setting_as_u64(&self, name: SettingName) -> Result<u64, DatastoreError> {
        let value = self.get_setting_value(name);
        settings::value_as_u64(name, &value).map_err(|e| DatastoreError::Invalid {
            kind: ObjectKind::Setting,
            reason: e.to_string(),
        })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
