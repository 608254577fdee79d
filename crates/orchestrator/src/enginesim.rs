//! Simulated engine data path.
//!
//! Models an engine's-eye view of a volume: which replica addresses are in
//! the quorum and what mode each one is in. One simulator per volume, held
//! in a collection keyed by volume name. [`super::SimOrchestrator`] creates
//! a simulator when an engine process starts, keeps its membership in line
//! with the addresses the engine was launched with, and serves replica-mode
//! reports from it.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use dbv_common::ReplicaMode;

use crate::OrchestratorError;

/// Parameters for creating one engine simulator.
#[derive(Debug, Clone)]
pub struct EngineSimRequest {
    pub volume_name: String,
    pub volume_size: u64,
    pub replica_addrs: Vec<String>,
}

/// One simulated engine: replica address -> mode.
#[derive(Clone, Default, Debug)]
pub struct EngineSimulator {
    replicas: Arc<Mutex<BTreeMap<String, ReplicaMode>>>,
}

impl EngineSimulator {
    fn with_replicas(addrs: &[String]) -> Self {
        let sim = Self::default();
        {
            let mut replicas = sim.replicas.lock();
            for addr in addrs {
                replicas.insert(addr.clone(), ReplicaMode::RW);
            }
        }
        sim
    }

    /// Current quorum: address -> mode.
    pub fn replica_list(&self) -> BTreeMap<String, ReplicaMode> {
        self.replicas.lock().clone()
    }

    /// Add a replica; rebuilding replicas join write-only until the
    /// simulator promotes them.
    pub fn replica_add(&self, addr: &str, rebuild: bool) {
        let mode = if rebuild {
            ReplicaMode::WO
        } else {
            ReplicaMode::RW
        };
        self.replicas.lock().insert(addr.to_string(), mode);
    }

    pub fn replica_remove(&self, addr: &str) {
        self.replicas.lock().remove(addr);
    }

    /// Force a mode, e.g. `Err` to simulate a replica failure.
    pub fn set_replica_mode(&self, addr: &str, mode: ReplicaMode) {
        if let Some(entry) = self.replicas.lock().get_mut(addr) {
            *entry = mode;
        }
    }

    /// Bring membership in line with the launcher's address list.
    /// Departed addresses are dropped, newcomers join write-only.
    pub fn sync_membership(&self, addrs: &[String]) {
        let mut replicas = self.replicas.lock();
        replicas.retain(|addr, _| addrs.iter().any(|a| a == addr));
        for addr in addrs {
            replicas.entry(addr.clone()).or_insert(ReplicaMode::WO);
        }
    }

    /// Promote write-only rebuilds that have caught up.
    pub fn promote_rebuilding(&self) {
        for mode in self.replicas.lock().values_mut() {
            if *mode == ReplicaMode::WO {
                *mode = ReplicaMode::RW;
            }
        }
    }
}

/// All engine simulators, keyed by volume name.
#[derive(Default)]
pub struct EngineSimCollection {
    simulators: Mutex<BTreeMap<String, EngineSimulator>>,
}

impl EngineSimCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a simulator for a volume. Duplicate creation is an error.
    pub fn create(&self, req: &EngineSimRequest) -> Result<EngineSimulator, OrchestratorError> {
        let mut simulators = self.simulators.lock();
        if simulators.contains_key(&req.volume_name) {
            return Err(OrchestratorError::Backend(format!(
                "duplicate simulator for volume {}",
                req.volume_name
            )));
        }
        let sim = EngineSimulator::with_replicas(&req.replica_addrs);
        simulators.insert(req.volume_name.clone(), sim.clone());
        Ok(sim)
    }

    /// Create the simulator on engine start, or reconcile membership on an
    /// already-running engine.
    pub fn ensure(&self, volume_name: &str, addrs: &[String]) -> EngineSimulator {
        let mut simulators = self.simulators.lock();
        if let Some(sim) = simulators.get(volume_name) {
            let sim = sim.clone();
            drop(simulators);
            sim.sync_membership(addrs);
            return sim;
        }
        let sim = EngineSimulator::with_replicas(addrs);
        simulators.insert(volume_name.to_string(), sim.clone());
        sim
    }

    pub fn get(&self, volume_name: &str) -> Result<EngineSimulator, OrchestratorError> {
        self.simulators
            .lock()
            .get(volume_name)
            .cloned()
            .ok_or_else(|| OrchestratorError::InstanceNotFound(volume_name.to_string()))
    }

    pub fn delete(&self, volume_name: &str) -> Result<(), OrchestratorError> {
        self.simulators
            .lock()
            .remove(volume_name)
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::InstanceNotFound(volume_name.to_string()))
    }

    /// Promote every rebuilding replica across all simulators.
    pub fn promote_rebuilding(&self) {
        for sim in self.simulators.lock().values() {
            sim.promote_rebuilding();
        }
    }
}
