//! Deterministic in-memory orchestrator backend.
//!
//! Simulates a process table: `ensure_instance` registers a process in
//! `Starting`, [`SimOrchestrator::tick`] advances every process one step
//! (`Starting -> Running`, `Stopping -> Stopped`), and test hooks can
//! force arbitrary states. Addresses are assigned deterministically from
//! registration order so tests are reproducible.
//!
//! Engines additionally get a simulated data path: when an engine reaches
//! Running, a [`crate::enginesim::EngineSimulator`] is created for its
//! volume from the launch addresses; re-ensuring the engine with a changed
//! address list adjusts the quorum (newcomers join write-only and are
//! promoted on the next tick), and [`SimOrchestrator::engine_replica_modes`]
//! reports the quorum back.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use dbv_common::{InstanceState, ReplicaMode};

use crate::enginesim::{EngineSimCollection, EngineSimulator};
use crate::{
    InstanceKind, InstanceOrchestrator, InstanceProcessSpec, ObservedInstance, OrchestratorError,
};

const BASE_PORT: u16 = 10_000;

struct SimProcess {
    spec: InstanceProcessSpec,
    observed: ObservedInstance,
    /// Address reserved at registration, applied when Running.
    ip: String,
    port: u16,
    log_requests: u32,
}

#[derive(Default)]
struct SimState {
    processes: HashMap<String, SimProcess>,
    registered: u32,
}

/// In-memory [`InstanceOrchestrator`] used by tests and local runs.
#[derive(Default)]
pub struct SimOrchestrator {
    state: Mutex<SimState>,
    engines: EngineSimCollection,
}

impl SimOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance every process one lifecycle step.
    pub fn tick(&self) {
        let mut started_engines: Vec<(String, Vec<String>)> = Vec::new();
        let mut stopped_engines: Vec<String> = Vec::new();
        {
            let mut state = self.state.lock();
            for process in state.processes.values_mut() {
                match process.observed.state {
                    InstanceState::Starting => {
                        process.observed.state = InstanceState::Running;
                        process.observed.ip = process.ip.clone();
                        process.observed.port = process.port;
                        process.observed.current_image = process.spec.image.clone();
                        if process.spec.kind == InstanceKind::Engine {
                            process.observed.endpoint =
                                format!("/dev/{}", process.spec.volume_name);
                            started_engines.push((
                                process.spec.volume_name.clone(),
                                process.spec.replica_addresses.clone(),
                            ));
                        }
                    }
                    InstanceState::Stopping => {
                        process.observed = ObservedInstance {
                            state: InstanceState::Stopped,
                            ..Default::default()
                        };
                        if process.spec.kind == InstanceKind::Engine {
                            stopped_engines.push(process.spec.volume_name.clone());
                        }
                    }
                    _ => {}
                }
            }
        }
        for (volume, addrs) in started_engines {
            self.engines.ensure(&volume, &addrs);
        }
        for volume in stopped_engines {
            let _ = self.engines.delete(&volume);
        }
        // Rebuilding replicas catch up one tick after they join.
        self.engines.promote_rebuilding();
    }

    /// Force a process into `Error` (test hook).
    pub fn fail_instance(&self, name: &str) {
        if let Some(process) = self.state.lock().processes.get_mut(name) {
            process.observed.state = InstanceState::Error;
        }
    }

    /// Force an arbitrary observed state (test hook).
    pub fn set_observed(&self, name: &str, observed: ObservedInstance) {
        if let Some(process) = self.state.lock().processes.get_mut(name) {
            process.observed = observed;
        }
    }

    /// The simulated data path of a volume's running engine (test hook).
    pub fn engine_sim(&self, volume_name: &str) -> Result<EngineSimulator, OrchestratorError> {
        self.engines.get(volume_name)
    }

    /// How many log captures were requested for an instance.
    pub fn log_requests(&self, name: &str) -> u32 {
        self.state
            .lock()
            .processes
            .get(name)
            .map(|p| p.log_requests)
            .unwrap_or(0)
    }
}

#[async_trait]
impl InstanceOrchestrator for SimOrchestrator {
    async fn ensure_instance(
        &self,
        spec: &InstanceProcessSpec,
    ) -> Result<ObservedInstance, OrchestratorError> {
        let mut sync_engine: Option<(String, Vec<String>)> = None;
        let observed = {
            let mut state = self.state.lock();
            if let Some(process) = state.processes.get_mut(&spec.name) {
                process.spec = spec.clone();
                match process.observed.state {
                    // A stopped process asked for again is restarted;
                    // anything else (including Error) just reports its
                    // current state.
                    InstanceState::Stopped => {
                        process.observed = ObservedInstance {
                            state: InstanceState::Starting,
                            ..Default::default()
                        };
                    }
                    InstanceState::Running if spec.kind == InstanceKind::Engine => {
                        sync_engine = Some((
                            spec.volume_name.clone(),
                            spec.replica_addresses.clone(),
                        ));
                    }
                    _ => {}
                }
                process.observed.clone()
            } else {
                state.registered += 1;
                let index = state.registered;
                let process = SimProcess {
                    spec: spec.clone(),
                    observed: ObservedInstance {
                        state: InstanceState::Starting,
                        ..Default::default()
                    },
                    ip: format!("10.42.{}.{}", index / 256, index % 256),
                    port: BASE_PORT + (index % 1000) as u16,
                    log_requests: 0,
                };
                debug!(instance = %spec.name, node = %spec.node_id, "sim instance registered");
                let observed = process.observed.clone();
                state.processes.insert(spec.name.clone(), process);
                observed
            }
        };
        if let Some((volume, addrs)) = sync_engine {
            self.engines.ensure(&volume, &addrs);
        }
        Ok(observed)
    }

    async fn stop_instance(&self, name: &str) -> Result<ObservedInstance, OrchestratorError> {
        let mut state = self.state.lock();
        match state.processes.get_mut(name) {
            Some(process) => {
                match process.observed.state {
                    InstanceState::Stopped | InstanceState::Stopping => {}
                    _ => process.observed.state = InstanceState::Stopping,
                }
                Ok(process.observed.clone())
            }
            // Stopping something that never ran reports it already stopped.
            None => Ok(ObservedInstance {
                state: InstanceState::Stopped,
                ..Default::default()
            }),
        }
    }

    async fn delete_instance(&self, name: &str) -> Result<(), OrchestratorError> {
        let removed = self.state.lock().processes.remove(name);
        if let Some(process) = removed {
            if process.spec.kind == InstanceKind::Engine {
                let _ = self.engines.delete(&process.spec.volume_name);
            }
        }
        Ok(())
    }

    async fn request_log(&self, name: &str) -> Result<(), OrchestratorError> {
        match self.state.lock().processes.get_mut(name) {
            Some(process) => {
                process.log_requests += 1;
                Ok(())
            }
            None => Err(OrchestratorError::InstanceNotFound(name.to_string())),
        }
    }

    async fn engine_replica_modes(
        &self,
        engine_name: &str,
    ) -> Result<BTreeMap<String, ReplicaMode>, OrchestratorError> {
        let volume = {
            let state = self.state.lock();
            match state.processes.get(engine_name) {
                Some(process) if process.spec.kind == InstanceKind::Engine => {
                    if process.observed.state != InstanceState::Running {
                        return Ok(BTreeMap::new());
                    }
                    process.spec.volume_name.clone()
                }
                Some(_) => {
                    return Err(OrchestratorError::Backend(format!(
                        "{} is not an engine",
                        engine_name
                    )))
                }
                None => return Err(OrchestratorError::InstanceNotFound(engine_name.to_string())),
            }
        };
        match self.engines.get(&volume) {
            Ok(sim) => Ok(sim.replica_list()),
            // Engine marked Running but its data path is already gone:
            // report an empty quorum rather than failing the reporter.
            Err(_) => Ok(BTreeMap::new()),
        }
    }
}
