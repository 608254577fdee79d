//! Event recording.
//!
//! Events are emitted on terminal state transitions (Attached, Detached,
//! Faulted, DeletionCompleted) and on sustained failures. Together with
//! volume conditions and robustness they form the user-visible failure
//! surface.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use dbv_datastore::ObjectKind;

pub const REASON_ATTACHED: &str = "Attached";
pub const REASON_DETACHED: &str = "Detached";
pub const REASON_FAULTED: &str = "Faulted";
pub const REASON_SALVAGE: &str = "Salvage";
pub const REASON_DELETION_COMPLETED: &str = "DeletionCompleted";
pub const REASON_SCHEDULING_FAILURE: &str = "ReplicaSchedulingFailure";
pub const REASON_RESTORE_FAILURE: &str = "RestoreFailure";
pub const REASON_RETRIES_EXHAUSTED: &str = "RetriesExhausted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// One recorded event.
#[derive(Debug, Clone)]
pub struct Event {
    pub object_kind: ObjectKind,
    pub object_name: String,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// Sink for controller events.
pub trait EventRecorder: Send + Sync {
    fn record(&self, event: Event);

    fn normal(&self, kind: ObjectKind, name: &str, reason: &str, message: &str) {
        self.record(Event {
            object_kind: kind,
            object_name: name.to_string(),
            event_type: EventType::Normal,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }

    fn warning(&self, kind: ObjectKind, name: &str, reason: &str, message: &str) {
        self.record(Event {
            object_kind: kind,
            object_name: name.to_string(),
            event_type: EventType::Warning,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

/// Default recorder: events land in the structured log.
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn record(&self, event: Event) {
        match event.event_type {
            EventType::Normal => info!(
                kind = %event.object_kind,
                object = %event.object_name,
                reason = %event.reason,
                "{}",
                event.message
            ),
            EventType::Warning => warn!(
                kind = %event.object_kind,
                object = %event.object_name,
                reason = %event.reason,
                "{}",
                event.message
            ),
        }
    }
}

/// Test recorder that keeps every event.
#[derive(Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<Event>>,
}

impl MemoryRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}
