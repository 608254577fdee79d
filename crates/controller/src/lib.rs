//! # DBV Controller Crate
//!
//! The control plane proper: reconcilers that observe declared state in
//! the datastore and drive the cluster toward it.
//!
//! ## Components
//!
//! - [`queue`]: keyed, deduplicating, rate-limited work queue feeding
//!   reconcile workers from change notifications.
//! - [`owner`]: deterministic volume -> controller ownership election;
//!   at most one controller instance mutates a given volume.
//! - [`volume_controller`]: the volume reconciliation engine, one pass per
//!   queue key, every observable mutation committed through the datastore.
//! - [`node_controller`]: node-scoped configuration (default disks from
//!   labels/annotations, default tags).
//! - [`instance_controller`]: bridges engine/replica desired state to the
//!   orchestrator adapter and reports observed state back.
//! - [`migration`]: one-shot startup upgrades for records written by older
//!   releases.
//! - [`events`]: event recording on terminal transitions and failures.
//!
//! ## Concurrency model
//!
//! Workers run reconcile passes in parallel across keys; the queue
//! guarantees a key is in flight on at most one worker, so per-volume
//! reconciliation is serial. A pass is synchronous and bounded; long waits
//! are expressed as re-enqueue-with-delay, never by parking a worker.

pub mod daemon;
pub mod error;
pub mod events;
pub mod instance_controller;
pub mod migration;
pub mod node_controller;
pub mod owner;
pub mod queue;
pub mod volume_controller;

pub use error::ControllerError;
pub use events::{Event, EventRecorder, EventType, MemoryRecorder, TracingRecorder};
pub use node_controller::NodeController;
pub use queue::WorkQueue;
pub use volume_controller::VolumeController;
