//! # DBV Common Crate
//!
//! Shared entity model and utilities for the DBV control plane.
//!
//! ## Modules
//! - `meta`: object metadata shared by every stored entity
//! - `condition`: status conditions with transition tracking
//! - `instance`: instance state machine shared by engines and replicas
//! - `volume`, `engine`, `replica`: the volume entity family
//! - `node`: storage nodes and disks
//! - `settings`: typed registry of cluster tunables
//! - `labels`: label/annotation keys and child-name generation
//! - `config`: daemon configuration loading
//!
//! ## Entity relationship
//! ```text
//! ┌────────┐ 1..1 ┌────────┐
//! │ Volume │─────▶│ Engine │   (one active, plus one during live upgrade)
//! └───┬────┘      └────────┘
//!     │ 1..N
//!     ▼
//! ┌─────────┐ scheduled on ┌──────┐ hosted by ┌──────┐
//! │ Replica │─────────────▶│ Disk │──────────▶│ Node │
//! └─────────┘              └──────┘           └──────┘
//! ```
//!
//! Children never hold references to their parent; they carry the volume
//! name as a label and the parent rediscovers them by label lookup.

pub mod condition;
pub mod config;
pub mod engine;
pub mod instance;
pub mod labels;
pub mod meta;
pub mod node;
pub mod replica;
pub mod settings;
pub mod volume;

pub use condition::{Condition, ConditionStatus};
pub use engine::{Engine, EngineSpec, EngineStatus, RestoreStatus};
pub use instance::{InstanceSpec, InstanceState, InstanceStatus, ReplicaMode};
pub use meta::ObjectMeta;
pub use node::{Disk, DiskSpec, DiskStatus, Node, NodeSpec, NodeStatus};
pub use replica::{Replica, ReplicaSpec, ReplicaStatus};
pub use settings::{Setting, SettingError, SettingName};
pub use volume::{Volume, VolumeRobustness, VolumeSpec, VolumeState, VolumeStatus};

/// Unix timestamp in seconds.
pub type Timestamp = u64;
