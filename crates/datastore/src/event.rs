//! Change-notification events emitted on every committed write.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind tag for stored entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Volume,
    Engine,
    Replica,
    Node,
    Disk,
    Setting,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectKind::Volume => "volume",
            ObjectKind::Engine => "engine",
            ObjectKind::Replica => "replica",
            ObjectKind::Node => "node",
            ObjectKind::Disk => "disk",
            ObjectKind::Setting => "setting",
        };
        write!(f, "{}", s)
    }
}

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchOp {
    Added,
    Updated,
    Deleted,
}

/// One change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: ObjectKind,
    pub name: String,
    pub op: WatchOp,
    /// Owning volume for engines/replicas, so volume reconcilers can be
    /// enqueued from child events without a second lookup.
    pub volume: Option<String>,
}
