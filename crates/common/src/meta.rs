//! Object metadata shared by every stored entity.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// Metadata attached to every entity in the datastore.
///
/// ## Versioning
///
/// `resource_version` is assigned and bumped by the datastore on every
/// committed write. Callers never set it directly; they carry the version
/// they read back into the write, and the datastore rejects the write with
/// a conflict when the stored version has moved on.
///
/// ## Two-phase deletion
///
/// Deletion first stamps `deletion_timestamp`. The object remains visible
/// until every finalizer token has been removed, at which point the
/// datastore drops it for good.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Unique name within the entity kind.
    pub name: String,

    /// Labels used for child discovery (`labels::VOLUME_KEY` etc).
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Free-form annotations (default-disk config, tag lists).
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Set when deletion has been requested; cleanup runs before removal.
    #[serde(default)]
    pub deletion_timestamp: Option<Timestamp>,

    /// Tokens that must be cleared before the object is physically removed.
    #[serde(default)]
    pub finalizers: Vec<String>,

    /// Monotonic version managed by the datastore.
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Whether deletion has been requested for this object.
    #[must_use]
    pub fn deletion_requested(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_finalizer(mut self, token: impl Into<String>) -> Self {
        self.finalizers.push(token.into());
        self
    }
}
