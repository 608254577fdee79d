//! Typed registry of cluster tunables.
//!
//! Settings are stored as name -> string records; this module is the only
//! place that knows which names exist, what type each value carries and
//! what the default is when a setting has never been written. Callers go
//! through the typed accessors on the datastore instead of switching on
//! raw strings.
//!
//! | Name | Type | Default |
//! |------|------|---------|
//! | `default-engine-image` | string | "" |
//! | `default-data-path` | string | `/var/lib/dbv` |
//! | `create-default-disk-labeled-nodes` | bool | false |
//! | `replica-soft-anti-affinity` | bool | false |
//! | `auto-salvage` | bool | true |
//! | `backup-target` | string | "" |
//! | `taint-toleration` | string list | "" |
//! | `standby-poll-interval` | seconds | 300 |
//! | `salvage-window` | seconds | 60 |
//! | `overprovision-ratio` | integer | 1 |
//!
//! `standby-poll-interval` bounds how stale a standby volume's view of the
//! backup chain may get; a backup rotated out between two polls can be
//! missed (best effort). `salvage-window` is the tolerance used when
//! collecting the most-recent failure cohort for auto-salvage.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

// ════════════════════════════════════════════════════════════════════════════
// SETTING NAMES
// ════════════════════════════════════════════════════════════════════════════

/// Every recognised setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettingName {
    DefaultEngineImage,
    DefaultDataPath,
    CreateDefaultDiskLabeledNodes,
    ReplicaSoftAntiAffinity,
    AutoSalvage,
    BackupTarget,
    TaintToleration,
    StandbyPollInterval,
    SalvageWindow,
    OverprovisionRatio,
}

impl SettingName {
    pub const ALL: [SettingName; 10] = [
        SettingName::DefaultEngineImage,
        SettingName::DefaultDataPath,
        SettingName::CreateDefaultDiskLabeledNodes,
        SettingName::ReplicaSoftAntiAffinity,
        SettingName::AutoSalvage,
        SettingName::BackupTarget,
        SettingName::TaintToleration,
        SettingName::StandbyPollInterval,
        SettingName::SalvageWindow,
        SettingName::OverprovisionRatio,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SettingName::DefaultEngineImage => "default-engine-image",
            SettingName::DefaultDataPath => "default-data-path",
            SettingName::CreateDefaultDiskLabeledNodes => "create-default-disk-labeled-nodes",
            SettingName::ReplicaSoftAntiAffinity => "replica-soft-anti-affinity",
            SettingName::AutoSalvage => "auto-salvage",
            SettingName::BackupTarget => "backup-target",
            SettingName::TaintToleration => "taint-toleration",
            SettingName::StandbyPollInterval => "standby-poll-interval",
            SettingName::SalvageWindow => "salvage-window",
            SettingName::OverprovisionRatio => "overprovision-ratio",
        }
    }

    /// Value used when the setting has never been written.
    #[must_use]
    pub const fn default_value(&self) -> &'static str {
        match self {
            SettingName::DefaultEngineImage => "",
            SettingName::DefaultDataPath => "/var/lib/dbv",
            SettingName::CreateDefaultDiskLabeledNodes => "false",
            SettingName::ReplicaSoftAntiAffinity => "false",
            SettingName::AutoSalvage => "true",
            SettingName::BackupTarget => "",
            SettingName::TaintToleration => "",
            SettingName::StandbyPollInterval => "300",
            SettingName::SalvageWindow => "60",
            SettingName::OverprovisionRatio => "1",
        }
    }

    pub fn parse(name: &str) -> Result<Self, SettingError> {
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.as_str() == name)
            .ok_or_else(|| SettingError::UnknownName(name.to_string()))
    }
}

impl fmt::Display for SettingName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// SETTING ENTITY AND ERRORS
// ════════════════════════════════════════════════════════════════════════════

/// A stored setting record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub meta: ObjectMeta,
    pub value: String,
}

/// Errors reading or interpreting a setting value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingError {
    /// The name is not in the registry.
    UnknownName(String),
    /// The stored value does not parse as the setting's type.
    InvalidValue {
        name: SettingName,
        value: String,
        expected: &'static str,
    },
}

impl fmt::Display for SettingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingError::UnknownName(name) => write!(f, "unknown setting name: {}", name),
            SettingError::InvalidValue {
                name,
                value,
                expected,
            } => write!(
                f,
                "invalid value {:?} for setting {}: expected {}",
                value, name, expected
            ),
        }
    }
}

impl std::error::Error for SettingError {}

/// Interpret a raw setting value as a bool.
pub fn value_as_bool(name: SettingName, value: &str) -> Result<bool, SettingError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(SettingError::InvalidValue {
            name,
            value: value.to_string(),
            expected: "true or false",
        }),
    }
}

/// Interpret a raw setting value as an unsigned integer.
pub fn value_as_u64(name: SettingName, value: &str) -> Result<u64, SettingError> {
    value.parse::<u64>().map_err(|_| SettingError::InvalidValue {
        name,
        value: value.to_string(),
        expected: "an unsigned integer",
    })
}

/// Interpret a raw setting value as a comma-separated list.
#[must_use]
pub fn value_as_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
