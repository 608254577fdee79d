//! Daemon configuration loaded from TOML.
//!
//! Kept small and typed; anything tunable at runtime lives in the settings
//! registry instead.

use std::fs;
use std::path::Path;

use serde::Deserialize;

/// Configuration for one control-plane daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Name of the node this daemon runs on; doubles as the controller id
    /// for ownership election. Mandatory.
    pub node_id: String,

    /// Bind address for the observability HTTP endpoints.
    pub listen_addr: Option<String>,

    /// Reconcile workers per controller.
    pub workers: Option<usize>,

    /// Upper bound on a single orchestrator call within one reconcile pass.
    pub instance_call_timeout_secs: Option<u64>,

    /// Refuse auto-salvage for volumes running without revision counters.
    /// With counters disabled the engine cannot rank replicas by revision,
    /// so salvage hands it the whole recent-failure cohort as equivalent
    /// candidates; set this to require operator intervention instead.
    pub salvage_requires_revision_counters: Option<bool>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            node_id: String::new(),
            listen_addr: Some("127.0.0.1:9520".to_string()),
            workers: Some(4),
            instance_call_timeout_secs: Some(30),
            salvage_requires_revision_counters: Some(false),
        }
    }
}

impl DaemonConfig {
    #[must_use]
    pub fn listen_addr(&self) -> &str {
        self.listen_addr.as_deref().unwrap_or("127.0.0.1:9520")
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers.unwrap_or(4).max(1)
    }

    #[must_use]
    pub fn instance_call_timeout_secs(&self) -> u64 {
        self.instance_call_timeout_secs.unwrap_or(30)
    }

    #[must_use]
    pub fn salvage_requires_revision_counters(&self) -> bool {
        self.salvage_requires_revision_counters.unwrap_or(false)
    }
}

/// Load config from a TOML file path.
/// Missing file or parse failure is an error; there is no implicit default
/// because `node_id` has no sensible fallback.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<DaemonConfig, ConfigError> {
    let p = path.as_ref();
    let s = fs::read_to_string(p).map_err(|e| ConfigError::Io(p.display().to_string(), e))?;
    let cfg: DaemonConfig = toml::from_str(&s).map_err(ConfigError::Parse)?;
    if cfg.node_id.is_empty() {
        return Err(ConfigError::MissingNodeId);
    }
    Ok(cfg)
}

/// Errors loading the daemon configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[source] toml::de::Error),
    #[error("config is missing node_id")]
    MissingNodeId,
}
