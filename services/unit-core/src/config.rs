//! Engine configuration.
//!
//! Loaded from a JSON file; every timeout can also be overridden through
//! `CONVOY_*` environment variables so deployments can tune a single value
//! without shipping a new config file. Durations are humantime strings
//! ("10s", "5m", "1h").

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("can't parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid duration value: {0}")]
    InvalidDuration(#[from] humantime::DurationError),
}

/// One update manager known to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UmClientConfig {
    #[serde(rename = "umID")]
    pub um_id: String,
    #[serde(default)]
    pub priority: u32,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Directory for the state database and scratch data.
    pub working_dir: PathBuf,

    /// Debounce window for unit status emissions.
    #[serde(with = "humantime_serde", default = "Config::default_send_timeout")]
    pub unit_status_send_timeout: Duration,

    /// Bound on the initial service-manager rendezvous.
    #[serde(with = "humantime_serde", default = "Config::default_connection_timeout")]
    pub nodes_connection_timeout: Duration,

    /// Default TTL applied when a schedule rule carries none.
    #[serde(with = "humantime_serde", default = "Config::default_update_ttl")]
    pub update_ttl: Duration,

    /// Service manager node ids expected to register.
    #[serde(rename = "nodeIDs", default)]
    pub node_ids: Vec<String>,

    /// Update managers and their phase ordering priorities.
    #[serde(default)]
    pub um_clients: Vec<UmClientConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("/var/lib/convoy"),
            unit_status_send_timeout: Self::default_send_timeout(),
            nodes_connection_timeout: Self::default_connection_timeout(),
            update_ttl: Self::default_update_ttl(),
            node_ids: Vec::new(),
            um_clients: Vec::new(),
        }
    }
}

impl Config {
    fn default_send_timeout() -> Duration {
        Duration::from_secs(3)
    }

    fn default_connection_timeout() -> Duration {
        Duration::from_secs(30)
    }

    fn default_update_ttl() -> Duration {
        Duration::from_secs(30 * 24 * 3600)
    }

    /// Load configuration from a JSON file, then apply env overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.apply_env_overrides()?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(raw) = std::env::var("CONVOY_UNIT_STATUS_SEND_TIMEOUT") {
            self.unit_status_send_timeout = humantime::parse_duration(&raw)?;
        }

        if let Ok(raw) = std::env::var("CONVOY_NODES_CONNECTION_TIMEOUT") {
            self.nodes_connection_timeout = humantime::parse_duration(&raw)?;
        }

        if let Ok(raw) = std::env::var("CONVOY_UPDATE_TTL") {
            self.update_ttl = humantime::parse_duration(&raw)?;
        }

        if let Ok(raw) = std::env::var("CONVOY_WORKING_DIR") {
            self.working_dir = PathBuf::from(raw);
        }

        Ok(())
    }

    /// Path of the state database inside the working directory.
    pub fn state_db_path(&self) -> PathBuf {
        self.working_dir.join("unit-core.db")
    }
}
