//! Application configuration.
//!
//! Loaded from YAML files and `MESHPEER__*` environment variables.

mod peering;

pub use peering::{
    PeerStreamConfig, WatchBackoffConfig, DEFAULT_DATACENTER,
    DEFAULT_INCOMING_HEARTBEAT_TIMEOUT_MS, DEFAULT_OUTGOING_HEARTBEAT_INTERVAL_MS,
    MIN_OUTGOING_HEARTBEAT_INTERVAL_MS,
};

use serde::Deserialize;
use thiserror::Error;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "meshpeer.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "MESHPEER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "MESHPEER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "MESHPEER_LOG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub peering: PeerStreamConfig,
}

impl Config {
    /// Load configuration from the default file, an optional explicit path,
    /// the file named by `MESHPEER_CONFIG` and environment overrides, in
    /// that order.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
