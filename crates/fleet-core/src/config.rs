//! Process-wide master configuration.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default inactivity timeout.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable overriding the inactivity timeout, in milliseconds.
pub const ENV_INACTIVITY_TIMEOUT_MS: &str = "FLEET_INACTIVITY_TIMEOUT_MS";
/// Environment variable overriding the module directory.
pub const ENV_MODULE_DIR: &str = "FLEET_MODULE_DIR";
/// Environment variable overriding the listen address.
pub const ENV_BIND_ADDR: &str = "FLEET_BIND_ADDR";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Master node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Time without a ping after which a session is considered stale.
    pub inactivity_timeout: Duration,
    /// Root directory of stored module packages.
    pub module_dir: PathBuf,
    /// Address the slave endpoint listens on.
    pub bind_addr: SocketAddr,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            module_dir: PathBuf::from("Modules"),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 57344)),
        }
    }
}

impl MasterConfig {
    /// Defaults overlaid with `FLEET_*` environment variables.
    ///
    /// # Errors
    /// Returns error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// # Errors
    /// Returns error if a value is present but cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_INACTIVITY_TIMEOUT_MS) {
            let millis = value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue {
                    key: ENV_INACTIVITY_TIMEOUT_MS,
                    value: value.clone(),
                })?;
            config.inactivity_timeout = Duration::from_millis(millis);
        }

        if let Some(value) = lookup(ENV_MODULE_DIR) {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: ENV_MODULE_DIR,
                    value,
                });
            }
            config.module_dir = PathBuf::from(value);
        }

        if let Some(value) = lookup(ENV_BIND_ADDR) {
            config.bind_addr = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    key: ENV_BIND_ADDR,
                    value: value.clone(),
                })?;
        }

        Ok(config)
    }
}
