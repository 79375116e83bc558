//! Bridge application configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// Configuration read from the `-c` file, re-read on SIGHUP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Line sent to the upstream server right after connecting.
    #[serde(default = "default_greeting")]
    pub greeting: String,

    /// Upper bound for the reconnect backoff (in seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// `host:port` of the server to stay connected to.
    #[serde(default = "default_address")]
    pub address: String,
}

fn default_greeting() -> String {
    "hello world!".to_string()
}

fn default_max_backoff() -> u32 {
    60
}

fn default_address() -> String {
    "127.0.0.1:9000".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            greeting: default_greeting(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
        }
    }
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load and validate configuration from a string.
    pub fn load_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.address.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "upstream.address".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        if self.max_backoff_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_backoff_secs".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        Ok(())
    }
}
