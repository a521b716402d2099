//! # Configuration
//!
//! YAML configuration consumed by the [`Engine`](crate::engine::Engine).
//! Unset fields take defaults; `log_level` is validated up front so a typo
//! fails at load time instead of silencing logs.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

const VALID_LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error"];

fn default_log_level() -> String {
    "info".to_string()
}

/// Pull pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Log verbosity: debug, info, warn, or error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Registry hosts contacted over plain HTTP.
    #[serde(default)]
    pub insecure_registries: Vec<String>,
    /// Basic credentials offered to registries (and their token endpoints).
    #[serde(default)]
    pub registry_username: Option<String>,
    #[serde(default)]
    pub registry_password: Option<String>,
    /// Relaxes media-type and size checks on downloaded layers. Digest
    /// checks always run.
    #[serde(default)]
    pub skip_layer_validation: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            insecure_registries: Vec::new(),
            registry_username: None,
            registry_password: None,
            skip_layer_validation: false,
        }
    }
}

impl Config {
    /// Loads and validates a config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: Config = serde_yaml::from_str(&contents).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(Error::InvalidLogLevel(self.log_level.clone()));
        }
        Ok(())
    }
}
