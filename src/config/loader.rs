//! Configuration loading and management
//!
//! This module handles loading and writing the JSON configuration file.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config = load_config_str(&contents)
        .map_err(|e| match e {
            ConfigError::ParseError(msg) => {
                ConfigError::ParseError(format!("{msg} at {path:?}"))
            }
            other => other,
        })?;

    info!(
        groups = config.groups.len(),
        version = %config.config_version,
        "Configuration loaded"
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(json)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse JSON: {e}")))?;

    config.validate()?;

    Ok(config)
}

/// Serialize a configuration to pretty JSON
///
/// # Errors
///
/// Returns `ConfigError::ParseError` if serialization fails.
pub fn config_to_string(config: &Config) -> Result<String, ConfigError> {
    serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize JSON: {e}")))
}

/// Write the built-in default configuration to a file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let config = Config::default_config();
    std::fs::write(path, config_to_string(&config)?)?;

    info!("Default configuration written to {:?}", path);
    Ok(())
}
