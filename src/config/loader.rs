//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Override for the listen address
pub const ENV_LISTEN_ADDR: &str = "NAT66_LISTEN_ADDR";
/// Override for the NAT prefix
pub const ENV_PREFIX: &str = "NAT66_PREFIX";
/// Override for the log level
pub const ENV_LOG_LEVEL: &str = "NAT66_LOG_LEVEL";
/// Override for the PID file path
pub const ENV_PID_FILE: &str = "NAT66_PID_FILE";

/// Load configuration from a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let config = read_config(path.as_ref())?;
    config.validate()?;
    log_loaded(&config);
    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `NAT66_LISTEN_ADDR`: Override listen address
/// - `NAT66_PREFIX`: Override NAT prefix
/// - `NAT66_LOG_LEVEL`: Override log level
/// - `NAT66_PID_FILE`: Override PID file path
///
/// Overrides are applied before validation, so a file without a prefix is
/// accepted when `NAT66_PREFIX` provides one.
///
/// # Errors
///
/// Returns `ConfigError` if loading, an override or validation fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = read_config(path.as_ref())?;
    apply_env_overrides(&mut config)?;
    config.validate()?;
    log_loaded(&config);
    Ok(config)
}

/// Apply `NAT66_*` environment overrides to `config`
///
/// # Errors
///
/// Returns `ConfigError::EnvError` if a variable holds an invalid value.
pub fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    apply_overrides_from(config, |name| std::env::var(name).ok())
}

/// Apply overrides read through `lookup`
fn apply_overrides_from(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(addr) = lookup(ENV_LISTEN_ADDR) {
        config.listen.address = addr.parse().map_err(|_| ConfigError::EnvError {
            name: ENV_LISTEN_ADDR.into(),
            reason: format!("Invalid socket address: {addr}"),
        })?;
        debug!("Listen address overridden to {}", config.listen.address);
    }

    if let Some(prefix) = lookup(ENV_PREFIX) {
        config.nat.prefix = prefix;
        debug!("NAT prefix overridden to {}", config.nat.prefix);
    }

    if let Some(level) = lookup(ENV_LOG_LEVEL) {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(path) = lookup(ENV_PID_FILE) {
        config.pid_file = path.into();
        debug!("PID file overridden to {:?}", config.pid_file);
    }

    Ok(())
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}

/// Read and parse a configuration file without validating it.
///
/// Used when further overrides are applied before validation.
///
/// # Errors
///
/// Returns `ConfigError` if the file is missing or not valid JSON.
pub fn read_config(path: &Path) -> Result<Config, ConfigError> {
    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}")))
}

fn log_loaded(config: &Config) {
    info!(
        listen = %config.listen.address,
        prefix = %config.nat.prefix,
        backend = %config.nat.backend,
        "Configuration loaded"
    );
}
