//! Configuration loading
//!
//! Loads configuration from a JSON file, with optional environment overrides.

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

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: tun={}, mtu={}, {} services",
        config.tun.name,
        config.tun.mtu,
        config.services.len()
    );

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
/// - `TUN_INTERCEPTOR_TUN_NAME`: Override the TUN interface name
/// - `TUN_INTERCEPTOR_MTU`: Override the MTU
/// - `TUN_INTERCEPTOR_LOG_LEVEL`: Override log level
/// - `TUN_INTERCEPTOR_UDP_MAX_CONNECTIONS`: Override the UDP connection limit
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing or validation fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

fn apply_env_overrides(
    config: &mut Config,
    var: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(name) = var("TUN_INTERCEPTOR_TUN_NAME") {
        config.tun.name = name;
        debug!("TUN name overridden to {}", config.tun.name);
    }

    if let Some(mtu) = var("TUN_INTERCEPTOR_MTU") {
        config.tun.mtu = mtu.parse().map_err(|_| ConfigError::EnvError {
            name: "TUN_INTERCEPTOR_MTU".into(),
            reason: format!("Invalid MTU: {mtu}"),
        })?;
        debug!("MTU overridden to {}", config.tun.mtu);
    }

    if let Some(level) = var("TUN_INTERCEPTOR_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(max) = var("TUN_INTERCEPTOR_UDP_MAX_CONNECTIONS") {
        config.udp.max_connections = max.parse().map_err(|_| ConfigError::EnvError {
            name: "TUN_INTERCEPTOR_UDP_MAX_CONNECTIONS".into(),
            reason: format!("Invalid number: {max}"),
        })?;
        debug!(
            "UDP max connections overridden to {}",
            config.udp.max_connections
        );
    }

    // Re-validate after overrides
    config.validate()
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
