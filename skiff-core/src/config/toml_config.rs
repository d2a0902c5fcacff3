//! TOML configuration file I/O
//!
//! Handles loading and saving the client configuration to/from TOML files
//! in the user's configuration directory.

use crate::config::ClientConfig;
use crate::error::{ConfigError, SkiffError};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default configuration file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Get the default configuration directory
///
/// Returns ~/.config/skiff on Linux, or SKIFF_CONFIG_DIR environment variable if set
pub fn get_config_dir() -> Result<PathBuf, SkiffError> {
    // Allow tests to override config directory via environment variable
    if let Ok(config_dir) = std::env::var("SKIFF_CONFIG_DIR") {
        return Ok(PathBuf::from(config_dir));
    }

    // Under sudo the engine may need privileges, but state belongs to the invoking user
    let home = if let Ok(sudo_user) = std::env::var("SUDO_USER") {
        std::env::var("SUDO_HOME").unwrap_or_else(|_| format!("/home/{}", sudo_user))
    } else {
        std::env::var("HOME").map_err(|_| {
            SkiffError::Config(ConfigError::IoError {
                message: "HOME environment variable not set".to_string(),
            })
        })?
    };

    Ok(PathBuf::from(home).join(".config").join("skiff"))
}

/// Get the default configuration file path
pub fn get_config_path() -> Result<PathBuf, SkiffError> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

/// Get the path of the JSON state file (profile, daily usage)
pub fn get_state_path() -> Result<PathBuf, SkiffError> {
    Ok(get_config_dir()?.join(crate::storage::file::STATE_FILE_NAME))
}

/// Load configuration from the default TOML file
///
/// A missing file yields the defaults so a fresh install works without setup.
pub fn load_config() -> Result<ClientConfig, SkiffError> {
    let config_path = get_config_path()?;
    if !config_path.exists() {
        debug!(path = %config_path.display(), "No config file, using defaults");
        return Ok(ClientConfig::default());
    }
    load_config_from_path(&config_path)
}

/// Load configuration from a specific TOML file
pub fn load_config_from_path<P: AsRef<Path>>(path: P) -> Result<ClientConfig, SkiffError> {
    let contents = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SkiffError::Config(ConfigError::LoadFailed {
            path: path.as_ref().to_string_lossy().to_string(),
        }),
        _ => SkiffError::Config(ConfigError::IoError {
            message: format!("Failed to read config file: {}", e),
        }),
    })?;

    let config: ClientConfig = toml::from_str(&contents).map_err(|e| {
        SkiffError::Config(ConfigError::ValidationError {
            message: format!("Failed to parse config file: {}", e),
        })
    })?;

    config.validate().map_err(|message| {
        warn!("Configuration validation failed: {}", message);
        SkiffError::Config(ConfigError::ValidationError { message })
    })?;

    info!(
        "Loaded configuration: api={}, mode={}, auto_reconnect={}, max_attempts={}, base_delay={}ms, max_delay={}ms",
        config.api.base_url,
        config.connection.mode,
        config.connection.auto_reconnect,
        config.reconnection.max_attempts,
        config.reconnection.base_delay_ms,
        config.reconnection.max_delay_ms
    );

    Ok(config)
}

/// Save configuration to the default TOML file
pub fn save_config(config: &ClientConfig) -> Result<(), SkiffError> {
    let config_path = get_config_path()?;
    save_config_to_path(config, &config_path)
}

/// Save configuration to a specific TOML file
pub fn save_config_to_path<P: AsRef<Path>>(
    config: &ClientConfig,
    path: P,
) -> Result<(), SkiffError> {
    config
        .validate()
        .map_err(|message| SkiffError::Config(ConfigError::ValidationError { message }))?;

    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            SkiffError::Config(ConfigError::IoError {
                message: format!("Failed to create config directory: {}", e),
            })
        })?;
    }

    let toml_string = toml::to_string_pretty(config)?;

    std::fs::write(&path, toml_string).map_err(|_e| {
        SkiffError::Config(ConfigError::SaveFailed {
            path: path.as_ref().to_string_lossy().to_string(),
        })
    })?;

    info!("Saved configuration to {:?}", path.as_ref());
    Ok(())
}

/// Check if a configuration file exists
pub fn config_exists() -> Result<bool, SkiffError> {
    Ok(get_config_path()?.exists())
}
