//! Configuration file resolution and TOML loading
//!
//! Config and database locations follow the same priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. Platform config/data directory
//! 4. Compiled fallback

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Resolve the configuration file for `app_name`.
///
/// Returns `None` when no file exists at any tier; callers then fall back to
/// compiled defaults instead of failing.
pub fn resolve_config_file(
    cli_arg: Option<&str>,
    env_var_name: &str,
    app_name: &str,
) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(PathBuf::from(path));
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config directory
    let platform = platform_config_file(app_name);
    match platform {
        Some(path) if path.exists() => Some(path),
        Some(path) => {
            debug!(path = %path.display(), "No platform config file, using defaults");
            None
        }
        None => None,
    }
}

/// Platform config file path: `<config_dir>/<app_name>/config.toml`
pub fn platform_config_file(app_name: &str) -> Option<PathBuf> {
    if cfg!(target_os = "linux") {
        let user_config = dirs::config_dir().map(|d| d.join(app_name).join("config.toml"));
        if let Some(path) = user_config {
            if path.exists() {
                return Some(path);
            }
        }
        let system_config = PathBuf::from("/etc").join(app_name).join("config.toml");
        Some(system_config)
    } else {
        dirs::config_dir().map(|d| d.join(app_name).join("config.toml"))
    }
}

/// Resolve the SQLite database path for `app_name`
pub fn resolve_database_path(
    cli_arg: Option<&str>,
    env_var_name: &str,
    app_name: &str,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    default_data_dir(app_name).join(format!("{}.db", app_name))
}

/// OS-dependent default data folder
pub fn default_data_dir(app_name: &str) -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(app_name))
        .unwrap_or_else(|| PathBuf::from(format!("./{}_data", app_name)))
}

/// Read and deserialize a TOML file
pub fn load_toml_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Read TOML failed ({}): {}", path.display(), e))
    })?;
    parse_toml(&content)
}

/// Deserialize TOML text
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> Result<T> {
    toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
}

/// Load a TOML file if one resolves, otherwise return `T::default()`.
///
/// A file that resolves but fails to parse is an error; a missing file is not.
pub fn load_or_default<T>(cli_arg: Option<&str>, env_var_name: &str, app_name: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match resolve_config_file(cli_arg, env_var_name, app_name) {
        Some(path) if path.exists() => load_toml_file(&path),
        Some(path) => {
            warn!(path = %path.display(), "Config file not found, using defaults");
            Ok(T::default())
        }
        None => Ok(T::default()),
    }
}
