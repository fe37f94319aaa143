//! Configuration Vault – reads/writes `~/.corelink/config.toml`.

use corelink_kernel::KernelConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Persisted operator configuration stored in `~/.corelink/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Service name reported to the trace collector.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default)]
    pub kernel: KernelConfig,
}

fn default_service_name() -> String {
    "corelink".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            kernel: KernelConfig::default(),
        }
    }
}

/// Return the path to `~/.corelink/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".corelink").join("config.toml")
}

/// Default snapshot directory, next to the config file.
pub fn default_state_dir() -> PathBuf {
    config_path()
        .parent()
        .map(|dir| dir.join("state"))
        .unwrap_or_else(|| PathBuf::from("state"))
}

/// Load the config from disk. Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, ConfigError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg: Config = toml::from_str(&raw)?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `CORELINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `CORELINK_MAX_APPS` | `kernel.max_apps` |
/// | `CORELINK_QUEUE_CAPACITY` | `kernel.event_queue_capacity` |
/// | `CORELINK_HEALTH_INTERVAL_MS` | `kernel.health_check_interval_ms` |
/// | `CORELINK_AUTO_HEAL` | `kernel.auto_heal` |
/// | `CORELINK_STATE_DIR` | `kernel.state_dir` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(v) = env_parsed("CORELINK_MAX_APPS") {
        cfg.kernel.max_apps = v;
    }
    if let Some(v) = env_parsed("CORELINK_QUEUE_CAPACITY") {
        cfg.kernel.event_queue_capacity = v;
    }
    if let Some(v) = env_parsed("CORELINK_HEALTH_INTERVAL_MS") {
        cfg.kernel.health_check_interval_ms = v;
    }
    if let Some(v) = env_parsed("CORELINK_AUTO_HEAL") {
        cfg.kernel.auto_heal = v;
    }
    if let Ok(v) = std::env::var("CORELINK_STATE_DIR") {
        if !v.is_empty() {
            cfg.kernel.state_dir = Some(PathBuf::from(v));
        }
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Save the config to disk, creating `~/.corelink/` if necessary.
pub fn save(cfg: &Config) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(write_err)?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;
    // Owner read/write only (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}
