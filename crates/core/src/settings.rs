use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::health::HealthConfig;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("config directory is unavailable for this platform")]
    ConfigDirUnavailable,
    #[error("failed to read settings file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthSettings {
    pub poll_interval_secs: u64,
    pub settle_delay_ms: u64,
    pub failure_threshold: u32,
    pub ping_timeout_secs: u64,
    pub reconnect_timeout_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            settle_delay_ms: 500,
            failure_threshold: 3,
            ping_timeout_secs: 10,
            reconnect_timeout_secs: 30,
        }
    }
}

impl HealthSettings {
    #[must_use]
    pub fn to_config(&self) -> HealthConfig {
        HealthConfig {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            failure_threshold: self.failure_threshold.max(1),
            ping_timeout: Duration::from_secs(self.ping_timeout_secs.max(1)),
            reconnect_timeout: Duration::from_secs(self.reconnect_timeout_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingSettings {
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub health: HealthSettings,
    pub logging: LoggingSettings,
    pub restore_tabs: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            health: HealthSettings::default(),
            logging: LoggingSettings::default(),
            restore_tabs: true,
        }
    }
}

impl Settings {
    pub fn load_from_path(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Unreadable settings degrade to defaults; the failure is only logged.
    #[must_use]
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load_from_path(path) {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!(%error, "falling back to default settings");
                Self::default()
            }
        }
    }
}

/// Resolves the quarry configuration directory.
///
/// `QUARRY_CONFIG_DIR` replaces the platform base directory (`%APPDATA%` on
/// Windows, `$XDG_CONFIG_HOME` or `$HOME/.config` elsewhere).
pub fn config_dir() -> Result<PathBuf, SettingsError> {
    let base_dir = if let Some(custom) = env::var_os("QUARRY_CONFIG_DIR") {
        PathBuf::from(custom)
    } else if cfg!(target_os = "windows") {
        env::var_os("APPDATA")
            .map(PathBuf::from)
            .ok_or(SettingsError::ConfigDirUnavailable)?
    } else if let Some(xdg_config_home) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config_home)
    } else {
        let home = env::var_os("HOME").ok_or(SettingsError::ConfigDirUnavailable)?;
        PathBuf::from(home).join(".config")
    };

    Ok(base_dir.join("quarry"))
}

pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    Ok(config_dir()?.join("settings.toml"))
}
