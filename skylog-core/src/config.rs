//! Configuration file management for skylog.
//!
//! Reads `~/.skylog/config.toml` layered over built-in defaults, with
//! `SKYLOG_` environment variables on top (`SKYLOG_SESSION__OPERATOR_ID`,
//! `SKYLOG_DETECTOR__TAKEOFF_SPEED_MS`, ...).

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::broadcast::BroadcastConfig;
use crate::detector::DetectorConfig;
use crate::sites::SiteConfig;
use crate::types::SkylogError;

/// Full configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub webhook: Option<String>,
    pub detector: DetectorConfig,
    pub sites: SiteConfig,
    pub broadcast: BroadcastConfig,
    pub session: SessionConfig,
    pub reference: ReferenceConfig,
    pub database: DatabaseConfig,
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Identity the live record and stored flights are keyed by.
    pub operator_id: String,
    /// Silence after which an open flight is closed automatically.
    pub watchdog_timeout_sec: f64,
    /// How often the live runner checks the watchdog.
    pub watchdog_poll_sec: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub sites_path: Option<PathBuf>,
    pub zones_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub host: String,
    pub port: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            operator_id: "default".into(),
            watchdog_timeout_sec: 300.0,
            watchdog_poll_sec: 5.0,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: "data/skylog.db".into(),
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        DashboardConfig {
            host: "127.0.0.1".into(),
            port: 8080,
        }
    }
}

impl Config {
    /// Reject values that would make the detector or watchdog misbehave.
    pub fn validate(&self) -> Result<(), SkylogError> {
        let d = &self.detector;
        for (name, value) in [
            ("takeoff_speed_ms", d.takeoff_speed_ms),
            ("landing_speed_ms", d.landing_speed_ms),
            ("landing_descent_ms", d.landing_descent_ms),
            ("confirmation_window_sec", d.confirmation_window_sec),
        ] {
            if !value.is_finite() {
                return Err(SkylogError::Config(format!("detector {name} must be finite, got {value}")));
            }
        }
        if d.landing_speed_ms > d.takeoff_speed_ms {
            return Err(SkylogError::Config(format!(
                "landing speed {} m/s exceeds takeoff speed {} m/s",
                d.landing_speed_ms, d.takeoff_speed_ms
            )));
        }
        if d.confirmation_window_sec < 0.0 {
            return Err(SkylogError::Config("confirmation window must not be negative".into()));
        }
        let positive = |x: f64| x.is_finite() && x > 0.0;
        if !positive(self.session.watchdog_timeout_sec) || !positive(self.session.watchdog_poll_sec) {
            return Err(SkylogError::Config(
                "watchdog timings must be positive and finite".into(),
            ));
        }
        if self.session.operator_id.trim().is_empty() {
            return Err(SkylogError::Config("operator_id must not be empty".into()));
        }
        Ok(())
    }
}

/// Get the config directory path (`~/.skylog/`).
pub fn config_dir() -> PathBuf {
    dirs_home().join(".skylog")
}

/// Get the config file path.
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load config from the default location. A missing file yields defaults.
pub fn load_config() -> Result<Config, SkylogError> {
    load_config_from(&config_file())
}

/// Load config from `path` layered over defaults, then environment.
pub fn load_config_from(path: &Path) -> Result<Config, SkylogError> {
    let config: Config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("SKYLOG_").split("__"))
        .extract()
        .map_err(|e| SkylogError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Save config to `~/.skylog/config.toml`.
pub fn save_config(config: &Config) -> Result<PathBuf, SkylogError> {
    let path = config_file();
    save_config_to(config, &path)?;
    Ok(path)
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<(), SkylogError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| SkylogError::Config(e.to_string()))?;
    }
    let text = serialize_config(config)?;
    std::fs::write(path, text).map_err(|e| SkylogError::Config(e.to_string()))
}

/// Serialize config to TOML text.
pub fn serialize_config(config: &Config) -> Result<String, SkylogError> {
    let body = toml::to_string_pretty(config).map_err(|e| SkylogError::Config(e.to_string()))?;
    Ok(format!("# skylog configuration\n\n{body}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
