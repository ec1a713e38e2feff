//! Application configuration
//!
//! Loaded from `phonecast.toml` in the platform config directory; every
//! field has a default so a missing or partial file works. The tuned
//! delays in [`HealthConfig`] are overridable rather than hard-coded: the
//! defaults come from field experience, not from anything platform-neutral.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::*;
use crate::error::Error;

/// Top-level application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub capture: CaptureConfig,
    pub health: HealthConfig,
}

/// Stream server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base TCP port; the server scans `port..port+port_scan_range`
    pub port: u16,
    pub port_scan_range: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            port_scan_range: PORT_SCAN_RANGE,
        }
    }
}

/// Capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture device name; `None` selects the default input device
    pub device: Option<String>,
    /// Capacity of the capture → pipeline channel, in chunks
    pub channel_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            channel_capacity: CAPTURE_CHANNEL_CAPACITY,
        }
    }
}

/// Health watchdog settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Watchdog tick interval in seconds
    pub tick_secs: u64,
    /// Consecutive stale ticks tolerated before capture is restarted
    pub stale_ticks_before_restart: u8,
    /// Delay between capture stop and restart, in milliseconds
    pub restart_delay_ms: u64,
    /// Delay after system wake before the pipeline is rebuilt, in milliseconds
    pub wake_delay_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            tick_secs: HEALTH_TICK_SECS,
            stale_ticks_before_restart: STALE_TICKS_BEFORE_RESTART,
            restart_delay_ms: CAPTURE_RESTART_DELAY_MS,
            wake_delay_ms: WAKE_RESTART_DELAY_MS,
        }
    }
}

impl AppConfig {
    /// Path of the config file, if a config directory exists on this platform
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "phonecast")
            .map(|dirs| dirs.config_dir().join("phonecast.toml"))
    }

    /// Load from the default location, falling back to defaults when the
    /// file is absent
    pub fn load() -> Result<Self, Error> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load from an explicit path
    pub fn load_from(path: &std::path::Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))
    }
}
