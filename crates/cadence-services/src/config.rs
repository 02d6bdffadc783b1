//! Engine configuration, persisted as TOML

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Clock resolution in frames per second
    pub sample_rate: u32,
    /// How far ahead of the clock commands are dispatched
    pub lookahead_ms: u64,
    /// Interval between scheduling passes
    pub poll_interval_ms: u64,
    /// Initial tempo in BPM
    pub tempo: f64,
    pub beats_per_bar: u32,
    pub beat_unit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            lookahead_ms: 200,
            poll_interval_ms: 25,
            tempo: 120.0,
            beats_per_bar: 4,
            beat_unit: 4,
        }
    }
}

impl EngineConfig {
    /// Read a config file, reporting I/O and parse errors
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Lookahead, never shorter than one poll interval or commands would be
    /// dispatched late
    pub fn lookahead_millis(&self) -> u64 {
        self.lookahead_ms.max(self.poll_interval_ms.max(1))
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cadence")
        .join("config.toml")
}

/// Load the user config, falling back to defaults
pub fn load_config() -> EngineConfig {
    let path = config_path();
    if !path.exists() {
        return EngineConfig::default();
    }
    EngineConfig::from_path(&path).unwrap_or_else(|e| {
        warn!("Ignoring {}: {e}", path.display());
        EngineConfig::default()
    })
}

pub fn save_config(config: &EngineConfig) -> Result<(), ConfigError> {
    config.write_to(&config_path())
}
