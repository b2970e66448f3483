//! Configuration loading
//!
//! Configuration file resolution priority order:
//! 1. Explicit path (command-line argument)
//! 2. `MIXDOWN_CONFIG` environment variable
//! 3. `<config_dir>/mixdown/config.toml`
//! 4. Built-in defaults
//!
//! Every field has a default, so an empty file (or no file) is valid.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable naming a configuration file
pub const CONFIG_ENV_VAR: &str = "MIXDOWN_CONFIG";

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct MixdownConfig {
    pub sink: SinkSettings,
    pub output: OutputSettings,
    pub logging: LoggingSettings,
}

/// Mixing sink and decode worker settings
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SinkSettings {
    /// Decoded blocks queued per track before the decode worker waits
    pub queue_capacity: usize,

    /// Latency requested from the playback backend
    pub target_latency_ms: u64,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            target_latency_ms: 100,
        }
    }
}

impl SinkSettings {
    pub fn target_latency(&self) -> Duration {
        Duration::from_millis(self.target_latency_ms)
    }
}

/// Audio device settings
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputSettings {
    /// Output device name (None = default device)
    pub device: Option<String>,

    /// Fixed device buffer size in frames (None = device default)
    pub buffer_size_frames: Option<u32>,
}

/// Logging settings
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl MixdownConfig {
    /// Parse and validate configuration text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: MixdownConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Reading configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Resolve and load configuration following the priority order above.
    ///
    /// An explicit path or environment variable that points at a missing file
    /// is an error; a missing default-location file is not.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            info!("Using configuration file {}", path.display());
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let path = PathBuf::from(path);
            info!("Using configuration file {} (from {})", path.display(), CONFIG_ENV_VAR);
            return Self::from_file(&path);
        }

        if let Some(path) = default_config_path() {
            if path.exists() {
                info!("Using configuration file {}", path.display());
                return Self::from_file(&path);
            }
        }

        debug!("No configuration file found, using built-in defaults");
        Ok(Self::default())
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sink.queue_capacity == 0 {
            return Err(Error::Config("sink.queue_capacity must be at least 1".to_string()));
        }
        if let Some(0) = self.output.buffer_size_frames {
            return Err(Error::Config("output.buffer_size_frames must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Platform default configuration path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("mixdown").join("config.toml"))
}
