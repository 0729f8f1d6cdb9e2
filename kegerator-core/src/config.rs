//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/kegerator/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/kegerator/` (~/.config/kegerator/)
//! - State/Logs: `$XDG_STATE_HOME/kegerator/` (~/.local/state/kegerator/)
//!
//! The keg state file itself is not configuration; it defaults to
//! `state.json` in the working directory, as operators edit it by hand and
//! send SIGHUP to reload it.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// HTTP listener
    #[serde(default)]
    pub server: ServerConfig,

    /// State file and autosave
    #[serde(default)]
    pub state: StateConfig,

    /// Pour segmentation
    #[serde(default)]
    pub flow: FlowSettings,

    /// Humidity/temperature polling
    #[serde(default)]
    pub dht: DhtSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Upper bound on serving a single request, in seconds
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            timeout_secs: default_request_timeout(),
        }
    }
}

fn default_addr() -> String {
    "0.0.0.0:9220".to_string()
}

fn default_request_timeout() -> u64 {
    5
}

/// State file configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    /// File to load initial state from and save state to
    #[serde(default = "default_state_file")]
    pub file: PathBuf,

    /// Periodically write state back to `file`
    #[serde(default = "default_autosave")]
    pub autosave: bool,

    /// Seconds between automatic saves
    #[serde(default = "default_save_interval")]
    pub save_interval_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            file: default_state_file(),
            autosave: default_autosave(),
            save_interval_secs: default_save_interval(),
        }
    }
}

impl StateConfig {
    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }
}

fn default_state_file() -> PathBuf {
    PathBuf::from("state.json")
}

fn default_autosave() -> bool {
    true
}

fn default_save_interval() -> u64 {
    300
}

/// Pour segmentation settings shared by every flow aggregator
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct FlowSettings {
    /// Silence that separates two pours, in milliseconds
    #[serde(default = "default_gap_threshold")]
    pub gap_threshold_ms: u64,

    /// Pulses a pour needs before it counts as a real dispense
    #[serde(default = "default_pour_event_threshold")]
    pub pour_event_threshold: u32,

    /// Pulse queue capacity per aggregator
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            gap_threshold_ms: default_gap_threshold(),
            pour_event_threshold: default_pour_event_threshold(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl FlowSettings {
    pub fn gap_threshold(&self) -> Duration {
        Duration::from_millis(self.gap_threshold_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gap_threshold_ms == 0 {
            return Err(Error::Config(
                "flow.gap_threshold_ms must be greater than 0".to_string(),
            ));
        }
        if self.pour_event_threshold == 0 {
            return Err(Error::Config(
                "flow.pour_event_threshold must be greater than 0".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config(
                "flow.queue_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_gap_threshold() -> u64 {
    1000
}

fn default_pour_event_threshold() -> u32 {
    10
}

fn default_queue_capacity() -> usize {
    1000
}

/// Humidity/temperature sensor settings
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct DhtSettings {
    /// Seconds between reads
    #[serde(default = "default_read_interval")]
    pub read_interval_secs: u64,

    /// Retries allowed for the initial read at attach time
    #[serde(default = "default_attach_retries")]
    pub attach_retries: u32,

    /// Retries allowed for each periodic read
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,

    /// Temperatures above this are sensor glitches, in Celsius
    #[serde(default = "default_temperature_limit")]
    pub temperature_limit: f32,
}

impl Default for DhtSettings {
    fn default() -> Self {
        Self {
            read_interval_secs: default_read_interval(),
            attach_retries: default_attach_retries(),
            read_retries: default_read_retries(),
            temperature_limit: default_temperature_limit(),
        }
    }
}

impl DhtSettings {
    pub fn read_interval(&self) -> Duration {
        Duration::from_secs(self.read_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_interval_secs == 0 {
            return Err(Error::Config(
                "dht.read_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_read_interval() -> u64 {
    10
}

fn default_attach_retries() -> u32 {
    4
}

fn default_read_retries() -> u32 {
    10
}

fn default_temperature_limit() -> f32 {
    100.0
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write logs to stderr (for service supervisors)
    #[serde(default = "default_log_stderr")]
    pub stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stderr: default_log_stderr(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_stderr() -> bool {
    true
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.flow.validate()?;
        self.dht.validate()?;
        if self.state.autosave && self.state.save_interval_secs == 0 {
            return Err(Error::Config(
                "state.save_interval_secs must be greater than 0 when autosave is on".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/kegerator/config.toml` (~/.config/kegerator/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("kegerator").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/kegerator/` (~/.local/state/kegerator/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("kegerator")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/kegerator/kegerator.log` (~/.local/state/kegerator/kegerator.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("kegerator.log")
    }
}
