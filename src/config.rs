//! Configuration System using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults
//! 2. A TOML file (default `config/tera_daq.toml`)
//! 3. Environment variables prefixed with `TERA_DAQ_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use tera_daq::config::DaqConfig;
//!
//! let config = DaqConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), tera_daq::error::DaqError>(())
//! ```
//!
//! `TERA_DAQ_APPLICATION__LOG_LEVEL=debug` overrides `application.log_level`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/tera_daq.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaqConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Run container settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Timeout and retry policy
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Control loop settings
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "TeraDAQ".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Run container backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Run directory with JSON-lines records
    Jsonl,
    /// HDF5 file per run (feature `storage_hdf5`)
    Hdf5,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory runs are created in
    pub output_dir: PathBuf,
    /// Container format
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    /// Sync every append to disk before the Runner advances
    #[serde(default = "default_true")]
    pub fsync: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            backend: default_backend(),
            fsync: true,
        }
    }
}

/// Dispatcher timeouts and connection retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Bound for query and set operations
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Bound for capture operations
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,
    /// Bound for a single connect attempt
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Capture bound per instrument role
    #[serde(default)]
    pub role_timeouts_ms: HashMap<String, u64>,
    /// Connection retry policy
    #[serde(default)]
    pub connect_retry: RetryConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            capture_timeout_ms: default_capture_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            role_timeouts_ms: HashMap::new(),
            connect_retry: RetryConfig::default(),
        }
    }
}

/// Bounded exponential backoff for connect operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff_ms: u64,
    /// Delay growth factor
    pub multiplier: f64,
    /// Upper bound for one delay
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            multiplier: 2.0,
            max_backoff_ms: 2000,
        }
    }
}

impl RetryConfig {
    /// Runtime retry policy.
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            multiplier: self.multiplier,
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// Control loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Snapshots buffered per subscriber before it lags
    #[serde(default = "default_status_capacity")]
    pub status_channel_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            status_channel_capacity: default_status_capacity(),
        }
    }
}

/// Instrument definition in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Role the instrument is registered under (e.g. "source")
    pub role: String,
    /// Driver type (e.g. "simulated_source", "simulated_controller")
    pub r#type: String,
    /// Transport address, if the driver needs one
    #[serde(default)]
    pub address: Option<String>,
    /// Whether this instrument is registered
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Driver-specific settings
    #[serde(default)]
    pub settings: toml::Table,
}

impl InstrumentDefinition {
    /// Numeric driver setting.
    pub fn setting_f64(&self, key: &str) -> Option<f64> {
        match self.settings.get(key)? {
            toml::Value::Float(f) => Some(*f),
            toml::Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// String driver setting.
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(toml::Value::as_str)
    }
}

fn default_backend() -> StorageBackend {
    StorageBackend::Jsonl
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_capture_timeout_ms() -> u64 {
    60_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_status_capacity() -> usize {
    256
}

impl DaqConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(DaqConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TERA_DAQ_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.storage.backend == StorageBackend::Hdf5 && !cfg!(feature = "storage_hdf5") {
            return Err(DaqError::Configuration(
                "Storage backend 'hdf5' requires the storage_hdf5 feature".into(),
            ));
        }

        let d = &self.dispatcher;
        if d.default_timeout_ms == 0 || d.capture_timeout_ms == 0 || d.connect_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "Dispatcher timeouts must be greater than zero".into(),
            ));
        }
        if let Some((role, _)) = d.role_timeouts_ms.iter().find(|(_, ms)| **ms == 0) {
            return Err(DaqError::Configuration(format!(
                "Capture timeout for role '{}' must be greater than zero",
                role
            )));
        }
        if !(d.connect_retry.multiplier.is_finite() && d.connect_retry.multiplier >= 1.0) {
            return Err(DaqError::Configuration(format!(
                "Invalid retry multiplier {}. Must be >= 1.0",
                d.connect_retry.multiplier
            )));
        }

        if self.runner.status_channel_capacity == 0 {
            return Err(DaqError::Configuration(
                "status_channel_capacity must be greater than zero".into(),
            ));
        }

        let mut roles = HashSet::new();
        for instrument in self.enabled_instruments() {
            if !roles.insert(&instrument.role) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate instrument role: {}",
                    instrument.role
                )));
            }
        }

        Ok(())
    }

    /// Get all enabled instruments
    pub fn enabled_instruments(&self) -> Vec<&InstrumentDefinition> {
        self.instruments
            .iter()
            .filter(|inst| inst.enabled)
            .collect()
    }
}
