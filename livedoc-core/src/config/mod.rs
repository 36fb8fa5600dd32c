//! Configuration management for livedoc
//!
//! Defaults, TOML files and `LIVEDOC_<SECTION>_<KEY>` environment overrides,
//! validated once before use.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

use crate::core_observe::MappedChangePolicy;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Live-query observation settings
    pub observe: ObserveConfig,

    /// Broadcast-fed driver and publisher settings
    pub pubsub: PubSubConfig,

    /// Collection defaults
    pub collections: CollectionConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Observation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserveConfig {
    /// Interval between re-runs of a polled query
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Minimum gap between two polls of the same query
    #[serde(with = "humantime_serde")]
    pub poll_throttle: Duration,

    /// Events buffered per listener before the multiplexer waits on it
    pub listener_buffer: usize,

    /// Events buffered between a driver and its multiplexer
    pub driver_buffer: usize,

    /// Never pick the log-tailing driver automatically
    pub disable_log_tailing: bool,

    /// What to do when a mapped document did not change
    pub mapped_change_policy: MappedChangePolicy,
}

/// Pub/sub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Create a broadcast manager when composing a `LiveDb`
    pub enabled: bool,

    /// Default for `PublishOptions::optimistic`
    pub optimistic: bool,

    /// Capacity of each broadcast channel
    pub channel_buffer: usize,
}

/// Collection defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// "STRING" or "MONGO"
    pub id_generation: String,

    /// Register insert/update/delete methods when a collection is created
    pub define_mutation_methods: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Describe and emit metrics
    pub enabled: bool,
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            poll_throttle: Duration::from_millis(50),
            listener_buffer: 1024,
            driver_buffer: 1024,
            disable_log_tailing: false,
            mapped_change_policy: MappedChangePolicy::default(),
        }
    }
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            optimistic: true,
            channel_buffer: 1024,
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            id_generation: "STRING".to_string(),
            define_mutation_methods: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn invalid_env(key: &str, value: String, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidEnv {
        key: key.to_string(),
        value,
        reason: reason.to_string(),
    }
}

fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Ok(Some(v)),
            Err(e) => Err(invalid_env(key, raw, e)),
        },
        Err(_) => Ok(None),
    }
}

fn parse_env_duration(key: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(key) {
        Ok(raw) => match humantime_serde::re::humantime::parse_duration(&raw) {
            Ok(v) => Ok(Some(v)),
            Err(e) => Err(invalid_env(key, raw, e)),
        },
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: LIVEDOC_<SECTION>_<KEY>
    /// Example: LIVEDOC_OBSERVE_POLL_INTERVAL=250ms
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment variables on top of the current values
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = parse_env_duration("LIVEDOC_OBSERVE_POLL_INTERVAL")? {
            self.observe.poll_interval = v;
        }
        if let Some(v) = parse_env_duration("LIVEDOC_OBSERVE_POLL_THROTTLE")? {
            self.observe.poll_throttle = v;
        }
        if let Some(v) = parse_env("LIVEDOC_OBSERVE_LISTENER_BUFFER")? {
            self.observe.listener_buffer = v;
        }
        if let Some(v) = parse_env("LIVEDOC_OBSERVE_DRIVER_BUFFER")? {
            self.observe.driver_buffer = v;
        }
        if let Some(v) = parse_env("LIVEDOC_OBSERVE_DISABLE_LOG_TAILING")? {
            self.observe.disable_log_tailing = v;
        }

        if let Some(v) = parse_env("LIVEDOC_PUBSUB_ENABLED")? {
            self.pubsub.enabled = v;
        }
        if let Some(v) = parse_env("LIVEDOC_PUBSUB_OPTIMISTIC")? {
            self.pubsub.optimistic = v;
        }

        if let Ok(v) = env::var("LIVEDOC_COLLECTIONS_ID_GENERATION") {
            self.collections.id_generation = v;
        }

        if let Ok(level) = env::var("LIVEDOC_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(v) = parse_env("LIVEDOC_LOG_JSON")? {
            self.logging.json_format = v;
        }

        if let Some(v) = parse_env("LIVEDOC_METRICS_ENABLED")? {
            self.metrics.enabled = v;
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.observe.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.observe.listener_buffer == 0 || self.observe.driver_buffer == 0 {
            return Err(ConfigError::ValidationFailed(
                "observe buffers must be greater than 0".to_string(),
            ));
        }

        if self.pubsub.channel_buffer == 0 {
            return Err(ConfigError::ValidationFailed(
                "channel_buffer must be greater than 0".to_string(),
            ));
        }

        if !matches!(self.collections.id_generation.as_str(), "STRING" | "MONGO") {
            return Err(ConfigError::ValidationFailed(format!(
                "Unrecognized id generation: {}",
                self.collections.id_generation
            )));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;

        std::fs::write(path, contents).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(())
    }
}
