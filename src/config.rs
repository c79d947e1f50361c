//! Configuration module for the edge telemetry agent.
//!
//! Scalar settings come from environment variables; sink definitions come
//! from a JSON file named by `EDGE_TELEMETRY_SINKS_FILE`. Everything is
//! validated at load time so the pipeline only ever sees a typed, consistent
//! [`Config`].

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backpressure::Thresholds;
use crate::sink::PayloadMode;

/// Default location of the reading buffer
const DEFAULT_DB_PATH: &str = "./edge-telemetry.db";

/// Default seconds between collector ticks
const DEFAULT_COLLECT_INTERVAL_SECS: u64 = 10;

/// Default seconds between publisher ticks
const DEFAULT_PUBLISH_INTERVAL_SECS: u64 = 30;

/// Default seconds between pruner ticks
const DEFAULT_PRUNE_INTERVAL_SECS: u64 = 300;

/// Default number of readings drained per publish cycle
const DEFAULT_PUBLISH_BATCH_SIZE: usize = 50;

/// Default rows deleted per prune chunk
const DEFAULT_PRUNE_CHUNK_SIZE: usize = 5_000;

/// Default rows deleted per prune tick
const DEFAULT_PRUNE_BUDGET: usize = 50_000;

/// Default free-space mark below which collection stops
const DEFAULT_LOW_WATER_MB: u64 = 512;

/// Default free-space mark below which pruning runs immediately
const DEFAULT_URGENT_MB: u64 = 128;

/// Default per-sink delivery timeout
const DEFAULT_SINK_TIMEOUT_SECS: u64 = 10;

/// Default ceiling for the publisher's failure backoff
const DEFAULT_MAX_BACKOFF_SECS: u64 = 300;

/// Default upper bound for a single scheduler tick
const DEFAULT_TICK_TIMEOUT_SECS: u64 = 120;

/// Maximum allowed publish batch size
const MAX_PUBLISH_BATCH_SIZE: usize = 10_000;

/// Longest interval accepted for any periodic task
const MAX_INTERVAL_SECS: u64 = 86_400;

/// Default MQTT port
const DEFAULT_BROKER_PORT: u16 = 1883;

/// Default MQTT topic prefix
const DEFAULT_TOPIC_PREFIX: &str = "dataloggers";

/// Default MQTT keep-alive in seconds
const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

/// Error type for configuration loading failures
#[derive(Debug, Error)]
#[error("Configuration error{}: {message}", var_suffix(.env_var))]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

fn var_suffix(env_var: &Option<String>) -> String {
    match env_var {
        Some(var) => format!(" for {}", var),
        None => String::new(),
    }
}

impl ConfigError {
    fn var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }

    fn general(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: None,
        }
    }
}

/// How an HTTP sink authenticates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum AuthMode {
    /// No authentication header
    #[default]
    None,

    /// `Authorization: Bearer <key>`
    Bearer { key: String },

    /// `X-API-KEY: <key>`
    XApiKey { key: String },

    /// `<name>: <key>`
    Header { name: String, key: String },
}

/// HTTP endpoint receiving batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSinkConfig {
    pub name: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    pub url: String,

    #[serde(default)]
    pub auth: AuthMode,

    #[serde(default)]
    pub payload: PayloadMode,

    /// Overrides the agent-wide sink timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// MQTT broker receiving one message per reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSinkConfig {
    pub name: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    #[serde(default)]
    pub tls: bool,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Defaults to `pub_<station id>`
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default)]
    pub payload: PayloadMode,

    /// Overrides the agent-wide sink timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for BrokerSinkConfig {
    fn default() -> Self {
        Self {
            name: "broker".to_string(),
            enabled: true,
            host: "localhost".to_string(),
            port: DEFAULT_BROKER_PORT,
            tls: false,
            username: None,
            password: None,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            client_id: None,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            payload: PayloadMode::default(),
            timeout_secs: None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_broker_port() -> u16 {
    DEFAULT_BROKER_PORT
}

fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_string()
}

fn default_keep_alive_secs() -> u64 {
    DEFAULT_KEEP_ALIVE_SECS
}

/// A configured delivery destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    Http(HttpSinkConfig),
    Broker(BrokerSinkConfig),
}

impl SinkConfig {
    pub fn name(&self) -> &str {
        match self {
            SinkConfig::Http(c) => &c.name,
            SinkConfig::Broker(c) => &c.name,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            SinkConfig::Http(c) => c.enabled,
            SinkConfig::Broker(c) => c.enabled,
        }
    }

    /// Per-sink timeout override, if any.
    pub fn timeout(&self) -> Option<Duration> {
        let secs = match self {
            SinkConfig::Http(c) => c.timeout_secs,
            SinkConfig::Broker(c) => c.timeout_secs,
        };
        secs.map(Duration::from_secs)
    }

    /// Check the fields that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = self.name();
        if name.trim().is_empty() {
            return Err(ConfigError::general("sink name must not be empty"));
        }
        if self.timeout() == Some(Duration::ZERO) {
            return Err(ConfigError::general(format!(
                "sink '{}': timeout_secs must be greater than 0",
                name
            )));
        }

        match self {
            SinkConfig::Http(c) => {
                if !(c.url.starts_with("http://") || c.url.starts_with("https://")) {
                    return Err(ConfigError::general(format!(
                        "sink '{}': url '{}' must start with http:// or https://",
                        name, c.url
                    )));
                }
                match &c.auth {
                    AuthMode::None => {}
                    AuthMode::Bearer { key } | AuthMode::XApiKey { key } => {
                        if key.is_empty() {
                            return Err(ConfigError::general(format!(
                                "sink '{}': auth key must not be empty",
                                name
                            )));
                        }
                    }
                    AuthMode::Header { name: header, key } => {
                        if header.trim().is_empty() || key.is_empty() {
                            return Err(ConfigError::general(format!(
                                "sink '{}': header auth needs a header name and a key",
                                name
                            )));
                        }
                    }
                }
            }
            SinkConfig::Broker(c) => {
                if crate::sink::broker::strip_scheme(&c.host).is_empty() {
                    return Err(ConfigError::general(format!(
                        "sink '{}': broker host must not be empty",
                        name
                    )));
                }
                if c.port == 0 {
                    return Err(ConfigError::general(format!(
                        "sink '{}': broker port must not be 0",
                        name
                    )));
                }
                if c.username.is_some() != c.password.is_some() {
                    return Err(ConfigError::general(format!(
                        "sink '{}': username and password must be set together",
                        name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SinksFile {
    #[serde(default)]
    sinks: Vec<SinkConfig>,
}

/// Parse and validate a sinks document.
pub fn parse_sinks(json: &str) -> Result<Vec<SinkConfig>, ConfigError> {
    let file: SinksFile = serde_json::from_str(json)
        .map_err(|e| ConfigError::general(format!("invalid sinks document: {}", e)))?;

    let mut names = HashSet::new();
    for sink in &file.sinks {
        sink.validate()?;
        if !names.insert(sink.name().to_string()) {
            return Err(ConfigError::general(format!(
                "duplicate sink name '{}'",
                sink.name()
            )));
        }
    }
    Ok(file.sinks)
}

/// Read, parse and validate a sinks file.
pub fn load_sinks(path: impl AsRef<Path>) -> Result<Vec<SinkConfig>, ConfigError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::var(
            "EDGE_TELEMETRY_SINKS_FILE",
            format!("cannot read {}: {}", path.display(), e),
        )
    })?;
    parse_sinks(&json)
}

/// Configuration for the edge telemetry agent.
///
/// All settings can be configured via environment variables:
/// - `EDGE_TELEMETRY_DB_PATH`: Buffer database (default: ./edge-telemetry.db)
/// - `EDGE_TELEMETRY_STATION_ID`: Station id override (default: derived)
/// - `EDGE_TELEMETRY_COLLECT_INTERVAL_SECS`: Seconds between samples (default: 10)
/// - `EDGE_TELEMETRY_PUBLISH_INTERVAL_SECS`: Seconds between publish cycles (default: 30)
/// - `EDGE_TELEMETRY_PRUNE_INTERVAL_SECS`: Seconds between prune passes (default: 300)
/// - `EDGE_TELEMETRY_PUBLISH_BATCH_SIZE`: Readings per publish cycle (default: 50)
/// - `EDGE_TELEMETRY_PRUNE_CHUNK_SIZE`: Rows per delete statement (default: 5000)
/// - `EDGE_TELEMETRY_PRUNE_BUDGET`: Rows deleted per prune tick (default: 50000)
/// - `EDGE_TELEMETRY_LOW_WATER_MB`: Stop collecting below this (default: 512)
/// - `EDGE_TELEMETRY_URGENT_MB`: Prune immediately below this (default: 128)
/// - `EDGE_TELEMETRY_SINK_TIMEOUT_SECS`: Per-sink delivery timeout (default: 10)
/// - `EDGE_TELEMETRY_MAX_BACKOFF_SECS`: Publisher backoff ceiling, 0 disables backoff (default: 300)
/// - `EDGE_TELEMETRY_TICK_TIMEOUT_SECS`: Bound for any single task tick (default: 120)
/// - `EDGE_TELEMETRY_SINKS_FILE`: JSON file with sink definitions (default: none)
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the SQLite reading buffer
    pub db_path: PathBuf,

    /// Explicit station id; derived from the host when absent
    pub station_id: Option<String>,

    /// Duration between collector ticks
    pub collect_interval: Duration,

    /// Duration between publisher ticks
    pub publish_interval: Duration,

    /// Duration between pruner ticks
    pub prune_interval: Duration,

    /// Maximum readings drained per publish cycle
    pub publish_batch_size: usize,

    /// Rows deleted per prune statement
    pub prune_chunk_size: usize,

    /// Rows deleted per prune tick
    pub prune_budget: usize,

    /// Free-space thresholds for backpressure
    pub thresholds: Thresholds,

    /// Default per-sink delivery timeout
    pub sink_timeout: Duration,

    /// Ceiling for the publisher's failure backoff
    pub max_backoff: Duration,

    /// Upper bound for one tick of any periodic task
    pub tick_timeout: Duration,

    /// Delivery destinations, in delivery order
    pub sinks: Vec<SinkConfig>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is not a valid number, is out of
    /// range, or if the sinks file cannot be read or validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = env::var("EDGE_TELEMETRY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_PATH));

        let station_id = env::var("EDGE_TELEMETRY_STATION_ID")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let collect_interval = Duration::from_secs(Self::parse_u64(
            "EDGE_TELEMETRY_COLLECT_INTERVAL_SECS",
            DEFAULT_COLLECT_INTERVAL_SECS,
            1,
            MAX_INTERVAL_SECS,
        )?);
        let publish_interval = Duration::from_secs(Self::parse_u64(
            "EDGE_TELEMETRY_PUBLISH_INTERVAL_SECS",
            DEFAULT_PUBLISH_INTERVAL_SECS,
            1,
            MAX_INTERVAL_SECS,
        )?);
        let prune_interval = Duration::from_secs(Self::parse_u64(
            "EDGE_TELEMETRY_PRUNE_INTERVAL_SECS",
            DEFAULT_PRUNE_INTERVAL_SECS,
            1,
            MAX_INTERVAL_SECS,
        )?);

        let publish_batch_size = Self::parse_u64(
            "EDGE_TELEMETRY_PUBLISH_BATCH_SIZE",
            DEFAULT_PUBLISH_BATCH_SIZE as u64,
            1,
            MAX_PUBLISH_BATCH_SIZE as u64,
        )? as usize;
        let prune_chunk_size = Self::parse_u64(
            "EDGE_TELEMETRY_PRUNE_CHUNK_SIZE",
            DEFAULT_PRUNE_CHUNK_SIZE as u64,
            1,
            u32::MAX as u64,
        )? as usize;
        let prune_budget = Self::parse_u64(
            "EDGE_TELEMETRY_PRUNE_BUDGET",
            DEFAULT_PRUNE_BUDGET as u64,
            1,
            u32::MAX as u64,
        )? as usize;

        let low_water_mb =
            Self::parse_u64("EDGE_TELEMETRY_LOW_WATER_MB", DEFAULT_LOW_WATER_MB, 0, u32::MAX as u64)?;
        let urgent_mb =
            Self::parse_u64("EDGE_TELEMETRY_URGENT_MB", DEFAULT_URGENT_MB, 0, u32::MAX as u64)?;
        let thresholds = Thresholds::from_mb(low_water_mb, urgent_mb).ok_or_else(|| {
            ConfigError::var(
                "EDGE_TELEMETRY_URGENT_MB",
                format!(
                    "urgent mark {}MB must not exceed low-water mark {}MB",
                    urgent_mb, low_water_mb
                ),
            )
        })?;

        let sink_timeout = Duration::from_secs(Self::parse_u64(
            "EDGE_TELEMETRY_SINK_TIMEOUT_SECS",
            DEFAULT_SINK_TIMEOUT_SECS,
            1,
            600,
        )?);
        let max_backoff = Duration::from_secs(Self::parse_u64(
            "EDGE_TELEMETRY_MAX_BACKOFF_SECS",
            DEFAULT_MAX_BACKOFF_SECS,
            0,
            MAX_INTERVAL_SECS,
        )?);

        let tick_timeout = Duration::from_secs(Self::parse_u64(
            "EDGE_TELEMETRY_TICK_TIMEOUT_SECS",
            DEFAULT_TICK_TIMEOUT_SECS,
            1,
            MAX_INTERVAL_SECS,
        )?);

        let sinks = match env::var("EDGE_TELEMETRY_SINKS_FILE") {
            Ok(path) if !path.trim().is_empty() => load_sinks(path.trim())?,
            _ => Vec::new(),
        };

        Ok(Self {
            db_path,
            station_id,
            collect_interval,
            publish_interval,
            prune_interval,
            publish_batch_size,
            prune_chunk_size,
            prune_budget,
            thresholds,
            sink_timeout,
            max_backoff,
            tick_timeout,
            sinks,
        })
    }

    /// Parse an unsigned integer variable with bounds checking.
    fn parse_u64(env_var: &str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError> {
        match env::var(env_var) {
            Ok(value) => {
                let parsed: u64 = value.trim().parse().map_err(|_| {
                    ConfigError::var(env_var, format!("'{}' is not a valid number", value))
                })?;

                if parsed < min {
                    return Err(ConfigError::var(
                        env_var,
                        format!("{} is below minimum ({})", parsed, min),
                    ));
                }

                if parsed > max {
                    return Err(ConfigError::var(
                        env_var,
                        format!("{} exceeds maximum ({})", parsed, max),
                    ));
                }

                Ok(parsed)
            }
            Err(_) => Ok(default),
        }
    }

    /// Number of sinks that take part in the commit decision.
    pub fn enabled_sinks(&self) -> usize {
        self.sinks.iter().filter(|s| s.enabled()).count()
    }
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            station_id: None,
            collect_interval: Duration::from_secs(DEFAULT_COLLECT_INTERVAL_SECS),
            publish_interval: Duration::from_secs(DEFAULT_PUBLISH_INTERVAL_SECS),
            prune_interval: Duration::from_secs(DEFAULT_PRUNE_INTERVAL_SECS),
            publish_batch_size: DEFAULT_PUBLISH_BATCH_SIZE,
            prune_chunk_size: DEFAULT_PRUNE_CHUNK_SIZE,
            prune_budget: DEFAULT_PRUNE_BUDGET,
            thresholds: Thresholds::default(),
            sink_timeout: Duration::from_secs(DEFAULT_SINK_TIMEOUT_SECS),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
            tick_timeout: Duration::from_secs(DEFAULT_TICK_TIMEOUT_SECS),
            sinks: Vec::new(),
        }
    }
}
