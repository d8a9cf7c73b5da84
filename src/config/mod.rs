use crate::events::EventType;
use alloy::primitives::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid url for {field}: {source}")]
    InvalidUrl {
        field: String,
        source: url::ParseError,
    },
    #[error("invalid contract address for {field}: {value}")]
    InvalidAddress { field: String, value: String },
    #[error("unknown event type in {section}: {key}")]
    UnknownEventType { section: String, key: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub primary: PrimaryConfig,
    #[serde(default)]
    pub secondary: SecondaryConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrimaryConfig {
    /// JSON-RPC WebSocket endpoint. Empty disables the primary transport.
    #[serde(default)]
    pub ws_url: String,
    /// Contract emitting pool events.
    #[serde(default)]
    pub pool_contract: String,
    /// Contract emitting cycle and slip events.
    #[serde(default)]
    pub cycle_contract: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecondaryConfig {
    /// Socket endpoint. Empty disables the fallback socket.
    #[serde(default)]
    pub ws_url: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Also subscribe the socket when the primary is healthy.
    #[serde(default)]
    pub redundant: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    /// event type -> URL, polled while push delivery is unavailable.
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_dedupe_capacity")]
    pub dedupe_capacity: usize,
    #[serde(default = "default_min_notify_interval_ms")]
    pub min_notify_interval_ms: u64,
    /// How far ahead of local time a timestamp may be.
    #[serde(default = "default_max_future_skew_secs")]
    pub max_future_skew_secs: i64,
    /// event type -> freshness window in seconds.
    #[serde(default)]
    pub freshness: HashMap<String, i64>,
    #[serde(default = "default_seen_cycles_capacity")]
    pub seen_cycles_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_dir")]
    pub dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}
fn default_heartbeat_secs() -> u64 {
    20
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_dedupe_capacity() -> usize {
    500
}
fn default_min_notify_interval_ms() -> u64 {
    2000
}
fn default_max_future_skew_secs() -> i64 {
    60
}
fn default_seen_cycles_capacity() -> usize {
    100
}
fn default_grace_period_ms() -> u64 {
    30_000
}
fn default_storage_dir() -> String {
    ".poolstream".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            pool_contract: String::new(),
            cycle_contract: String::new(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl Default for SecondaryConfig {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            redundant: false,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            endpoints: HashMap::new(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dedupe_capacity: default_dedupe_capacity(),
            min_notify_interval_ms: default_min_notify_interval_ms(),
            max_future_skew_secs: default_max_future_skew_secs(),
            freshness: HashMap::new(),
            seen_cycles_capacity: default_seen_cycles_capacity(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl PrimaryConfig {
    pub fn enabled(&self) -> bool {
        !self.ws_url.is_empty()
    }

    pub fn pool_address(&self) -> Option<Address> {
        Address::from_str(&self.pool_contract).ok()
    }

    pub fn cycle_address(&self) -> Option<Address> {
        Address::from_str(&self.cycle_contract).ok()
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl SecondaryConfig {
    pub fn enabled(&self) -> bool {
        !self.ws_url.is_empty()
    }
}

impl PollingConfig {
    /// Endpoints keyed by event type. Unknown keys are skipped; `validate`
    /// reports them.
    pub fn endpoint_map(&self) -> HashMap<EventType, String> {
        self.endpoints
            .iter()
            .filter_map(|(k, v)| Some((k.parse().ok()?, v.clone())))
            .collect()
    }
}

impl PipelineConfig {
    pub fn freshness_overrides(&self) -> HashMap<EventType, i64> {
        self.freshness
            .iter()
            .filter_map(|(k, v)| Some((k.parse().ok()?, *v)))
            .collect()
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.overlay_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides (no file needed).
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.overlay_env(|key| std::env::var(key).ok());
        config
    }

    /// Apply `POOLSTREAM_*` overrides from `lookup`.
    pub fn overlay_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("POOLSTREAM_PRIMARY_WS_URL") {
            self.primary.ws_url = v;
        }
        if let Some(v) = lookup("POOLSTREAM_POOL_CONTRACT") {
            self.primary.pool_contract = v;
        }
        if let Some(v) = lookup("POOLSTREAM_CYCLE_CONTRACT") {
            self.primary.cycle_contract = v;
        }
        if let Some(v) = lookup("POOLSTREAM_SECONDARY_WS_URL") {
            self.secondary.ws_url = v;
        }
        if let Some(v) = lookup("POOLSTREAM_STORAGE_DIR") {
            self.storage.dir = v;
        }
        if let Some(v) = lookup("POOLSTREAM_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(ms) = lookup("POOLSTREAM_GRACE_PERIOD_MS").and_then(|v| v.parse().ok()) {
            self.registry.grace_period_ms = ms;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url("primary.ws_url", &self.primary.ws_url)?;
        check_url("secondary.ws_url", &self.secondary.ws_url)?;
        check_address("primary.pool_contract", &self.primary.pool_contract)?;
        check_address("primary.cycle_contract", &self.primary.cycle_contract)?;

        for (key, url) in &self.polling.endpoints {
            check_event_key("polling.endpoints", key)?;
            check_url(&format!("polling.endpoints.{key}"), url)?;
        }
        for key in self.pipeline.freshness.keys() {
            check_event_key("pipeline.freshness", key)?;
        }
        Ok(())
    }
}

fn check_url(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Ok(());
    }
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|source| ConfigError::InvalidUrl {
            field: field.to_string(),
            source,
        })
}

fn check_address(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() || Address::from_str(value).is_ok() {
        return Ok(());
    }
    Err(ConfigError::InvalidAddress {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn check_event_key(section: &str, key: &str) -> Result<(), ConfigError> {
    EventType::from_str(key)
        .map(|_| ())
        .map_err(|_| ConfigError::UnknownEventType {
            section: section.to_string(),
            key: key.to_string(),
        })
}
