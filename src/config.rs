//! Bridge Configuration
//!
//! Loaded from a TOML file, then selectively overridden from the
//! environment. Durations are written as milliseconds.
//!
//! ```toml
//! [source]
//! kind = "kafka"
//! brokers = ["localhost:9092"]
//! group_id = "cdc-bridge"
//! topics = ["dbserver1.inventory.customers"]
//! offset_reset = "earliest"
//! commit_mode = "after_append"
//!
//! [event_log]
//! endpoint = "file:///var/lib/cdc-bridge/log"
//!
//! [primary_keys]
//! customers = "id"
//! products_on_hand = "product_id"
//! ```
//!
//! ## Environment Overrides
//!
//! | Variable | Field |
//! |----------|-------|
//! | CDC_BRIDGE_BROKERS | source.brokers (comma separated) |
//! | CDC_BRIDGE_GROUP_ID | source.group_id |
//! | CDC_BRIDGE_TOPICS | source.topics (comma separated) |
//! | CDC_BRIDGE_OFFSET_RESET | source.offset_reset |
//! | CDC_BRIDGE_COMMIT_MODE | source.commit_mode |
//! | CDC_BRIDGE_LOG_ENDPOINT | event_log.endpoint |

use crate::bridge::retry::RetryPolicy;
use crate::cdc::PrimaryKeyMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the config file path
pub const CONFIG_PATH_ENV: &str = "CDC_BRIDGE_CONFIG";

/// Configuration error; always fatal at startup
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value `{value}` for {var}")]
    InvalidEnv { var: String, value: String },
    #[error("invalid table name `{0}`: must be non-empty and must not contain '-'")]
    InvalidTableName(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub source: SourceConfig,
    pub event_log: EventLogConfig,
    /// Table -> primary-key field
    #[serde(default)]
    pub primary_keys: PrimaryKeyMap,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
}

impl BridgeConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a file, apply environment overrides, validate for a
    /// long-running service
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: BridgeConfig = toml::from_str(&text)?;
        config.apply_env()?;
        config.validate_for_service()?;
        Ok(config)
    }

    /// Config path from the first CLI argument or `CDC_BRIDGE_CONFIG`
    pub fn path_from_args_or_env() -> Option<PathBuf> {
        std::env::args_os()
            .nth(1)
            .map(PathBuf::from)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
    }

    /// Apply `CDC_BRIDGE_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from any variable lookup (the environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(brokers) = lookup("CDC_BRIDGE_BROKERS") {
            self.source.brokers = split_list(&brokers);
        }
        if let Some(group_id) = lookup("CDC_BRIDGE_GROUP_ID") {
            self.source.group_id = group_id;
        }
        if let Some(topics) = lookup("CDC_BRIDGE_TOPICS") {
            self.source.topics = split_list(&topics);
        }
        if let Some(endpoint) = lookup("CDC_BRIDGE_LOG_ENDPOINT") {
            self.event_log.endpoint = endpoint;
        }
        if let Some(reset) = lookup("CDC_BRIDGE_OFFSET_RESET") {
            self.source.offset_reset = match reset.to_lowercase().as_str() {
                "earliest" => OffsetReset::Earliest,
                "latest" => OffsetReset::Latest,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "CDC_BRIDGE_OFFSET_RESET".to_string(),
                        value: reset,
                    })
                }
            };
        }
        if let Some(mode) = lookup("CDC_BRIDGE_COMMIT_MODE") {
            self.source.commit_mode = match mode.to_lowercase().as_str() {
                "after_append" => CommitMode::AfterAppend,
                "auto" => CommitMode::Auto,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "CDC_BRIDGE_COMMIT_MODE".to_string(),
                        value: mode,
                    })
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.primary_keys.validate()?;
        if self.primary_keys.is_empty() {
            return Err(ConfigError::Invalid(
                "primary_keys must configure at least one table".to_string(),
            ));
        }
        if self.source.kind == SourceKind::Kafka {
            if self.source.brokers.is_empty() {
                return Err(ConfigError::Invalid("source.brokers is empty".to_string()));
            }
            if self.source.topics.is_empty() {
                return Err(ConfigError::Invalid("source.topics is empty".to_string()));
            }
            if self.source.group_id.is_empty() {
                return Err(ConfigError::Invalid("source.group_id is empty".to_string()));
            }
            if self.source.partitions.is_empty() {
                return Err(ConfigError::Invalid("source.partitions is empty".to_string()));
            }
        }
        if self.source.poll_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "source.poll_timeout_ms must be positive".to_string(),
            ));
        }
        self.event_log.endpoint()?;
        self.retry.validate()?;
        Ok(())
    }

    /// `validate`, plus rejecting sources nothing can feed from outside
    /// the process
    pub fn validate_for_service(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.source.kind == SourceKind::Memory {
            return Err(ConfigError::Invalid(
                "source.kind = \"memory\" has no producer outside tests".to_string(),
            ));
        }
        Ok(())
    }

    /// In-memory source and log, for tests
    pub fn test() -> Self {
        BridgeConfig {
            source: SourceConfig::test(),
            event_log: EventLogConfig::memory(),
            primary_keys: PrimaryKeyMap::new()
                .with("customers", "id")
                .with("products", "id")
                .with("products_on_hand", "product_id"),
            retry: RetryPolicy::test(),
            dead_letter: DeadLetterConfig::default(),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Message source backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Kafka,
    /// In-process source fed through a handle
    Memory,
}

/// Where to start when a partition has no committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

/// When the source position is committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Only after the message was appended, skipped or dead-lettered
    /// (at-least-once)
    #[default]
    AfterAppend,
    /// As soon as the message is polled
    Auto,
}

/// Message source connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    #[serde(default)]
    pub brokers: Vec<String>,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default = "default_partitions")]
    pub partitions: Vec<i32>,
    #[serde(default)]
    pub offset_reset: OffsetReset,
    #[serde(default)]
    pub commit_mode: CommitMode,
    /// Directory holding committed offsets per consumer group
    #[serde(default = "default_offset_dir")]
    pub offset_dir: PathBuf,
    #[serde(
        rename = "poll_timeout_ms",
        with = "duration_millis",
        default = "default_poll_timeout"
    )]
    pub poll_timeout: Duration,
    #[serde(
        rename = "connect_timeout_ms",
        with = "duration_millis",
        default = "default_connect_timeout"
    )]
    pub connect_timeout: Duration,
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: i32,
}

fn default_partitions() -> Vec<i32> {
    vec![0]
}

fn default_offset_dir() -> PathBuf {
    PathBuf::from("/var/lib/cdc-bridge/offsets")
}

fn default_poll_timeout() -> Duration {
    Duration::from_millis(1000)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_fetch_max_bytes() -> i32 {
    1024 * 1024 // 1MB
}

impl SourceConfig {
    /// Kafka source with the given brokers, group and topics
    pub fn kafka(brokers: Vec<String>, group_id: &str, topics: Vec<String>) -> Self {
        SourceConfig {
            kind: SourceKind::Kafka,
            brokers,
            group_id: group_id.to_string(),
            topics,
            partitions: default_partitions(),
            offset_reset: OffsetReset::Earliest,
            commit_mode: CommitMode::AfterAppend,
            offset_dir: default_offset_dir(),
            poll_timeout: default_poll_timeout(),
            connect_timeout: default_connect_timeout(),
            fetch_max_bytes: default_fetch_max_bytes(),
        }
    }

    /// In-memory source with a short poll timeout
    pub fn test() -> Self {
        SourceConfig {
            kind: SourceKind::Memory,
            poll_timeout: Duration::from_millis(10),
            ..Self::kafka(Vec::new(), "test", Vec::new())
        }
    }
}

/// Parsed event log endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEndpoint {
    /// `memory://`
    Memory,
    /// `file://<dir>`
    File(PathBuf),
}

/// Event log connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    /// `memory://` or `file://<dir>`
    pub endpoint: String,
    /// Segment size before rotation (default: 64MB)
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,
    /// Fsync after every append
    #[serde(default = "default_fsync")]
    pub fsync: bool,
}

fn default_segment_max_bytes() -> u64 {
    64 * 1024 * 1024 // 64MB
}

fn default_fsync() -> bool {
    true
}

impl EventLogConfig {
    pub fn memory() -> Self {
        EventLogConfig {
            endpoint: "memory://".to_string(),
            segment_max_bytes: default_segment_max_bytes(),
            fsync: default_fsync(),
        }
    }

    pub fn file(dir: &Path) -> Self {
        EventLogConfig {
            endpoint: format!("file://{}", dir.display()),
            segment_max_bytes: default_segment_max_bytes(),
            fsync: default_fsync(),
        }
    }

    pub fn endpoint(&self) -> Result<LogEndpoint, ConfigError> {
        if self.endpoint == "memory://" {
            return Ok(LogEndpoint::Memory);
        }
        match self.endpoint.strip_prefix("file://") {
            Some(path) if !path.is_empty() => Ok(LogEndpoint::File(PathBuf::from(path))),
            _ => Err(ConfigError::Invalid(format!(
                "unsupported event_log.endpoint `{}` (use memory:// or file://<dir>)",
                self.endpoint
            ))),
        }
    }
}

/// Dead-letter destination
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// JSON-lines file; when unset dead letters are only logged
    pub path: Option<PathBuf>,
}

/// Serde helper for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
