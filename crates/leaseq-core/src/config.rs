//! Queue configuration.
//!
//! Everything is plain serde data so a queue can be described in TOML:
//!
//! ```toml
//! [store]
//! backend = "sqlite"
//! path = "queue.db"
//!
//! [queue]
//! name = "orders"
//! enable_priority = true
//!
//! [queue.heartbeat]
//! lease_timeout_ms = 60000
//! renew_interval_ms = 15000
//! ```
//!
//! Durations are integer milliseconds (`*_ms`).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::columns::{ColumnSchema, is_identifier};
use crate::error::QueueError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for QueueError {
    fn from(err: ConfigError) -> Self {
        QueueError::Configuration(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatOptions {
    /// A lease older than this is reclaimed by the heartbeat monitor.
    pub lease_timeout_ms: u64,
    /// How often a worker renews the lease while its handler runs.
    pub renew_interval_ms: u64,
    pub monitor_interval_ms: u64,
    pub batch_size: usize,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            lease_timeout_ms: 60_000,
            renew_interval_ms: 15_000,
            monitor_interval_ms: 10_000,
            batch_size: 100,
        }
    }
}

impl HeartbeatOptions {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayedOptions {
    pub monitor_interval_ms: u64,
    pub batch_size: usize,
}

impl Default for DelayedOptions {
    fn default() -> Self {
        Self {
            monitor_interval_ms: 1_000,
            batch_size: 100,
        }
    }
}

impl DelayedOptions {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationOptions {
    pub monitor_interval_ms: u64,
    pub batch_size: usize,
    /// Applied when the producer sets no expiration of its own.
    pub default_expiration_ms: Option<u64>,
}

impl Default for ExpirationOptions {
    fn default() -> Self {
        Self {
            monitor_interval_ms: 5_000,
            batch_size: 100,
            default_expiration_ms: None,
        }
    }
}

impl ExpirationOptions {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn default_expiration(&self) -> Option<Duration> {
        self.default_expiration_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Retries allowed per exception type (the first attempt is not a retry).
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random (0.0 disables jitter).
    pub jitter: f64,
    /// Per-exception-type overrides of `max_retries`.
    pub per_exception: BTreeMap<String, u32>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            jitter: 0.0,
            per_exception: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    pub workers: usize,
    /// Idle poll interval; a local enqueue wakes idle workers earlier.
    pub poll_interval_ms: u64,
    /// Only lease messages with this route.
    pub route: Option<String>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval_ms: 500,
            route: None,
        }
    }
}

impl WorkerOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Options persisted in the configuration table when the queue is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub name: String,
    pub enable_priority: bool,
    pub enable_routes: bool,
    pub enable_status_table: bool,
    pub enable_delayed_processing: bool,
    pub enable_message_expiration: bool,
    pub enable_heartbeat: bool,
    pub heartbeat: HeartbeatOptions,
    pub delayed: DelayedOptions,
    pub expiration: ExpirationOptions,
    pub retry: RetryOptions,
    pub worker: WorkerOptions,
    pub additional_columns: ColumnSchema,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            enable_priority: false,
            enable_routes: false,
            enable_status_table: false,
            enable_delayed_processing: true,
            enable_message_expiration: true,
            enable_heartbeat: true,
            heartbeat: HeartbeatOptions::default(),
            delayed: DelayedOptions::default(),
            expiration: ExpirationOptions::default(),
            retry: RetryOptions::default(),
            worker: WorkerOptions::default(),
            additional_columns: ColumnSchema::default(),
        }
    }
}

impl QueueOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let options: Self = toml::from_str(input)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Cross-field checks. Called by every constructor that accepts options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_identifier(&self.name) {
            return Err(invalid(format!(
                "queue name `{}` must be an identifier",
                self.name
            )));
        }
        if self.enable_heartbeat {
            let hb = &self.heartbeat;
            if hb.lease_timeout_ms == 0 || hb.renew_interval_ms == 0 || hb.monitor_interval_ms == 0
            {
                return Err(invalid("heartbeat intervals must be non-zero"));
            }
            if hb.renew_interval_ms.saturating_mul(3) > hb.lease_timeout_ms {
                return Err(invalid(format!(
                    "heartbeat renew interval ({}ms) must be at most a third of the lease timeout ({}ms)",
                    hb.renew_interval_ms, hb.lease_timeout_ms
                )));
            }
            if hb.batch_size == 0 {
                return Err(invalid("heartbeat batch size must be non-zero"));
            }
        }
        if self.enable_delayed_processing
            && (self.delayed.monitor_interval_ms == 0 || self.delayed.batch_size == 0)
        {
            return Err(invalid("delayed monitor interval and batch size must be non-zero"));
        }
        if self.enable_message_expiration
            && (self.expiration.monitor_interval_ms == 0 || self.expiration.batch_size == 0)
        {
            return Err(invalid("expiration monitor interval and batch size must be non-zero"));
        }
        if !self.enable_message_expiration && self.expiration.default_expiration_ms.is_some() {
            return Err(invalid("default expiration set while expiration is disabled"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(invalid("retry multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(invalid("retry jitter must be within 0.0..=1.0"));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(invalid("worker poll interval must be non-zero"));
        }
        if self.worker.route.is_some() && !self.enable_routes {
            return Err(invalid("worker route filter set while routes are disabled"));
        }
        self.additional_columns
            .validate_definitions()
            .map_err(|e| invalid(e.to_string()))?;
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Which backend a queue lives in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    Sqlite {
        /// `None` opens a private in-memory database.
        #[serde(default)]
        path: Option<String>,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        #[serde(default = "default_busy_timeout_ms")]
        busy_timeout_ms: u64,
    },
    Redis {
        url: String,
        #[serde(default = "default_namespace")]
        namespace: String,
    },
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_namespace() -> String {
    "leaseq".to_string()
}

/// Top-level config file: one store, one queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseqConfig {
    pub store: StoreConfig,
    pub queue: QueueOptions,
}

impl LeaseqConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.queue.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_are_valid() {
        QueueOptions::default().validate().unwrap();
    }

    #[rstest]
    #[case(60_000, 20_000, true)]
    #[case(60_000, 20_001, false)]
    #[case(30_000, 15_000, false)]
    #[case(0, 0, false)]
    fn heartbeat_ratio(#[case] lease_ms: u64, #[case] renew_ms: u64, #[case] ok: bool) {
        let mut options = QueueOptions::default();
        options.heartbeat.lease_timeout_ms = lease_ms;
        options.heartbeat.renew_interval_ms = renew_ms;
        assert_eq!(options.validate().is_ok(), ok);
    }

    #[test]
    fn heartbeat_ratio_ignored_when_disabled() {
        let mut options = QueueOptions::default();
        options.enable_heartbeat = false;
        options.heartbeat.renew_interval_ms = options.heartbeat.lease_timeout_ms;
        options.validate().unwrap();
    }

    #[test]
    fn route_filter_requires_routes() {
        let mut options = QueueOptions::default();
        options.worker.route = Some("blue".into());
        assert!(options.validate().is_err());
        options.enable_routes = true;
        options.validate().unwrap();
    }

    #[test]
    fn queue_name_must_be_identifier() {
        let options = QueueOptions::new("orders; drop table x");
        assert!(matches!(options.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn parses_full_config_file() {
        let raw = r#"
            [store]
            backend = "sqlite"
            path = "/tmp/queue.db"

            [queue]
            name = "orders"
            enable_priority = true
            enable_status_table = true

            [queue.heartbeat]
            lease_timeout_ms = 30000
            renew_interval_ms = 5000

            [queue.retry]
            max_retries = 2
            per_exception = { Timeout = 5 }

            [[queue.additional_columns]]
            name = "tenant"
            column_type = "text"
            nullable = false
        "#;
        let config = LeaseqConfig::from_toml_str(raw).unwrap();
        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                path: Some("/tmp/queue.db".into()),
                max_connections: 5,
                busy_timeout_ms: 5_000,
            }
        );
        assert_eq!(config.queue.name, "orders");
        assert!(config.queue.enable_priority);
        assert_eq!(config.queue.heartbeat.lease_timeout(), Duration::from_secs(30));
        assert_eq!(config.queue.heartbeat.batch_size, 100);
        assert_eq!(config.queue.retry.per_exception.get("Timeout"), Some(&5));
        assert!(config.queue.additional_columns.get("tenant").is_some());
    }

    #[test]
    fn invalid_file_is_rejected() {
        let raw = r#"
            [queue.heartbeat]
            lease_timeout_ms = 1000
            renew_interval_ms = 900
        "#;
        let err = LeaseqConfig::from_toml_str(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let as_queue_error: QueueError = err.into();
        assert!(matches!(as_queue_error, QueueError::Configuration(_)));
    }

    #[test]
    fn reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.toml");
        std::fs::write(&path, "name = \"mail\"\nenable_routes = true\n").unwrap();
        let options = QueueOptions::from_toml_file(&path).unwrap();
        assert_eq!(options.name, "mail");
        assert!(options.enable_routes);
    }
}
