//! Configuration module for the data pipeline core
//!
//! Settings are grouped per component. Every section has defaults so a bare
//! `Config::default()` runs the whole core in-process; deployments override
//! values through a config file and `DATA_PIPELINE__SECTION__KEY` variables.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::resilience::{CircuitBreakerConfig, RetryConfig};

/// Main configuration for the pipeline core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data connector settings
    pub connector: ConnectorConfig,
    /// ETL engine settings
    pub etl: EtlConfig,
    /// Stream processor defaults
    pub stream: StreamConfig,
    /// Kafka transport settings
    pub kafka: KafkaConfig,
    /// Data quality monitor settings
    pub quality: QualityConfig,
    /// Default retry and circuit breaker policies
    pub resilience: ResilienceConfig,
    /// Logging and metrics settings
    pub monitoring: MonitoringConfig,
}

/// Data connector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Timeout applied to HTTP sources without their own timeout
    pub http_timeout_secs: u64,
    /// Pool size for relational sources without their own pool size
    pub relational_max_connections: u32,
    /// Seconds to wait when acquiring a relational connection
    pub relational_acquire_timeout_secs: u64,
}

/// ETL engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    /// Results retained per job id
    pub history_limit: usize,
    /// Suffix for the default quarantine table
    pub quarantine_suffix: String,
}

/// Stream processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Capacity of subscription channels
    pub channel_capacity: usize,
    /// Partitions for topics created by processors
    pub topic_partitions: i32,
    /// Replication factor for topics created by processors
    pub topic_replication: i32,
}

/// Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Client id prefix for producers, consumers and the admin client
    pub client_id: String,
    /// Enable auto commit
    pub enable_auto_commit: bool,
    /// Session timeout in milliseconds
    pub session_timeout_ms: u64,
    /// Where to start when a group has no committed offset
    pub auto_offset_reset: String,
    /// Produce timeout in milliseconds
    pub produce_timeout_ms: u64,
    /// Compression type
    pub compression_type: String,
    /// SASL configuration
    pub sasl: Option<SaslConfig>,
}

/// SASL configuration for Kafka
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaslConfig {
    /// SASL mechanism
    pub mechanism: String,
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

/// Data quality monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Messages kept in the rolling buffer
    pub buffer_capacity: usize,
    /// Seconds between metric recomputations
    pub evaluation_interval_secs: u64,
    /// Messages older than this are counted as late for timeliness
    pub timeliness_threshold_secs: i64,
    /// Alerts retained before the oldest resolved ones are dropped
    pub alert_limit: usize,
    /// Per-metric alert thresholds
    pub thresholds: QualityThresholds,
}

/// Warning/critical band for one quality metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricThresholds {
    pub warning: f64,
    pub critical: f64,
}

impl MetricThresholds {
    pub const fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }
}

/// Thresholds for the six quality dimensions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub completeness: MetricThresholds,
    pub accuracy: MetricThresholds,
    pub consistency: MetricThresholds,
    pub timeliness: MetricThresholds,
    pub validity: MetricThresholds,
    pub uniqueness: MetricThresholds,
}

/// Default resilience policies
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Monitoring and logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Log level
    pub log_level: String,
    /// Log format (json or pretty)
    pub log_format: String,
    /// Prefix for Prometheus metric names
    pub metrics_namespace: String,
    /// Capacity of the event bus
    pub event_bus_capacity: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: 30,
            relational_max_connections: 10,
            relational_acquire_timeout_secs: 10,
        }
    }
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            quarantine_suffix: "_quarantine".to_string(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1000,
            topic_partitions: 3,
            topic_replication: 1,
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: "data-pipeline".to_string(),
            enable_auto_commit: true,
            session_timeout_ms: 30000,
            auto_offset_reset: "earliest".to_string(),
            produce_timeout_ms: 30000,
            compression_type: "lz4".to_string(),
            sasl: None,
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            evaluation_interval_secs: 30,
            timeliness_threshold_secs: 300,
            alert_limit: 1000,
            thresholds: QualityThresholds::default(),
        }
    }
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            completeness: MetricThresholds::new(95.0, 90.0),
            accuracy: MetricThresholds::new(95.0, 90.0),
            consistency: MetricThresholds::new(90.0, 80.0),
            timeliness: MetricThresholds::new(90.0, 80.0),
            validity: MetricThresholds::new(95.0, 90.0),
            uniqueness: MetricThresholds::new(98.0, 95.0),
        }
    }
}

impl QualityThresholds {
    fn all(&self) -> [(&'static str, MetricThresholds); 6] {
        [
            ("completeness", self.completeness),
            ("accuracy", self.accuracy),
            ("consistency", self.consistency),
            ("timeliness", self.timeliness),
            ("validity", self.validity),
            ("uniqueness", self.uniqueness),
        ]
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            metrics_namespace: "data_pipeline".to_string(),
            event_bus_capacity: 1024,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut cfg = config::Config::builder();

        // Load from file if specified
        if let Ok(config_file) = std::env::var("DATA_PIPELINE_CONFIG_FILE") {
            cfg = cfg.add_source(config::File::with_name(&config_file));
        }

        cfg = cfg.add_source(
            config::Environment::with_prefix("DATA_PIPELINE")
                .separator("__")
                .list_separator(",")
                .try_parsing(true),
        );

        let config: Self = cfg.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from a file, with environment overrides on top
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let cfg = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("DATA_PIPELINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.etl.history_limit == 0 {
            return Err(PipelineError::configuration(
                "ETL history limit must be greater than 0",
            ));
        }

        if self.stream.channel_capacity == 0 {
            return Err(PipelineError::configuration(
                "Stream channel capacity must be greater than 0",
            ));
        }

        if self.stream.topic_partitions <= 0 || self.stream.topic_replication <= 0 {
            return Err(PipelineError::configuration(
                "Topic partitions and replication must be greater than 0",
            ));
        }

        if self.quality.buffer_capacity == 0 {
            return Err(PipelineError::configuration(
                "Quality buffer capacity must be greater than 0",
            ));
        }

        if self.quality.evaluation_interval_secs == 0 {
            return Err(PipelineError::configuration(
                "Quality evaluation interval must be greater than 0",
            ));
        }

        for (name, band) in self.quality.thresholds.all() {
            if band.critical > band.warning {
                return Err(PipelineError::configuration(format!(
                    "Critical threshold for {} cannot exceed its warning threshold",
                    name
                )));
            }
        }

        self.resilience.retry.validate()?;
        self.resilience.circuit_breaker.validate()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.quality.buffer_capacity = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.quality.thresholds.accuracy = MetricThresholds::new(80.0, 90.0);
        assert!(config.validate().is_err());

        config = Config::default();
        config.resilience.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(
            &path,
            r#"{"etl": {"history_limit": 5}, "quality": {"buffer_capacity": 50}}"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.etl.history_limit, 5);
        assert_eq!(config.quality.buffer_capacity, 50);
        assert_eq!(config.stream.channel_capacity, 1000);
    }
}
