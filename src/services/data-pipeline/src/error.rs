//! Error handling module for the data pipeline core
//!
//! Every component resolves failures into [`PipelineError`]. The connector, ETL
//! engine and stream processor convert these into result objects at their
//! boundaries, so callers see `success: false` plus a message instead of a
//! crashed task.

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error taxonomy for the ingestion core
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Unreachable source, bad credentials, dropped connection
    #[error("Connection error: {source_id} - {message}")]
    Connection { source_id: String, message: String },

    /// Per-source rate limit exceeded
    #[error("Rate limit exceeded: {source_id} - {message}")]
    RateLimit { source_id: String, message: String },

    /// Record failed validation rules
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// A transformation step or processing rule failed
    #[error("Transformation error: {step} - {message}")]
    Transformation { step: String, message: String },

    /// Writing to the relational store failed
    #[error("Load error: {table} - {message}")]
    Load { table: String, message: String },

    /// Publishing to the broker failed
    #[error("Publish error: {topic} - {message}")]
    Publish { topic: String, message: String },

    /// Broker level failures (subscribe, topic admin)
    #[error("Broker error: {message}")]
    Broker { message: String },

    /// Operation exceeded its deadline
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Circuit breaker rejected the call without invoking it
    #[error("Circuit breaker open for {operation}")]
    CircuitOpen { operation: String },

    /// Retry budget spent; carries the last underlying error
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<PipelineError>,
    },

    /// Unknown data source, job or processor
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A job or processor was started twice
    #[error("{kind} already running: {id}")]
    AlreadyRunning { kind: &'static str, id: String },

    /// Source variant or format this build cannot handle
    #[error("Unsupported source type: {source_type}")]
    UnsupportedSource { source_type: String },

    /// Serialization/Deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// I/O errors
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Internal system errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PipelineError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    /// Create a rate limit error
    pub fn rate_limit(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RateLimit {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a transformation error
    pub fn transformation(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transformation {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Create a load error
    pub fn load(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Load {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a publish error
    pub fn publish(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create a broker error
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create an already-running error
    pub fn already_running(kind: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyRunning {
            kind,
            id: id.into(),
        }
    }

    /// Create an unsupported source error
    pub fn unsupported_source(source_type: impl Into<String>) -> Self {
        Self::UnsupportedSource {
            source_type: source_type.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Default retry classification, used when no explicit signature list applies
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Broker { .. } => true,
            Self::Publish { .. } => true,
            Self::Load { .. } => true,
            Self::Io { .. } => true,
            _ => false,
        }
    }

    /// Stable signature matched against `RetryConfig::retryable_errors`
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::Connection { .. } => "CONNECTION_ERROR",
            Self::RateLimit { .. } => "RATE_LIMITED",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Transformation { .. } => "TRANSFORMATION_ERROR",
            Self::Load { .. } => "LOAD_ERROR",
            Self::Publish { .. } => "PUBLISH_ERROR",
            Self::Broker { .. } => "BROKER_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyRunning { .. } => "ALREADY_RUNNING",
            Self::UnsupportedSource { .. } => "UNSUPPORTED_SOURCE",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::Io { .. } => "IO_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Get the error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Connection { .. } => "connection",
            Self::RateLimit { .. } => "rate_limit",
            Self::Validation { .. } => "validation",
            Self::Transformation { .. } => "transformation",
            Self::Load { .. } => "load",
            Self::Publish { .. } => "publish",
            Self::Broker { .. } => "broker",
            Self::Timeout { .. } => "timeout",
            Self::CircuitOpen { .. } => "circuit_breaker",
            Self::RetriesExhausted { .. } => "retry",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyRunning { .. } => "conflict",
            Self::UnsupportedSource { .. } => "unsupported",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }
}

// Implement conversions from common error types
impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}

impl From<csv::Error> for PipelineError {
    fn from(err: csv::Error) -> Self {
        Self::serialization(format!("CSV parse failed: {}", err))
    }
}

impl From<regex::Error> for PipelineError {
    fn from(err: regex::Error) -> Self {
        Self::configuration(format!("Invalid pattern: {}", err))
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else {
            Self::connection(
                err.url().map(|u| u.to_string()).unwrap_or_default(),
                err.to_string(),
            )
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::timeout("database pool acquire"),
            sqlx::Error::Io(e) => Self::connection("database", e.to_string()),
            sqlx::Error::PoolClosed => Self::connection("database", "pool closed"),
            other => Self::load("database", other.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for PipelineError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("async operation")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = PipelineError::configuration("test config error");
        assert_eq!(err.category(), "configuration");
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(PipelineError::timeout("extract").is_retryable());
        assert!(PipelineError::connection("pg", "refused").is_retryable());
        assert!(!PipelineError::validation("email", "invalid").is_retryable());
        assert!(!PipelineError::transformation("map", "bad").is_retryable());
    }

    #[test]
    fn test_exhausted_message_embeds_last_error() {
        let err = PipelineError::RetriesExhausted {
            operation: "extract:orders".to_string(),
            attempts: 4,
            source: Box::new(PipelineError::connection("orders", "connection reset")),
        };
        let message = err.to_string();
        assert!(message.contains("4 attempts"));
        assert!(message.contains("connection reset"));
    }

    #[test]
    fn test_error_categories() {
        let errors = [
            PipelineError::configuration("test"),
            PipelineError::serialization("test"),
            PipelineError::rate_limit("api", "test"),
            PipelineError::timeout("test"),
        ];

        let categories: Vec<&str> = errors.iter().map(|e| e.category()).collect();
        assert_eq!(
            categories,
            ["configuration", "serialization", "rate_limit", "timeout"]
        );
    }
}
