//! # Data Pipeline Service
//!
//! Ingestion core for the AI-CORE platform:
//! - Uniform extraction from relational, HTTP, file and stream sources
//! - Transactional ETL jobs with validation gates and quarantine
//! - Rule-driven stream processing with batching and dead-lettering
//! - Record validation, cleansing and anomaly detection
//! - Rolling data quality metrics with threshold alerting
//!
//! Every component reports through a shared [`EventBus`] and
//! [`MetricsCollector`]; retries and circuit breaking are provided by
//! [`resilience::ErrorHandler`].
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use data_pipeline_service::{store::InMemoryStore, Config, DataPipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = DataPipeline::new(Config::from_env()?, Arc::new(InMemoryStore::new()))?;
//!     pipeline.start()?;
//!     println!("{}", pipeline.metrics().export());
//!     pipeline.stop().await;
//!     Ok(())
//! }
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

pub mod broker;
pub mod config;
pub mod connector;
pub mod error;
pub mod etl;
pub mod events;
pub mod metrics;
pub mod quality;
pub mod resilience;
pub mod store;
pub mod stream;
pub mod types;
pub mod validation;

// Re-exports for convenience
pub use config::Config;
pub use connector::{DataConnector, DataSourceConfig};
pub use error::{PipelineError, Result};
pub use etl::{EtlEngine, EtlJobConfig, EtlJobResult};
pub use events::{EventBus, PipelineEvent};
pub use metrics::MetricsCollector;
pub use quality::{DataQualityMonitor, QualityReport, QualityRule};
pub use resilience::ErrorHandler;
pub use stream::{StreamProcessor, StreamProcessorConfig};
pub use types::*;
pub use validation::{ValidationEngine, ValidationRule};

/// Sources, jobs, processors and quality rules loaded from one YAML or JSON file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineDefinition {
    /// Raw source definitions; see [`PipelineDefinition::data_sources`]
    pub sources: Vec<Value>,
    pub jobs: Vec<EtlJobConfig>,
    pub processors: Vec<StreamProcessorConfig>,
    pub quality_rules: Vec<QualityRule>,
}

impl PipelineDefinition {
    /// Load a definition, choosing the format from the file extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&content)?),
            _ => Self::from_yaml(&content),
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Typed source definitions; an unknown `type` is reported as unsupported
    pub fn data_sources(&self) -> Result<Vec<DataSourceConfig>> {
        self.sources
            .iter()
            .cloned()
            .map(DataSourceConfig::from_value)
            .collect()
    }
}

/// Wires the connector, ETL engine and quality monitor around shared
/// events, metrics and error handling
#[derive(Clone)]
pub struct DataPipeline {
    config: Arc<Config>,
    events: EventBus,
    metrics: Arc<MetricsCollector>,
    error_handler: Arc<ErrorHandler>,
    connector: Arc<DataConnector>,
    etl: Arc<EtlEngine>,
    quality: DataQualityMonitor,
}

impl DataPipeline {
    /// Build every component; ETL jobs load into `store`
    pub fn new(config: Config, store: Arc<dyn store::RelationalStore>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let events = EventBus::with_capacity(config.monitoring.event_bus_capacity);
        let metrics = Arc::new(MetricsCollector::new(&config)?);
        let error_handler = Arc::new(
            ErrorHandler::new(events.clone(), Arc::clone(&metrics))
                .with_circuit_breaker(config.resilience.circuit_breaker.clone()),
        );

        let connector = Arc::new(DataConnector::new(
            config.connector.clone(),
            Arc::clone(&error_handler),
            events.clone(),
            Arc::clone(&metrics),
        ));
        let etl = Arc::new(EtlEngine::new(
            config.etl.clone(),
            Arc::clone(&connector),
            store,
            Arc::clone(&error_handler),
            events.clone(),
            Arc::clone(&metrics),
        ));
        let quality =
            DataQualityMonitor::new(config.quality.clone(), events.clone(), Arc::clone(&metrics));

        Ok(Self {
            config,
            events,
            metrics,
            error_handler,
            connector,
            etl,
            quality,
        })
    }

    /// Register sources, jobs and quality rules; processor definitions are
    /// returned for the caller to bind to a broker
    pub async fn apply_definition(
        &self,
        definition: PipelineDefinition,
    ) -> Result<Vec<StreamProcessorConfig>> {
        for source in definition.data_sources()? {
            self.connector.register_data_source(source).await?;
        }
        for job in definition.jobs {
            self.etl.register_job(job)?;
        }
        for rule in definition.quality_rules {
            self.quality.add_quality_rule(rule)?;
        }
        info!(
            processors = definition.processors.len(),
            "Pipeline definition applied"
        );
        Ok(definition.processors)
    }

    /// Stream processor sharing this pipeline's events, metrics and quality monitor
    pub fn stream_processor(
        &self,
        config: StreamProcessorConfig,
        broker: Arc<dyn broker::MessageBroker>,
    ) -> Result<StreamProcessor> {
        Ok(StreamProcessor::new(
            config,
            self.config.stream.clone(),
            broker,
            Arc::clone(&self.error_handler),
            self.events.clone(),
            Arc::clone(&self.metrics),
        )?
        .with_quality_monitor(self.quality.clone()))
    }

    /// Start the periodic quality evaluation
    pub fn start(&self) -> Result<()> {
        info!("Starting data pipeline");
        self.quality.start()
    }

    /// Stop background work and release source connections
    pub async fn stop(&self) {
        info!("Stopping data pipeline");
        self.quality.stop().await;
        self.connector.close_all_connections().await;
    }

    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    pub fn error_handler(&self) -> Arc<ErrorHandler> {
        Arc::clone(&self.error_handler)
    }

    pub fn connector(&self) -> Arc<DataConnector> {
        Arc::clone(&self.connector)
    }

    pub fn etl(&self) -> Arc<EtlEngine> {
        Arc::clone(&self.etl)
    }

    pub fn quality(&self) -> &DataQualityMonitor {
        &self.quality
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    const DEFINITION: &str = r#"
sources:
  - id: crm
    name: CRM export
    type: file
    path: /tmp/crm.json
    format: json
jobs:
  - id: contacts
    name: Contacts
    source:
      source_id: crm
    destination:
      table: contacts
processors:
  - id: signups
    name: Signups
    input_topic: signups.raw
    consumer_group: signups
quality_rules:
  - id: email-present
    name: Email present
    type: completeness
    field: email
"#;

    #[test]
    fn test_definition_from_yaml() {
        let definition = PipelineDefinition::from_yaml(DEFINITION).unwrap();
        assert_eq!(definition.jobs.len(), 1);
        assert_eq!(definition.processors[0].input_topic, "signups.raw");
        let sources = definition.data_sources().unwrap();
        assert_eq!(sources[0].source.type_name(), "file");
    }

    #[test]
    fn test_unknown_source_type_rejected() {
        let definition = PipelineDefinition {
            sources: vec![serde_json::json!({"id": "x", "name": "x", "type": "ftp"})],
            ..Default::default()
        };
        assert!(matches!(
            definition.data_sources(),
            Err(PipelineError::UnsupportedSource { .. })
        ));
    }

    #[tokio::test]
    async fn test_pipeline_lifecycle() {
        let pipeline = DataPipeline::new(Config::default(), Arc::new(InMemoryStore::new())).unwrap();
        pipeline.start().unwrap();
        assert!(pipeline.quality().is_running());
        pipeline.stop().await;
        assert!(!pipeline.quality().is_running());
    }
}
