//! Metrics collection module for the data pipeline core
//!
//! Prometheus counters, gauges and histograms for extraction, ETL jobs, stream
//! messages, retries, circuit transitions and quality alerts. Components record
//! through the name-based helpers so call sites stay free of metric handles.

use std::time::Instant;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, GaugeVec, Opts, Registry};
use tracing::{debug, error, info};

use crate::{
    config::Config,
    error::{PipelineError, Result},
};

const DURATION_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Main metrics collector for the pipeline core
pub struct MetricsCollector {
    registry: Registry,

    // Counter metrics
    extractions_total: IntCounterVec,
    etl_jobs_total: IntCounterVec,
    etl_records_total: IntCounterVec,
    stream_messages_total: IntCounterVec,
    dead_letters_total: IntCounterVec,
    retry_attempts_total: IntCounterVec,
    circuit_transitions_total: IntCounterVec,
    quality_alerts_total: IntCounterVec,

    // Gauge metrics
    running_etl_jobs: IntGauge,
    running_stream_processors: IntGauge,
    quality_score: GaugeVec,

    // Histogram metrics
    extraction_duration_seconds: HistogramVec,
    etl_job_duration_seconds: HistogramVec,
    stream_processing_duration_seconds: HistogramVec,

    start_time: Instant,
}

impl MetricsCollector {
    /// Create a new metrics collector with its own registry
    pub fn new(config: &Config) -> Result<Self> {
        let registry = Registry::new();
        let namespace = config.monitoring.metrics_namespace.as_str();

        debug!(namespace, "Initializing metrics collector");

        let counter = |name: &str, help: &str, labels: &[&str]| -> Result<IntCounterVec> {
            let vec = IntCounterVec::new(Opts::new(name, help).namespace(namespace), labels)?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        let extractions_total = counter(
            "extractions_total",
            "Extraction calls per source and outcome",
            &["source", "status"],
        )?;
        let etl_jobs_total = counter(
            "etl_jobs_total",
            "ETL job executions per final status",
            &["status"],
        )?;
        let etl_records_total = counter(
            "etl_records_total",
            "Records handled by ETL loads per outcome",
            &["outcome"],
        )?;
        let stream_messages_total = counter(
            "stream_messages_total",
            "Stream messages processed per processor and outcome",
            &["processor", "status"],
        )?;
        let dead_letters_total = counter(
            "dead_letters_total",
            "Messages forwarded to a dead-letter topic",
            &["processor"],
        )?;
        let retry_attempts_total = counter(
            "retry_attempts_total",
            "Retries scheduled per operation",
            &["operation"],
        )?;
        let circuit_transitions_total = counter(
            "circuit_transitions_total",
            "Circuit breaker transitions per target state",
            &["state"],
        )?;
        let quality_alerts_total = counter(
            "quality_alerts_total",
            "Quality alerts raised per metric and severity",
            &["metric", "severity"],
        )?;

        let running_etl_jobs = IntGauge::with_opts(
            Opts::new("running_etl_jobs", "ETL jobs currently executing").namespace(namespace),
        )?;
        registry.register(Box::new(running_etl_jobs.clone()))?;

        let running_stream_processors = IntGauge::with_opts(
            Opts::new("running_stream_processors", "Stream processors currently running")
                .namespace(namespace),
        )?;
        registry.register(Box::new(running_stream_processors.clone()))?;

        let quality_score = GaugeVec::new(
            Opts::new("quality_score", "Latest value of each quality metric").namespace(namespace),
            &["metric"],
        )?;
        registry.register(Box::new(quality_score.clone()))?;

        let histogram = |name: &str, help: &str, labels: &[&str]| -> Result<HistogramVec> {
            let vec = HistogramVec::new(
                HistogramOpts::new(name, help)
                    .namespace(namespace)
                    .buckets(DURATION_BUCKETS.to_vec()),
                labels,
            )?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        let extraction_duration_seconds = histogram(
            "extraction_duration_seconds",
            "Extraction latency per source",
            &["source"],
        )?;
        let etl_job_duration_seconds = histogram(
            "etl_job_duration_seconds",
            "ETL job execution time",
            &["job"],
        )?;
        let stream_processing_duration_seconds = histogram(
            "stream_processing_duration_seconds",
            "Per-message processing time",
            &["processor"],
        )?;

        info!("Metrics collector initialized");

        Ok(Self {
            registry,
            extractions_total,
            etl_jobs_total,
            etl_records_total,
            stream_messages_total,
            dead_letters_total,
            retry_attempts_total,
            circuit_transitions_total,
            quality_alerts_total,
            running_etl_jobs,
            running_stream_processors,
            quality_score,
            extraction_duration_seconds,
            etl_job_duration_seconds,
            stream_processing_duration_seconds,
            start_time: Instant::now(),
        })
    }

    /// Get Prometheus registry for an external exporter
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Seconds since the collector was created
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Increment a counter metric
    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        match name {
            "extractions_total" => self
                .extractions_total
                .with_label_values(&[label(labels, "source"), label(labels, "status")])
                .inc(),
            "etl_jobs_total" => self
                .etl_jobs_total
                .with_label_values(&[label(labels, "status")])
                .inc(),
            "stream_messages_total" => self
                .stream_messages_total
                .with_label_values(&[label(labels, "processor"), label(labels, "status")])
                .inc(),
            "dead_letters_total" => self
                .dead_letters_total
                .with_label_values(&[label(labels, "processor")])
                .inc(),
            "retry_attempts_total" => self
                .retry_attempts_total
                .with_label_values(&[label(labels, "operation")])
                .inc(),
            "circuit_transitions_total" => self
                .circuit_transitions_total
                .with_label_values(&[label(labels, "state")])
                .inc(),
            "quality_alerts_total" => self
                .quality_alerts_total
                .with_label_values(&[label(labels, "metric"), label(labels, "severity")])
                .inc(),
            _ => debug!("Unknown counter metric: {}", name),
        }
    }

    /// Add to a counter metric
    pub fn add_to_counter(&self, name: &str, amount: u64, labels: &[(&str, &str)]) {
        match name {
            "etl_records_total" => self
                .etl_records_total
                .with_label_values(&[label(labels, "outcome")])
                .inc_by(amount),
            _ => {
                for _ in 0..amount {
                    self.increment_counter(name, labels);
                }
            }
        }
    }

    /// Set a gauge metric value
    pub fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        match name {
            "running_etl_jobs" => self.running_etl_jobs.set(value as i64),
            "running_stream_processors" => self.running_stream_processors.set(value as i64),
            "quality_score" => self
                .quality_score
                .with_label_values(&[label(labels, "metric")])
                .set(value),
            _ => debug!("Unknown gauge metric: {}", name),
        }
    }

    /// Adjust an integer gauge by `delta`
    pub fn add_to_gauge(&self, name: &str, delta: i64) {
        match name {
            "running_etl_jobs" => self.running_etl_jobs.add(delta),
            "running_stream_processors" => self.running_stream_processors.add(delta),
            _ => debug!("Unknown gauge metric: {}", name),
        }
    }

    /// Record a histogram observation
    pub fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        match name {
            "extraction_duration_seconds" => self
                .extraction_duration_seconds
                .with_label_values(&[label(labels, "source")])
                .observe(value),
            "etl_job_duration_seconds" => self
                .etl_job_duration_seconds
                .with_label_values(&[label(labels, "job")])
                .observe(value),
            "stream_processing_duration_seconds" => self
                .stream_processing_duration_seconds
                .with_label_values(&[label(labels, "processor")])
                .observe(value),
            _ => debug!("Unknown histogram metric: {}", name),
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        use prometheus::TextEncoder;
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_else(|e| {
                error!("Failed to encode metrics: {}", e);
                String::new()
            })
    }
}

fn label<'a>(labels: &[(&str, &'a str)], key: &str) -> &'a str {
    labels
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
        .unwrap_or("unknown")
}

impl From<prometheus::Error> for PipelineError {
    fn from(err: prometheus::Error) -> Self {
        PipelineError::internal(format!("Prometheus error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_creation() {
        let config = Config::default();
        let collector = MetricsCollector::new(&config);
        assert!(collector.is_ok());
    }

    #[test]
    fn test_unknown_metric_is_ignored() {
        let collector = MetricsCollector::new(&Config::default()).unwrap();
        collector.increment_counter("no_such_metric", &[]);
        collector.set_gauge("no_such_gauge", 1.0, &[]);
    }

    #[test]
    fn test_prometheus_export() {
        let collector = MetricsCollector::new(&Config::default()).unwrap();

        collector.increment_counter(
            "stream_messages_total",
            &[("processor", "orders"), ("status", "success")],
        );
        collector.add_to_counter("etl_records_total", 3, &[("outcome", "inserted")]);
        collector.set_gauge("quality_score", 97.5, &[("metric", "completeness")]);
        collector.record_histogram(
            "stream_processing_duration_seconds",
            0.002,
            &[("processor", "orders")],
        );

        let export = collector.export();
        assert!(export.contains("data_pipeline_stream_messages_total"));
        assert!(export.contains("data_pipeline_etl_records_total{outcome=\"inserted\"} 3"));
        assert!(export.contains("data_pipeline_quality_score"));
    }

    #[test]
    fn test_independent_registries() {
        let config = Config::default();
        let first = MetricsCollector::new(&config).unwrap();
        let second = MetricsCollector::new(&config).unwrap();
        first.add_to_gauge("running_etl_jobs", 1);
        assert!(!second.export().contains("running_etl_jobs 1"));
    }
}
