//! Stream processing module
//!
//! A [`StreamProcessor`] consumes one input topic under a consumer group and
//! runs every message through an optional validation gate and an ordered list
//! of [`ProcessingRule`]s before publishing the result. In batch mode messages
//! are buffered until the batch is full or its timeout elapses; both triggers
//! feed the same flush path inside the consumer task.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    broker::MessageBroker,
    config::StreamConfig,
    error::{PipelineError, Result},
    etl::AggregateFunction,
    events::{EventBus, PipelineEvent},
    metrics::MetricsCollector,
    quality::DataQualityMonitor,
    resilience::{CircuitBreakerConfig, ErrorHandler, RetryConfig},
    types::{
        matches_all, number_value, value_as_f64, Condition, ProcessingMetadata, ProcessingResult,
        Record, StreamMessage,
    },
    validation::{ValidationEngine, ValidationRule},
};

/// Transforms a record; `None` drops the message as filtered
pub type CustomRuleFn = Arc<dyn Fn(Record) -> Result<Option<Record>> + Send + Sync>;

/// Stream processor definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamProcessorConfig {
    pub id: String,
    pub name: String,
    pub input_topic: String,
    #[serde(default)]
    pub output_topic: Option<String>,
    pub consumer_group: String,
    #[serde(default)]
    pub rules: Vec<ProcessingRule>,
    #[serde(default)]
    pub validation: Option<StreamValidation>,
    #[serde(default)]
    pub dead_letter_topic: Option<String>,
    #[serde(default)]
    pub batch: Option<BatchSettings>,
    /// Retry policy for output and dead-letter publishes
    #[serde(default)]
    pub publish_retry: Option<RetryConfig>,
    /// Breaker for publishes, keyed by topic; the handler default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl StreamProcessorConfig {
    pub fn new(
        id: impl Into<String>,
        input_topic: impl Into<String>,
        consumer_group: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            input_topic: input_topic.into(),
            output_topic: None,
            consumer_group: consumer_group.into(),
            rules: Vec::new(),
            validation: None,
            dead_letter_topic: None,
            batch: None,
            publish_retry: None,
            circuit_breaker: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamValidation {
    pub rules: Vec<ValidationRule>,
    #[serde(default)]
    pub on_failure: StreamFailurePolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFailurePolicy {
    /// Drop with a failed result
    #[default]
    Skip,
    /// Forward the original message and its errors to the dead-letter topic
    #[serde(alias = "dead_letter")]
    DeadLetter,
    /// Mark the result for retry by the caller
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSettings {
    pub size: usize,
    pub timeout_ms: u64,
}

/// Runtime changes applied by [`StreamProcessor::update_config`]
///
/// Unset fields are left unchanged. Input topic and consumer group need a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamProcessorUpdate {
    pub name: Option<String>,
    pub output_topic: Option<Option<String>>,
    pub rules: Option<Vec<ProcessingRule>>,
    pub validation: Option<Option<StreamValidation>>,
    pub dead_letter_topic: Option<Option<String>>,
    pub batch: Option<Option<BatchSettings>>,
    pub publish_retry: Option<Option<RetryConfig>>,
    pub circuit_breaker: Option<Option<CircuitBreakerConfig>>,
}

/// One step applied to every message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessingRule {
    Transform {
        /// Source field renamed to target field
        #[serde(default)]
        field_mappings: BTreeMap<String, String>,
        #[serde(default)]
        calculations: Vec<Calculation>,
    },
    /// Stops rule application for messages that fail a condition
    Filter { conditions: Vec<Condition> },
    Enrich {
        #[serde(default)]
        add_timestamp: bool,
        #[serde(default)]
        add_processor_info: bool,
        #[serde(default)]
        lookup: Option<LookupSpec>,
    },
    /// Running aggregate over every message seen by the processor
    Aggregate {
        field: String,
        function: AggregateFunction,
        #[serde(default)]
        target: Option<String>,
    },
    #[serde(skip)]
    Custom(CustomProcessingRule),
}

impl ProcessingRule {
    pub fn name(&self) -> &str {
        match self {
            Self::Transform { .. } => "transform",
            Self::Filter { .. } => "filter",
            Self::Enrich { .. } => "enrich",
            Self::Aggregate { .. } => "aggregate",
            Self::Custom(rule) => &rule.name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calculation {
    pub target: String,
    pub operation: CalculationOp,
    pub fields: Vec<String>,
    /// Concat separator, a single space by default
    #[serde(default)]
    pub separator: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalculationOp {
    Sum,
    Multiply,
    Concat,
}

/// Marks the message for an external lookup keyed by `field`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupSpec {
    pub field: String,
    pub source: String,
}

#[derive(Clone)]
pub struct CustomProcessingRule {
    pub name: String,
    pub apply: CustomRuleFn,
}

impl CustomProcessingRule {
    pub fn new<F>(name: impl Into<String>, apply: F) -> Self
    where
        F: Fn(Record) -> Result<Option<Record>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            apply: Arc::new(apply),
        }
    }
}

impl fmt::Debug for CustomProcessingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomProcessingRule")
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorState {
    Stopped,
    Running,
}

/// Running statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub processor_id: String,
    pub state: ProcessorState,
    pub messages_processed: u64,
    pub messages_succeeded: u64,
    pub messages_failed: u64,
    pub messages_filtered: u64,
    pub messages_dead_lettered: u64,
    pub batches_flushed: u64,
    pub average_processing_time_ms: f64,
    /// Processed messages per second of uptime
    pub throughput_per_sec: f64,
    pub uptime_secs: f64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct StatsInner {
    processed: u64,
    succeeded: u64,
    failed: u64,
    filtered: u64,
    dead_lettered: u64,
    batches_flushed: u64,
    total_time_ms: f64,
    started_at: Option<Instant>,
    uptime_before: Duration,
    last_processed_at: Option<DateTime<Utc>>,
}

impl StatsInner {
    fn uptime(&self) -> Duration {
        self.uptime_before + self.started_at.map(|s| s.elapsed()).unwrap_or_default()
    }
}

#[derive(Default)]
struct RunningAggregate {
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

enum RuleOutcome {
    Continue(Record),
    Filtered,
}

/// Stream processor
#[derive(Clone)]
pub struct StreamProcessor {
    config: Arc<RwLock<Arc<StreamProcessorConfig>>>,
    stream_config: StreamConfig,
    broker: Arc<dyn MessageBroker>,
    validator: ValidationEngine,
    error_handler: Arc<ErrorHandler>,
    quality: Option<DataQualityMonitor>,
    events: EventBus,
    metrics: Arc<MetricsCollector>,
    worker: Arc<tokio::sync::Mutex<Option<Worker>>>,
    stats: Arc<Mutex<StatsInner>>,
    aggregates: Arc<Mutex<HashMap<String, RunningAggregate>>>,
}

impl StreamProcessor {
    pub fn new(
        config: StreamProcessorConfig,
        stream_config: StreamConfig,
        broker: Arc<dyn MessageBroker>,
        error_handler: Arc<ErrorHandler>,
        events: EventBus,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        validate_config(&config)?;
        Ok(Self {
            config: Arc::new(RwLock::new(Arc::new(config))),
            stream_config,
            broker,
            validator: ValidationEngine::default(),
            error_handler,
            quality: None,
            events,
            metrics,
            worker: Arc::new(tokio::sync::Mutex::new(None)),
            stats: Arc::new(Mutex::new(StatsInner::default())),
            aggregates: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Mirror every processed message into a quality monitor
    pub fn with_quality_monitor(mut self, monitor: DataQualityMonitor) -> Self {
        self.quality = Some(monitor);
        self
    }

    pub fn with_validator(mut self, validator: ValidationEngine) -> Self {
        self.validator = validator;
        self
    }

    pub fn id(&self) -> String {
        self.config.read().id.clone()
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<StreamProcessorConfig> {
        Arc::clone(&self.config.read())
    }

    pub async fn get_state(&self) -> ProcessorState {
        if self.worker.lock().await.is_some() {
            ProcessorState::Running
        } else {
            ProcessorState::Stopped
        }
    }

    /// Create topics, subscribe and spawn the consumer task
    #[instrument(skip(self), fields(processor_id = %self.id()))]
    pub async fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Err(PipelineError::already_running("stream processor", self.id()));
        }

        let config = self.config();
        info!(input_topic = %config.input_topic, "Starting stream processor");

        let topics = std::iter::once(&config.input_topic)
            .chain(config.output_topic.iter())
            .chain(config.dead_letter_topic.iter());
        for topic in topics {
            self.broker
                .create_topic(
                    topic,
                    self.stream_config.topic_partitions,
                    self.stream_config.topic_replication,
                )
                .await?;
        }

        let receiver = self
            .broker
            .subscribe(&config.input_topic, &config.consumer_group)
            .await?;

        self.stats.lock().started_at = Some(Instant::now());

        let token = CancellationToken::new();
        let processor = self.clone();
        let child = token.clone();
        let handle = tokio::spawn(async move {
            processor.consume(receiver, child).await;
        });
        *worker = Some(Worker { token, handle });

        self.metrics.add_to_gauge("running_stream_processors", 1);
        self.events.publish(PipelineEvent::ProcessorStarted {
            processor_id: config.id.clone(),
        });
        info!("Stream processor started");
        Ok(())
    }

    /// Flush buffered messages, then leave the consumer group
    #[instrument(skip(self), fields(processor_id = %self.id()))]
    pub async fn stop(&self) -> Result<()> {
        let mut worker = self.worker.lock().await;
        let Some(Worker { token, handle }) = worker.take() else {
            debug!("Stream processor is not running");
            return Ok(());
        };

        token.cancel();
        if let Err(e) = handle.await {
            error!(error = %e, "Consumer task ended abnormally");
        }

        let config = self.config();
        self.broker
            .unsubscribe(&config.input_topic, &config.consumer_group)
            .await?;

        {
            let mut stats = self.stats.lock();
            if let Some(started) = stats.started_at.take() {
                stats.uptime_before += started.elapsed();
            }
        }

        self.metrics.add_to_gauge("running_stream_processors", -1);
        self.events.publish(PipelineEvent::ProcessorStopped {
            processor_id: config.id.clone(),
        });
        info!("Stream processor stopped");
        Ok(())
    }

    /// Swap rules, gate, batching or output topics without a restart
    pub async fn update_config(&self, update: StreamProcessorUpdate) -> Result<()> {
        let mut next = (*self.config()).clone();
        if let Some(name) = update.name {
            next.name = name;
        }
        if let Some(output_topic) = update.output_topic {
            next.output_topic = output_topic;
        }
        if let Some(rules) = update.rules {
            next.rules = rules;
        }
        if let Some(validation) = update.validation {
            next.validation = validation;
        }
        if let Some(dead_letter_topic) = update.dead_letter_topic {
            next.dead_letter_topic = dead_letter_topic;
        }
        if let Some(batch) = update.batch {
            next.batch = batch;
        }
        if let Some(publish_retry) = update.publish_retry {
            next.publish_retry = publish_retry;
        }
        if let Some(circuit_breaker) = update.circuit_breaker {
            next.circuit_breaker = circuit_breaker;
        }
        validate_config(&next)?;

        if self.get_state().await == ProcessorState::Running {
            for topic in next.output_topic.iter().chain(next.dead_letter_topic.iter()) {
                self.broker
                    .create_topic(
                        topic,
                        self.stream_config.topic_partitions,
                        self.stream_config.topic_replication,
                    )
                    .await?;
            }
        }

        let processor_id = next.id.clone();
        *self.config.write() = Arc::new(next);
        info!(processor_id = %processor_id, "Stream processor configuration updated");
        self.events
            .publish(PipelineEvent::ProcessorConfigUpdated { processor_id });
        Ok(())
    }

    pub async fn get_stats(&self) -> ProcessorStats {
        let state = self.get_state().await;
        let stats = self.stats.lock();
        let uptime = stats.uptime().as_secs_f64();
        ProcessorStats {
            processor_id: self.id(),
            state,
            messages_processed: stats.processed,
            messages_succeeded: stats.succeeded,
            messages_failed: stats.failed,
            messages_filtered: stats.filtered,
            messages_dead_lettered: stats.dead_lettered,
            batches_flushed: stats.batches_flushed,
            average_processing_time_ms: if stats.processed == 0 {
                0.0
            } else {
                stats.total_time_ms / stats.processed as f64
            },
            throughput_per_sec: if uptime > 0.0 {
                stats.processed as f64 / uptime
            } else {
                0.0
            },
            uptime_secs: uptime,
            last_processed_at: stats.last_processed_at,
        }
    }

    async fn consume(&self, mut receiver: mpsc::Receiver<StreamMessage>, token: CancellationToken) {
        let mut buffer: Vec<StreamMessage> = Vec::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let batch = self.config().batch;

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    self.flush(&mut buffer).await;
                }
                received = receiver.recv() => {
                    let Some(message) = received else {
                        debug!("Subscription closed");
                        break;
                    };
                    match batch {
                        Some(settings) => {
                            if buffer.is_empty() {
                                deadline = Some(Instant::now() + Duration::from_millis(settings.timeout_ms));
                            }
                            buffer.push(message);
                            if buffer.len() >= settings.size {
                                deadline = None;
                                self.flush(&mut buffer).await;
                            }
                        }
                        None => {
                            if !buffer.is_empty() {
                                // Batching was switched off with messages still buffered
                                deadline = None;
                                self.flush(&mut buffer).await;
                            }
                            self.process_message(message).await;
                        }
                    }
                }
            }
        }

        while let Ok(message) = receiver.try_recv() {
            buffer.push(message);
        }
        if self.config().batch.is_some() {
            self.flush(&mut buffer).await;
        } else {
            for message in buffer.drain(..) {
                self.process_message(message).await;
            }
        }
    }

    /// Process and clear the buffer as one batch
    async fn flush(&self, buffer: &mut Vec<StreamMessage>) {
        if buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(buffer);
        let size = batch.len();
        for message in batch {
            self.process_message(message).await;
        }

        self.stats.lock().batches_flushed += 1;
        debug!(size, "Batch flushed");
        self.events.publish(PipelineEvent::BatchFlushed {
            processor_id: self.id(),
            size,
        });
    }

    /// Run one message through the gate, the rules and the output publish
    pub async fn process_message(&self, message: StreamMessage) -> ProcessingResult {
        let started = std::time::Instant::now();
        let config = self.config();
        let mut metadata = ProcessingMetadata::default();

        let outcome = self.run_pipeline(&config, &message, &mut metadata).await;
        metadata.processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        let result = match outcome {
            Ok(processed_message) => ProcessingResult {
                success: true,
                original_message: message,
                processed_message,
                error: None,
                metadata,
            },
            Err(e) => ProcessingResult {
                success: false,
                original_message: message,
                processed_message: None,
                error: Some(e.to_string()),
                metadata,
            },
        };

        self.record_outcome(&config, &result);
        result
    }

    async fn run_pipeline(
        &self,
        config: &StreamProcessorConfig,
        message: &StreamMessage,
        metadata: &mut ProcessingMetadata,
    ) -> Result<Option<StreamMessage>> {
        let needs_record = config.validation.is_some() || !config.rules.is_empty();
        let mut record = match message.value.as_object() {
            Some(record) => record.clone(),
            None if needs_record => {
                return Err(PipelineError::validation(
                    "value",
                    "message payload is not a JSON object",
                ));
            }
            None => Record::new(),
        };

        if let Some(gate) = &config.validation {
            let validation = self.validator.validate_record(&record, &gate.rules);
            match validation.cleaned_data {
                Some(cleaned) => record = cleaned,
                None => {
                    let errors = validation.error_messages();
                    metadata.validation_errors = errors.clone();
                    let failure = PipelineError::validation(
                        validation
                            .errors
                            .first()
                            .map(|e| e.field.as_str())
                            .unwrap_or("*"),
                        errors.join("; "),
                    );

                    match gate.on_failure {
                        StreamFailurePolicy::Skip => {}
                        StreamFailurePolicy::Retry => metadata.retry_requested = true,
                        StreamFailurePolicy::DeadLetter => {
                            self.dead_letter(config, message, &errors).await?;
                            metadata.dead_lettered = true;
                        }
                    }
                    return Err(failure);
                }
            }
        }

        for rule in &config.rules {
            metadata.rules_applied.push(rule.name().to_string());
            match self.apply_rule(config, rule, record)? {
                RuleOutcome::Continue(next) => record = next,
                RuleOutcome::Filtered => {
                    metadata.filtered = true;
                    return Ok(None);
                }
            }
        }

        let value = if message.value.is_object() {
            Value::Object(record)
        } else {
            message.value.clone()
        };
        let mut processed = StreamMessage {
            key: message.key.clone(),
            value,
            headers: message.headers.clone(),
            timestamp: message.timestamp,
            partition: None,
            offset: None,
        };
        processed
            .headers
            .insert("x-processed-by".to_string(), config.id.clone());

        if let Some(topic) = &config.output_topic {
            self.publish(config, topic, &processed).await?;
            metadata.published = true;
        }

        Ok(Some(processed))
    }

    fn apply_rule(
        &self,
        config: &StreamProcessorConfig,
        rule: &ProcessingRule,
        mut record: Record,
    ) -> Result<RuleOutcome> {
        match rule {
            ProcessingRule::Transform {
                field_mappings,
                calculations,
            } => {
                for (source, target) in field_mappings {
                    if let Some(value) = record.remove(source) {
                        record.insert(target.clone(), value);
                    }
                }
                for calculation in calculations {
                    let value = calculate(calculation, &record)?;
                    record.insert(calculation.target.clone(), value);
                }
                Ok(RuleOutcome::Continue(record))
            }
            ProcessingRule::Filter { conditions } => {
                if matches_all(conditions, &record) {
                    Ok(RuleOutcome::Continue(record))
                } else {
                    Ok(RuleOutcome::Filtered)
                }
            }
            ProcessingRule::Enrich {
                add_timestamp,
                add_processor_info,
                lookup,
            } => {
                if *add_timestamp {
                    record.insert(
                        "_processed_at".to_string(),
                        Value::String(Utc::now().to_rfc3339()),
                    );
                }
                if *add_processor_info {
                    record.insert(
                        "_processor".to_string(),
                        json!({"id": config.id, "name": config.name}),
                    );
                }
                if let Some(lookup) = lookup {
                    let key = record.get(&lookup.field).cloned().unwrap_or(Value::Null);
                    record.insert(
                        "_lookup".to_string(),
                        json!({"source": lookup.source, "key": key, "status": "pending"}),
                    );
                }
                Ok(RuleOutcome::Continue(record))
            }
            ProcessingRule::Aggregate {
                field,
                function,
                target,
            } => {
                let target = target
                    .clone()
                    .unwrap_or_else(|| format!("{}_{}", function, field));
                let value = record.get(field).filter(|v| !v.is_null());
                let numeric = value.and_then(value_as_f64);

                let mut aggregates = self.aggregates.lock();
                let running = aggregates.entry(target.clone()).or_default();
                if value.is_some() {
                    running.count += 1;
                }
                if let Some(n) = numeric {
                    running.sum += n;
                    running.min = Some(running.min.map_or(n, |m| m.min(n)));
                    running.max = Some(running.max.map_or(n, |m| m.max(n)));
                }
                let aggregate = match function {
                    AggregateFunction::Count => Value::from(running.count),
                    AggregateFunction::Sum => number_value(running.sum),
                    AggregateFunction::Avg if running.count == 0 => Value::Null,
                    AggregateFunction::Avg => number_value(running.sum / running.count as f64),
                    AggregateFunction::Min => running.min.map(number_value).unwrap_or(Value::Null),
                    AggregateFunction::Max => running.max.map(number_value).unwrap_or(Value::Null),
                };
                drop(aggregates);

                record.insert(target, aggregate);
                Ok(RuleOutcome::Continue(record))
            }
            ProcessingRule::Custom(custom) => match (custom.apply)(record) {
                Ok(Some(next)) => Ok(RuleOutcome::Continue(next)),
                Ok(None) => Ok(RuleOutcome::Filtered),
                Err(PipelineError::Transformation { step, message }) => {
                    Err(PipelineError::Transformation { step, message })
                }
                Err(other) => Err(PipelineError::transformation(&custom.name, other.to_string())),
            },
        }
    }

    async fn publish(
        &self,
        config: &StreamProcessorConfig,
        topic: &str,
        message: &StreamMessage,
    ) -> Result<()> {
        let operation = format!("publish:{}", topic);
        self.error_handler
            .execute_guarded(
                &operation,
                || self.broker.produce(topic, message),
                config.publish_retry.as_ref(),
                config.circuit_breaker.as_ref(),
            )
            .await
    }

    async fn dead_letter(
        &self,
        config: &StreamProcessorConfig,
        message: &StreamMessage,
        errors: &[String],
    ) -> Result<()> {
        let topic = config.dead_letter_topic.as_deref().ok_or_else(|| {
            PipelineError::configuration(format!(
                "Processor {} has no dead-letter topic",
                config.id
            ))
        })?;

        let mut envelope = StreamMessage::new(
            message.key.clone(),
            json!({
                "original": message.value,
                "errors": errors,
                "processor_id": config.id,
                "failed_at": Utc::now().to_rfc3339(),
            }),
        );
        envelope.headers = message.headers.clone();
        envelope
            .headers
            .insert("x-dead-letter-reason".to_string(), "validation".to_string());
        envelope
            .headers
            .insert("x-processed-by".to_string(), config.id.clone());

        self.publish(config, topic, &envelope).await?;

        warn!(processor_id = %config.id, topic, "Message dead-lettered");
        self.metrics
            .increment_counter("dead_letters_total", &[("processor", config.id.as_str())]);
        self.events.publish(PipelineEvent::MessageDeadLettered {
            processor_id: config.id.clone(),
            topic: topic.to_string(),
        });
        Ok(())
    }

    fn record_outcome(&self, config: &StreamProcessorConfig, result: &ProcessingResult) {
        let elapsed_ms = result.metadata.processing_time_ms;
        {
            let mut stats = self.stats.lock();
            stats.processed += 1;
            stats.total_time_ms += elapsed_ms;
            stats.last_processed_at = Some(Utc::now());
            if result.success {
                stats.succeeded += 1;
            } else {
                stats.failed += 1;
            }
            if result.metadata.filtered {
                stats.filtered += 1;
            }
            if result.metadata.dead_lettered {
                stats.dead_lettered += 1;
            }
        }

        let status = match (result.success, result.metadata.filtered) {
            (true, true) => "filtered",
            (true, false) => "success",
            (false, _) => "failed",
        };
        self.metrics.increment_counter(
            "stream_messages_total",
            &[("processor", config.id.as_str()), ("status", status)],
        );
        self.metrics.record_histogram(
            "stream_processing_duration_seconds",
            elapsed_ms / 1000.0,
            &[("processor", config.id.as_str())],
        );

        match &result.error {
            None => self.events.publish(PipelineEvent::MessageProcessed {
                processor_id: config.id.clone(),
                processing_time_ms: elapsed_ms,
            }),
            Some(error) => {
                debug!(processor_id = %config.id, error = %error, "Message processing failed");
                self.events.publish(PipelineEvent::MessageFailed {
                    processor_id: config.id.clone(),
                    error: error.clone(),
                });
            }
        }

        if let Some(monitor) = &self.quality {
            monitor.record(result.original_message.clone(), Some(result));
        }
    }
}

fn validate_config(config: &StreamProcessorConfig) -> Result<()> {
    if config.id.trim().is_empty() {
        return Err(PipelineError::configuration("Processor id must not be empty"));
    }
    if config.input_topic.trim().is_empty() || config.consumer_group.trim().is_empty() {
        return Err(PipelineError::configuration(format!(
            "Processor {} needs an input topic and a consumer group",
            config.id
        )));
    }
    if let Some(batch) = config.batch {
        if batch.size == 0 || batch.timeout_ms == 0 {
            return Err(PipelineError::configuration(format!(
                "Processor {} has an empty batch size or timeout",
                config.id
            )));
        }
    }
    if let Some(gate) = &config.validation {
        if gate.on_failure == StreamFailurePolicy::DeadLetter && config.dead_letter_topic.is_none()
        {
            return Err(PipelineError::configuration(format!(
                "Processor {} dead-letters without a dead-letter topic",
                config.id
            )));
        }
    }
    if let Some(retry) = &config.publish_retry {
        retry.validate()?;
    }
    if let Some(breaker) = &config.circuit_breaker {
        breaker.validate()?;
    }
    Ok(())
}

fn calculate(calculation: &Calculation, record: &Record) -> Result<Value> {
    match calculation.operation {
        CalculationOp::Sum => Ok(number_value(
            calculation
                .fields
                .iter()
                .filter_map(|f| record.get(f).and_then(value_as_f64))
                .sum(),
        )),
        CalculationOp::Multiply => {
            let mut product = 1.0;
            for field in &calculation.fields {
                let factor = record.get(field).and_then(value_as_f64).ok_or_else(|| {
                    PipelineError::transformation(
                        "transform",
                        format!("{} needs numeric field {}", calculation.target, field),
                    )
                })?;
                product *= factor;
            }
            Ok(number_value(product))
        }
        CalculationOp::Concat => {
            let separator = calculation.separator.as_deref().unwrap_or(" ");
            let parts: Vec<String> = calculation
                .fields
                .iter()
                .filter_map(|f| record.get(f))
                .filter(|v| !v.is_null())
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            Ok(Value::String(parts.join(separator)))
        }
    }
}
