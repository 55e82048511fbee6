//! Lifecycle and outcome events
//!
//! Components publish [`PipelineEvent`]s on a shared [`EventBus`]. Subscribers
//! (loggers, metric exporters, tests) receive every event published after they
//! subscribed. Publishing never fails, even without subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Default channel capacity; slow subscribers lag rather than block publishers
const DEFAULT_CAPACITY: usize = 1024;

/// Event emitted by the pipeline components
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    // Data connector
    SourceRegistered { source_id: String, source_type: String },
    SourceRemoved { source_id: String },
    ConnectionsClosed { count: usize },
    ExtractionCompleted { source_id: String, records: usize, elapsed_ms: u64 },
    ExtractionFailed { source_id: String, error: String },

    // ETL engine
    JobRegistered { job_id: String },
    JobStarted { job_id: String, execution_id: String },
    JobCompleted { job_id: String, execution_id: String, records_processed: u64 },
    JobFailed { job_id: String, execution_id: String, error: String },
    JobCancelled { job_id: String },

    // Stream processor
    ProcessorStarted { processor_id: String },
    ProcessorStopped { processor_id: String },
    ProcessorConfigUpdated { processor_id: String },
    MessageProcessed { processor_id: String, processing_time_ms: f64 },
    MessageFailed { processor_id: String, error: String },
    MessageDeadLettered { processor_id: String, topic: String },
    BatchFlushed { processor_id: String, size: usize },

    // Resilience
    RetryAttempted { operation: String, attempt: u32, delay_ms: u64, error: String },
    RetrySucceeded { operation: String, attempts: u32 },
    RetryExhausted { operation: String, attempts: u32, error: String },
    CircuitOpened { operation: String, failure_count: u32 },
    CircuitHalfOpened { operation: String },
    CircuitClosed { operation: String },
    CircuitRejected { operation: String },

    // Quality monitor
    QualityMetricsUpdated { overall_score: f64 },
    AlertCreated { alert_id: String, metric: String, severity: String },
    AlertAcknowledged { alert_id: String },
    AlertResolved { alert_id: String },
}

impl PipelineEvent {
    /// Stable event name for logging and metrics labels
    pub fn name(&self) -> &'static str {
        match self {
            Self::SourceRegistered { .. } => "source_registered",
            Self::SourceRemoved { .. } => "source_removed",
            Self::ConnectionsClosed { .. } => "connections_closed",
            Self::ExtractionCompleted { .. } => "extraction_completed",
            Self::ExtractionFailed { .. } => "extraction_failed",
            Self::JobRegistered { .. } => "job_registered",
            Self::JobStarted { .. } => "job_started",
            Self::JobCompleted { .. } => "job_completed",
            Self::JobFailed { .. } => "job_failed",
            Self::JobCancelled { .. } => "job_cancelled",
            Self::ProcessorStarted { .. } => "processor_started",
            Self::ProcessorStopped { .. } => "processor_stopped",
            Self::ProcessorConfigUpdated { .. } => "processor_config_updated",
            Self::MessageProcessed { .. } => "message_processed",
            Self::MessageFailed { .. } => "message_failed",
            Self::MessageDeadLettered { .. } => "message_dead_lettered",
            Self::BatchFlushed { .. } => "batch_flushed",
            Self::RetryAttempted { .. } => "retry_attempted",
            Self::RetrySucceeded { .. } => "retry_succeeded",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::CircuitOpened { .. } => "circuit_opened",
            Self::CircuitHalfOpened { .. } => "circuit_half_opened",
            Self::CircuitClosed { .. } => "circuit_closed",
            Self::CircuitRejected { .. } => "circuit_rejected",
            Self::QualityMetricsUpdated { .. } => "quality_metrics_updated",
            Self::AlertCreated { .. } => "alert_created",
            Self::AlertAcknowledged { .. } => "alert_acknowledged",
            Self::AlertResolved { .. } => "alert_resolved",
        }
    }
}

/// Timestamped envelope delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    pub event: PipelineEvent,
}

/// Broadcast bus shared by all components of one deployment
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a bus with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with an explicit channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: PipelineEvent) {
        debug!(event = event.name(), payload = ?event, "pipeline event");
        // No receivers is not an error for a side channel
        let _ = self.sender.send(EventEnvelope {
            timestamp: Utc::now(),
            event,
        });
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain every event currently buffered for a receiver
pub fn drain(receiver: &mut broadcast::Receiver<EventEnvelope>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(envelope) => events.push(envelope.event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}
