//! ETL pipeline engine
//!
//! Runs registered jobs through extract, transform, validate and load. Each
//! execution produces one [`EtlJobResult`] that is appended to the job's
//! bounded history. Only the load phase runs inside a store transaction.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::EtlConfig,
    connector::{DataConnector, ExtractOptions},
    error::{PipelineError, Result},
    events::{EventBus, PipelineEvent},
    metrics::MetricsCollector,
    resilience::{CircuitBreakerConfig, ErrorHandler, RetryConfig},
    store::{RelationalStore, StoreTransaction},
    types::{matches_all, number_value, value_as_f64, Condition, Record},
    validation::{ValidationEngine, ValidationRule},
};

/// Computes a mapped field from the whole input record
pub type ComputeFn = Arc<dyn Fn(&Record) -> Result<Value> + Send + Sync>;

/// Replaces the record set with a caller-defined transformation
pub type CustomStepFn = Arc<dyn Fn(Vec<Record>) -> Result<Vec<Record>> + Send + Sync>;

/// ETL job definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlJobConfig {
    pub id: String,
    pub name: String,
    pub source: JobSource,
    #[serde(default)]
    pub transformations: Vec<TransformationStep>,
    pub destination: JobDestination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationGate>,
}

/// Where a job reads from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSource {
    pub source_id: String,
    /// SQL for relational sources, endpoint name for HTTP sources, ignored for files
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub filter: Record,
    /// Page size; the whole source is read in one call when unset
    #[serde(default)]
    pub batch_size: Option<usize>,
}

/// Where a job writes to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDestination {
    pub table: String,
    #[serde(default)]
    pub mode: WriteMode,
    /// Existence check columns for upserts
    #[serde(default)]
    pub key_columns: Vec<String>,
    /// Defaults to the table name plus the configured suffix
    #[serde(default)]
    pub quarantine_table: Option<String>,
    /// Retry policy wrapped around the whole load transaction
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Breaker around the load; the handler default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    #[default]
    Insert,
    Upsert,
    Replace,
}

/// Validation applied between transformation and load
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationGate {
    pub rules: Vec<ValidationRule>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

/// What happens to records that fail the gate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Drop and warn
    #[default]
    Skip,
    /// Fail the job before anything is written
    Stop,
    /// Write to the quarantine table and continue
    Quarantine,
}

/// One transformation in a job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformationStep {
    Map {
        mappings: Vec<FieldMapping>,
        /// Drop fields that no mapping reads
        #[serde(default)]
        remove_unmapped: bool,
    },
    Filter {
        conditions: Vec<Condition>,
    },
    Aggregate {
        group_by: Vec<String>,
        aggregations: Vec<Aggregation>,
    },
    #[serde(skip)]
    Custom(CustomStep),
}

impl TransformationStep {
    pub fn name(&self) -> &str {
        match self {
            Self::Map { .. } => "map",
            Self::Filter { .. } => "filter",
            Self::Aggregate { .. } => "aggregate",
            Self::Custom(step) => &step.name,
        }
    }
}

/// Target field fed by a source field, a computed value or a default
#[derive(Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    pub target: String,
    #[serde(default)]
    pub source: Option<String>,
    /// Used when the source field is absent, or as a constant without a source
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(skip)]
    pub compute: Option<ComputeFn>,
}

impl FieldMapping {
    pub fn copy(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            source: Some(source.into()),
            default: None,
            compute: None,
        }
    }

    pub fn constant(target: impl Into<String>, value: Value) -> Self {
        Self {
            target: target.into(),
            source: None,
            default: Some(value),
            compute: None,
        }
    }

    pub fn computed<F>(target: impl Into<String>, compute: F) -> Self
    where
        F: Fn(&Record) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            target: target.into(),
            source: None,
            default: None,
            compute: Some(Arc::new(compute)),
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

impl fmt::Debug for FieldMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldMapping")
            .field("target", &self.target)
            .field("source", &self.source)
            .field("default", &self.default)
            .field("computed", &self.compute.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregation {
    /// `*` counts rows
    pub field: String,
    pub function: AggregateFunction,
    /// Output name, `<function>_<field>` by default
    #[serde(default)]
    pub alias: Option<String>,
}

impl Aggregation {
    pub fn new(field: impl Into<String>, function: AggregateFunction) -> Self {
        Self {
            field: field.into(),
            function,
            alias: None,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    fn output_name(&self) -> String {
        self.alias.clone().unwrap_or_else(|| {
            let field = if self.field == "*" { "all" } else { &self.field };
            format!("{}_{}", self.function, field)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
        };
        f.write_str(name)
    }
}

/// Caller-supplied transformation
#[derive(Clone)]
pub struct CustomStep {
    pub name: String,
    pub apply: CustomStepFn,
}

impl CustomStep {
    pub fn new<F>(name: impl Into<String>, apply: F) -> Self
    where
        F: Fn(Vec<Record>) -> Result<Vec<Record>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            apply: Arc::new(apply),
        }
    }
}

impl fmt::Debug for CustomStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomStep").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Immutable record of one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlJobResult {
    pub job_id: String,
    pub execution_id: String,
    pub status: JobStatus,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub records_extracted: u64,
    /// Records that reached the validation gate after transformation
    pub records_processed: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub records_skipped: u64,
    /// Records rejected by a `stop` gate or written to quarantine
    pub records_failed: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Registered job as listed by [`EtlEngine::list_jobs`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    pub last_run: Option<DateTime<Utc>>,
}

struct JobEntry {
    config: Arc<EtlJobConfig>,
    status: JobStatus,
    running: bool,
    cancel_requested: bool,
    last_run: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct RunState {
    records_extracted: u64,
    records_processed: u64,
    records_inserted: u64,
    records_updated: u64,
    records_skipped: u64,
    records_failed: u64,
    errors: Vec<String>,
    warnings: Vec<String>,
    cancelled: bool,
}

#[derive(Default)]
struct LoadCounts {
    inserted: u64,
    updated: u64,
}

/// ETL pipeline engine
pub struct EtlEngine {
    config: EtlConfig,
    connector: Arc<DataConnector>,
    store: Arc<dyn RelationalStore>,
    validator: ValidationEngine,
    error_handler: Arc<ErrorHandler>,
    events: EventBus,
    metrics: Arc<MetricsCollector>,
    jobs: DashMap<String, JobEntry>,
    history: DashMap<String, VecDeque<EtlJobResult>>,
}

impl EtlEngine {
    pub fn new(
        config: EtlConfig,
        connector: Arc<DataConnector>,
        store: Arc<dyn RelationalStore>,
        error_handler: Arc<ErrorHandler>,
        events: EventBus,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            config,
            connector,
            store,
            validator: ValidationEngine::default(),
            error_handler,
            events,
            metrics,
            jobs: DashMap::new(),
            history: DashMap::new(),
        }
    }

    /// Replace the validation engine used by the gate
    pub fn with_validator(mut self, validator: ValidationEngine) -> Self {
        self.validator = validator;
        self
    }

    /// Register or replace a job definition
    pub fn register_job(&self, job: EtlJobConfig) -> Result<()> {
        validate_job(&job)?;

        if let Some(existing) = self.jobs.get(&job.id) {
            if existing.running {
                return Err(PipelineError::already_running("ETL job", &job.id));
            }
        }

        let job_id = job.id.clone();
        info!(job_id = %job_id, name = %job.name, "Registering ETL job");
        self.jobs.insert(
            job_id.clone(),
            JobEntry {
                config: Arc::new(job),
                status: JobStatus::Pending,
                running: false,
                cancel_requested: false,
                last_run: None,
            },
        );
        self.events.publish(PipelineEvent::JobRegistered { job_id });
        Ok(())
    }

    pub fn unregister_job(&self, job_id: &str) -> Result<()> {
        let running = self
            .jobs
            .get(job_id)
            .map(|entry| entry.running)
            .ok_or_else(|| PipelineError::not_found("ETL job", job_id))?;
        if running {
            return Err(PipelineError::already_running("ETL job", job_id));
        }
        self.jobs.remove(job_id);
        self.history.remove(job_id);
        info!(job_id, "ETL job unregistered");
        Ok(())
    }

    pub fn get_job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.get(job_id).map(|entry| entry.status)
    }

    pub fn list_jobs(&self) -> Vec<JobSummary> {
        let mut jobs: Vec<JobSummary> = self
            .jobs
            .iter()
            .map(|entry| JobSummary {
                id: entry.key().clone(),
                name: entry.config.name.clone(),
                status: entry.status,
                last_run: entry.last_run,
            })
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    /// Most recent results first, at most `limit` of them
    pub fn get_job_history(&self, job_id: &str, limit: Option<usize>) -> Vec<EtlJobResult> {
        self.history
            .get(job_id)
            .map(|history| {
                history
                    .iter()
                    .rev()
                    .take(limit.unwrap_or(usize::MAX))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mark a running job cancelled
    ///
    /// The execution stops at its next phase boundary. A load transaction that
    /// is already open still resolves to commit or rollback. Returns false when
    /// the job is not running.
    pub fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| PipelineError::not_found("ETL job", job_id))?;
        if !entry.running {
            return Ok(false);
        }
        entry.cancel_requested = true;
        entry.status = JobStatus::Cancelled;
        drop(entry);

        info!(job_id, "ETL job cancellation requested");
        self.events.publish(PipelineEvent::JobCancelled {
            job_id: job_id.to_string(),
        });
        Ok(true)
    }

    /// Run one execution to completion
    ///
    /// Fails only when the job is unknown or already running; every other
    /// failure is reported in the returned result.
    #[instrument(skip(self))]
    pub async fn execute_job(&self, job_id: &str) -> Result<EtlJobResult> {
        let job = {
            let mut entry = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| PipelineError::not_found("ETL job", job_id))?;
            if entry.running {
                return Err(PipelineError::already_running("ETL job", job_id));
            }
            entry.running = true;
            entry.cancel_requested = false;
            entry.status = JobStatus::Running;
            Arc::clone(&entry.config)
        };
        self.metrics.add_to_gauge("running_etl_jobs", 1);
        let guard = RunningJob {
            engine: self,
            job_id,
            settled: false,
        };

        let execution_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let timer = Instant::now();

        info!(execution_id = %execution_id, "ETL job started");
        self.events.publish(PipelineEvent::JobStarted {
            job_id: job_id.to_string(),
            execution_id: execution_id.clone(),
        });

        let mut state = RunState::default();
        let outcome = self.run(&job, &execution_id, &mut state).await;

        let cancelled = state.cancelled || self.cancel_requested(job_id);
        let status = match (&outcome, cancelled) {
            (_, true) => JobStatus::Cancelled,
            (Ok(()), false) => JobStatus::Completed,
            (Err(_), false) => JobStatus::Failed,
        };
        if let Err(e) = &outcome {
            state.errors.push(e.to_string());
        }

        let elapsed = timer.elapsed();
        let result = EtlJobResult {
            job_id: job_id.to_string(),
            execution_id: execution_id.clone(),
            status,
            success: status == JobStatus::Completed,
            started_at,
            completed_at: Utc::now(),
            duration_ms: elapsed.as_millis() as u64,
            records_extracted: state.records_extracted,
            records_processed: state.records_processed,
            records_inserted: state.records_inserted,
            records_updated: state.records_updated,
            records_skipped: state.records_skipped,
            records_failed: state.records_failed,
            errors: state.errors,
            warnings: state.warnings,
        };

        guard.finish(status, started_at);
        self.record_history(result.clone());

        self.metrics
            .increment_counter("etl_jobs_total", &[("status", status.as_str())]);
        self.metrics
            .record_histogram("etl_job_duration_seconds", elapsed.as_secs_f64(), &[("job", job_id)]);
        for (outcome, count) in [
            ("inserted", result.records_inserted),
            ("updated", result.records_updated),
            ("skipped", result.records_skipped),
            ("failed", result.records_failed),
        ] {
            if count > 0 {
                self.metrics
                    .add_to_counter("etl_records_total", count, &[("outcome", outcome)]);
            }
        }

        match status {
            JobStatus::Completed => {
                info!(
                    execution_id = %execution_id,
                    processed = result.records_processed,
                    inserted = result.records_inserted,
                    updated = result.records_updated,
                    duration_ms = result.duration_ms,
                    "ETL job completed"
                );
                self.events.publish(PipelineEvent::JobCompleted {
                    job_id: job_id.to_string(),
                    execution_id,
                    records_processed: result.records_processed,
                });
            }
            JobStatus::Cancelled => {
                info!(execution_id = %execution_id, "ETL job finished as cancelled");
            }
            _ => {
                let message = result.errors.last().cloned().unwrap_or_default();
                error!(execution_id = %execution_id, error = %message, "ETL job failed");
                self.events.publish(PipelineEvent::JobFailed {
                    job_id: job_id.to_string(),
                    execution_id,
                    error: message,
                });
            }
        }

        Ok(result)
    }

    /// Clear the running flag and settle the job's status
    fn release(&self, job_id: &str, status: JobStatus, last_run: Option<DateTime<Utc>>) {
        if let Some(mut entry) = self.jobs.get_mut(job_id) {
            entry.running = false;
            entry.cancel_requested = false;
            entry.status = status;
            if last_run.is_some() {
                entry.last_run = last_run;
            }
        }
        self.metrics.add_to_gauge("running_etl_jobs", -1);
    }

    fn cancel_requested(&self, job_id: &str) -> bool {
        self.jobs
            .get(job_id)
            .map(|entry| entry.cancel_requested)
            .unwrap_or(false)
    }

    fn record_history(&self, result: EtlJobResult) {
        let mut history = self.history.entry(result.job_id.clone()).or_default();
        history.push_back(result);
        while history.len() > self.config.history_limit.max(1) {
            history.pop_front();
        }
    }

    async fn run(&self, job: &EtlJobConfig, execution_id: &str, state: &mut RunState) -> Result<()> {
        let records = self.extract(job).await?;
        state.records_extracted = records.len() as u64;
        debug!(records = records.len(), "Extraction phase finished");

        if self.cancel_requested(&job.id) {
            state.cancelled = true;
            return Ok(());
        }

        let mut records = records;
        for step in &job.transformations {
            records = apply_step(step, records)?;
            debug!(step = step.name(), records = records.len(), "Transformation applied");
        }
        state.records_processed = records.len() as u64;

        let mut quarantined: Vec<(Record, Vec<String>)> = Vec::new();
        let valid = match &job.validation {
            Some(gate) => {
                let mut valid = Vec::with_capacity(records.len());
                let mut rejected: Vec<String> = Vec::new();
                for (index, record) in records.into_iter().enumerate() {
                    let result = self.validator.validate_record(&record, &gate.rules);
                    state.warnings.extend(
                        result
                            .warnings
                            .iter()
                            .map(|w| format!("record {}: {}", index, w)),
                    );
                    match result.cleaned_data {
                        Some(cleaned) => valid.push(cleaned),
                        None => {
                            let messages = result.error_messages();
                            match gate.on_failure {
                                FailurePolicy::Skip => {
                                    state.records_skipped += 1;
                                    state.warnings.push(format!(
                                        "record {} skipped: {}",
                                        index,
                                        messages.join("; ")
                                    ));
                                }
                                FailurePolicy::Stop => {
                                    state.records_failed += 1;
                                    rejected.push(format!("record {}: {}", index, messages.join("; ")));
                                }
                                FailurePolicy::Quarantine => {
                                    state.records_failed += 1;
                                    quarantined.push((record, messages));
                                }
                            }
                        }
                    }
                }

                if !rejected.is_empty() {
                    let count = rejected.len();
                    state.errors.extend(rejected);
                    return Err(PipelineError::validation(
                        "*",
                        format!("{} record(s) failed validation, job stopped", count),
                    ));
                }
                valid
            }
            None => records,
        };

        if self.cancel_requested(&job.id) {
            state.cancelled = true;
            return Ok(());
        }

        let quarantine_table = job
            .destination
            .quarantine_table
            .clone()
            .unwrap_or_else(|| format!("{}{}", job.destination.table, self.config.quarantine_suffix));
        let quarantine_rows: Vec<Record> = quarantined
            .into_iter()
            .map(|(record, errors)| quarantine_row(record, errors, &job.id, execution_id))
            .collect();

        let operation = format!("etl_load:{}", job.id);
        let (valid, quarantine_rows, quarantine_table) =
            (&valid, &quarantine_rows, quarantine_table.as_str());
        let counts = self
            .error_handler
            .execute_guarded(
                &operation,
                move || self.load(job, valid, quarantine_table, quarantine_rows),
                job.destination.retry.as_ref(),
                job.destination.circuit_breaker.as_ref(),
            )
            .await?;

        state.records_inserted = counts.inserted;
        state.records_updated = counts.updated;
        Ok(())
    }

    async fn extract(&self, job: &EtlJobConfig) -> Result<Vec<Record>> {
        let source = &job.source;
        let mut records = Vec::new();

        let Some(batch_size) = source.batch_size else {
            let options = ExtractOptions {
                filter: source.filter.clone(),
                ..Default::default()
            };
            return self.extract_page(job, &options).await;
        };

        let mut offset = 0;
        loop {
            let options = ExtractOptions {
                limit: Some(batch_size),
                offset: Some(offset),
                filter: source.filter.clone(),
            };
            let page = self.extract_page(job, &options).await?;
            let fetched = page.len();
            records.extend(page);
            offset += fetched;

            if fetched < batch_size {
                break;
            }
            if self.cancel_requested(&job.id) {
                break;
            }
        }

        Ok(records)
    }

    async fn extract_page(&self, job: &EtlJobConfig, options: &ExtractOptions) -> Result<Vec<Record>> {
        let result = self
            .connector
            .extract_data(&job.source.source_id, &job.source.query, options)
            .await;
        if result.success {
            Ok(result.data)
        } else {
            Err(PipelineError::connection(
                &job.source.source_id,
                result
                    .error
                    .unwrap_or_else(|| "extraction failed".to_string()),
            ))
        }
    }

    /// Load phase inside one transaction; any error rolls it back
    async fn load(
        &self,
        job: &EtlJobConfig,
        records: &[Record],
        quarantine_table: &str,
        quarantined: &[Record],
    ) -> Result<LoadCounts> {
        let mut tx = self.store.begin().await?;

        match write_records(tx.as_mut(), &job.destination, records, quarantine_table, quarantined)
            .await
        {
            Ok(counts) => {
                tx.commit().await?;
                Ok(counts)
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Load failed, rolling back");
                if let Err(rollback) = tx.rollback().await {
                    error!(job_id = %job.id, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

/// Marks one execution of a job as in flight
///
/// Dropping it unsettled (the execution future was abandoned) releases the job
/// as cancelled so later executions are not locked out.
struct RunningJob<'a> {
    engine: &'a EtlEngine,
    job_id: &'a str,
    settled: bool,
}

impl RunningJob<'_> {
    fn finish(mut self, status: JobStatus, started_at: DateTime<Utc>) {
        self.settled = true;
        self.engine.release(self.job_id, status, Some(started_at));
    }
}

impl Drop for RunningJob<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(job_id = self.job_id, "ETL job execution dropped before completing");
            self.engine.release(self.job_id, JobStatus::Cancelled, None);
        }
    }
}

async fn write_records(
    tx: &mut dyn StoreTransaction,
    destination: &JobDestination,
    records: &[Record],
    quarantine_table: &str,
    quarantined: &[Record],
) -> Result<LoadCounts> {
    let table = destination.table.as_str();
    let mut counts = LoadCounts::default();

    if destination.mode == WriteMode::Replace {
        let deleted = tx.delete_all(table).await?;
        debug!(table, deleted, "Existing rows removed");
    }

    for record in records {
        match destination.mode {
            WriteMode::Insert | WriteMode::Replace => {
                tx.insert(table, record).await?;
                counts.inserted += 1;
            }
            WriteMode::Upsert => {
                if let Some(column) = destination
                    .key_columns
                    .iter()
                    .find(|column| matches!(record.get(*column), None | Some(Value::Null)))
                {
                    return Err(PipelineError::load(
                        table,
                        format!("record is missing key column {}", column),
                    ));
                }
                if tx.exists(table, &destination.key_columns, record).await? {
                    tx.update(table, &destination.key_columns, record).await?;
                    counts.updated += 1;
                } else {
                    tx.insert(table, record).await?;
                    counts.inserted += 1;
                }
            }
        }
    }

    for row in quarantined {
        tx.insert(quarantine_table, row).await?;
    }

    Ok(counts)
}

fn quarantine_row(mut record: Record, errors: Vec<String>, job_id: &str, execution_id: &str) -> Record {
    record.insert(
        "_errors".to_string(),
        Value::Array(errors.into_iter().map(Value::String).collect()),
    );
    record.insert("_job_id".to_string(), Value::String(job_id.to_string()));
    record.insert(
        "_execution_id".to_string(),
        Value::String(execution_id.to_string()),
    );
    record.insert(
        "_quarantined_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    record
}

fn validate_job(job: &EtlJobConfig) -> Result<()> {
    if job.id.trim().is_empty() {
        return Err(PipelineError::configuration("Job id must not be empty"));
    }
    if job.destination.table.trim().is_empty() {
        return Err(PipelineError::configuration(format!(
            "Job {} has no destination table",
            job.id
        )));
    }
    if job.source.batch_size == Some(0) {
        return Err(PipelineError::configuration(format!(
            "Job {} has a zero batch size",
            job.id
        )));
    }
    if job.destination.mode == WriteMode::Upsert && job.destination.key_columns.is_empty() {
        return Err(PipelineError::configuration(format!(
            "Job {} uses upsert without key columns",
            job.id
        )));
    }
    for step in &job.transformations {
        if let TransformationStep::Map { mappings, .. } = step {
            if let Some(mapping) = mappings
                .iter()
                .find(|m| m.source.is_none() && m.compute.is_none() && m.default.is_none())
            {
                return Err(PipelineError::configuration(format!(
                    "Mapping for {} has no source, value or computation",
                    mapping.target
                )));
            }
        }
    }
    Ok(())
}

/// Apply one transformation step to the full record set
pub fn apply_step(step: &TransformationStep, records: Vec<Record>) -> Result<Vec<Record>> {
    match step {
        TransformationStep::Map {
            mappings,
            remove_unmapped,
        } => records
            .into_iter()
            .map(|record| map_record(&record, mappings, *remove_unmapped))
            .collect(),
        TransformationStep::Filter { conditions } => Ok(records
            .into_iter()
            .filter(|record| matches_all(conditions, record))
            .collect()),
        TransformationStep::Aggregate {
            group_by,
            aggregations,
        } => Ok(aggregate(&records, group_by, aggregations)),
        TransformationStep::Custom(custom) => (custom.apply)(records).map_err(|e| match e {
            PipelineError::Transformation { .. } => e,
            other => PipelineError::transformation(&custom.name, other.to_string()),
        }),
    }
}

fn map_record(record: &Record, mappings: &[FieldMapping], remove_unmapped: bool) -> Result<Record> {
    let mut output = Record::new();

    if !remove_unmapped {
        for (key, value) in record {
            let consumed = mappings
                .iter()
                .any(|m| m.source.as_deref() == Some(key.as_str()) && m.target != *key);
            if !consumed {
                output.insert(key.clone(), value.clone());
            }
        }
    }

    for mapping in mappings {
        let value = match (&mapping.compute, &mapping.source) {
            (Some(compute), _) => compute(record).map_err(|e| {
                PipelineError::transformation("map", format!("{}: {}", mapping.target, e))
            })?,
            (None, Some(source)) => match record.get(source) {
                Some(value) if !value.is_null() => value.clone(),
                _ => mapping.default.clone().unwrap_or(Value::Null),
            },
            (None, None) => mapping.default.clone().unwrap_or(Value::Null),
        };
        output.insert(mapping.target.clone(), value);
    }

    Ok(output)
}

fn aggregate(records: &[Record], group_by: &[String], aggregations: &[Aggregation]) -> Vec<Record> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, (Record, Vec<&Record>)> = HashMap::new();

    for record in records {
        let key_values: Vec<Value> = group_by
            .iter()
            .map(|field| record.get(field).cloned().unwrap_or(Value::Null))
            .collect();
        let key = Value::Array(key_values.clone()).to_string();

        let (_, members) = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            let head: Record = group_by.iter().cloned().zip(key_values).collect();
            (head, Vec::new())
        });
        members.push(record);
    }

    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .map(|(mut head, members)| {
            for aggregation in aggregations {
                head.insert(
                    aggregation.output_name(),
                    aggregate_values(&members, aggregation),
                );
            }
            head
        })
        .collect()
}

fn aggregate_values(members: &[&Record], aggregation: &Aggregation) -> Value {
    if aggregation.function == AggregateFunction::Count {
        let count = if aggregation.field == "*" {
            members.len()
        } else {
            members
                .iter()
                .filter(|r| !matches!(r.get(&aggregation.field), None | Some(Value::Null)))
                .count()
        };
        return Value::from(count as u64);
    }

    let numbers: Vec<f64> = members
        .iter()
        .filter_map(|r| r.get(&aggregation.field).and_then(value_as_f64))
        .collect();

    match aggregation.function {
        AggregateFunction::Sum => number_value(numbers.iter().sum()),
        AggregateFunction::Avg if numbers.is_empty() => Value::Null,
        AggregateFunction::Avg => number_value(numbers.iter().sum::<f64>() / numbers.len() as f64),
        AggregateFunction::Min => numbers
            .iter()
            .copied()
            .reduce(f64::min)
            .map(number_value)
            .unwrap_or(Value::Null),
        AggregateFunction::Max => numbers
            .iter()
            .copied()
            .reduce(f64::max)
            .map(number_value)
            .unwrap_or(Value::Null),
        AggregateFunction::Count => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        connector::{DataSourceConfig, RelationalSource, SourceKind},
        events::drain,
        store::InMemoryStore,
        types::ComparisonOp,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    struct Harness {
        engine: EtlEngine,
        store: InMemoryStore,
        events: EventBus,
    }

    /// Source store whose reads wait for a configurable delay
    #[derive(Clone)]
    struct SlowStore {
        inner: InMemoryStore,
        delay: Arc<parking_lot::Mutex<Duration>>,
    }

    impl SlowStore {
        fn new(rows: Vec<Record>, delay: Duration) -> Self {
            let inner = InMemoryStore::new();
            inner.seed("orders", rows);
            Self {
                inner,
                delay: Arc::new(parking_lot::Mutex::new(delay)),
            }
        }

        fn set_delay(&self, delay: Duration) {
            *self.delay.lock() = delay;
        }
    }

    #[async_trait::async_trait]
    impl RelationalStore for SlowStore {
        async fn fetch(
            &self,
            query: &str,
            limit: Option<usize>,
            offset: Option<usize>,
        ) -> Result<Vec<Record>> {
            let delay = *self.delay.lock();
            tokio::time::sleep(delay).await;
            self.inner.fetch(query, limit, offset).await
        }

        async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
            self.inner.begin().await
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) {}
    }

    async fn harness(rows: Vec<Record>) -> Harness {
        let source_store = InMemoryStore::new();
        source_store.seed("orders", rows);
        harness_with_source(Arc::new(source_store)).await
    }

    async fn harness_with_source(source_store: Arc<dyn RelationalStore>) -> Harness {
        let config = Config::default();
        let events = EventBus::new();
        let metrics = Arc::new(MetricsCollector::new(&config).unwrap());
        let handler = Arc::new(ErrorHandler::new(events.clone(), Arc::clone(&metrics)));
        let connector = Arc::new(DataConnector::new(
            config.connector.clone(),
            Arc::clone(&handler),
            events.clone(),
            Arc::clone(&metrics),
        ));

        connector
            .attach_relational_source(
                DataSourceConfig::new(
                    "db",
                    "Orders DB",
                    SourceKind::Relational(RelationalSource {
                        url: "postgres://unused".to_string(),
                        max_connections: None,
                    }),
                ),
                source_store,
            )
            .await
            .unwrap();

        let store = InMemoryStore::new();
        let engine = EtlEngine::new(
            config.etl.clone(),
            connector,
            Arc::new(store.clone()),
            handler,
            events.clone(),
            metrics,
        );
        Harness {
            engine,
            store,
            events,
        }
    }

    fn job(mode: WriteMode) -> EtlJobConfig {
        EtlJobConfig {
            id: "orders-sync".to_string(),
            name: "Orders sync".to_string(),
            source: JobSource {
                source_id: "db".to_string(),
                query: "orders".to_string(),
                filter: Record::new(),
                batch_size: None,
            },
            transformations: Vec::new(),
            destination: JobDestination {
                table: "warehouse_orders".to_string(),
                mode,
                key_columns: if mode == WriteMode::Upsert {
                    vec!["id".to_string()]
                } else {
                    Vec::new()
                },
                quarantine_table: None,
                retry: None,
                circuit_breaker: None,
            },
            validation: None,
        }
    }

    fn orders() -> Vec<Record> {
        vec![
            record(json!({"id": 1, "customer": "acme", "amount": 120.0})),
            record(json!({"id": 2, "customer": "acme", "amount": 30.0})),
            record(json!({"id": 3, "customer": "globex", "amount": 75.5})),
        ]
    }

    #[tokio::test]
    async fn test_insert_job_lifecycle() {
        let h = harness(orders()).await;
        let mut events = h.events.subscribe();
        h.engine.register_job(job(WriteMode::Insert)).unwrap();
        assert_eq!(h.engine.get_job_status("orders-sync"), Some(JobStatus::Pending));

        let result = h.engine.execute_job("orders-sync").await.unwrap();
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.records_extracted, 3);
        assert_eq!(result.records_inserted, 3);
        assert_eq!(h.store.rows("warehouse_orders").len(), 3);
        assert_eq!(h.engine.get_job_status("orders-sync"), Some(JobStatus::Completed));

        let names: Vec<&str> = drain(&mut events)
            .iter()
            .map(|e| e.name())
            .filter(|n| n.starts_with("job_"))
            .collect();
        assert_eq!(names, ["job_registered", "job_started", "job_completed"]);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let h = harness(orders()).await;
        let err = h.engine.execute_job("missing").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_upsert_updates_existing_and_inserts_new() {
        let h = harness(vec![record(json!({"id": 1, "amount": 999.0}))]).await;
        h.store.seed(
            "warehouse_orders",
            vec![record(json!({"id": 1, "amount": 10.0}))],
        );
        h.engine.register_job(job(WriteMode::Upsert)).unwrap();

        let result = h.engine.execute_job("orders-sync").await.unwrap();
        assert_eq!(result.records_updated, 1);
        assert_eq!(result.records_inserted, 0);
        assert_eq!(h.store.rows("warehouse_orders")[0]["amount"], json!(999.0));

        h.store.seed("warehouse_orders", Vec::new());
        let result = h.engine.execute_job("orders-sync").await.unwrap();
        assert_eq!(result.records_updated, 0);
        assert_eq!(result.records_inserted, 1);
    }

    #[tokio::test]
    async fn test_replace_clears_existing_rows() {
        let h = harness(orders()).await;
        h.store.seed(
            "warehouse_orders",
            vec![record(json!({"id": 99})), record(json!({"id": 100}))],
        );
        h.engine.register_job(job(WriteMode::Replace)).unwrap();

        let result = h.engine.execute_job("orders-sync").await.unwrap();
        assert!(result.success);
        let ids: Vec<Value> = h
            .store
            .rows("warehouse_orders")
            .iter()
            .map(|r| r["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_load_failure_rolls_back() {
        let h = harness(orders()).await;
        h.store
            .seed("warehouse_orders", vec![record(json!({"id": 42}))]);
        h.store.fail_writes_to("warehouse_orders");
        h.engine.register_job(job(WriteMode::Replace)).unwrap();

        let result = h.engine.execute_job("orders-sync").await.unwrap();
        assert!(!result.success);
        assert_eq!(result.status, JobStatus::Failed);
        assert!(!result.errors.is_empty());
        assert_eq!(h.store.rows("warehouse_orders").len(), 1);
        assert_eq!(h.engine.get_job_status("orders-sync"), Some(JobStatus::Failed));
    }

    #[tokio::test]
    async fn test_transformations_pipeline() {
        let h = harness(orders()).await;
        let mut definition = job(WriteMode::Insert);
        definition.transformations = vec![
            TransformationStep::Map {
                mappings: vec![
                    FieldMapping::copy("customer", "customer_name"),
                    FieldMapping::computed("amount_cents", |r| {
                        let amount = r.get("amount").and_then(value_as_f64).unwrap_or(0.0);
                        Ok(json!((amount * 100.0).round() as i64))
                    }),
                ],
                remove_unmapped: false,
            },
            TransformationStep::Filter {
                conditions: vec![Condition::new(
                    "amount",
                    ComparisonOp::GreaterThanOrEqual,
                    json!(50),
                )],
            },
            TransformationStep::Aggregate {
                group_by: vec!["customer_name".to_string()],
                aggregations: vec![
                    Aggregation::new("amount", AggregateFunction::Sum).alias("total"),
                    Aggregation::new("*", AggregateFunction::Count),
                ],
            },
        ];
        h.engine.register_job(definition).unwrap();

        let result = h.engine.execute_job("orders-sync").await.unwrap();
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.records_processed, 2);

        let rows = h.store.rows("warehouse_orders");
        assert_eq!(rows[0]["customer_name"], json!("acme"));
        assert_eq!(rows[0]["total"], json!(120.0));
        assert_eq!(rows[0]["count_all"], json!(1));
        assert_eq!(rows[1]["customer_name"], json!("globex"));
    }

    #[tokio::test]
    async fn test_custom_step_error_fails_job() {
        let h = harness(orders()).await;
        let mut definition = job(WriteMode::Insert);
        definition.transformations = vec![TransformationStep::Custom(CustomStep::new(
            "explode",
            |_| Err(PipelineError::internal("boom")),
        ))];
        h.engine.register_job(definition).unwrap();

        let result = h.engine.execute_job("orders-sync").await.unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert!(result.errors[0].contains("explode"));
        assert!(h.store.rows("warehouse_orders").is_empty());
    }

    fn gated(policy: FailurePolicy) -> EtlJobConfig {
        let mut definition = job(WriteMode::Insert);
        definition.validation = Some(ValidationGate {
            rules: vec![ValidationRule::range("amount", Some(50.0), None)],
            on_failure: policy,
        });
        definition
    }

    #[tokio::test]
    async fn test_gate_skip() {
        let h = harness(orders()).await;
        h.engine.register_job(gated(FailurePolicy::Skip)).unwrap();
        let result = h.engine.execute_job("orders-sync").await.unwrap();
        assert!(result.success);
        assert_eq!(result.records_skipped, 1);
        assert_eq!(result.records_inserted, 2);
        assert!(result.warnings.iter().any(|w| w.contains("skipped")));
    }

    #[tokio::test]
    async fn test_gate_stop_writes_nothing() {
        let h = harness(orders()).await;
        h.engine.register_job(gated(FailurePolicy::Stop)).unwrap();
        let result = h.engine.execute_job("orders-sync").await.unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.records_failed, 1);
        assert!(h.store.rows("warehouse_orders").is_empty());
    }

    #[tokio::test]
    async fn test_gate_quarantine() {
        let h = harness(orders()).await;
        h.engine
            .register_job(gated(FailurePolicy::Quarantine))
            .unwrap();
        let result = h.engine.execute_job("orders-sync").await.unwrap();
        assert!(result.success);
        assert_eq!(result.records_failed, 1);
        assert_eq!(h.store.rows("warehouse_orders").len(), 2);

        let quarantined = h.store.rows("warehouse_orders_quarantine");
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0]["id"], json!(2));
        assert_eq!(quarantined[0]["_job_id"], json!("orders-sync"));
        assert!(quarantined[0]["_errors"].as_array().is_some());
    }

    #[tokio::test]
    async fn test_paged_extraction() {
        let rows: Vec<Record> = (0..7).map(|i| record(json!({ "id": i }))).collect();
        let h = harness(rows).await;
        let mut definition = job(WriteMode::Insert);
        definition.source.batch_size = Some(3);
        h.engine.register_job(definition).unwrap();

        let result = h.engine.execute_job("orders-sync").await.unwrap();
        assert_eq!(result.records_extracted, 7);
        assert_eq!(h.store.rows("warehouse_orders").len(), 7);
    }

    #[tokio::test]
    async fn test_extraction_failure_fails_job() {
        let h = harness(orders()).await;
        let mut definition = job(WriteMode::Insert);
        definition.source.query = "no_such_table".to_string();
        h.engine.register_job(definition).unwrap();

        let result = h.engine.execute_job("orders-sync").await.unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert!(result.errors[0].contains("no_such_table"));
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_newest_first() {
        let h = harness(orders()).await;
        h.engine.register_job(job(WriteMode::Replace)).unwrap();
        let limit = Config::default().etl.history_limit;
        for _ in 0..(limit + 2) {
            h.engine.execute_job("orders-sync").await.unwrap();
        }

        let all = h.engine.get_job_history("orders-sync", None);
        assert_eq!(all.len(), limit);
        assert!(all[0].started_at >= all[1].started_at);
        assert_eq!(h.engine.get_job_history("orders-sync", Some(2)).len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_definitions_rejected() {
        let h = harness(orders()).await;
        let mut definition = job(WriteMode::Upsert);
        definition.destination.key_columns.clear();
        assert!(h.engine.register_job(definition).is_err());

        let mut definition = job(WriteMode::Insert);
        definition.source.batch_size = Some(0);
        assert!(h.engine.register_job(definition).is_err());
    }

    #[tokio::test]
    async fn test_cancel_requires_running_job() {
        let h = harness(orders()).await;
        h.engine.register_job(job(WriteMode::Insert)).unwrap();
        assert!(!h.engine.cancel_job("orders-sync").unwrap());
        assert!(h.engine.cancel_job("missing").is_err());

        assert_eq!(h.engine.list_jobs().len(), 1);
        h.engine.unregister_job("orders-sync").unwrap();
        assert!(h.engine.list_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_execution_rejected_and_cancel_mid_run() {
        let source = SlowStore::new(orders(), Duration::from_secs(5));
        let h = harness_with_source(Arc::new(source)).await;
        h.engine.register_job(job(WriteMode::Insert)).unwrap();

        let (first, _) = tokio::join!(h.engine.execute_job("orders-sync"), async {
            while h.engine.get_job_status("orders-sync") != Some(JobStatus::Running) {
                tokio::task::yield_now().await;
            }
            let second = h.engine.execute_job("orders-sync").await;
            assert!(matches!(second, Err(PipelineError::AlreadyRunning { .. })));
            assert!(h.engine.unregister_job("orders-sync").is_err());
            assert!(h.engine.cancel_job("orders-sync").unwrap());
        });

        let result = first.unwrap();
        assert_eq!(result.status, JobStatus::Cancelled);
        assert!(!result.success);
        assert_eq!(result.records_extracted, 3);
        assert!(h.store.rows("warehouse_orders").is_empty());
        assert_eq!(h.engine.get_job_status("orders-sync"), Some(JobStatus::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_execution_releases_job() {
        let source = SlowStore::new(orders(), Duration::from_secs(60));
        let h = harness_with_source(Arc::new(source.clone())).await;
        h.engine.register_job(job(WriteMode::Insert)).unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), h.engine.execute_job("orders-sync"))
                .await;
        assert!(abandoned.is_err());
        assert_eq!(h.engine.get_job_status("orders-sync"), Some(JobStatus::Cancelled));
        assert!(!h.engine.cancel_job("orders-sync").unwrap());
        assert!(h.engine.get_job_history("orders-sync", None).is_empty());

        source.set_delay(Duration::ZERO);
        let result = h.engine.execute_job("orders-sync").await.unwrap();
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(h.store.rows("warehouse_orders").len(), 3);
    }

    #[tokio::test]
    async fn test_load_goes_through_the_breaker() {
        let h = harness(orders()).await;
        h.store.fail_writes_to("warehouse_orders");
        let mut definition = job(WriteMode::Insert);
        definition.destination.circuit_breaker = Some(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout_ms: 60_000,
        });
        h.engine.register_job(definition).unwrap();

        let failed = h.engine.execute_job("orders-sync").await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);

        let rejected = h.engine.execute_job("orders-sync").await.unwrap();
        assert_eq!(rejected.status, JobStatus::Failed);
        assert!(rejected.errors.iter().any(|e| e.contains("Circuit breaker open")));
    }

    #[test]
    fn test_job_definition_from_json() {
        let definition: EtlJobConfig = serde_json::from_value(json!({
            "id": "daily",
            "name": "Daily",
            "source": {"source_id": "db", "query": "select * from t", "batch_size": 500},
            "transformations": [
                {"type": "map", "mappings": [{"source": "a", "target": "b"}, {"target": "origin", "default": "etl"}]},
                {"type": "filter", "conditions": [{"field": "b", "operator": "gt", "value": 1}]},
                {"type": "aggregate", "group_by": ["b"], "aggregations": [{"field": "x", "function": "avg"}]}
            ],
            "destination": {"table": "t2", "mode": "upsert", "key_columns": ["b"]},
            "validation": {"rules": [{"field": "b", "rule": "required"}], "on_failure": "quarantine"}
        }))
        .unwrap();

        assert_eq!(definition.transformations.len(), 3);
        assert_eq!(definition.destination.mode, WriteMode::Upsert);
        assert!(validate_job(&definition).is_ok());
        assert_eq!(
            definition.validation.map(|v| v.on_failure),
            Some(FailurePolicy::Quarantine)
        );
    }
}
