//! Data connector: uniform extraction over relational, HTTP, file and stream sources
//!
//! Each registered source owns one live connection handle. Extraction never
//! returns an error to the caller; failures are reported inside the
//! [`ExtractionResult`] together with timing metadata.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::ConnectorConfig,
    error::{PipelineError, Result},
    events::{EventBus, PipelineEvent},
    metrics::MetricsCollector,
    resilience::{CircuitBreakerConfig, ErrorHandler, RetryConfig},
    store::{PgStore, RelationalStore},
    types::Record,
};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Registered data source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub source: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    /// Retry policy wrapped around each extraction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// Breaker policy for extractions; the handler default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

const SOURCE_TYPES: &[&str] = &["relational", "http_api", "http-api", "file", "stream"];

impl DataSourceConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, source: SourceKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source,
            credentials: None,
            retry: None,
            circuit_breaker: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    /// Parse a loosely typed definition, reporting unknown `type` tags explicitly
    pub fn from_value(value: Value) -> Result<Self> {
        match value.get("type").and_then(Value::as_str) {
            Some(kind) if SOURCE_TYPES.contains(&kind) => Ok(serde_json::from_value(value)?),
            Some(kind) => Err(PipelineError::unsupported_source(kind)),
            None => Err(PipelineError::configuration(
                "Data source definition is missing its type",
            )),
        }
    }
}

/// Source variant with its connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    Relational(RelationalSource),
    #[serde(alias = "http-api")]
    HttpApi(HttpApiSource),
    File(FileSource),
    Stream(StreamSource),
}

impl SourceKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Relational(_) => "relational",
            Self::HttpApi(_) => "http_api",
            Self::File(_) => "file",
            Self::Stream(_) => "stream",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalSource {
    /// `postgres://` connection URL
    pub url: String,
    #[serde(default)]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpApiSource {
    pub base_url: String,
    /// Endpoint name to path
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

/// Requests allowed per window
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests: u32,
    pub window_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Csv,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSource {
    pub path: PathBuf,
    pub format: FileFormat,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_has_header")]
    pub has_header: bool,
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn default_delimiter() -> char {
    ','
}

fn default_has_header() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSource {
    pub topic: String,
    #[serde(default)]
    pub group_id: Option<String>,
}

/// Credentials attached to outgoing requests or connections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    Bearer { token: String },
    Basic { username: String, password: String },
    ApiKey { header: String, key: String },
}

/// Pagination and filtering for one extraction call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractOptions {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Merged into HTTP query parameters
    #[serde(default)]
    pub filter: Record,
}

impl ExtractOptions {
    pub fn page(limit: usize, offset: usize) -> Self {
        Self {
            limit: Some(limit),
            offset: Some(offset),
            filter: Record::new(),
        }
    }
}

/// Outcome of one extraction call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub success: bool,
    pub data: Vec<Record>,
    pub metadata: ExtractionMetadata,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    pub source_id: String,
    pub record_count: usize,
    pub extraction_time_ms: u64,
    pub extracted_at: DateTime<Utc>,
}

enum Connection {
    Relational(Arc<dyn RelationalStore>),
    Http {
        client: reqwest::Client,
        limiter: Option<Arc<DirectLimiter>>,
    },
    File,
    Stream,
}

struct RegisteredSource {
    config: DataSourceConfig,
    connection: Connection,
}

/// Data connector
pub struct DataConnector {
    config: ConnectorConfig,
    sources: DashMap<String, Arc<RegisteredSource>>,
    error_handler: Arc<ErrorHandler>,
    events: EventBus,
    metrics: Arc<MetricsCollector>,
}

impl DataConnector {
    pub fn new(
        config: ConnectorConfig,
        error_handler: Arc<ErrorHandler>,
        events: EventBus,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            config,
            sources: DashMap::new(),
            error_handler,
            events,
            metrics,
        }
    }

    /// Build and validate the connection for a source, then register it
    #[instrument(skip(self, config), fields(source_id = %config.id))]
    pub async fn register_data_source(&self, config: DataSourceConfig) -> Result<()> {
        let connection = match &config.source {
            SourceKind::Relational(relational) => {
                let mut options = PgStore::parse_url(&relational.url)?;
                if let Some(Credentials::Basic { username, password }) = &config.credentials {
                    options = options.username(username).password(password);
                }
                let store = PgStore::connect_with(
                    options,
                    relational
                        .max_connections
                        .unwrap_or(self.config.relational_max_connections),
                    Duration::from_secs(self.config.relational_acquire_timeout_secs),
                )
                .await
                .map_err(|e| PipelineError::connection(&config.id, e.to_string()))?;
                Connection::Relational(Arc::new(store))
            }
            SourceKind::HttpApi(http) => self.build_http_connection(&config.id, http)?,
            SourceKind::File(file) => {
                if !file.encoding.eq_ignore_ascii_case("utf-8")
                    && !file.encoding.eq_ignore_ascii_case("utf8")
                {
                    return Err(PipelineError::configuration(format!(
                        "Unsupported file encoding: {}",
                        file.encoding
                    )));
                }
                if !file.delimiter.is_ascii() {
                    return Err(PipelineError::configuration(
                        "CSV delimiter must be a single ASCII character",
                    ));
                }
                tokio::fs::metadata(&file.path).await.map_err(|e| {
                    PipelineError::connection(
                        &config.id,
                        format!("Cannot access {}: {}", file.path.display(), e),
                    )
                })?;
                Connection::File
            }
            SourceKind::Stream(_) => Connection::Stream,
        };

        self.insert_source(config, connection).await;
        Ok(())
    }

    /// Register a relational source over a caller-supplied store
    pub async fn attach_relational_source(
        &self,
        config: DataSourceConfig,
        store: Arc<dyn RelationalStore>,
    ) -> Result<()> {
        if !matches!(config.source, SourceKind::Relational(_)) {
            return Err(PipelineError::configuration(format!(
                "Source {} is not relational",
                config.id
            )));
        }
        self.insert_source(config, Connection::Relational(store))
            .await;
        Ok(())
    }

    async fn insert_source(&self, config: DataSourceConfig, connection: Connection) {
        let source_id = config.id.clone();
        let source_type = config.source.type_name();
        let registered = Arc::new(RegisteredSource { config, connection });

        if let Some(previous) = self.sources.insert(source_id.clone(), registered) {
            warn!(source_id = %source_id, "Replacing registered data source");
            close_connection(&previous.connection).await;
        }

        info!(source_id = %source_id, source_type, "Data source registered");
        self.events.publish(PipelineEvent::SourceRegistered {
            source_id,
            source_type: source_type.to_string(),
        });
    }

    fn build_http_connection(&self, source_id: &str, http: &HttpApiSource) -> Result<Connection> {
        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &http.headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| PipelineError::configuration(format!("Invalid header name: {}", e)))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| PipelineError::configuration(format!("Invalid header value: {}", e)))?;
            headers.insert(name, value);
        }

        let timeout = Duration::from_secs(http.timeout_secs.unwrap_or(self.config.http_timeout_secs));
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::connection(source_id, e.to_string()))?;

        let limiter = match http.rate_limit {
            Some(limit) => Some(Arc::new(build_limiter(limit)?)),
            None => None,
        };

        Ok(Connection::Http { client, limiter })
    }

    /// Extract records from a registered source
    #[instrument(skip(self, options))]
    pub async fn extract_data(
        &self,
        source_id: &str,
        query: &str,
        options: &ExtractOptions,
    ) -> ExtractionResult {
        let started = Instant::now();
        let outcome = self.extract_inner(source_id, query, options).await;
        let elapsed = started.elapsed();

        let metadata = |record_count| ExtractionMetadata {
            source_id: source_id.to_string(),
            record_count,
            extraction_time_ms: elapsed.as_millis() as u64,
            extracted_at: Utc::now(),
        };

        self.metrics.record_histogram(
            "extraction_duration_seconds",
            elapsed.as_secs_f64(),
            &[("source", source_id)],
        );

        match outcome {
            Ok(data) => {
                debug!(records = data.len(), "Extraction completed");
                self.metrics.increment_counter(
                    "extractions_total",
                    &[("source", source_id), ("status", "success")],
                );
                self.events.publish(PipelineEvent::ExtractionCompleted {
                    source_id: source_id.to_string(),
                    records: data.len(),
                    elapsed_ms: elapsed.as_millis() as u64,
                });
                ExtractionResult {
                    success: true,
                    metadata: metadata(data.len()),
                    data,
                    error: None,
                }
            }
            Err(error) => {
                warn!(error = %error, "Extraction failed");
                self.metrics.increment_counter(
                    "extractions_total",
                    &[("source", source_id), ("status", "failure")],
                );
                self.events.publish(PipelineEvent::ExtractionFailed {
                    source_id: source_id.to_string(),
                    error: error.to_string(),
                });
                ExtractionResult {
                    success: false,
                    data: Vec::new(),
                    metadata: metadata(0),
                    error: Some(error.to_string()),
                }
            }
        }
    }

    async fn extract_inner(
        &self,
        source_id: &str,
        query: &str,
        options: &ExtractOptions,
    ) -> Result<Vec<Record>> {
        let source = self
            .sources
            .get(source_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PipelineError::not_found("data source", source_id))?;

        let operation = format!("extract:{}", source_id);
        let source = &source;
        self.error_handler
            .execute_guarded(
                &operation,
                move || extract_once(source, query, options),
                source.config.retry.as_ref(),
                source.config.circuit_breaker.as_ref(),
            )
            .await
    }

    /// Lightweight liveness probe
    pub async fn test_connection(&self, source_id: &str) -> Result<bool> {
        let source = self
            .sources
            .get(source_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PipelineError::not_found("data source", source_id))?;

        let healthy = match (&source.connection, &source.config.source) {
            (Connection::Relational(store), _) => store.ping().await.is_ok(),
            (Connection::Http { client, .. }, SourceKind::HttpApi(http)) => {
                match client.get(&http.base_url).send().await {
                    Ok(response) => !response.status().is_server_error(),
                    Err(e) => {
                        debug!(source_id, error = %e, "HTTP probe failed");
                        false
                    }
                }
            }
            (Connection::File, SourceKind::File(file)) => {
                tokio::fs::metadata(&file.path).await.is_ok()
            }
            (Connection::Stream, _) => true,
            _ => false,
        };

        debug!(source_id, healthy, "Connection probe finished");
        Ok(healthy)
    }

    pub fn get_data_source(&self, source_id: &str) -> Option<DataSourceConfig> {
        self.sources
            .get(source_id)
            .map(|entry| entry.config.clone())
    }

    pub fn list_data_sources(&self) -> Vec<DataSourceConfig> {
        let mut sources: Vec<DataSourceConfig> = self
            .sources
            .iter()
            .map(|entry| entry.config.clone())
            .collect();
        sources.sort_by(|a, b| a.id.cmp(&b.id));
        sources
    }

    /// Close and forget one source
    pub async fn remove_data_source(&self, source_id: &str) -> Result<()> {
        let (_, source) = self
            .sources
            .remove(source_id)
            .ok_or_else(|| PipelineError::not_found("data source", source_id))?;
        close_connection(&source.connection).await;

        info!(source_id, "Data source removed");
        self.events.publish(PipelineEvent::SourceRemoved {
            source_id: source_id.to_string(),
        });
        Ok(())
    }

    /// Release every held connection
    pub async fn close_all_connections(&self) {
        let ids: Vec<String> = self.sources.iter().map(|e| e.key().clone()).collect();
        let removed: Vec<Arc<RegisteredSource>> = ids
            .iter()
            .filter_map(|id| self.sources.remove(id).map(|(_, source)| source))
            .collect();
        let count = removed.len();
        join_all(
            removed
                .iter()
                .map(|source| close_connection(&source.connection)),
        )
        .await;

        info!(count, "Closed all data source connections");
        self.events
            .publish(PipelineEvent::ConnectionsClosed { count });
    }
}

fn build_limiter(limit: RateLimitConfig) -> Result<DirectLimiter> {
    let requests = NonZeroU32::new(limit.requests).ok_or_else(|| {
        PipelineError::configuration("Rate limit must allow at least one request")
    })?;
    let period = Duration::from_millis(limit.window_ms) / limit.requests;
    let quota = Quota::with_period(period)
        .ok_or_else(|| PipelineError::configuration("Rate limit window must be positive"))?
        .allow_burst(requests);
    Ok(RateLimiter::direct(quota))
}

async fn close_connection(connection: &Connection) {
    if let Connection::Relational(store) = connection {
        store.close().await;
    }
}

async fn extract_once(
    source: &RegisteredSource,
    query: &str,
    options: &ExtractOptions,
) -> Result<Vec<Record>> {
    // Every attempt, retries included, spends from the request budget
    if let Connection::Http {
        limiter: Some(limiter),
        ..
    } = &source.connection
    {
        if limiter.check().is_err() {
            return Err(PipelineError::rate_limit(
                &source.config.id,
                "Request budget for the current window is spent",
            ));
        }
    }

    match (&source.connection, &source.config.source) {
        (Connection::Relational(store), _) => {
            store.fetch(query, options.limit, options.offset).await
        }
        (Connection::Http { client, .. }, SourceKind::HttpApi(http)) => {
            extract_http(&source.config, client, http, query, options).await
        }
        (Connection::File, SourceKind::File(file)) => {
            let records = read_file(&source.config.id, file).await?;
            Ok(paginate(records, options))
        }
        (Connection::Stream, SourceKind::Stream(stream)) => Err(PipelineError::unsupported_source(
            format!(
                "stream source {} (topic {}) is consumed through a stream processor",
                source.config.id, stream.topic
            ),
        )),
        _ => Err(PipelineError::internal(format!(
            "Connection does not match source type for {}",
            source.config.id
        ))),
    }
}

async fn extract_http(
    config: &DataSourceConfig,
    client: &reqwest::Client,
    http: &HttpApiSource,
    endpoint: &str,
    options: &ExtractOptions,
) -> Result<Vec<Record>> {
    let path = http
        .endpoints
        .get(endpoint)
        .map(String::as_str)
        .unwrap_or(endpoint);
    let url = format!(
        "{}/{}",
        http.base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    );

    let mut params: Vec<(String, String)> = options
        .filter
        .iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), rendered)
        })
        .collect();
    if let Some(limit) = options.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    if let Some(offset) = options.offset {
        params.push(("offset".to_string(), offset.to_string()));
    }

    let mut request = client.get(&url).query(&params);
    request = match &config.credentials {
        Some(Credentials::Bearer { token }) => request.bearer_auth(token),
        Some(Credentials::Basic { username, password }) => {
            request.basic_auth(username, Some(password))
        }
        Some(Credentials::ApiKey { header, key }) => request.header(header.as_str(), key.as_str()),
        None => request,
    };

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(PipelineError::connection(
            &config.id,
            format!("HTTP {} from {}", status, url),
        ));
    }

    let body = response.bytes().await?;
    let payload: Value = serde_json::from_slice(&body)?;
    Ok(records_from_payload(payload))
}

/// Accepts an array, an object wrapping `data`/`results`/`items`, or one object
fn records_from_payload(payload: Value) -> Vec<Record> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            let wrapped = ["data", "results", "items"]
                .iter()
                .find(|key| matches!(map.get(**key), Some(Value::Array(_))))
                .and_then(|key| map.remove(*key));
            match wrapped {
                Some(Value::Array(items)) => items,
                _ => vec![Value::Object(map)],
            }
        }
        Value::Null => Vec::new(),
        other => vec![other],
    };

    items.into_iter().map(into_record).collect()
}

fn into_record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => {
            let mut record = Record::new();
            record.insert("value".to_string(), other);
            record
        }
    }
}

async fn read_file(source_id: &str, file: &FileSource) -> Result<Vec<Record>> {
    let content = tokio::fs::read_to_string(&file.path).await.map_err(|e| {
        PipelineError::connection(
            source_id,
            format!("Cannot read {}: {}", file.path.display(), e),
        )
    })?;

    match file.format {
        FileFormat::Csv => parse_csv(&content, file.delimiter as u8, file.has_header),
        FileFormat::Json => parse_json(&content),
    }
}

fn parse_csv(content: &str, delimiter: u8, has_header: bool) -> Result<Vec<Record>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(has_header)
        .flexible(true)
        .trim(csv::Trim::None)
        .from_reader(content.as_bytes());

    let headers: Option<Vec<String>> = if has_header {
        Some(reader.headers()?.iter().map(str::to_string).collect())
    } else {
        None
    };

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let mut record = Record::new();
        for (index, field) in row.iter().enumerate() {
            let column = headers
                .as_ref()
                .and_then(|h| h.get(index).cloned())
                .unwrap_or_else(|| format!("column_{}", index + 1));
            record.insert(column, Value::String(field.to_string()));
        }
        records.push(record);
    }
    Ok(records)
}

fn parse_json(content: &str) -> Result<Vec<Record>> {
    match serde_json::from_str::<Value>(content) {
        Ok(payload) => Ok(records_from_payload(payload)),
        Err(_) => content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str::<Value>(line).map(into_record).map_err(Into::into))
            .collect(),
    }
}

fn paginate(records: Vec<Record>, options: &ExtractOptions) -> Vec<Record> {
    records
        .into_iter()
        .skip(options.offset.unwrap_or(0))
        .take(options.limit.unwrap_or(usize::MAX))
        .collect()
}
