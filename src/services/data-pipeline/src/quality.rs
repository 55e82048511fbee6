//! Data quality monitor
//!
//! Keeps a rolling buffer of recent messages and their processing results,
//! recomputes six quality metrics on a periodic tick, raises threshold alerts
//! and checks field-level quality rules against every incoming message.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::{MetricThresholds, QualityConfig},
    error::{PipelineError, Result},
    events::{EventBus, PipelineEvent},
    metrics::MetricsCollector,
    types::{is_empty_value, value_as_f64, value_type_name, ProcessingResult, StreamMessage},
};

/// Change smaller than this, in score points, counts as stable
const TREND_DEAD_BAND: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityDimension {
    Completeness,
    Accuracy,
    Consistency,
    Timeliness,
    Validity,
    Uniqueness,
}

impl QualityDimension {
    pub const ALL: [QualityDimension; 6] = [
        Self::Completeness,
        Self::Accuracy,
        Self::Consistency,
        Self::Timeliness,
        Self::Validity,
        Self::Uniqueness,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completeness => "completeness",
            Self::Accuracy => "accuracy",
            Self::Consistency => "consistency",
            Self::Timeliness => "timeliness",
            Self::Validity => "validity",
            Self::Uniqueness => "uniqueness",
        }
    }

    fn thresholds(&self, config: &QualityConfig) -> MetricThresholds {
        let thresholds = &config.thresholds;
        match self {
            Self::Completeness => thresholds.completeness,
            Self::Accuracy => thresholds.accuracy,
            Self::Consistency => thresholds.consistency,
            Self::Timeliness => thresholds.timeliness,
            Self::Validity => thresholds.validity,
            Self::Uniqueness => thresholds.uniqueness,
        }
    }

    fn recommendation(&self) -> &'static str {
        match self {
            Self::Completeness => {
                "Completeness is below target: check producers for missing or empty fields"
            }
            Self::Accuracy => {
                "Accuracy is below target: review processing failures and transformation rules"
            }
            Self::Consistency => {
                "Consistency is below target: fields arrive with mixed types, enforce a schema upstream"
            }
            Self::Timeliness => {
                "Timeliness is below target: messages arrive late, check consumer lag and producer clocks"
            }
            Self::Validity => {
                "Validity is below target: payloads fail structural validation, inspect the dead-letter topic"
            }
            Self::Uniqueness => {
                "Uniqueness is below target: duplicate messages detected, enable idempotent producers"
            }
        }
    }
}

impl fmt::Display for QualityDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

/// Current value of one quality dimension, 0 to 100
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityMetric {
    pub name: QualityDimension,
    pub value: f64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub trend: Trend,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    #[default]
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// What raised an alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertOrigin {
    Threshold,
    Rule { rule_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityAlert {
    pub id: String,
    pub severity: AlertSeverity,
    pub metric: String,
    pub message: String,
    /// Observed value, when the alert is numeric
    pub value: Option<f64>,
    pub threshold: Option<f64>,
    pub origin: AlertOrigin,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl QualityAlert {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Field-level rule checked against every recorded message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityRule {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub check: QualityCheck,
    #[serde(default)]
    pub severity: AlertSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QualityCheck {
    /// Field present and non-empty
    Completeness { field: String },
    /// Field, when present, matches the pattern
    Validity { field: String, pattern: String },
    /// Field, when present, is numeric and inside the bounds
    Accuracy {
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
}

impl QualityCheck {
    fn dimension(&self) -> QualityDimension {
        match self {
            Self::Completeness { .. } => QualityDimension::Completeness,
            Self::Validity { .. } => QualityDimension::Validity,
            Self::Accuracy { .. } => QualityDimension::Accuracy,
        }
    }
}

/// Snapshot returned by [`DataQualityMonitor::generate_report`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    /// Mean of all metric values
    pub overall_score: f64,
    pub metrics: Vec<QualityMetric>,
    pub trends: BTreeMap<QualityDimension, Trend>,
    pub unresolved_alerts: usize,
    pub critical_alerts: usize,
    pub recommendations: Vec<String>,
    pub sample_size: usize,
    pub generated_at: DateTime<Utc>,
}

struct Observation {
    message: StreamMessage,
    /// Processing outcome, when the message went through a processor
    success: Option<bool>,
    failed_validation: bool,
}

struct CompiledRule {
    rule: QualityRule,
    pattern: Option<Regex>,
}

struct MonitorState {
    buffer: VecDeque<Observation>,
    metrics: BTreeMap<QualityDimension, QualityMetric>,
    evaluated: bool,
    alerts: VecDeque<QualityAlert>,
    rules: Vec<CompiledRule>,
}

struct Ticker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Rolling quality monitor
#[derive(Clone)]
pub struct DataQualityMonitor {
    config: Arc<QualityConfig>,
    state: Arc<Mutex<MonitorState>>,
    ticker: Arc<Mutex<Option<Ticker>>>,
    events: EventBus,
    metrics: Arc<MetricsCollector>,
}

impl DataQualityMonitor {
    pub fn new(config: QualityConfig, events: EventBus, metrics: Arc<MetricsCollector>) -> Self {
        let now = Utc::now();
        let initial = QualityDimension::ALL
            .iter()
            .map(|dimension| {
                let thresholds = dimension.thresholds(&config);
                (
                    *dimension,
                    QualityMetric {
                        name: *dimension,
                        value: 100.0,
                        warning_threshold: thresholds.warning,
                        critical_threshold: thresholds.critical,
                        trend: Trend::Stable,
                        last_updated: now,
                    },
                )
            })
            .collect();

        Self {
            state: Arc::new(Mutex::new(MonitorState {
                buffer: VecDeque::with_capacity(config.buffer_capacity.min(4096)),
                metrics: initial,
                evaluated: false,
                alerts: VecDeque::new(),
                rules: Vec::new(),
            })),
            config: Arc::new(config),
            ticker: Arc::new(Mutex::new(None)),
            events,
            metrics,
        }
    }

    /// Start the periodic metric evaluation
    pub fn start(&self) -> Result<()> {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return Err(PipelineError::already_running("quality monitor", "ticker"));
        }

        let token = CancellationToken::new();
        let period = Duration::from_secs(self.config.evaluation_interval_secs.max(1));
        let monitor = self.clone();
        let child = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = interval.tick() => {
                        monitor.evaluate_now();
                    }
                }
            }
            debug!("Quality evaluation loop exited");
        });

        *ticker = Some(Ticker { token, handle });
        info!(interval_secs = period.as_secs(), "Quality monitor started");
        Ok(())
    }

    /// Stop the periodic evaluation and wait for the loop to exit
    pub async fn stop(&self) {
        let ticker = self.ticker.lock().take();
        if let Some(Ticker { token, handle }) = ticker {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Quality evaluation loop ended abnormally");
            }
            info!("Quality monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker.lock().is_some()
    }

    /// Add a message and, optionally, its processing result to the buffer
    ///
    /// Quality rules are checked immediately; metrics wait for the next tick.
    pub fn record(&self, message: StreamMessage, result: Option<&ProcessingResult>) {
        let mut raised = Vec::new();
        {
            let mut state = self.state.lock();

            for compiled in &state.rules {
                if let Some(message_text) = check_rule(compiled, &message) {
                    raised.push(new_alert(
                        compiled.rule.severity,
                        compiled.rule.check.dimension().as_str(),
                        format!("Rule {} violated: {}", compiled.rule.name, message_text),
                        None,
                        None,
                        AlertOrigin::Rule {
                            rule_id: compiled.rule.id.clone(),
                        },
                    ));
                }
            }
            for alert in &raised {
                push_alert(&mut state.alerts, alert.clone(), self.config.alert_limit);
            }

            if state.buffer.len() >= self.config.buffer_capacity.max(1) {
                state.buffer.pop_front();
            }
            state.buffer.push_back(Observation {
                message,
                success: result.map(|r| r.success),
                failed_validation: result
                    .map(|r| !r.metadata.validation_errors.is_empty())
                    .unwrap_or(false),
            });
        }

        for alert in raised {
            self.announce(&alert);
        }
    }

    /// Recompute all metrics from the buffer and raise or resolve threshold alerts
    pub fn evaluate_now(&self) -> Vec<QualityMetric> {
        let now = Utc::now();
        let mut raised = Vec::new();
        let mut resolved = Vec::new();

        let (snapshot, overall) = {
            let mut state = self.state.lock();
            let values = compute_metrics(&state.buffer, self.config.timeliness_threshold_secs, now);
            let first = !state.evaluated;
            state.evaluated = true;

            for (dimension, value) in values {
                let Some(metric) = state.metrics.get_mut(&dimension) else {
                    continue;
                };
                metric.trend = if first {
                    Trend::Stable
                } else {
                    trend_between(metric.value, value)
                };
                metric.value = value;
                metric.last_updated = now;
                let metric = metric.clone();

                let breach = if value < metric.critical_threshold {
                    Some((AlertSeverity::Critical, metric.critical_threshold))
                } else if value < metric.warning_threshold {
                    Some((AlertSeverity::Warning, metric.warning_threshold))
                } else {
                    None
                };

                match breach {
                    Some((severity, threshold)) => {
                        let duplicate = state.alerts.iter().any(|a| {
                            a.origin == AlertOrigin::Threshold
                                && a.metric == dimension.as_str()
                                && a.severity == severity
                                && !a.is_resolved()
                        });
                        if !duplicate {
                            let alert = new_alert(
                                severity,
                                dimension.as_str(),
                                format!(
                                    "{} is {:.1}%, below the {} threshold of {:.1}%",
                                    dimension,
                                    value,
                                    severity.as_str(),
                                    threshold
                                ),
                                Some(value),
                                Some(threshold),
                                AlertOrigin::Threshold,
                            );
                            push_alert(&mut state.alerts, alert.clone(), self.config.alert_limit);
                            raised.push(alert);
                        }
                    }
                    None => {
                        for alert in state.alerts.iter_mut().filter(|a| {
                            a.origin == AlertOrigin::Threshold
                                && a.metric == dimension.as_str()
                                && !a.is_resolved()
                        }) {
                            alert.resolved_at = Some(now);
                            resolved.push(alert.id.clone());
                        }
                    }
                }
            }

            let snapshot: Vec<QualityMetric> = state.metrics.values().cloned().collect();
            let overall = overall_score(&snapshot);
            (snapshot, overall)
        };

        for metric in &snapshot {
            self.metrics.set_gauge(
                "quality_score",
                metric.value,
                &[("metric", metric.name.as_str())],
            );
        }
        for alert in &raised {
            self.announce(alert);
        }
        for alert_id in resolved {
            info!(alert_id = %alert_id, "Threshold alert resolved after recovery");
            self.events.publish(PipelineEvent::AlertResolved { alert_id });
        }

        debug!(overall_score = overall, "Quality metrics updated");
        self.events
            .publish(PipelineEvent::QualityMetricsUpdated {
                overall_score: overall,
            });
        snapshot
    }

    pub fn get_metrics(&self) -> Vec<QualityMetric> {
        self.state.lock().metrics.values().cloned().collect()
    }

    /// Alerts in creation order
    pub fn get_alerts(&self, include_resolved: bool) -> Vec<QualityAlert> {
        self.state
            .lock()
            .alerts
            .iter()
            .filter(|a| include_resolved || !a.is_resolved())
            .cloned()
            .collect()
    }

    pub fn acknowledge_alert(&self, alert_id: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            let alert = state
                .alerts
                .iter_mut()
                .find(|a| a.id == alert_id)
                .ok_or_else(|| PipelineError::not_found("alert", alert_id))?;
            alert.acknowledged = true;
        }
        self.events.publish(PipelineEvent::AlertAcknowledged {
            alert_id: alert_id.to_string(),
        });
        Ok(())
    }

    pub fn resolve_alert(&self, alert_id: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            let alert = state
                .alerts
                .iter_mut()
                .find(|a| a.id == alert_id)
                .ok_or_else(|| PipelineError::not_found("alert", alert_id))?;
            if alert.resolved_at.is_none() {
                alert.resolved_at = Some(Utc::now());
            }
        }
        self.events.publish(PipelineEvent::AlertResolved {
            alert_id: alert_id.to_string(),
        });
        Ok(())
    }

    /// Register a rule, replacing any rule with the same id
    pub fn add_quality_rule(&self, rule: QualityRule) -> Result<()> {
        let pattern = match &rule.check {
            QualityCheck::Validity { pattern, .. } => Some(Regex::new(pattern).map_err(|e| {
                PipelineError::configuration(format!("Invalid pattern in rule {}: {}", rule.id, e))
            })?),
            _ => None,
        };

        let mut state = self.state.lock();
        state.rules.retain(|r| r.rule.id != rule.id);
        info!(rule_id = %rule.id, "Quality rule added");
        state.rules.push(CompiledRule { rule, pattern });
        Ok(())
    }

    pub fn remove_quality_rule(&self, rule_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let before = state.rules.len();
        state.rules.retain(|r| r.rule.id != rule_id);
        if state.rules.len() == before {
            return Err(PipelineError::not_found("quality rule", rule_id));
        }
        Ok(())
    }

    pub fn list_quality_rules(&self) -> Vec<QualityRule> {
        self.state
            .lock()
            .rules
            .iter()
            .map(|r| r.rule.clone())
            .collect()
    }

    /// Overall score, trends and recommendations from the current state
    pub fn generate_report(&self) -> QualityReport {
        let state = self.state.lock();
        let metrics: Vec<QualityMetric> = state.metrics.values().cloned().collect();
        let trends = metrics.iter().map(|m| (m.name, m.trend)).collect();

        let unresolved: Vec<&QualityAlert> =
            state.alerts.iter().filter(|a| !a.is_resolved()).collect();
        let critical: Vec<&&QualityAlert> = unresolved
            .iter()
            .filter(|a| a.severity == AlertSeverity::Critical)
            .collect();

        let mut recommendations: Vec<String> = metrics
            .iter()
            .filter(|m| m.value < m.warning_threshold)
            .map(|m| m.name.recommendation().to_string())
            .collect();
        for alert in &critical {
            recommendations.push(format!(
                "Resolve critical {} alert: {}",
                alert.metric, alert.message
            ));
        }
        if recommendations.is_empty() {
            recommendations.push("All quality metrics are within their thresholds".to_string());
        }

        QualityReport {
            overall_score: overall_score(&metrics),
            trends,
            unresolved_alerts: unresolved.len(),
            critical_alerts: critical.len(),
            recommendations,
            sample_size: state.buffer.len(),
            metrics,
            generated_at: Utc::now(),
        }
    }

    fn announce(&self, alert: &QualityAlert) {
        warn!(
            alert_id = %alert.id,
            metric = %alert.metric,
            severity = alert.severity.as_str(),
            "{}",
            alert.message
        );
        self.metrics.increment_counter(
            "quality_alerts_total",
            &[("metric", alert.metric.as_str()), ("severity", alert.severity.as_str())],
        );
        self.events.publish(PipelineEvent::AlertCreated {
            alert_id: alert.id.clone(),
            metric: alert.metric.clone(),
            severity: alert.severity.as_str().to_string(),
        });
    }
}

fn new_alert(
    severity: AlertSeverity,
    metric: &str,
    message: String,
    value: Option<f64>,
    threshold: Option<f64>,
    origin: AlertOrigin,
) -> QualityAlert {
    QualityAlert {
        id: Uuid::new_v4().to_string(),
        severity,
        metric: metric.to_string(),
        message,
        value,
        threshold,
        origin,
        created_at: Utc::now(),
        acknowledged: false,
        resolved_at: None,
    }
}

/// Append, evicting the oldest resolved alert (or the oldest alert) when full
fn push_alert(alerts: &mut VecDeque<QualityAlert>, alert: QualityAlert, limit: usize) {
    if alerts.len() >= limit.max(1) {
        match alerts.iter().position(QualityAlert::is_resolved) {
            Some(index) => {
                alerts.remove(index);
            }
            None => {
                alerts.pop_front();
            }
        }
    }
    alerts.push_back(alert);
}

fn trend_between(previous: f64, current: f64) -> Trend {
    let delta = current - previous;
    if delta > TREND_DEAD_BAND {
        Trend::Up
    } else if delta < -TREND_DEAD_BAND {
        Trend::Down
    } else {
        Trend::Stable
    }
}

fn overall_score(metrics: &[QualityMetric]) -> f64 {
    if metrics.is_empty() {
        return 0.0;
    }
    metrics.iter().map(|m| m.value).sum::<f64>() / metrics.len() as f64
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn compute_metrics(
    buffer: &VecDeque<Observation>,
    timeliness_threshold_secs: i64,
    now: DateTime<Utc>,
) -> Vec<(QualityDimension, f64)> {
    let total = buffer.len();

    let mut fields_total = 0;
    let mut fields_filled = 0;
    let mut field_types: HashMap<&str, HashSet<&'static str>> = HashMap::new();
    let mut with_result = 0;
    let mut succeeded = 0;
    let mut timely = 0;
    let mut valid = 0;
    let mut keys = HashSet::new();

    for observation in buffer {
        let message = &observation.message;

        match message.record() {
            Some(record) => {
                for (field, value) in record {
                    fields_total += 1;
                    if !is_empty_value(Some(value)) {
                        fields_filled += 1;
                    }
                    if !value.is_null() {
                        field_types
                            .entry(field.as_str())
                            .or_default()
                            .insert(value_type_name(value));
                    }
                }
                if !observation.failed_validation {
                    valid += 1;
                }
            }
            None => fields_total += 1,
        }

        if let Some(success) = observation.success {
            with_result += 1;
            if success {
                succeeded += 1;
            }
        }

        if (now - message.timestamp).num_seconds() <= timeliness_threshold_secs {
            timely += 1;
        }

        let key = message
            .key
            .clone()
            .unwrap_or_else(|| message.value.to_string());
        keys.insert(key);
    }

    let consistent = field_types.values().filter(|types| types.len() == 1).count();

    vec![
        (QualityDimension::Completeness, ratio(fields_filled, fields_total)),
        (QualityDimension::Accuracy, ratio(succeeded, with_result)),
        (QualityDimension::Consistency, ratio(consistent, field_types.len())),
        (QualityDimension::Timeliness, ratio(timely, total)),
        (QualityDimension::Validity, ratio(valid, total)),
        (QualityDimension::Uniqueness, ratio(keys.len(), total)),
    ]
}

/// Violation description, if the message breaks the rule
fn check_rule(compiled: &CompiledRule, message: &StreamMessage) -> Option<String> {
    let record = message.record();
    let field_value = |field: &str| record.and_then(|r| r.get(field));

    match &compiled.rule.check {
        QualityCheck::Completeness { field } => {
            is_empty_value(field_value(field)).then(|| format!("{} is missing or empty", field))
        }
        QualityCheck::Validity { field, .. } => {
            let value = field_value(field).filter(|v| !v.is_null())?;
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let pattern = compiled.pattern.as_ref()?;
            (!pattern.is_match(&text)).then(|| format!("{} has invalid format", field))
        }
        QualityCheck::Accuracy { field, min, max } => {
            let value = field_value(field).filter(|v| !v.is_null())?;
            match value_as_f64(value) {
                None => Some(format!("{} is not numeric", field)),
                Some(n) if min.map_or(false, |min| n < min) || max.map_or(false, |max| n > max) => {
                    Some(format!("{} value {} is out of range", field, n))
                }
                Some(_) => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, events::drain, types::ProcessingMetadata};
    use serde_json::json;

    fn monitor_with(config: QualityConfig) -> (DataQualityMonitor, EventBus) {
        let events = EventBus::new();
        let metrics = Arc::new(MetricsCollector::new(&Config::default()).unwrap());
        (DataQualityMonitor::new(config, events.clone(), metrics), events)
    }

    fn monitor() -> (DataQualityMonitor, EventBus) {
        monitor_with(QualityConfig::default())
    }

    fn message(key: &str, value: Value) -> StreamMessage {
        StreamMessage::new(Some(key.to_string()), value)
    }

    fn result_for(message: &StreamMessage, success: bool) -> ProcessingResult {
        ProcessingResult {
            success,
            original_message: message.clone(),
            processed_message: None,
            error: (!success).then(|| "failed".to_string()),
            metadata: ProcessingMetadata::default(),
        }
    }

    fn metric(metrics: &[QualityMetric], dimension: QualityDimension) -> f64 {
        metrics
            .iter()
            .find(|m| m.name == dimension)
            .map(|m| m.value)
            .unwrap()
    }

    #[test]
    fn test_metrics_over_clean_buffer() {
        let (monitor, _) = monitor();
        for i in 0..10 {
            let msg = message(&format!("k{}", i), json!({"id": i, "name": "x"}));
            let result = result_for(&msg, true);
            monitor.record(msg, Some(&result));
        }

        let metrics = monitor.evaluate_now();
        for dimension in QualityDimension::ALL {
            assert_eq!(metric(&metrics, dimension), 100.0, "{}", dimension);
        }
        assert!(monitor.get_alerts(false).is_empty());
    }

    #[test]
    fn test_metric_formulas() {
        let (monitor, _) = monitor();
        let old = Utc::now() - chrono::Duration::seconds(3600);

        let a = message("a", json!({"id": 1, "name": ""}));
        let b = message("a", json!({"id": "2", "name": "bob"})).with_timestamp(old);
        let c = message("c", json!("not an object"));
        let d = message("d", json!({"id": 4, "name": "dan"}));

        monitor.record(a.clone(), Some(&result_for(&a, true)));
        monitor.record(b.clone(), Some(&result_for(&b, false)));
        monitor.record(c, None);
        monitor.record(d.clone(), Some(&result_for(&d, true)));

        let metrics = monitor.evaluate_now();
        // 5 of 7 counted fields are filled (a.name is empty, c counts as one empty field)
        assert!((metric(&metrics, QualityDimension::Completeness) - 5.0 / 7.0 * 100.0).abs() < 1e-9);
        assert!((metric(&metrics, QualityDimension::Accuracy) - 2.0 / 3.0 * 100.0).abs() < 1e-9);
        // id is both number and string, name is always a string
        assert_eq!(metric(&metrics, QualityDimension::Consistency), 50.0);
        assert_eq!(metric(&metrics, QualityDimension::Timeliness), 75.0);
        assert_eq!(metric(&metrics, QualityDimension::Validity), 75.0);
        assert_eq!(metric(&metrics, QualityDimension::Uniqueness), 75.0);
    }

    #[test]
    fn test_buffer_evicts_oldest() {
        let config = QualityConfig {
            buffer_capacity: 3,
            ..QualityConfig::default()
        };
        let (monitor, _) = monitor_with(config);
        monitor.record(message("dup", json!({"a": 1})), None);
        monitor.record(message("dup", json!({"a": 1})), None);
        for key in ["x", "y", "z"] {
            monitor.record(message(key, json!({"a": 1})), None);
        }

        let report = monitor.generate_report();
        assert_eq!(report.sample_size, 3);
        let metrics = monitor.evaluate_now();
        assert_eq!(metric(&metrics, QualityDimension::Uniqueness), 100.0);
    }

    #[test]
    fn test_threshold_alerts_dedup_and_auto_resolve() {
        let (monitor, events) = monitor();
        let mut rx = events.subscribe();

        let bad = message("k", json!({"a": 1}));
        monitor.record(bad.clone(), Some(&result_for(&bad, false)));
        monitor.evaluate_now();
        monitor.evaluate_now();

        let alerts = monitor.get_alerts(false);
        let accuracy: Vec<&QualityAlert> =
            alerts.iter().filter(|a| a.metric == "accuracy").collect();
        assert_eq!(accuracy.len(), 1);
        assert_eq!(accuracy[0].severity, AlertSeverity::Critical);
        assert_eq!(accuracy[0].origin, AlertOrigin::Threshold);

        let report = monitor.generate_report();
        assert!(report.critical_alerts >= 1);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.starts_with("Accuracy is below target")));

        let config = QualityConfig {
            buffer_capacity: 1,
            ..QualityConfig::default()
        };
        let (recovering, _) = monitor_with(config);
        recovering.record(bad.clone(), Some(&result_for(&bad, false)));
        recovering.evaluate_now();
        assert_eq!(recovering.get_alerts(false).len(), 1);
        let good = message("k2", json!({"a": 2}));
        recovering.record(good.clone(), Some(&result_for(&good, true)));
        recovering.evaluate_now();
        assert!(recovering.get_alerts(false).is_empty());
        assert_eq!(recovering.get_alerts(true).len(), 1);

        let names: Vec<&str> = drain(&mut rx).iter().map(|e| e.name()).collect();
        assert!(names.contains(&"alert_created"));
        assert!(names.contains(&"quality_metrics_updated"));
    }

    #[test]
    fn test_trend_dead_band() {
        assert_eq!(trend_between(90.0, 90.5), Trend::Stable);
        assert_eq!(trend_between(90.0, 92.0), Trend::Up);
        assert_eq!(trend_between(90.0, 85.0), Trend::Down);

        let (monitor, _) = monitor();
        let ok = message("a", json!({"a": 1}));
        monitor.record(ok.clone(), Some(&result_for(&ok, true)));
        monitor.evaluate_now();
        let bad = message("b", json!({"a": 1}));
        monitor.record(bad.clone(), Some(&result_for(&bad, false)));
        let metrics = monitor.evaluate_now();
        let accuracy = metrics
            .iter()
            .find(|m| m.name == QualityDimension::Accuracy)
            .unwrap();
        assert_eq!(accuracy.trend, Trend::Down);
    }

    #[test]
    fn test_quality_rules_raise_alerts_immediately() {
        let (monitor, _) = monitor();
        monitor
            .add_quality_rule(QualityRule {
                id: "email-format".to_string(),
                name: "Email format".to_string(),
                check: QualityCheck::Validity {
                    field: "email".to_string(),
                    pattern: r"^[^@\s]+@[^@\s]+\.[a-z]+$".to_string(),
                },
                severity: AlertSeverity::Warning,
            })
            .unwrap();
        monitor
            .add_quality_rule(QualityRule {
                id: "age-range".to_string(),
                name: "Age range".to_string(),
                check: QualityCheck::Accuracy {
                    field: "age".to_string(),
                    min: Some(0.0),
                    max: Some(130.0),
                },
                severity: AlertSeverity::Critical,
            })
            .unwrap();

        monitor.record(message("1", json!({"email": "a@b.io", "age": 30})), None);
        assert!(monitor.get_alerts(false).is_empty());

        monitor.record(message("2", json!({"email": "nope", "age": 200})), None);
        let alerts = monitor.get_alerts(false);
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().any(|a| a.origin
            == AlertOrigin::Rule {
                rule_id: "age-range".to_string()
            }
            && a.severity == AlertSeverity::Critical));

        monitor.remove_quality_rule("age-range").unwrap();
        assert!(monitor.remove_quality_rule("age-range").is_err());
        assert_eq!(monitor.list_quality_rules().len(), 1);
    }

    #[test]
    fn test_invalid_rule_pattern_rejected() {
        let (monitor, _) = monitor();
        let rule: QualityRule = serde_json::from_value(json!({
            "id": "r", "name": "broken", "type": "validity", "field": "x", "pattern": "(["
        }))
        .unwrap();
        assert!(monitor.add_quality_rule(rule).is_err());
    }

    #[test]
    fn test_acknowledge_and_resolve() {
        let (monitor, _) = monitor();
        monitor
            .add_quality_rule(QualityRule {
                id: "name".to_string(),
                name: "Name present".to_string(),
                check: QualityCheck::Completeness {
                    field: "name".to_string(),
                },
                severity: AlertSeverity::Info,
            })
            .unwrap();
        monitor.record(message("1", json!({"name": " "})), None);

        let alert = monitor.get_alerts(false).remove(0);
        monitor.acknowledge_alert(&alert.id).unwrap();
        assert!(monitor.get_alerts(false)[0].acknowledged);

        monitor.resolve_alert(&alert.id).unwrap();
        assert!(monitor.get_alerts(false).is_empty());
        assert!(monitor.acknowledge_alert("missing").is_err());
    }

    #[test]
    fn test_alert_limit_drops_resolved_first() {
        let mut alerts = VecDeque::new();
        let mut first = new_alert(AlertSeverity::Info, "m", "a".into(), None, None, AlertOrigin::Threshold);
        first.resolved_at = None;
        let mut second = new_alert(AlertSeverity::Info, "m", "b".into(), None, None, AlertOrigin::Threshold);
        second.resolved_at = Some(Utc::now());
        alerts.push_back(first);
        alerts.push_back(second);

        push_alert(
            &mut alerts,
            new_alert(AlertSeverity::Info, "m", "c".into(), None, None, AlertOrigin::Threshold),
            2,
        );
        let messages: Vec<&str> = alerts.iter().map(|a| a.message.as_str()).collect();
        assert_eq!(messages, ["a", "c"]);
    }

    #[test]
    fn test_report_overall_score() {
        let (monitor, _) = monitor();
        let report = monitor.generate_report();
        assert_eq!(report.overall_score, 100.0);
        assert_eq!(report.trends.len(), 6);
        assert_eq!(
            report.recommendations,
            vec!["All quality metrics are within their thresholds".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_tick() {
        let config = QualityConfig {
            evaluation_interval_secs: 10,
            ..QualityConfig::default()
        };
        let (monitor, events) = monitor_with(config);
        let mut rx = events.subscribe();

        monitor.start().unwrap();
        assert!(monitor.start().is_err());

        tokio::time::sleep(Duration::from_secs(25)).await;
        let updates = drain(&mut rx)
            .into_iter()
            .filter(|e| e.name() == "quality_metrics_updated")
            .count();
        assert_eq!(updates, 2);

        monitor.stop().await;
        assert!(!monitor.is_running());
    }
}
