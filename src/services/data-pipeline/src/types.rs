//! Type definitions shared across the pipeline components
//!
//! Records are loosely structured JSON objects. Stream messages wrap a JSON
//! payload with broker coordinates, and processing results describe what
//! happened to one message on its way through a stream processor.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single extracted or transformed row
pub type Record = serde_json::Map<String, Value>;

/// A message flowing through the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamMessage {
    /// Optional partitioning key
    pub key: Option<String>,
    /// Structured payload
    pub value: Value,
    /// String headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Producer or broker timestamp
    pub timestamp: DateTime<Utc>,
    /// Partition when sourced from a broker
    pub partition: Option<i32>,
    /// Offset when sourced from a broker
    pub offset: Option<i64>,
}

impl StreamMessage {
    /// Create a message with the current timestamp and no broker coordinates
    pub fn new(key: Option<String>, value: Value) -> Self {
        Self {
            key,
            value,
            headers: HashMap::new(),
            timestamp: Utc::now(),
            partition: None,
            offset: None,
        }
    }

    /// Attach a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Override the timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Payload as a record, if it is a JSON object
    pub fn record(&self) -> Option<&Record> {
        self.value.as_object()
    }
}

/// Outcome of processing one stream message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub success: bool,
    pub original_message: StreamMessage,
    pub processed_message: Option<StreamMessage>,
    pub error: Option<String>,
    pub metadata: ProcessingMetadata,
}

/// Metadata attached to a processing result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    /// Processing time in milliseconds
    pub processing_time_ms: f64,
    /// Rule kinds applied, in order
    pub rules_applied: Vec<String>,
    /// Validation errors, when the gate rejected the message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,
    /// Set when a filter rule stopped the message
    #[serde(default)]
    pub filtered: bool,
    /// Set when the validation gate asks the caller to retry the message
    #[serde(default)]
    pub retry_requested: bool,
    /// Set when the message was forwarded to the dead-letter topic
    #[serde(default)]
    pub dead_lettered: bool,
    /// Set when the processed payload was published to the output topic
    #[serde(default)]
    pub published: bool,
}

/// Numeric view of a JSON value, accepting numeric strings
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

/// Null, missing or empty-string check used by completeness metrics
pub fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        _ => false,
    }
}

/// Runtime type name of a JSON value
pub fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Convert an f64 into a JSON number, falling back to null for NaN/inf
pub fn number_value(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Comparison used by filter conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    #[serde(alias = "eq")]
    Equals,
    #[serde(alias = "ne")]
    NotEquals,
    #[serde(alias = "gt")]
    GreaterThan,
    #[serde(alias = "gte")]
    GreaterThanOrEqual,
    #[serde(alias = "lt")]
    LessThan,
    #[serde(alias = "lte")]
    LessThanOrEqual,
    Contains,
    In,
    Exists,
}

/// Per-field predicate used by ETL and stream filters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ComparisonOp,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: ComparisonOp, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Evaluate against a record. A missing or null field only satisfies `not_equals`.
    pub fn matches(&self, record: &Record) -> bool {
        let actual = match record.get(&self.field) {
            None | Some(Value::Null) => {
                return matches!(self.operator, ComparisonOp::NotEquals)
                    && !self.value.is_null();
            }
            Some(value) => value,
        };

        match self.operator {
            ComparisonOp::Exists => true,
            ComparisonOp::Equals => loosely_equal(actual, &self.value),
            ComparisonOp::NotEquals => !loosely_equal(actual, &self.value),
            ComparisonOp::GreaterThan => compare(actual, &self.value).map_or(false, |o| o.is_gt()),
            ComparisonOp::GreaterThanOrEqual => {
                compare(actual, &self.value).map_or(false, |o| o.is_ge())
            }
            ComparisonOp::LessThan => compare(actual, &self.value).map_or(false, |o| o.is_lt()),
            ComparisonOp::LessThanOrEqual => {
                compare(actual, &self.value).map_or(false, |o| o.is_le())
            }
            ComparisonOp::Contains => match (actual, &self.value) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
                (Value::Array(items), needle) => items.iter().any(|i| loosely_equal(i, needle)),
                _ => false,
            },
            ComparisonOp::In => match &self.value {
                Value::Array(options) => options.iter().any(|o| loosely_equal(actual, o)),
                _ => false,
            },
        }
    }
}

/// All conditions hold
pub fn matches_all(conditions: &[Condition], record: &Record) -> bool {
    conditions.iter().all(|c| c.matches(record))
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (value_as_f64(left), value_as_f64(right)) {
        (Some(a), Some(b)) if !left.is_string() || !right.is_string() => a == b,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (value_as_f64(left), value_as_f64(right)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (left, right) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_as_f64() {
        assert_eq!(value_as_f64(&json!(12)), Some(12.0));
        assert_eq!(value_as_f64(&json!(" 3.5 ")), Some(3.5));
        assert_eq!(value_as_f64(&json!("abc")), None);
        assert_eq!(value_as_f64(&json!(true)), None);
    }

    #[test]
    fn test_is_empty_value() {
        assert!(is_empty_value(None));
        assert!(is_empty_value(Some(&json!(null))));
        assert!(is_empty_value(Some(&json!("   "))));
        assert!(!is_empty_value(Some(&json!(0))));
    }

    #[test]
    fn test_message_builder() {
        let message = StreamMessage::new(Some("k1".to_string()), json!({"a": 1}))
            .with_header("source", "test");
        assert_eq!(message.headers.get("source").map(String::as_str), Some("test"));
        assert!(message.record().is_some());
    }

    #[test]
    fn test_conditions() {
        let record = json!({"amount": "150", "status": "paid", "tags": ["vip"]})
            .as_object()
            .cloned()
            .unwrap();
        assert!(Condition::new("amount", ComparisonOp::GreaterThan, json!(100)).matches(&record));
        assert!(Condition::new("amount", ComparisonOp::Equals, json!(150)).matches(&record));
        assert!(!Condition::new("amount", ComparisonOp::LessThan, json!(100)).matches(&record));
        assert!(Condition::new("status", ComparisonOp::In, json!(["paid", "open"])).matches(&record));
        assert!(Condition::new("tags", ComparisonOp::Contains, json!("vip")).matches(&record));
        assert!(!Condition::new("missing", ComparisonOp::Exists, json!(null)).matches(&record));
        assert!(Condition::new("missing", ComparisonOp::NotEquals, json!(1)).matches(&record));
    }

    #[test]
    fn test_condition_operator_aliases() {
        let condition: Condition =
            serde_json::from_value(json!({"field": "x", "operator": "gte", "value": 3})).unwrap();
        assert_eq!(condition.operator, ComparisonOp::GreaterThanOrEqual);
    }
}
