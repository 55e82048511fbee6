//! Validation and cleansing engine
//!
//! Rule evaluation over single records, dataset quality reports, keyword-driven
//! cleansing, and statistical anomaly detection. Everything here is a pure
//! function of its inputs; the engine only carries cleansing keyword sets.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{PipelineError, Result},
    types::{number_value, value_as_f64, value_type_name, Record},
};

/// Signature of a caller-supplied rule: field value plus the whole record
pub type CustomCheck =
    Arc<dyn Fn(Option<&Value>, &Record) -> std::result::Result<(), String> + Send + Sync>;

/// Injected validation strategy
#[derive(Clone)]
pub struct CustomRule {
    pub name: String,
    pub check: CustomCheck,
}

impl CustomRule {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(Option<&Value>, &Record) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }
}

impl fmt::Debug for CustomRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomRule").field("name", &self.name).finish()
    }
}

/// Declarative validation rule bound to one field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRule {
    pub field: String,
    #[serde(flatten)]
    pub kind: RuleKind,
    /// Replaces the generated message on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ValidationRule {
    pub fn new(field: impl Into<String>, kind: RuleKind) -> Self {
        Self {
            field: field.into(),
            kind,
            message: None,
        }
    }

    pub fn required(field: impl Into<String>) -> Self {
        Self::new(field, RuleKind::Required)
    }

    pub fn of_type(field: impl Into<String>, expected: ValueKind) -> Self {
        Self::new(field, RuleKind::Type { expected })
    }

    pub fn range(field: impl Into<String>, min: Option<f64>, max: Option<f64>) -> Self {
        Self::new(field, RuleKind::Range { min, max })
    }

    pub fn pattern(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(
            field,
            RuleKind::Pattern {
                pattern: pattern.into(),
            },
        )
    }

    pub fn one_of(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field, RuleKind::Enum { values })
    }

    pub fn length(field: impl Into<String>, min: Option<usize>, max: Option<usize>) -> Self {
        Self::new(field, RuleKind::Length { min, max })
    }

    pub fn custom(field: impl Into<String>, rule: CustomRule) -> Self {
        Self::new(field, RuleKind::Custom(rule))
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Rule kinds with their configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RuleKind {
    /// Present and not null; an empty string satisfies it
    Required,
    Type {
        expected: ValueKind,
    },
    /// Inclusive numeric bounds
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Pattern {
        pattern: String,
    },
    Enum {
        values: Vec<Value>,
    },
    /// Character count for strings, element count for arrays
    Length {
        #[serde(default)]
        min: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
    },
    #[serde(skip)]
    Custom(CustomRule),
}

impl RuleKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::Type { .. } => "type",
            Self::Range { .. } => "range",
            Self::Pattern { .. } => "pattern",
            Self::Enum { .. } => "enum",
            Self::Length { .. } => "length",
            Self::Custom(_) => "custom",
        }
    }
}

/// Expected value types for `type` rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Email,
    Url,
    Date,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Email => "email",
            Self::Url => "url",
            Self::Date => "date",
        };
        f.write_str(name)
    }
}

/// One rule violation or coercion note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub rule: String,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Per-record validation outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    /// Record with coercions applied; present only when `errors` is empty
    pub cleaned_data: Option<Record>,
}

impl ValidationResult {
    /// Error messages rendered as `field: message`
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}

/// Per-field statistics for a dataset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldStatistics {
    pub null_count: usize,
    pub null_rate: f64,
    pub unique_count: usize,
    pub duplicate_count: usize,
    pub valid_count: usize,
    pub invalid_count: usize,
}

/// Error message frequency across a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrequency {
    pub error: String,
    pub count: usize,
    pub percentage: f64,
}

/// Dataset-level quality summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataQualityReport {
    pub total_records: usize,
    pub valid_records: usize,
    pub invalid_records: usize,
    /// valid / total * 100
    pub validation_rate: f64,
    pub field_statistics: BTreeMap<String, FieldStatistics>,
    /// Top ten by count
    pub common_errors: Vec<ErrorFrequency>,
    pub generated_at: DateTime<Utc>,
}

/// Named cleansing transforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleansingRule {
    Email,
    Phone,
    Currency,
    Date,
}

impl FromStr for CleansingRule {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(Self::Email),
            "phone" => Ok(Self::Phone),
            "currency" => Ok(Self::Currency),
            "date" => Ok(Self::Date),
            other => Err(PipelineError::configuration(format!(
                "Unknown cleansing rule: {}",
                other
            ))),
        }
    }
}

/// Field-name keywords selecting which fields each cleansing rule touches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleansingConfig {
    pub email_keywords: Vec<String>,
    pub phone_keywords: Vec<String>,
    pub currency_keywords: Vec<String>,
    pub date_keywords: Vec<String>,
}

impl Default for CleansingConfig {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|s| s.to_string()).collect();
        Self {
            email_keywords: words(&["email", "mail"]),
            phone_keywords: words(&["phone", "mobile", "tel", "fax"]),
            currency_keywords: words(&["price", "amount", "cost", "total", "salary", "revenue"]),
            date_keywords: words(&["date", "_at", "time", "birthday", "created", "updated"]),
        }
    }
}

impl CleansingConfig {
    fn keywords(&self, rule: CleansingRule) -> &[String] {
        match rule {
            CleansingRule::Email => &self.email_keywords,
            CleansingRule::Phone => &self.phone_keywords,
            CleansingRule::Currency => &self.currency_keywords,
            CleansingRule::Date => &self.date_keywords,
        }
    }
}

/// One flagged value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    /// Position of the record in the input
    pub index: usize,
    pub value: f64,
    pub z_score: f64,
}

/// Summary statistics over the numeric values of a field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSummary {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    /// Population standard deviation
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub q1: f64,
    pub q3: f64,
    pub iqr: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub field: String,
    /// None when the field has no numeric values
    pub statistics: Option<FieldSummary>,
    /// Outside `[Q1 - 1.5 IQR, Q3 + 1.5 IQR]`
    pub iqr_outliers: Vec<Anomaly>,
    /// `|z| > 3`
    pub z_score_anomalies: Vec<Anomaly>,
}

/// Validation and cleansing engine
#[derive(Debug, Clone, Default)]
pub struct ValidationEngine {
    cleansing: CleansingConfig,
}

impl ValidationEngine {
    pub fn new(cleansing: CleansingConfig) -> Self {
        Self { cleansing }
    }

    /// Evaluate every rule against its field, in declaration order
    pub fn validate_record(&self, record: &Record, rules: &[ValidationRule]) -> ValidationResult {
        let compiled = CompiledRules::new(rules);
        compiled.validate(record)
    }

    /// Validate every record and derive the dataset quality report
    pub fn validate_dataset(
        &self,
        records: &[Record],
        rules: &[ValidationRule],
    ) -> (Vec<ValidationResult>, DataQualityReport) {
        let compiled = CompiledRules::new(rules);
        let total = records.len();

        let mut fields: Vec<String> = Vec::new();
        let mut seen_fields: HashSet<String> = HashSet::new();
        for field in rules
            .iter()
            .map(|r| r.field.clone())
            .chain(records.iter().flat_map(|r| r.keys().cloned()))
        {
            if seen_fields.insert(field.clone()) {
                fields.push(field);
            }
        }

        let mut stats: BTreeMap<String, FieldStatistics> = fields
            .iter()
            .map(|f| (f.clone(), FieldStatistics::default()))
            .collect();
        let mut distinct: HashMap<String, HashSet<String>> = HashMap::new();
        let mut non_null: HashMap<String, usize> = HashMap::new();
        let mut error_counts: HashMap<String, usize> = HashMap::new();
        let mut results = Vec::with_capacity(total);
        let mut valid_records = 0;

        for record in records {
            let result = compiled.validate(record);
            if result.is_valid {
                valid_records += 1;
            }

            let failed_fields: HashSet<&str> =
                result.errors.iter().map(|e| e.field.as_str()).collect();
            for error in &result.errors {
                *error_counts.entry(error.to_string()).or_insert(0) += 1;
            }

            for field in &fields {
                let Some(entry) = stats.get_mut(field) else {
                    continue;
                };
                match record.get(field) {
                    None | Some(Value::Null) => entry.null_count += 1,
                    Some(value) => {
                        *non_null.entry(field.clone()).or_insert(0) += 1;
                        distinct
                            .entry(field.clone())
                            .or_default()
                            .insert(value.to_string());
                    }
                }
                if failed_fields.contains(field.as_str()) {
                    entry.invalid_count += 1;
                } else {
                    entry.valid_count += 1;
                }
            }

            results.push(result);
        }

        for (field, entry) in stats.iter_mut() {
            entry.null_rate = percentage(entry.null_count, total);
            entry.unique_count = distinct.get(field).map(HashSet::len).unwrap_or(0);
            entry.duplicate_count = non_null.get(field).copied().unwrap_or(0) - entry.unique_count;
        }

        let mut common_errors: Vec<ErrorFrequency> = error_counts
            .into_iter()
            .map(|(error, count)| ErrorFrequency {
                error,
                count,
                percentage: percentage(count, total),
            })
            .collect();
        common_errors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.error.cmp(&b.error)));
        common_errors.truncate(10);

        let report = DataQualityReport {
            total_records: total,
            valid_records,
            invalid_records: total - valid_records,
            validation_rate: percentage(valid_records, total),
            field_statistics: stats,
            common_errors,
            generated_at: Utc::now(),
        };

        (results, report)
    }

    /// Normalize whitespace everywhere, then apply the named transforms to
    /// fields whose name matches the rule's keyword set
    pub fn cleanse_data(&self, records: &[Record], rules: &[CleansingRule]) -> Vec<Record> {
        records
            .iter()
            .map(|record| {
                let mut cleaned = Record::new();
                for (field, value) in record {
                    let mut value = match value {
                        Value::String(s) => Value::String(collapse_whitespace(s)),
                        other => other.clone(),
                    };

                    let lowered = field.to_lowercase();
                    for rule in rules {
                        let matches = self
                            .cleansing
                            .keywords(*rule)
                            .iter()
                            .any(|k| lowered.contains(&k.to_lowercase()));
                        if matches {
                            value = apply_cleansing(*rule, value);
                        }
                    }

                    cleaned.insert(field.clone(), value);
                }
                cleaned
            })
            .collect()
    }

    /// Summary statistics plus IQR and z-score outliers for one numeric field
    pub fn detect_anomalies(&self, records: &[Record], field: &str) -> AnomalyReport {
        let values: Vec<(usize, f64)> = records
            .iter()
            .enumerate()
            .filter_map(|(index, record)| {
                record
                    .get(field)
                    .and_then(value_as_f64)
                    .map(|value| (index, value))
            })
            .collect();

        let Some(statistics) = summarize(values.iter().map(|(_, v)| *v).collect()) else {
            return AnomalyReport {
                field: field.to_string(),
                statistics: None,
                iqr_outliers: Vec::new(),
                z_score_anomalies: Vec::new(),
            };
        };

        let lower = statistics.q1 - 1.5 * statistics.iqr;
        let upper = statistics.q3 + 1.5 * statistics.iqr;
        let z_of = |value: f64| {
            if statistics.std_dev > 0.0 {
                (value - statistics.mean) / statistics.std_dev
            } else {
                0.0
            }
        };

        let mut iqr_outliers = Vec::new();
        let mut z_score_anomalies = Vec::new();
        for (index, value) in values {
            let anomaly = Anomaly {
                index,
                value,
                z_score: z_of(value),
            };
            if value < lower || value > upper {
                iqr_outliers.push(anomaly.clone());
            }
            if anomaly.z_score.abs() > 3.0 {
                z_score_anomalies.push(anomaly);
            }
        }

        AnomalyReport {
            field: field.to_string(),
            statistics: Some(statistics),
            iqr_outliers,
            z_score_anomalies,
        }
    }
}

fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn summarize(mut values: Vec<f64>) -> Option<FieldSummary> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    let mean = values.iter().sum::<f64>() / n as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    let median = if n % 2 == 0 {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    } else {
        values[n / 2]
    };
    let q1 = values[n / 4];
    let q3 = values[(n * 3) / 4];

    Some(FieldSummary {
        count: n,
        mean,
        median,
        std_dev: variance.sqrt(),
        min: values[0],
        max: values[n - 1],
        q1,
        q3,
        iqr: q3 - q1,
    })
}

/// Rules with their patterns compiled once
struct CompiledRules<'a> {
    rules: Vec<(&'a ValidationRule, Option<std::result::Result<Regex, String>>)>,
}

impl<'a> CompiledRules<'a> {
    fn new(rules: &'a [ValidationRule]) -> Self {
        Self {
            rules: rules
                .iter()
                .map(|rule| {
                    let compiled = match &rule.kind {
                        RuleKind::Pattern { pattern } => {
                            Some(Regex::new(pattern).map_err(|e| e.to_string()))
                        }
                        _ => None,
                    };
                    (rule, compiled)
                })
                .collect(),
        }
    }

    fn validate(&self, record: &Record) -> ValidationResult {
        let mut working = record.clone();
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for (rule, regex) in &self.rules {
            let value = working.get(&rule.field).cloned();
            let present = !matches!(value, None | Some(Value::Null));

            let outcome = match &rule.kind {
                RuleKind::Required => {
                    if present {
                        Ok(None)
                    } else {
                        Err(format!("{} is required", rule.field))
                    }
                }
                RuleKind::Custom(custom) => (custom.check)(value.as_ref(), &working)
                    .map(|_| None)
                    .map_err(|message| {
                        if message.is_empty() {
                            format!("{} failed {}", rule.field, custom.name)
                        } else {
                            message
                        }
                    }),
                // Optional fields: only Required and Custom look at absent values
                _ if !present => Ok(None),
                RuleKind::Type { expected } => match value.as_ref() {
                    Some(v) => check_type(&rule.field, v, *expected),
                    None => Ok(None),
                },
                RuleKind::Range { min, max } => match value.as_ref().and_then(value_as_f64) {
                    Some(n) => check_range(&rule.field, n, *min, *max).map(|_| None),
                    None => Err(format!("{} must be a number", rule.field)),
                },
                RuleKind::Pattern { pattern } => {
                    let text = match value.as_ref() {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => String::new(),
                    };
                    match regex {
                        Some(Ok(re)) if re.is_match(&text) => Ok(None),
                        Some(Ok(_)) => {
                            Err(format!("{} does not match pattern {}", rule.field, pattern))
                        }
                        Some(Err(e)) => Err(format!("{} has an invalid pattern: {}", rule.field, e)),
                        None => Ok(None),
                    }
                }
                RuleKind::Enum { values } => match value.as_ref() {
                    Some(v) if values.contains(v) => Ok(None),
                    _ => Err(format!(
                        "{} must be one of {}",
                        rule.field,
                        values
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", ")
                    )),
                },
                RuleKind::Length { min, max } => {
                    let length = match value.as_ref() {
                        Some(Value::String(s)) => Some(s.chars().count()),
                        Some(Value::Array(a)) => Some(a.len()),
                        _ => None,
                    };
                    match length {
                        Some(len) => check_length(&rule.field, len, *min, *max).map(|_| None),
                        None => Err(format!("{} has no length", rule.field)),
                    }
                }
            };

            match outcome {
                Ok(None) => {}
                Ok(Some((coerced, note))) => {
                    working.insert(rule.field.clone(), coerced);
                    warnings.push(ValidationIssue {
                        field: rule.field.clone(),
                        rule: rule.kind.name().to_string(),
                        message: note,
                    });
                }
                Err(message) => errors.push(ValidationIssue {
                    field: rule.field.clone(),
                    rule: rule.kind.name().to_string(),
                    message: rule.message.clone().unwrap_or(message),
                }),
            }
        }

        let is_valid = errors.is_empty();
        ValidationResult {
            is_valid,
            errors,
            warnings,
            cleaned_data: is_valid.then_some(working),
        }
    }
}

type RuleOutcome = std::result::Result<Option<(Value, String)>, String>;

fn check_type(field: &str, value: &Value, expected: ValueKind) -> RuleOutcome {
    let mismatch = || {
        Err(format!(
            "{} must be of type {}, got {}",
            field,
            expected,
            value_type_name(value)
        ))
    };
    let coerced = |to: Value| {
        let note = format!(
            "{} coerced from {} to {}",
            field,
            value_type_name(value),
            expected
        );
        Ok(Some((to, note)))
    };

    match expected {
        ValueKind::String => match value {
            Value::String(_) => Ok(None),
            Value::Number(n) => coerced(Value::String(n.to_string())),
            Value::Bool(b) => coerced(Value::String(b.to_string())),
            _ => mismatch(),
        },
        ValueKind::Number => match value {
            Value::Number(_) => Ok(None),
            Value::String(_) => match value_as_f64(value) {
                Some(n) => coerced(number_value(n)),
                None => mismatch(),
            },
            _ => mismatch(),
        },
        ValueKind::Integer => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(None),
            Value::Number(n) => match n.as_f64() {
                // Whole floats outside the i64 range would saturate
                Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                    coerced(Value::from(f as i64))
                }
                _ => mismatch(),
            },
            Value::String(s) => match s.trim().parse::<i64>() {
                Ok(i) => coerced(Value::from(i)),
                Err(_) => mismatch(),
            },
            _ => mismatch(),
        },
        ValueKind::Boolean => match value {
            Value::Bool(_) => Ok(None),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => coerced(Value::Bool(true)),
                "false" | "0" | "no" => coerced(Value::Bool(false)),
                _ => mismatch(),
            },
            Value::Number(n) => match n.as_f64() {
                Some(f) if f == 0.0 => coerced(Value::Bool(false)),
                Some(f) if f == 1.0 => coerced(Value::Bool(true)),
                _ => mismatch(),
            },
            _ => mismatch(),
        },
        ValueKind::Array => match value {
            Value::Array(_) => Ok(None),
            _ => mismatch(),
        },
        ValueKind::Object => match value {
            Value::Object(_) => Ok(None),
            _ => mismatch(),
        },
        ValueKind::Email => match value {
            Value::String(s) if is_email(s) => Ok(None),
            Value::String(_) => Err(format!("{} must be a valid email address", field)),
            _ => mismatch(),
        },
        ValueKind::Url => match value {
            Value::String(s) if is_url(s) => Ok(None),
            Value::String(_) => Err(format!("{} must be a valid URL", field)),
            _ => mismatch(),
        },
        ValueKind::Date => match value {
            Value::String(s) if parse_date(s).is_some() => Ok(None),
            Value::String(_) => Err(format!("{} must be a valid date", field)),
            _ => mismatch(),
        },
    }
}

fn check_range(
    field: &str,
    value: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> std::result::Result<(), String> {
    if let Some(min) = min {
        if value < min {
            return Err(format!("{} must be at least {}", field, min));
        }
    }
    if let Some(max) = max {
        if value > max {
            return Err(format!("{} must be at most {}", field, max));
        }
    }
    Ok(())
}

fn check_length(
    field: &str,
    length: usize,
    min: Option<usize>,
    max: Option<usize>,
) -> std::result::Result<(), String> {
    if let Some(min) = min {
        if length < min {
            return Err(format!("{} must have length of at least {}", field, min));
        }
    }
    if let Some(max) = max {
        if length > max {
            return Err(format!("{} must have length of at most {}", field, max));
        }
    }
    Ok(())
}

fn is_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !local.chars().any(char::is_whitespace)
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains('@')
        && !domain.chars().any(char::is_whitespace)
}

fn is_url(value: &str) -> bool {
    let rest = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"));
    match rest {
        Some(rest) => {
            let host = rest.split(['/', '?', '#']).next().unwrap_or("");
            !host.is_empty() && !host.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y/%m/%d %H:%M:%S"];

enum ParsedDate {
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
}

fn parse_date(value: &str) -> Option<ParsedDate> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(ParsedDate::DateTime(dt.with_timezone(&Utc)));
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(ParsedDate::DateTime(dt.and_utc()));
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(ParsedDate::Date(date));
        }
    }
    None
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn apply_cleansing(rule: CleansingRule, value: Value) -> Value {
    let Value::String(text) = value else {
        return value;
    };

    match rule {
        CleansingRule::Email => Value::String(text.to_lowercase()),
        CleansingRule::Phone => Value::String(text.chars().filter(char::is_ascii_digit).collect()),
        CleansingRule::Currency => {
            let numeric: String = text
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            match numeric.parse::<f64>() {
                Ok(amount) if amount.is_finite() => number_value(amount),
                _ => Value::String(text),
            }
        }
        CleansingRule::Date => match parse_date(&text) {
            Some(ParsedDate::Date(date)) => Value::String(date.format("%Y-%m-%d").to_string()),
            Some(ParsedDate::DateTime(dt)) => Value::String(dt.to_rfc3339()),
            None => Value::String(text),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn engine() -> ValidationEngine {
        ValidationEngine::default()
    }

    #[test]
    fn test_required_accepts_empty_string() {
        let result = engine().validate_record(
            &record(json!({"name": "", "age": null})),
            &[ValidationRule::required("name"), ValidationRule::required("age")],
        );
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].field, "age");
        assert!(result.cleaned_data.is_none());
    }

    #[test]
    fn test_type_coercion_is_a_warning() {
        let result = engine().validate_record(
            &record(json!({"age": "42", "active": "yes", "score": 7})),
            &[
                ValidationRule::of_type("age", ValueKind::Integer),
                ValidationRule::of_type("active", ValueKind::Boolean),
                ValidationRule::of_type("score", ValueKind::String),
                ValidationRule::range("age", Some(18.0), Some(65.0)),
            ],
        );
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 3);
        let cleaned = result.cleaned_data.unwrap();
        assert_eq!(cleaned["age"], json!(42));
        assert_eq!(cleaned["active"], json!(true));
        assert_eq!(cleaned["score"], json!("7"));
    }

    #[test]
    fn test_failed_coercion_is_an_error() {
        let result = engine().validate_record(
            &record(json!({"age": "forty"})),
            &[ValidationRule::of_type("age", ValueKind::Number)],
        );
        assert!(!result.is_valid);
        assert_eq!(result.errors[0].rule, "type");
    }

    #[test]
    fn test_integer_coercion_rejects_out_of_range_floats() {
        let rules = [
            ValidationRule::of_type("big", ValueKind::Integer),
            ValidationRule::of_type("whole", ValueKind::Integer),
        ];
        let result = engine().validate_record(&record(json!({"big": 1e30, "whole": 42.0})), &rules);
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].field, "big");
        assert_eq!(result.errors[0].rule, "type");

        let result = engine().validate_record(&record(json!({"whole": 42.0})), &rules[1..]);
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.cleaned_data.unwrap()["whole"], json!(42));
    }

    #[test]
    fn test_optional_rules_skip_missing_values() {
        let result = engine().validate_record(
            &record(json!({"other": 1})),
            &[
                ValidationRule::range("age", Some(0.0), None),
                ValidationRule::pattern("code", "^[A-Z]+$"),
                ValidationRule::length("name", Some(2), None),
            ],
        );
        assert!(result.is_valid);
    }

    #[test]
    fn test_pattern_enum_length_and_messages() {
        let rules = vec![
            ValidationRule::pattern("code", "^[A-Z]{3}$").with_message("bad code"),
            ValidationRule::one_of("status", vec![json!("active"), json!("inactive")]),
            ValidationRule::length("tags", None, Some(2)),
            ValidationRule::of_type("email", ValueKind::Email),
            ValidationRule::of_type("site", ValueKind::Url),
            ValidationRule::of_type("born", ValueKind::Date),
        ];
        let result = engine().validate_record(
            &record(json!({
                "code": "abcd",
                "status": "deleted",
                "tags": ["a", "b", "c"],
                "email": "not-an-email",
                "site": "ftp://example.org",
                "born": "2021-02-30"
            })),
            &rules,
        );
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, ["code", "status", "tags", "email", "site", "born"]);
        assert_eq!(result.errors[0].message, "bad code");

        let ok = engine().validate_record(
            &record(json!({
                "code": "ABC",
                "status": "active",
                "tags": ["a"],
                "email": "user@example.com",
                "site": "https://example.org/path",
                "born": "2021-02-28"
            })),
            &rules,
        );
        assert!(ok.is_valid, "{:?}", ok.errors);
    }

    #[test]
    fn test_invalid_pattern_is_reported_not_panicking() {
        let result = engine().validate_record(
            &record(json!({"code": "x"})),
            &[ValidationRule::pattern("code", "([unclosed")],
        );
        assert!(!result.is_valid);
        assert!(result.errors[0].message.contains("invalid pattern"));
    }

    #[test]
    fn test_custom_rule_sees_whole_record() {
        let rule = ValidationRule::custom(
            "end",
            CustomRule::new("end_after_start", |value, record| {
                let end = value.and_then(Value::as_i64).unwrap_or(0);
                let start = record.get("start").and_then(Value::as_i64).unwrap_or(0);
                if end >= start {
                    Ok(())
                } else {
                    Err("end must not precede start".to_string())
                }
            }),
        );
        let bad = engine().validate_record(&record(json!({"start": 5, "end": 3})), &[rule.clone()]);
        assert_eq!(bad.errors[0].message, "end must not precede start");
        let good = engine().validate_record(&record(json!({"start": 1, "end": 3})), &[rule]);
        assert!(good.is_valid);
    }

    #[test]
    fn test_rules_deserialize_from_json() {
        let rules: Vec<ValidationRule> = serde_json::from_value(json!([
            {"field": "email", "rule": "required"},
            {"field": "age", "rule": "range", "min": 0, "max": 130},
            {"field": "kind", "rule": "type", "expected": "integer", "message": "kind must be numeric"}
        ]))
        .unwrap();
        assert_eq!(rules.len(), 3);
        assert!(matches!(rules[1].kind, RuleKind::Range { min: Some(_), max: Some(_) }));
        assert_eq!(rules[2].message.as_deref(), Some("kind must be numeric"));
    }

    #[test]
    fn test_dataset_report() {
        let records = vec![
            record(json!({"id": 1, "email": "a@x.io"})),
            record(json!({"id": 2, "email": null})),
            record(json!({"id": 2, "email": "b@x.io"})),
            record(json!({"id": 3})),
        ];
        let rules = vec![ValidationRule::required("email")];

        let (results, report) = engine().validate_dataset(&records, &rules);
        assert_eq!(results.len(), 4);
        assert_eq!(report.total_records, 4);
        assert_eq!(report.valid_records, 2);
        assert_eq!(report.invalid_records, 2);
        assert_eq!(report.validation_rate, 50.0);

        let email = &report.field_statistics["email"];
        assert_eq!(email.null_count, 2);
        assert_eq!(email.null_rate, 50.0);
        assert_eq!(email.invalid_count, 2);

        let id = &report.field_statistics["id"];
        assert_eq!(id.unique_count, 3);
        assert_eq!(id.duplicate_count, 1);

        assert_eq!(report.common_errors.len(), 1);
        assert_eq!(report.common_errors[0].count, 2);
        assert_eq!(report.common_errors[0].percentage, 50.0);
    }

    #[test]
    fn test_common_errors_truncated_to_ten() {
        let records: Vec<Record> = (0..12)
            .map(|i| record(json!({ format!("f{}", i): null })))
            .collect();
        let rules: Vec<ValidationRule> = (0..12)
            .map(|i| ValidationRule::required(format!("f{}", i)))
            .collect();
        let (_, report) = engine().validate_dataset(&records, &rules);
        assert_eq!(report.common_errors.len(), 10);
    }

    #[test]
    fn test_empty_dataset() {
        let (_, report) = engine().validate_dataset(&[], &[ValidationRule::required("x")]);
        assert_eq!(report.total_records, 0);
        assert_eq!(report.validation_rate, 0.0);
    }

    #[test]
    fn test_cleanse_data() {
        let records = vec![record(json!({
            "name": "  Jane    Doe ",
            "Email": " JANE@Example.COM ",
            "phone_number": "+1 (555) 010-9999",
            "total_price": "$1,234.50",
            "created_date": "03/15/2024",
            "count": 3
        }))];
        let rules = [
            CleansingRule::Email,
            CleansingRule::Phone,
            CleansingRule::Currency,
            CleansingRule::Date,
        ];
        let cleaned = engine().cleanse_data(&records, &rules);

        assert_eq!(cleaned[0]["name"], json!("Jane Doe"));
        assert_eq!(cleaned[0]["Email"], json!("jane@example.com"));
        assert_eq!(cleaned[0]["phone_number"], json!("15550109999"));
        assert_eq!(cleaned[0]["total_price"], json!(1234.5));
        assert_eq!(cleaned[0]["created_date"], json!("2024-03-15"));
        assert_eq!(cleaned[0]["count"], json!(3));
    }

    #[test]
    fn test_cleansing_only_touches_selected_rules() {
        let records = vec![record(json!({"email": "A@B.COM"}))];
        let cleaned = engine().cleanse_data(&records, &[CleansingRule::Phone]);
        assert_eq!(cleaned[0]["email"], json!("A@B.COM"));
        assert!("bogus".parse::<CleansingRule>().is_err());
    }

    #[test]
    fn test_detect_anomalies() {
        let records: Vec<Record> = [10, 12, 11, 13, 9, 14, 100, 8]
            .iter()
            .map(|v| record(json!({ "latency": v })))
            .collect();
        let report = engine().detect_anomalies(&records, "latency");
        let stats = report.statistics.unwrap();

        assert_eq!(stats.count, 8);
        assert_eq!(stats.mean, 22.125);
        assert_eq!(stats.median, 11.5);
        assert_eq!(stats.min, 8.0);
        assert_eq!(stats.max, 100.0);
        assert_eq!(stats.q1, 10.0);
        assert_eq!(stats.q3, 14.0);

        assert_eq!(report.iqr_outliers.len(), 1);
        assert_eq!(report.iqr_outliers[0].index, 6);
        assert_eq!(report.iqr_outliers[0].value, 100.0);
        // Population sigma is ~29.5, so 100 sits at z ~2.64
        assert!(report.z_score_anomalies.is_empty());
        assert!((report.iqr_outliers[0].z_score - 2.64).abs() < 0.01);
    }

    #[test]
    fn test_z_score_anomaly() {
        let mut values: Vec<i64> = vec![50; 30];
        values.push(500);
        let records: Vec<Record> = values
            .iter()
            .map(|v| record(json!({ "v": v })))
            .collect();
        let report = engine().detect_anomalies(&records, "v");
        assert_eq!(report.z_score_anomalies.len(), 1);
        assert_eq!(report.z_score_anomalies[0].index, 30);
    }

    #[test]
    fn test_anomalies_without_numeric_values() {
        let records = vec![record(json!({"v": "n/a"})), record(json!({}))];
        let report = engine().detect_anomalies(&records, "v");
        assert!(report.statistics.is_none());
        assert!(report.iqr_outliers.is_empty());
    }

    proptest! {
        #[test]
        fn prop_report_counts_are_consistent(
            ages in proptest::collection::vec(proptest::option::of(-50i64..200), 0..40)
        ) {
            let records: Vec<Record> = ages
                .iter()
                .map(|age| match age {
                    Some(a) => record(json!({ "age": a })),
                    None => record(json!({ "age": null })),
                })
                .collect();
            let rules = vec![
                ValidationRule::required("age"),
                ValidationRule::range("age", Some(0.0), Some(130.0)),
            ];

            let (results, report) = engine().validate_dataset(&records, &rules);
            prop_assert_eq!(report.total_records, records.len());
            prop_assert_eq!(report.valid_records + report.invalid_records, report.total_records);
            for result in results {
                prop_assert_eq!(result.is_valid, result.errors.is_empty());
                prop_assert_eq!(result.cleaned_data.is_some(), result.errors.is_empty());
            }
        }
    }
}
