//! Retry and circuit breaker wrappers shared by every I/O boundary
//!
//! [`ErrorHandler`] owns one circuit breaker per operation name plus a
//! per-operation error counter. Breaker state lives behind a mutex so all
//! concurrent callers using the same operation name observe one state machine.
//! The lock is never held across an await point.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    error::{PipelineError, Result},
    events::{EventBus, PipelineEvent},
    metrics::MetricsCollector,
};

/// Retry policy with exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
    /// Error codes or message substrings that qualify for a retry
    pub retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            retryable_errors: vec![
                "CONNECTION_ERROR".to_string(),
                "TIMEOUT".to_string(),
                "BROKER_ERROR".to_string(),
                "PUBLISH_ERROR".to_string(),
                "ECONNRESET".to_string(),
                "ECONNREFUSED".to_string(),
                "ETIMEDOUT".to_string(),
            ],
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Whether an error matches one of the retryable signatures
    pub fn is_retryable(&self, error: &PipelineError) -> bool {
        let code = error.code();
        let message = error.to_string().to_lowercase();
        self.retryable_errors.iter().any(|signature| {
            signature == code || message.contains(&signature.to_lowercase())
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(PipelineError::configuration(
                "Backoff multiplier must be at least 1.0",
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(PipelineError::configuration(
                "Initial retry delay cannot exceed the maximum delay",
            ));
        }
        Ok(())
    }
}

/// Circuit breaker policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Time the breaker stays open before admitting a trial call
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(PipelineError::configuration(
                "Circuit breaker failure threshold must be greater than 0",
            ));
        }
        Ok(())
    }

    fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    last_failure_at: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            trial_in_flight: false,
            last_failure_at: None,
            last_state_change: Utc::now(),
        }
    }

    fn transition(&mut self, state: CircuitState) {
        self.state = state;
        self.last_state_change = Utc::now();
    }
}

/// Snapshot of one breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
}

/// Retry and circuit breaker executor
#[derive(Clone)]
pub struct ErrorHandler {
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
    error_counts: Arc<DashMap<String, u32>>,
    circuit_breaker: CircuitBreakerConfig,
    events: EventBus,
    metrics: Arc<MetricsCollector>,
}

impl ErrorHandler {
    pub fn new(events: EventBus, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            breakers: Arc::new(Mutex::new(HashMap::new())),
            error_counts: Arc::new(DashMap::new()),
            circuit_breaker: CircuitBreakerConfig::default(),
            events,
            metrics,
        }
    }

    /// Breaker policy used when a call site has no override
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn circuit_breaker_config(&self) -> &CircuitBreakerConfig {
        &self.circuit_breaker
    }

    /// Run `operation`, retrying matching failures with exponential backoff
    ///
    /// The operation runs at most `max_retries + 1` times. Errors that match
    /// none of the retryable signatures are returned immediately and unchanged;
    /// an exhausted budget yields [`PipelineError::RetriesExhausted`] wrapping
    /// the last error.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        operation_name: &str,
        mut operation: F,
        config: &RetryConfig,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            operation = operation_name,
                            attempts = attempt,
                            "Operation succeeded after retry"
                        );
                        self.events.publish(PipelineEvent::RetrySucceeded {
                            operation: operation_name.to_string(),
                            attempts: attempt,
                        });
                    }
                    self.error_counts.remove(operation_name);
                    return Ok(value);
                }
                Err(error) => {
                    self.record_error(operation_name);

                    if !config.is_retryable(&error) {
                        debug!(
                            operation = operation_name,
                            error = %error,
                            "Error is not retryable"
                        );
                        return Err(error);
                    }

                    if attempt > config.max_retries {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %error,
                            "Retries exhausted"
                        );
                        self.events.publish(PipelineEvent::RetryExhausted {
                            operation: operation_name.to_string(),
                            attempts: attempt,
                            error: error.to_string(),
                        });
                        return Err(PipelineError::RetriesExhausted {
                            operation: operation_name.to_string(),
                            attempts: attempt,
                            source: Box::new(error),
                        });
                    }

                    let delay = config.delay_for_attempt(attempt);
                    warn!(
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Operation failed, retrying"
                    );
                    self.metrics
                        .increment_counter("retry_attempts_total", &[("operation", operation_name)]);
                    self.events.publish(PipelineEvent::RetryAttempted {
                        operation: operation_name.to_string(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: error.to_string(),
                    });

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Run `operation` behind the breaker registered for `operation_name`
    pub async fn execute_with_circuit_breaker<T, F, Fut>(
        &self,
        operation_name: &str,
        operation: F,
        config: &CircuitBreakerConfig,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire(operation_name, config)?;

        let outcome = operation().await;
        match &outcome {
            Ok(_) => permit.succeeded(),
            Err(error) => {
                debug!(operation = operation_name, error = %error, "Guarded call failed");
                permit.failed();
            }
        }
        outcome
    }

    /// Breaker around the retry loop: one breaker failure per exhausted retry cycle
    pub async fn execute_with_resilience<T, F, Fut>(
        &self,
        operation_name: &str,
        operation: F,
        retry: &RetryConfig,
        breaker: &CircuitBreakerConfig,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_circuit_breaker(
            operation_name,
            || self.execute_with_retry(operation_name, operation, retry),
            breaker,
        )
        .await
    }

    /// Breaker around every call, plus the retry loop when a policy is given
    ///
    /// `breaker` falls back to the handler's default policy.
    pub async fn execute_guarded<T, F, Fut>(
        &self,
        operation_name: &str,
        operation: F,
        retry: Option<&RetryConfig>,
        breaker: Option<&CircuitBreakerConfig>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = breaker.unwrap_or(&self.circuit_breaker);
        match retry {
            Some(retry) => {
                self.execute_with_resilience(operation_name, operation, retry, breaker)
                    .await
            }
            None => {
                self.execute_with_circuit_breaker(operation_name, operation, breaker)
                    .await
            }
        }
    }

    /// Current breaker state; unknown operations report closed
    pub fn circuit_state(&self, operation_name: &str) -> CircuitState {
        self.breakers
            .lock()
            .get(operation_name)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Consecutive failures recorded by the breaker
    pub fn failure_count(&self, operation_name: &str) -> u32 {
        self.breakers
            .lock()
            .get(operation_name)
            .map(|b| b.failure_count)
            .unwrap_or(0)
    }

    /// Failures seen by the retry loop since the last success
    pub fn error_count(&self, operation_name: &str) -> u32 {
        self.error_counts
            .get(operation_name)
            .map(|entry| *entry)
            .unwrap_or(0)
    }

    /// Force a breaker back to closed
    pub fn reset_circuit(&self, operation_name: &str) {
        let reset = {
            let mut breakers = self.breakers.lock();
            breakers.insert(operation_name.to_string(), CircuitBreaker::new()).is_some()
        };
        if reset {
            info!(operation = operation_name, "Circuit breaker reset");
            self.events.publish(PipelineEvent::CircuitClosed {
                operation: operation_name.to_string(),
            });
        }
    }

    /// Snapshot of every breaker
    pub fn circuit_stats(&self) -> HashMap<String, CircuitBreakerStats> {
        self.breakers
            .lock()
            .iter()
            .map(|(name, breaker)| {
                (
                    name.clone(),
                    CircuitBreakerStats {
                        state: breaker.state,
                        failure_count: breaker.failure_count,
                        last_failure_at: breaker.last_failure_at,
                        last_state_change: breaker.last_state_change,
                    },
                )
            })
            .collect()
    }

    fn record_error(&self, operation_name: &str) {
        *self
            .error_counts
            .entry(operation_name.to_string())
            .or_insert(0) += 1;
    }

    fn acquire<'a>(
        &'a self,
        operation_name: &'a str,
        config: &'a CircuitBreakerConfig,
    ) -> Result<BreakerPermit<'a>> {
        let (admitted, event) = {
            let mut breakers = self.breakers.lock();
            let breaker = breakers
                .entry(operation_name.to_string())
                .or_insert_with(CircuitBreaker::new);

            match breaker.state {
                CircuitState::Closed => (true, None),
                CircuitState::Open => {
                    let elapsed = breaker
                        .opened_at
                        .map(|at| at.elapsed())
                        .unwrap_or(Duration::MAX);
                    if elapsed >= config.reset_timeout() {
                        breaker.transition(CircuitState::HalfOpen);
                        breaker.trial_in_flight = true;
                        (
                            true,
                            Some(PipelineEvent::CircuitHalfOpened {
                                operation: operation_name.to_string(),
                            }),
                        )
                    } else {
                        (false, None)
                    }
                }
                CircuitState::HalfOpen => {
                    if breaker.trial_in_flight {
                        (false, None)
                    } else {
                        breaker.trial_in_flight = true;
                        (true, None)
                    }
                }
            }
        };

        if let Some(event) = event {
            info!(operation = operation_name, "Circuit breaker half-open");
            self.metrics
                .increment_counter("circuit_transitions_total", &[("state", "half_open")]);
            self.events.publish(event);
        }

        if admitted {
            Ok(BreakerPermit {
                handler: self,
                operation_name,
                config,
                settled: false,
            })
        } else {
            debug!(operation = operation_name, "Circuit breaker rejected call");
            self.events.publish(PipelineEvent::CircuitRejected {
                operation: operation_name.to_string(),
            });
            Err(PipelineError::CircuitOpen {
                operation: operation_name.to_string(),
            })
        }
    }

    fn record_success(&self, operation_name: &str) {
        let closed = {
            let mut breakers = self.breakers.lock();
            match breakers.get_mut(operation_name) {
                Some(breaker) => {
                    let was_closed = breaker.state == CircuitState::Closed;
                    breaker.failure_count = 0;
                    breaker.trial_in_flight = false;
                    breaker.opened_at = None;
                    if !was_closed {
                        breaker.transition(CircuitState::Closed);
                    }
                    !was_closed
                }
                None => false,
            }
        };

        if closed {
            info!(operation = operation_name, "Circuit breaker closed");
            self.metrics
                .increment_counter("circuit_transitions_total", &[("state", "closed")]);
            self.events.publish(PipelineEvent::CircuitClosed {
                operation: operation_name.to_string(),
            });
        }
    }

    fn record_failure(&self, operation_name: &str, config: &CircuitBreakerConfig) {
        let opened = {
            let mut breakers = self.breakers.lock();
            let breaker = breakers
                .entry(operation_name.to_string())
                .or_insert_with(CircuitBreaker::new);

            breaker.failure_count += 1;
            breaker.last_failure_at = Some(Utc::now());

            let should_open = match breaker.state {
                CircuitState::HalfOpen => true,
                CircuitState::Closed => breaker.failure_count >= config.failure_threshold,
                CircuitState::Open => false,
            };

            if should_open {
                breaker.transition(CircuitState::Open);
                breaker.opened_at = Some(Instant::now());
                breaker.trial_in_flight = false;
                Some(breaker.failure_count)
            } else {
                None
            }
        };

        if let Some(failure_count) = opened {
            warn!(
                operation = operation_name,
                failure_count, "Circuit breaker opened"
            );
            self.metrics
                .increment_counter("circuit_transitions_total", &[("state", "open")]);
            self.events.publish(PipelineEvent::CircuitOpened {
                operation: operation_name.to_string(),
                failure_count,
            });
        }
    }
}

/// Admission through a breaker; must be settled with the call's outcome
///
/// A permit dropped unsettled (the guarded future was cancelled or timed out)
/// counts as a failure, so a half-open trial never stays in flight.
struct BreakerPermit<'a> {
    handler: &'a ErrorHandler,
    operation_name: &'a str,
    config: &'a CircuitBreakerConfig,
    settled: bool,
}

impl BreakerPermit<'_> {
    fn succeeded(mut self) {
        self.settled = true;
        self.handler.record_success(self.operation_name);
    }

    fn failed(mut self) {
        self.settled = true;
        self.handler.record_failure(self.operation_name, self.config);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                operation = self.operation_name,
                "Guarded call dropped before completing"
            );
            self.handler.record_failure(self.operation_name, self.config);
        }
    }
}
