//! Circuit breaker implementation
//!
//! A per-dependency state machine. Transitions:
//!
//! - CLOSED → OPEN once the failure count reaches `failure_threshold`
//! - OPEN → HALF_OPEN lazily, on the first call after `timeout` has elapsed
//! - HALF_OPEN → CLOSED after `success_threshold` consecutive successes
//! - HALF_OPEN → OPEN on any failure
//!
//! While half-open every call is let through; the first failure re-trips the
//! breaker.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::{Error, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (blocking requests)
    Open,
    /// Circuit is half-open (allowing requests to test recovery)
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Mutable breaker state, always accessed under one lock
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
    total_calls: u64,
    total_failures: u64,
    total_trips: u64,
    rejected_calls: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            opened_at: None,
            total_calls: 0,
            total_failures: 0,
            total_trips: 0,
            rejected_calls: 0,
        }
    }
}

/// Circuit breaker for dependency protection
pub struct CircuitBreaker {
    /// Dependency name
    name: String,
    enabled: bool,
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            enabled: config.enabled,
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            timeout: config.timeout,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    /// Dependency name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` under the breaker.
    ///
    /// Fails fast with [`Error::CircuitOpen`] without invoking `operation`
    /// when the breaker is open. Otherwise invokes it exactly once and feeds
    /// the outcome into the state machine.
    #[tracing::instrument(skip(self, operation), fields(breaker = %self.name))]
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failures(e.failure_weight());
                Err(e)
            }
        }
    }

    /// Check if requests can proceed, without counting a call
    pub fn can_proceed(&self) -> bool {
        if !self.enabled {
            return true;
        }
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state != CircuitState::Open
    }

    /// Admit one call or reject it with [`Error::CircuitOpen`]
    fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        if !self.enabled {
            inner.total_calls += 1;
            return Ok(());
        }

        self.refresh(&mut inner);

        match inner.state {
            CircuitState::Closed => {
                tracing::trace!("Circuit closed, allowing request");
            }
            CircuitState::HalfOpen => {
                debug!("Circuit half-open, allowing probe request");
            }
            CircuitState::Open => {
                inner.rejected_calls += 1;
                let retry_after = self.remaining_open(&inner);
                debug!(
                    retry_after_ms = retry_after.as_millis(),
                    "Circuit open, rejecting request"
                );
                return Err(Error::CircuitOpen {
                    name: self.name.clone(),
                    retry_after,
                });
            }
        }

        inner.total_calls += 1;
        Ok(())
    }

    /// Record a successful call
    pub fn record_success(&self) {
        if !self.enabled {
            return;
        }

        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.successes += 1;
                debug!(
                    breaker = %self.name,
                    successes = inner.successes,
                    threshold = self.success_threshold,
                    "Success in half-open state"
                );
                if inner.successes >= self.success_threshold {
                    self.transition_to(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                tracing::trace!(breaker = %self.name, "Success recorded in open state (ignored)");
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        self.record_failures(1);
    }

    /// Record a failed call that stands for `weight` underlying failures
    pub fn record_failures(&self, weight: u32) {
        let mut inner = self.inner.lock();
        inner.total_failures += 1;

        if !self.enabled {
            return;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.failures = inner.failures.saturating_add(weight.max(1));
                warn!(
                    breaker = %self.name,
                    failures = inner.failures,
                    threshold = self.failure_threshold,
                    "Failure in closed state"
                );
                if inner.failures >= self.failure_threshold {
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "Failure in half-open state, reopening circuit");
                self.transition_to(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {
                tracing::trace!(breaker = %self.name, "Failure recorded in open state (ignored)");
            }
        }
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Force the breaker closed and clear its counters
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition_to(&mut inner, CircuitState::Closed);
        inner.failures = 0;
        inner.successes = 0;
    }

    /// Read-only snapshot of state and counters
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_trips: inner.total_trips,
            rejected_calls: inner.rejected_calls,
            current_failure_count: inner.failures,
            current_success_count: inner.successes,
        }
    }

    /// Human-readable status line
    pub fn status_message(&self) -> String {
        let inner = self.inner.lock();

        if !self.enabled {
            return format!("Dependency '{}' circuit breaker is closed (disabled)", self.name);
        }

        match inner.state {
            CircuitState::Closed => {
                format!("Dependency '{}' circuit breaker is closed", self.name)
            }
            CircuitState::Open => format!(
                "Dependency '{}' circuit breaker is open after {} failures, retry in {} seconds",
                self.name,
                inner.failures,
                self.remaining_open(&inner).as_secs()
            ),
            CircuitState::HalfOpen => format!(
                "Dependency '{}' circuit breaker is half-open, probing recovery ({}/{} successes)",
                self.name, inner.successes, self.success_threshold
            ),
        }
    }

    /// Apply the lazy OPEN → HALF_OPEN transition
    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && inner
                .opened_at
                .is_some_and(|opened| opened.elapsed() >= self.timeout)
        {
            debug!(breaker = %self.name, "Reset timeout elapsed, transitioning to half-open");
            self.transition_to(inner, CircuitState::HalfOpen);
        }
    }

    fn remaining_open(&self, inner: &BreakerState) -> Duration {
        inner
            .opened_at
            .map_or(Duration::ZERO, |opened| self.timeout.saturating_sub(opened.elapsed()))
    }

    /// Transition to a new state
    fn transition_to(&self, inner: &mut BreakerState, new_state: CircuitState) {
        let old_state = inner.state;

        match new_state {
            CircuitState::Closed => {
                inner.failures = 0;
                inner.successes = 0;
                inner.opened_at = None;
            }
            CircuitState::Open => {
                inner.successes = 0;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                inner.successes = 0;
            }
        }

        if old_state == new_state {
            return;
        }
        inner.state = new_state;

        match new_state {
            CircuitState::Closed => {
                info!(breaker = %self.name, from = %old_state, "Circuit breaker closed");
            }
            CircuitState::Open => {
                inner.total_trips += 1;
                telemetry_metrics::counter!("resilience_circuit_trips_total", "breaker" => self.name.clone())
                    .increment(1);
                warn!(
                    breaker = %self.name,
                    from = %old_state,
                    failures = inner.failures,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                info!(breaker = %self.name, "Circuit breaker half-open");
            }
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Circuit breaker metrics snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerMetrics {
    /// Dependency name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Calls admitted through the breaker
    pub total_calls: u64,
    /// Calls that failed
    pub total_failures: u64,
    /// Times the breaker opened
    pub total_trips: u64,
    /// Calls rejected while open
    pub rejected_calls: u64,
    /// Failures counted toward the threshold
    pub current_failure_count: u32,
    /// Half-open successes counted toward closing
    pub current_success_count: u32,
}
