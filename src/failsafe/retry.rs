//! Retry logic with configurable backoff

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{BackoffStrategy, RetryConfig};
use crate::{Error, Result};

/// Predicate deciding whether an error is worth another attempt
pub type RetryClassifier = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Retry executor parameterized by a [`RetryConfig`]
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    classifier: RetryClassifier,
    metrics: Arc<RetryCounters>,
}

#[derive(Debug, Default)]
struct RetryCounters {
    calls: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    successes_after_retry: AtomicU64,
    exhaustions: AtomicU64,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
            classifier: Arc::new(Error::is_retryable),
            metrics: Arc::new(RetryCounters::default()),
        }
    }

    /// Replace the retryable-error predicate
    #[must_use]
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Policy name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Underlying configuration
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based),
    /// before jitter
    #[must_use]
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay;
        let attempt = attempt.max(1);

        match self.config.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base.saturating_mul(attempt).min(self.config.max_delay),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(self.config.max_delay)
            }
        }
    }

    /// Delay actually slept after failed attempt `attempt`, jitter applied
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if !self.config.jitter || delay.is_zero() {
            return delay;
        }
        let factor: f64 = rand::rng().random_range(0.5..=1.5);
        let jittered = delay.mul_f64(factor);
        match self.config.strategy {
            BackoffStrategy::Fixed => jittered,
            BackoffStrategy::Linear | BackoffStrategy::Exponential => {
                jittered.min(self.config.max_delay)
            }
        }
    }

    /// Execute `operation` with retries.
    ///
    /// Non-retryable errors propagate unchanged on first occurrence. When the
    /// attempt budget runs out the last error is wrapped in
    /// [`Error::RetryExhausted`].
    pub async fn call<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.metrics.calls.fetch_add(1, Ordering::Relaxed);

        if !self.config.enabled {
            self.metrics.attempts.fetch_add(1, Ordering::Relaxed);
            return operation().await;
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.metrics.attempts.fetch_add(1, Ordering::Relaxed);

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        self.metrics.successes_after_retry.fetch_add(1, Ordering::Relaxed);
                        debug!(policy = %self.config.name, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if !(self.classifier)(&e) {
                        debug!(policy = %self.config.name, error = %e, "Error is not retryable");
                        return Err(e);
                    }

                    if attempt >= max_attempts {
                        self.metrics.exhaustions.fetch_add(1, Ordering::Relaxed);
                        telemetry_metrics::counter!("resilience_retry_exhausted_total", "policy" => self.config.name.clone())
                            .increment(1);
                        warn!(
                            policy = %self.config.name,
                            attempts = attempt,
                            error = %e,
                            "Max retry attempts reached"
                        );
                        return Err(Error::RetryExhausted {
                            name: self.config.name.clone(),
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }

                    let delay = self.delay_for(attempt);
                    debug!(
                        policy = %self.config.name,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Retrying after backoff"
                    );
                    self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                    sleep(delay).await;
                }
            }
        }
    }

    /// Counter snapshot
    #[must_use]
    pub fn metrics(&self) -> RetryMetrics {
        RetryMetrics {
            name: self.config.name.clone(),
            calls: self.metrics.calls.load(Ordering::Relaxed),
            attempts: self.metrics.attempts.load(Ordering::Relaxed),
            retries: self.metrics.retries.load(Ordering::Relaxed),
            successes_after_retry: self.metrics.successes_after_retry.load(Ordering::Relaxed),
            exhaustions: self.metrics.exhaustions.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Retry metrics snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryMetrics {
    /// Policy name
    pub name: String,
    /// Episodes started
    pub calls: u64,
    /// Operation invocations
    pub attempts: u64,
    /// Backoff sleeps taken
    pub retries: u64,
    /// Episodes that succeeded after at least one retry
    pub successes_after_retry: u64,
    /// Episodes that ran out of attempts
    pub exhaustions: u64,
}
