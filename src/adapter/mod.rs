//! Resilient adapters around external clients
//!
//! A [`ResilientAdapter`] routes every operation through
//! `CircuitBreaker.call(RetryPolicy.call(time-bounded attempt))` under an
//! overall deadline. [`ExchangeAdapter`] and [`CacheAdapter`] bind it to a
//! concrete client interface and add last-known-good fallbacks from a
//! [`LocalCache`].

mod cache;
mod exchange;
mod memory;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

pub use cache::{CacheAdapter, CacheClient};
pub use exchange::{ExchangeAdapter, ExchangeClient};
pub use memory::{LocalCache, LocalCacheStats};

use crate::config::DependencyConfig;
use crate::failsafe::{CircuitBreaker, LatencyStats, LatencyTracker, RateLimiter, RetryPolicy};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct AdapterCounters {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    short_circuits: AtomicU64,
    fallbacks: AtomicU64,
    deadline_exceeded: AtomicU64,
}

/// Composes a circuit breaker, a retry policy and timeouts around operations
pub struct ResilientAdapter {
    name: String,
    breaker: Arc<CircuitBreaker>,
    retry: Arc<RetryPolicy>,
    attempt_timeout: Option<Duration>,
    deadline: Option<Duration>,
    rate_limiter: Option<RateLimiter>,
    counters: AdapterCounters,
    latency: LatencyTracker,
}

impl ResilientAdapter {
    /// Create an adapter without timeouts or rate limiting
    #[must_use]
    pub fn new(name: &str, breaker: Arc<CircuitBreaker>, retry: Arc<RetryPolicy>) -> Self {
        Self {
            name: name.to_string(),
            breaker,
            retry,
            attempt_timeout: None,
            deadline: None,
            rate_limiter: None,
            counters: AdapterCounters::default(),
            latency: LatencyTracker::new(),
        }
    }

    /// Create an adapter with the timeouts and rate limit from `config`
    #[must_use]
    pub fn from_config(
        name: &str,
        config: &DependencyConfig,
        breaker: Arc<CircuitBreaker>,
        retry: Arc<RetryPolicy>,
    ) -> Self {
        let adapter = Self::new(name, breaker, retry)
            .with_timeouts(config.timeouts.attempt, config.timeouts.deadline);
        if config.rate_limit.enabled {
            adapter.with_rate_limiter(RateLimiter::new(&config.rate_limit))
        } else {
            adapter
        }
    }

    /// Bound each attempt and the whole call
    #[must_use]
    pub fn with_timeouts(mut self, attempt: Option<Duration>, deadline: Option<Duration>) -> Self {
        self.attempt_timeout = attempt;
        self.deadline = deadline;
        self
    }

    /// Wait for a rate-limit permit before each call
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Dependency name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The breaker guarding this dependency
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The retry policy applied to each call
    pub fn retry_policy(&self) -> &Arc<RetryPolicy> {
        &self.retry
    }

    /// Run `operation` through the breaker, the retry policy and timeouts.
    ///
    /// The breaker sees the whole retry episode as one logical call. Each
    /// attempt is bounded by the attempt timeout and the episode by the
    /// deadline; an episode cut off by the deadline counts as a breaker
    /// failure and returns [`Error::DeadlineExceeded`].
    ///
    /// # Errors
    ///
    /// [`Error::CircuitOpen`] without invoking `operation` while the breaker
    /// is open, [`Error::RetryExhausted`] when every attempt failed with a
    /// retryable error, or the operation's own non-retryable error.
    #[tracing::instrument(
        skip_all,
        fields(
            adapter = %self.name,
            request_id = %uuid::Uuid::new_v4()
        )
    )]
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        let start_time = Instant::now();
        let attempt_timeout = self.attempt_timeout;
        let retry = &*self.retry;
        let mut operation = operation;
        let episode = self.breaker.call(move || async move {
            retry
                .call(move || bounded(attempt_timeout, operation()))
                .await
        });

        let result = match self.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, episode).await {
                Ok(result) => result,
                Err(_) => {
                    // The episode was dropped before the breaker saw its outcome
                    self.breaker.record_failure();
                    self.counters.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
                    Err(Error::DeadlineExceeded(deadline))
                }
            },
            None => episode.await,
        };

        let latency = start_time.elapsed();
        match &result {
            Ok(_) => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                self.latency.record(latency);
                debug!(latency_ms = latency.as_millis(), "Call completed");
            }
            Err(Error::CircuitOpen { .. }) => {
                self.counters.short_circuits.fetch_add(1, Ordering::Relaxed);
                debug!("Call short-circuited by open breaker");
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, latency_ms = latency.as_millis(), "Call failed");
            }
        }

        result
    }

    /// Like [`ResilientAdapter::call`], substituting `fallback` for
    /// resilience failures.
    ///
    /// `fallback` is consulted only for an open circuit, retry exhaustion or
    /// an exceeded deadline; returning `None` propagates the original error.
    /// Non-retryable application errors always propagate.
    ///
    /// # Errors
    ///
    /// The error from [`ResilientAdapter::call`] when no fallback applies.
    pub async fn call_or_else<F, Fut, T, G>(&self, operation: F, fallback: G) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        G: FnOnce(&Error) -> Option<T>,
    {
        match self.call(operation).await {
            Err(e) if e.allows_fallback() => match fallback(&e) {
                Some(value) => {
                    self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                    telemetry_metrics::counter!("resilience_fallbacks_total", "adapter" => self.name.clone())
                        .increment(1);
                    info!(adapter = %self.name, error = %e, "Serving fallback value");
                    Ok(value)
                }
                None => Err(e),
            },
            other => other,
        }
    }

    /// Delegation metrics snapshot
    pub fn metrics(&self) -> AdapterMetrics {
        AdapterMetrics {
            name: self.name.clone(),
            calls: self.counters.calls.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            short_circuits: self.counters.short_circuits.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            deadline_exceeded: self.counters.deadline_exceeded.load(Ordering::Relaxed),
            throttled: self.rate_limiter.as_ref().map_or(0, RateLimiter::throttled),
            latency: self.latency.stats(),
        }
    }
}

impl fmt::Debug for ResilientAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientAdapter")
            .field("name", &self.name)
            .field("breaker", &self.breaker)
            .field("retry", &self.retry)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

async fn bounded<T>(limit: Option<Duration>, attempt: impl Future<Output = Result<T>>) -> Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .map_err(|_| Error::Timeout(limit))?,
        None => attempt.await,
    }
}

/// Adapter metrics snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterMetrics {
    /// Dependency name
    pub name: String,
    /// Calls routed through the adapter
    pub calls: u64,
    /// Calls that returned a value from the dependency
    pub successes: u64,
    /// Calls that failed after reaching the dependency
    pub failures: u64,
    /// Calls rejected by the open breaker
    pub short_circuits: u64,
    /// Failures replaced by a fallback value
    pub fallbacks: u64,
    /// Calls cut off by the overall deadline
    pub deadline_exceeded: u64,
    /// Calls that waited for a rate-limit permit
    pub throttled: u64,
    /// Latency of successful calls
    pub latency: LatencyStats,
}
