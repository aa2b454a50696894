//! Failsafe primitives: circuit breaker, retry, rate limiting, latency tracking

mod circuit_breaker;
mod latency;
mod rate_limiter;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitState};
pub use latency::{LatencyStats, LatencyTracker};
pub use rate_limiter::RateLimiter;
pub use retry::{RetryClassifier, RetryMetrics, RetryPolicy};
