//! Rate limiting implementation

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};

use governor::{
    Quota, RateLimiter as GovernorLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};

use crate::config::RateLimitConfig;

/// Token-bucket limiter guarding a dependency's request quota
pub struct RateLimiter {
    inner: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
    throttled: AtomicU64,
}

impl RateLimiter {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN),
        )
        .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            inner: GovernorLimiter::direct(quota),
            throttled: AtomicU64::new(0),
        }
    }

    /// Try to take a permit without waiting
    pub fn try_acquire(&self) -> bool {
        self.inner.check().is_ok()
    }

    /// Wait cooperatively until a permit is available
    pub async fn acquire(&self) {
        if self.inner.check().is_err() {
            self.throttled.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Rate limit reached, waiting for permit");
            self.inner.until_ready().await;
        }
    }

    /// Number of calls that had to wait for a permit
    pub fn throttled(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }
}
