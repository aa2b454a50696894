//! Exchange client adapter

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{LocalCache, ResilientAdapter};
use crate::health::{FnProbe, HealthProbe, ProbeOutcome};
use crate::Result;

/// Operations the adapter needs from an exchange client.
///
/// Payloads are passed through as opaque JSON.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Latest ticker for `symbol`
    async fn fetch_ticker(&self, symbol: &str) -> Result<Value>;

    /// Order book for `symbol`, `depth` levels per side
    async fn fetch_order_book(&self, symbol: &str, depth: u32) -> Result<Value>;

    /// Cheap liveness call
    async fn ping(&self) -> Result<()>;
}

/// An [`ExchangeClient`] behind a [`ResilientAdapter`], with last-known-good
/// fallbacks
pub struct ExchangeAdapter {
    client: Arc<dyn ExchangeClient>,
    adapter: Arc<ResilientAdapter>,
    last_known: LocalCache,
    fallback_enabled: bool,
}

impl ExchangeAdapter {
    /// How long a last-known-good value may be served
    pub const DEFAULT_FALLBACK_TTL: Duration = Duration::from_secs(300);

    /// Wrap `client`
    pub fn new(client: Arc<dyn ExchangeClient>, adapter: Arc<ResilientAdapter>) -> Self {
        Self {
            client,
            adapter,
            last_known: LocalCache::new(Self::DEFAULT_FALLBACK_TTL),
            fallback_enabled: true,
        }
    }

    /// Replace the last-known-good store
    #[must_use]
    pub fn with_last_known(mut self, cache: LocalCache) -> Self {
        self.last_known = cache;
        self
    }

    /// Enable or disable last-known-good fallbacks
    #[must_use]
    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    /// The underlying adapter
    pub fn adapter(&self) -> &Arc<ResilientAdapter> {
        &self.adapter
    }

    /// Last-known-good store
    pub fn last_known(&self) -> &LocalCache {
        &self.last_known
    }

    /// Latest ticker, or the last good one while the exchange is failing
    ///
    /// # Errors
    ///
    /// Propagates the adapter error when no fallback value is available.
    pub async fn fetch_ticker(&self, symbol: &str) -> Result<Value> {
        self.fetch(&format!("ticker:{symbol}"), || self.client.fetch_ticker(symbol))
            .await
    }

    /// Order book, or the last good one while the exchange is failing
    ///
    /// # Errors
    ///
    /// Propagates the adapter error when no fallback value is available.
    pub async fn fetch_order_book(&self, symbol: &str, depth: u32) -> Result<Value> {
        self.fetch(&format!("book:{symbol}:{depth}"), || {
            self.client.fetch_order_book(symbol, depth)
        })
        .await
    }

    /// Ping through the breaker and retry policy, without fallback
    ///
    /// # Errors
    ///
    /// Propagates the adapter error.
    pub async fn ping(&self) -> Result<()> {
        self.adapter.call(|| self.client.ping()).await
    }

    async fn fetch<F, Fut>(&self, key: &str, mut operation: F) -> Result<Value>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let last_known = &self.last_known;
        let fetch_and_remember = || {
            let attempt = operation();
            async move {
                let value = attempt.await?;
                last_known.set(key, value.clone());
                Ok(value)
            }
        };

        if self.fallback_enabled {
            self.adapter
                .call_or_else(fetch_and_remember, |_| last_known.get(key))
                .await
        } else {
            self.adapter.call(fetch_and_remember).await
        }
    }

    /// Health probe that pings the exchange directly, bypassing the breaker
    pub fn health_probe(&self) -> Arc<dyn HealthProbe> {
        let client = Arc::clone(&self.client);
        Arc::new(FnProbe::new(move || {
            let client = Arc::clone(&client);
            async move {
                client.ping().await?;
                Ok(ProbeOutcome::Up)
            }
        }))
    }
}

impl fmt::Debug for ExchangeAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeAdapter")
            .field("adapter", &self.adapter)
            .field("last_known", &self.last_known)
            .field("fallback_enabled", &self.fallback_enabled)
            .finish_non_exhaustive()
    }
}
