//! Cache backend adapter

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{LocalCache, ResilientAdapter};
use crate::health::{FnProbe, HealthProbe, ProbeOutcome};
use crate::Result;

/// Operations the adapter needs from a cache backend
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Value stored under `key`
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store `value` under `key`, expiring after `ttl` if given
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    /// Remove `key`; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Cheap liveness call
    async fn ping(&self) -> Result<()>;
}

/// A [`CacheClient`] behind a [`ResilientAdapter`].
///
/// Reads and writes are mirrored into a [`LocalCache`]. While the backend is
/// failing, reads are served from the mirror and writes land only in it.
pub struct CacheAdapter {
    client: Arc<dyn CacheClient>,
    adapter: Arc<ResilientAdapter>,
    local: LocalCache,
    fallback_enabled: bool,
}

impl CacheAdapter {
    /// TTL for mirrored entries written without one
    pub const DEFAULT_LOCAL_TTL: Duration = Duration::from_secs(60);

    /// Wrap `client`
    pub fn new(client: Arc<dyn CacheClient>, adapter: Arc<ResilientAdapter>) -> Self {
        Self {
            client,
            adapter,
            local: LocalCache::new(Self::DEFAULT_LOCAL_TTL),
            fallback_enabled: true,
        }
    }

    /// Replace the local mirror
    #[must_use]
    pub fn with_local(mut self, cache: LocalCache) -> Self {
        self.local = cache;
        self
    }

    /// Enable or disable serving from the local mirror on failure
    #[must_use]
    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    /// The underlying adapter
    pub fn adapter(&self) -> &Arc<ResilientAdapter> {
        &self.adapter
    }

    /// The local mirror
    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    /// Read `key` from the backend, falling back to the local mirror
    ///
    /// # Errors
    ///
    /// Propagates the adapter error when fallbacks are disabled or the
    /// failure is not a resilience failure.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let local = &self.local;
        let operation = || {
            let read = self.client.get(key);
            async move {
                let value = read.await?;
                match &value {
                    Some(value) => local.set(key, value.clone()),
                    None => {
                        local.remove(key);
                    }
                }
                Ok(value)
            }
        };

        if self.fallback_enabled {
            self.adapter
                .call_or_else(operation, |_| Some(local.get(key)))
                .await
        } else {
            self.adapter.call(operation).await
        }
    }

    /// Write `value` to the backend, then mirror it locally.
    ///
    /// The mirror is only written once the backend accepted the write or the
    /// write fell back; a rejected write leaves it untouched.
    ///
    /// # Errors
    ///
    /// Propagates the adapter error when fallbacks are disabled or the
    /// failure is not a resilience failure.
    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let operation = || self.client.set(key, value.clone(), ttl);
        if self.fallback_enabled {
            self.adapter
                .call_or_else(operation, |e| {
                    debug!(key, error = %e, "Backend write skipped, kept locally");
                    Some(())
                })
                .await?;
        } else {
            self.adapter.call(operation).await?;
        }

        match ttl {
            Some(ttl) => self.local.set_with_ttl(key, value, ttl),
            None => self.local.set(key, value),
        }
        Ok(())
    }

    /// Remove `key` from the backend and the local mirror
    ///
    /// # Errors
    ///
    /// Propagates the adapter error; deletes never fall back.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let local = self.local.remove(key);
        let remote = self.adapter.call(|| self.client.delete(key)).await?;
        Ok(remote || local)
    }

    /// Ping through the breaker and retry policy
    ///
    /// # Errors
    ///
    /// Propagates the adapter error.
    pub async fn ping(&self) -> Result<()> {
        self.adapter.call(|| self.client.ping()).await
    }

    /// Health probe that pings the backend directly, bypassing the breaker
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

impl fmt::Debug for CacheAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheAdapter")
            .field("adapter", &self.adapter)
            .field("local", &self.local)
            .field("fallback_enabled", &self.fallback_enabled)
            .finish_non_exhaustive()
    }
}
