//! Registry of named connection pools

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{ConnectionFactory, Pool, PoolStats};
use crate::config::PoolConfig;

/// Owns named pools of one connection type, created lazily
pub struct ConnectionPoolManager<C: Send + Sync + 'static> {
    pools: DashMap<String, Arc<Pool<C>>>,
    factory: Arc<dyn ConnectionFactory<C>>,
}

impl<C: Send + Sync + 'static> ConnectionPoolManager<C> {
    /// Create a manager whose pools open connections through `factory`
    #[must_use]
    pub fn new(factory: Arc<dyn ConnectionFactory<C>>) -> Self {
        Self {
            pools: DashMap::new(),
            factory,
        }
    }

    /// Existing pool for `name`, or a new one built from `config`.
    ///
    /// Registration is idempotent: once a pool exists, later calls return
    /// the same instance and `config` is ignored.
    pub fn get_pool(&self, name: &str, config: &PoolConfig) -> Arc<Pool<C>> {
        self.get_pool_with_factory(name, config, Arc::clone(&self.factory))
    }

    /// Like [`ConnectionPoolManager::get_pool`], with a dedicated factory for a new pool
    pub fn get_pool_with_factory(
        &self,
        name: &str,
        config: &PoolConfig,
        factory: Arc<dyn ConnectionFactory<C>>,
    ) -> Arc<Pool<C>> {
        if let Some(existing) = self.pools.get(name) {
            let existing = Arc::clone(existing.value());
            if !existing.is_closed() {
                if existing.config().max_connections != config.max_connections
                    || existing.config().max_connections_per_host != config.max_connections_per_host
                    || existing.config().pool_timeout != config.pool_timeout
                {
                    debug!(pool = name, "Pool already registered, ignoring new configuration");
                }
                return existing;
            }
        }

        let pool = self
            .pools
            .entry(name.to_string())
            .and_modify(|pool| {
                if pool.is_closed() {
                    *pool = Arc::new(Self::build(name, config, Arc::clone(&factory)));
                }
            })
            .or_insert_with(|| Arc::new(Self::build(name, config, factory)))
            .value()
            .clone();
        pool
    }

    fn build(name: &str, config: &PoolConfig, factory: Arc<dyn ConnectionFactory<C>>) -> Pool<C> {
        let config = PoolConfig {
            name: name.to_string(),
            ..config.clone()
        };
        info!(
            pool = name,
            max_connections = config.max_connections,
            max_connections_per_host = config.max_connections_per_host,
            "Creating connection pool"
        );
        Pool::new(config, factory)
    }

    /// Pool by name, if registered
    pub fn pool(&self, name: &str) -> Option<Arc<Pool<C>>> {
        self.pools.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Evict expired idle connections in every pool
    pub fn evict_expired(&self) -> usize {
        self.pools.iter().map(|entry| entry.value().evict_expired()).sum()
    }

    /// Run [`ConnectionPoolManager::evict_expired`] every `interval` until aborted
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = manager.evict_expired();
                if evicted > 0 {
                    debug!(evicted, "Pool maintenance evicted idle connections");
                }
            }
        })
    }

    /// Statistics for every pool, sorted by name
    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.pools.iter().map(|entry| entry.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Close every pool
    pub fn shutdown(&self) {
        for entry in &self.pools {
            entry.value().close();
        }
        info!(pools = self.pools.len(), "Connection pools shut down");
    }
}
