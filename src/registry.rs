//! Process-wide resilience context
//!
//! One [`ResilienceRegistry`] is built at startup from the loaded
//! [`Config`] and passed to whatever needs a breaker, a retry policy, an
//! adapter, a pool or the health service. Components are created lazily per
//! dependency name and shared from then on.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::adapter::{AdapterMetrics, CacheAdapter, CacheClient, ExchangeAdapter, ExchangeClient, ResilientAdapter};
use crate::config::Config;
use crate::failsafe::{CircuitBreaker, CircuitBreakerMetrics, RetryMetrics, RetryPolicy};
use crate::health::{HealthCheck, HealthCheckService, HealthProbe, HealthReport, HttpProbe, ServiceStatus};
use crate::pool::{ConnectionPoolManager, HttpSessionFactory, Pool, PoolStats};
use crate::Result;

/// Named breakers, retry policies, adapters, pools and health checks
pub struct ResilienceRegistry {
    config: Config,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    retry_policies: DashMap<String, Arc<RetryPolicy>>,
    adapters: DashMap<String, Arc<ResilientAdapter>>,
    pools: Arc<ConnectionPoolManager<reqwest::Client>>,
    health: Arc<HealthCheckService>,
}

impl ResilienceRegistry {
    /// Create an empty registry for `config`
    #[must_use]
    pub fn new(config: Config) -> Self {
        let factory = Arc::new(HttpSessionFactory::new(&config.defaults.pool));
        Self {
            config,
            breakers: DashMap::new(),
            retry_policies: DashMap::new(),
            adapters: DashMap::new(),
            pools: Arc::new(ConnectionPoolManager::new(factory)),
            health: Arc::new(HealthCheckService::new()),
        }
    }

    /// Loaded configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Breaker for `name`, created on first use
    pub fn circuit_breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(dependency = name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(name, &self.config.dependency(name).circuit_breaker))
            })
            .value()
            .clone()
    }

    /// Retry policy for `name`, created on first use
    pub fn retry_policy(&self, name: &str) -> Arc<RetryPolicy> {
        self.retry_policies
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RetryPolicy::new(&self.config.dependency(name).retry)))
            .value()
            .clone()
    }

    /// Adapter for `name`, sharing the dependency's breaker and retry policy
    pub fn adapter(&self, name: &str) -> Arc<ResilientAdapter> {
        if let Some(adapter) = self.adapters.get(name) {
            return Arc::clone(adapter.value());
        }
        let breaker = self.circuit_breaker(name);
        let retry = self.retry_policy(name);
        self.adapters
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(ResilientAdapter::from_config(
                    name,
                    &self.config.dependency(name),
                    breaker,
                    retry,
                ))
            })
            .value()
            .clone()
    }

    /// Wrap an exchange client in the adapter for `name`
    pub fn exchange_adapter(&self, name: &str, client: Arc<dyn ExchangeClient>) -> ExchangeAdapter {
        ExchangeAdapter::new(client, self.adapter(name))
    }

    /// Wrap a cache client in the adapter for `name`
    pub fn cache_adapter(&self, name: &str, client: Arc<dyn CacheClient>) -> CacheAdapter {
        CacheAdapter::new(client, self.adapter(name))
    }

    /// HTTP session pool for `name`, sized from its pool settings
    pub fn http_pool(&self, name: &str) -> Arc<Pool<reqwest::Client>> {
        let pool_config = self.config.dependency(name).pool;
        let factory = Arc::new(HttpSessionFactory::new(&pool_config));
        self.pools.get_pool_with_factory(name, &pool_config, factory)
    }

    /// Pool manager
    pub fn pools(&self) -> &Arc<ConnectionPoolManager<reqwest::Client>> {
        &self.pools
    }

    /// Health check service
    pub fn health(&self) -> &Arc<HealthCheckService> {
        &self.health
    }

    /// Register `probe` under `name` with the dependency's health settings
    pub fn register_health_check(&self, name: &str, probe: Arc<dyn HealthProbe>) {
        let config = self.config.dependency(name).health_check;
        self.health.register_health_check(HealthCheck::new(config, probe));
    }

    /// Register an [`HttpProbe`] for every dependency with a configured probe
    ///
    /// # Errors
    ///
    /// Returns an error if a probe cannot be built from its configuration.
    pub fn register_configured_probes(&self) -> Result<usize> {
        let mut registered = 0;
        for name in self.config.dependency_names() {
            let dependency = self.config.dependency(&name);
            let Some(probe_config) = &dependency.probe else {
                continue;
            };
            let probe = HttpProbe::new(probe_config, dependency.health_check.timeout)?;
            info!(dependency = %name, url = %probe.url(), "Registering HTTP health probe");
            self.register_health_check(&name, Arc::new(probe));
            registered += 1;
        }
        Ok(registered)
    }

    /// Serializable view of every component
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut circuit_breakers: Vec<CircuitBreakerMetrics> =
            self.breakers.iter().map(|entry| entry.value().metrics()).collect();
        circuit_breakers.sort_by(|a, b| a.name.cmp(&b.name));

        let mut retry_policies: Vec<RetryMetrics> =
            self.retry_policies.iter().map(|entry| entry.value().metrics()).collect();
        retry_policies.sort_by(|a, b| a.name.cmp(&b.name));

        let mut adapters: Vec<AdapterMetrics> =
            self.adapters.iter().map(|entry| entry.value().metrics()).collect();
        adapters.sort_by(|a, b| a.name.cmp(&b.name));

        RegistrySnapshot {
            generated_at: Utc::now(),
            overall_status: self.health.get_overall_status(),
            circuit_breakers,
            retry_policies,
            adapters,
            pools: self.pools.stats(),
            health: self.health.reports(),
        }
    }

    /// Stop health probing and close every pool
    pub fn shutdown(&self) {
        self.health.shutdown();
        self.pools.shutdown();
        info!("Resilience registry shut down");
    }
}

impl std::fmt::Debug for ResilienceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceRegistry")
            .field("breakers", &self.breakers.len())
            .field("retry_policies", &self.retry_policies.len())
            .field("adapters", &self.adapters.len())
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

/// Everything the registry knows, as plain data
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    /// When the snapshot was taken
    pub generated_at: DateTime<Utc>,
    /// Worst health status across checks
    pub overall_status: ServiceStatus,
    /// Breaker metrics by name
    pub circuit_breakers: Vec<CircuitBreakerMetrics>,
    /// Retry metrics by name
    pub retry_policies: Vec<RetryMetrics>,
    /// Adapter metrics by name
    pub adapters: Vec<AdapterMetrics>,
    /// Pool statistics by name
    pub pools: Vec<PoolStats>,
    /// Health reports by name
    pub health: Vec<HealthReport>,
}
