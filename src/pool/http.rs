//! HTTP sessions backed by `reqwest`

use async_trait::async_trait;

use super::ConnectionFactory;
use crate::config::PoolConfig;
use crate::{Error, Result};

/// Opens one `reqwest::Client` per pooled session, tuned from a [`PoolConfig`]
#[derive(Debug, Clone)]
pub struct HttpSessionFactory {
    config: PoolConfig,
    user_agent: String,
}

impl HttpSessionFactory {
    /// Create a factory using the pool's connect/request/keepalive timeouts
    #[must_use]
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            config: config.clone(),
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    /// Override the User-Agent header
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

#[async_trait]
impl ConnectionFactory<reqwest::Client> for HttpSessionFactory {
    async fn connect(&self, host: &str) -> Result<reqwest::Client> {
        tracing::debug!(host, "Building HTTP session");
        reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .pool_idle_timeout(self.config.keepalive_timeout)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| Error::Connection(format!("{host}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_http_sessions_are_pooled() {
        let config = PoolConfig {
            name: "exchange-http".to_string(),
            max_connections: 2,
            max_connections_per_host: 1,
            ..PoolConfig::default()
        };
        let pool = Pool::new(config.clone(), Arc::new(HttpSessionFactory::new(&config)));

        drop(pool.acquire("api.kraken.com").await.unwrap());
        let _session = pool.acquire("api.kraken.com").await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
    }
}
