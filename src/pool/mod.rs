//! Named, bounded pools of reusable transport sessions
//!
//! A [`Pool`] caps concurrently active sessions globally and per host,
//! queues acquirers fairly (first requested, first served) and hands out
//! [`PooledSession`] guards that return their connection on drop.
//! [`ConnectionPoolManager`] owns pools by name and creates them lazily.

mod connection_pool;
mod http;
mod manager;

use std::future::Future;

use async_trait::async_trait;

pub use connection_pool::{Pool, PoolStats, PooledSession};
pub use http::HttpSessionFactory;
pub use manager::ConnectionPoolManager;

use crate::Result;

/// Creates and validates connections for a pool
#[async_trait]
pub trait ConnectionFactory<C: Send + Sync + 'static>: Send + Sync {
    /// Open a new connection to `host`
    async fn connect(&self, host: &str) -> Result<C>;

    /// Check that an idle connection can be reused
    async fn is_healthy(&self, _conn: &C) -> bool {
        true
    }
}

/// Adapts an async closure into a [`ConnectionFactory`]
pub struct FnConnectionFactory<F> {
    connect: F,
}

impl<F> FnConnectionFactory<F> {
    /// Wrap `connect`, which receives the target host
    pub fn new(connect: F) -> Self {
        Self { connect }
    }
}

#[async_trait]
impl<C, F, Fut> ConnectionFactory<C> for FnConnectionFactory<F>
where
    C: Send + Sync + 'static,
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<C>> + Send,
{
    async fn connect(&self, host: &str) -> Result<C> {
        (self.connect)(host.to_string()).await
    }
}
