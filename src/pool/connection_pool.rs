//! Bounded connection pool with per-host limits

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use super::ConnectionFactory;
use crate::config::PoolConfig;
use crate::{Error, Result};

/// An idle connection waiting for reuse
struct IdleConnection<C> {
    conn: C,
    created_at: Instant,
    last_used: Instant,
}

/// Slots and idle connections for one host
struct HostSlot<C> {
    permits: Arc<Semaphore>,
    idle: VecDeque<IdleConnection<C>>,
}

#[derive(Debug, Default)]
struct PoolCounters {
    active: AtomicUsize,
    waiting: AtomicUsize,
    acquired: AtomicU64,
    created: AtomicU64,
    reused: AtomicU64,
    timeouts: AtomicU64,
    connect_failures: AtomicU64,
    evicted: AtomicU64,
    wait_micros: AtomicU64,
}

struct PoolShared<C: Send + Sync + 'static> {
    name: String,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory<C>>,
    global: Arc<Semaphore>,
    hosts: Mutex<HashMap<String, HostSlot<C>>>,
    closed: AtomicBool,
    counters: PoolCounters,
}

impl<C: Send + Sync + 'static> PoolShared<C> {
    fn host_permits(&self, host: &str) -> Arc<Semaphore> {
        let mut hosts = self.hosts.lock();
        let slot = hosts.entry(host.to_string()).or_insert_with(|| HostSlot {
            permits: Arc::new(Semaphore::new(self.config.max_connections_per_host)),
            idle: VecDeque::new(),
        });
        if self.closed.load(Ordering::Acquire) {
            slot.permits.close();
        }
        Arc::clone(&slot.permits)
    }

    /// Most recently used live idle connection for `host`; expired ones are evicted
    fn take_idle(&self, host: &str) -> Option<IdleConnection<C>> {
        let mut hosts = self.hosts.lock();
        let slot = hosts.get_mut(host)?;
        let keepalive = self.config.keepalive_timeout;

        let before = slot.idle.len();
        slot.idle.retain(|idle| idle.last_used.elapsed() <= keepalive);
        let evicted = before - slot.idle.len();
        if evicted > 0 {
            self.counters.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(pool = %self.name, host, evicted, "Evicted expired idle connections");
        }

        slot.idle.pop_back()
    }

    /// Close least recently used idle connections, on any host, until
    /// `reserve` more connections fit under `max_connections`
    fn trim_idle(&self, hosts: &mut HashMap<String, HostSlot<C>>, reserve: usize) -> usize {
        let max = self.config.max_connections.max(1);
        let active = self.counters.active.load(Ordering::Relaxed);
        let mut idle: usize = hosts.values().map(|slot| slot.idle.len()).sum();
        let mut evicted = 0;

        while idle > 0 && active + idle + reserve > max {
            let oldest = hosts
                .iter_mut()
                .filter_map(|(_, slot)| {
                    let last_used = slot.idle.front()?.last_used;
                    Some((last_used, slot))
                })
                .min_by_key(|(last_used, _)| *last_used)
                .map(|(_, slot)| slot);
            let Some(slot) = oldest else { break };
            slot.idle.pop_front();
            idle -= 1;
            evicted += 1;
        }
        if evicted > 0 {
            self.counters.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(pool = %self.name, evicted, "Closed idle connections over capacity");
        }
        evicted
    }

    /// Make room for a connection about to be opened
    fn reserve_for_connect(&self) {
        let mut hosts = self.hosts.lock();
        self.trim_idle(&mut hosts, 1);
    }

    fn give_back(&self, host: &str, conn: C, created_at: Instant) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut hosts = self.hosts.lock();
        self.trim_idle(&mut hosts, 1);
        if let Some(slot) = hosts.get_mut(host) {
            slot.idle.push_back(IdleConnection {
                conn,
                created_at,
                last_used: Instant::now(),
            });
        }
    }
}

/// A bounded pool of connections of type `C`
pub struct Pool<C: Send + Sync + 'static> {
    shared: Arc<PoolShared<C>>,
}

impl<C: Send + Sync + 'static> Pool<C> {
    /// Create a pool; `config.name` identifies it in logs and errors
    #[must_use]
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory<C>>) -> Self {
        let max_connections = config.max_connections.max(1);
        Self {
            shared: Arc::new(PoolShared {
                name: config.name.clone(),
                global: Arc::new(Semaphore::new(max_connections)),
                config,
                factory,
                hosts: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                counters: PoolCounters::default(),
            }),
        }
    }

    /// Pool name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Pool configuration
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Whether [`Pool::close`] has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Acquire a session to `host`.
    ///
    /// Waits cooperatively, first-come first-served, for a per-host slot and
    /// then a global slot, up to `pool_timeout` in total. Dropping the
    /// returned future while waiting gives up its queue position. The
    /// session is returned to the pool when the guard is dropped.
    #[tracing::instrument(skip(self), fields(pool = %self.shared.name))]
    pub async fn acquire(&self, host: &str) -> Result<PooledSession<C>> {
        let shared = &self.shared;
        if self.is_closed() {
            return Err(Error::PoolClosed(shared.name.clone()));
        }

        let start = Instant::now();
        let waiting = WaitingGuard::enter(&shared.counters.waiting);
        let host_permits = shared.host_permits(host);
        let global = Arc::clone(&shared.global);

        let permits = timeout(shared.config.pool_timeout, async move {
            let host_permit = host_permits.acquire_owned().await?;
            let global_permit = global.acquire_owned().await?;
            Ok::<_, tokio::sync::AcquireError>((host_permit, global_permit))
        })
        .await;
        drop(waiting);

        let waited = start.elapsed();
        let (host_permit, global_permit) = match permits {
            Ok(Ok(permits)) => permits,
            Ok(Err(_)) => return Err(Error::PoolClosed(shared.name.clone())),
            Err(_) => {
                shared.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                telemetry_metrics::counter!("resilience_pool_timeouts_total", "pool" => shared.name.clone())
                    .increment(1);
                warn!(host, waited_ms = waited.as_millis(), "Timed out waiting for a connection slot");
                return Err(Error::PoolTimeout {
                    pool: shared.name.clone(),
                    waited,
                });
            }
        };
        shared.counters.wait_micros.fetch_add(
            u64::try_from(waited.as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );

        let (conn, created_at) = match self.reuse_idle(host).await {
            Some(idle) => idle,
            None => {
                shared.reserve_for_connect();
                (self.connect(host).await?, Instant::now())
            }
        };

        shared.counters.acquired.fetch_add(1, Ordering::Relaxed);
        shared.counters.active.fetch_add(1, Ordering::Relaxed);

        Ok(PooledSession {
            conn: Some(conn),
            host: host.to_string(),
            created_at,
            discard: false,
            shared: Arc::clone(shared),
            _host_permit: host_permit,
            _global_permit: global_permit,
        })
    }

    async fn reuse_idle(&self, host: &str) -> Option<(C, Instant)> {
        while let Some(idle) = self.shared.take_idle(host) {
            if self.shared.factory.is_healthy(&idle.conn).await {
                self.shared.counters.reused.fetch_add(1, Ordering::Relaxed);
                return Some((idle.conn, idle.created_at));
            }
            self.shared.counters.evicted.fetch_add(1, Ordering::Relaxed);
            debug!(host, "Discarding unhealthy idle connection");
        }
        None
    }

    async fn connect(&self, host: &str) -> Result<C> {
        let shared = &self.shared;
        let connect_timeout = shared.config.connect_timeout;

        match timeout(connect_timeout, shared.factory.connect(host)).await {
            Ok(Ok(conn)) => {
                shared.counters.created.fetch_add(1, Ordering::Relaxed);
                debug!(host, "Opened new connection");
                Ok(conn)
            }
            Ok(Err(e)) => {
                shared.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
                warn!(host, error = %e, "Connection failed");
                Err(match e {
                    Error::Connection(_) => e,
                    other => Error::Connection(format!("{host}: {other}")),
                })
            }
            Err(_) => {
                shared.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
                warn!(host, timeout_ms = connect_timeout.as_millis(), "Connect timed out");
                Err(Error::Connection(format!(
                    "{host}: connect timed out after {}ms",
                    connect_timeout.as_millis()
                )))
            }
        }
    }

    /// Close idle connections older than `keepalive_timeout`.
    ///
    /// Returns the number of connections evicted.
    pub fn evict_expired(&self) -> usize {
        let keepalive = self.shared.config.keepalive_timeout;
        let mut evicted = 0;

        let mut hosts = self.shared.hosts.lock();
        for slot in hosts.values_mut() {
            let before = slot.idle.len();
            slot.idle.retain(|idle| idle.last_used.elapsed() <= keepalive);
            evicted += before - slot.idle.len();
        }
        // Only the map holds the semaphore: no session, waiter or clone is live
        hosts.retain(|_, slot| !slot.idle.is_empty() || Arc::strong_count(&slot.permits) > 1);
        drop(hosts);

        if evicted > 0 {
            self.shared
                .counters
                .evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(pool = %self.shared.name, evicted, "Evicted idle connections");
        }
        evicted
    }

    /// Drain idle connections, fail outstanding waiters with
    /// [`Error::PoolClosed`] and refuse further acquisition.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shared.global.close();
        let mut hosts = self.shared.hosts.lock();
        let mut drained = 0;
        for slot in hosts.values_mut() {
            slot.permits.close();
            drained += slot.idle.len();
            slot.idle.clear();
        }
        drop(hosts);

        info!(pool = %self.shared.name, drained, "Connection pool closed");
    }

    /// Counter snapshot
    pub fn stats(&self) -> PoolStats {
        let counters = &self.shared.counters;
        let idle = self
            .shared
            .hosts
            .lock()
            .values()
            .map(|slot| slot.idle.len())
            .sum();
        let acquired = counters.acquired.load(Ordering::Relaxed);
        let wait_micros = counters.wait_micros.load(Ordering::Relaxed);

        #[allow(clippy::cast_precision_loss)]
        let avg_wait_ms = if acquired == 0 {
            0.0
        } else {
            wait_micros as f64 / acquired as f64 / 1000.0
        };

        PoolStats {
            name: self.shared.name.clone(),
            max_connections: self.shared.config.max_connections,
            active: counters.active.load(Ordering::Relaxed),
            idle,
            waiting: counters.waiting.load(Ordering::Relaxed),
            total_acquired: acquired,
            created: counters.created.load(Ordering::Relaxed),
            reused: counters.reused.load(Ordering::Relaxed),
            timeouts: counters.timeouts.load(Ordering::Relaxed),
            connect_failures: counters.connect_failures.load(Ordering::Relaxed),
            evicted: counters.evicted.load(Ordering::Relaxed),
            avg_wait_ms,
            closed: self.is_closed(),
        }
    }
}

impl<C: Send + Sync + 'static> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.shared.name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Keeps the waiting gauge right even when the acquire future is dropped
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A connection checked out of a [`Pool`].
///
/// Dropping the guard returns the connection to the pool's idle list and
/// frees its slots, on every exit path.
pub struct PooledSession<C: Send + Sync + 'static> {
    conn: Option<C>,
    host: String,
    created_at: Instant,
    discard: bool,
    shared: Arc<PoolShared<C>>,
    _host_permit: OwnedSemaphorePermit,
    _global_permit: OwnedSemaphorePermit,
}

impl<C: Send + Sync + 'static> PooledSession<C> {
    /// Host this session is connected to
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Time since the underlying connection was opened
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Mark the connection broken so it is closed instead of reused
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<C: Send + Sync + 'static> Deref for PooledSession<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<C: Send + Sync + 'static> DerefMut for PooledSession<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<C: Send + Sync + 'static> Drop for PooledSession<C> {
    fn drop(&mut self) {
        self.shared.counters.active.fetch_sub(1, Ordering::Relaxed);
        if let Some(conn) = self.conn.take() {
            if !self.discard {
                self.shared.give_back(&self.host, conn, self.created_at);
            }
        }
    }
}

impl<C: Send + Sync + 'static> fmt::Debug for PooledSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("pool", &self.shared.name)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

/// Pool statistics snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    /// Pool name
    pub name: String,
    /// Global cap
    pub max_connections: usize,
    /// Sessions currently checked out
    pub active: usize,
    /// Connections waiting for reuse
    pub idle: usize,
    /// Acquirers currently queued
    pub waiting: usize,
    /// Successful acquisitions
    pub total_acquired: u64,
    /// Connections opened
    pub created: u64,
    /// Acquisitions served by an idle connection
    pub reused: u64,
    /// Acquisitions that hit `pool_timeout`
    pub timeouts: u64,
    /// Failed connection attempts
    pub connect_failures: u64,
    /// Idle connections closed for age or health
    pub evicted: u64,
    /// Mean time spent waiting for a slot
    pub avg_wait_ms: f64,
    /// Whether the pool was closed
    pub closed: bool,
}
