//! Background scheduling and aggregation of health checks

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{HealthCheck, HealthReport, ServiceStatus, StatusChange};
use crate::{Error, Result};

/// Shortest period a check is scheduled at
const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Callback invoked on every status transition
pub type StatusListener = Arc<dyn Fn(&StatusChange) + Send + Sync>;

struct Registered {
    check: Arc<HealthCheck>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Registered {
    fn stop(&mut self) {
        self.cancel.cancel();
        self.task = None;
    }
}

struct ServiceShared {
    checks: RwLock<HashMap<String, Registered>>,
    listeners: RwLock<Vec<StatusListener>>,
}

impl ServiceShared {
    async fn run_check(&self, check: &HealthCheck) -> HealthReport {
        check.run_probe_with(|change| self.publish(change)).await;
        check.report()
    }

    fn publish(&self, change: &StatusChange) {
        match change.current {
            ServiceStatus::Healthy => info!(
                check = %change.name,
                from = %change.previous,
                "Dependency healthy"
            ),
            ServiceStatus::Unknown => info!(check = %change.name, "Dependency status unknown"),
            ServiceStatus::Degraded | ServiceStatus::Unhealthy => warn!(
                check = %change.name,
                from = %change.previous,
                to = %change.current,
                reason = change.reason.as_deref().unwrap_or(""),
                "Dependency status changed"
            ),
        }
        telemetry_metrics::counter!(
            "resilience_health_transitions_total",
            "check" => change.name.clone(),
            "status" => change.current.to_string()
        )
        .increment(1);

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(change))).is_err() {
                warn!(check = %change.name, "Status listener panicked");
            }
        }
    }
}

/// Runs registered health checks and tracks the aggregate status
pub struct HealthCheckService {
    shared: Arc<ServiceShared>,
    root: CancellationToken,
    started: AtomicBool,
}

impl HealthCheckService {
    /// Create an empty, stopped service
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ServiceShared {
                checks: RwLock::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
            }),
            root: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Register a check, replacing any check with the same name.
    ///
    /// If the service is running, the check is scheduled immediately.
    pub fn register_health_check(&self, check: HealthCheck) {
        let check = Arc::new(check);
        let name = check.name().to_string();
        let mut registered = Registered {
            check,
            cancel: self.root.child_token(),
            task: None,
        };

        let mut checks = self.shared.checks.write();
        // Decided under the lock so a concurrent start() cannot miss this check
        if self.is_running() {
            registered.task = self.schedule(&registered);
        }
        let previous = checks.insert(name.clone(), registered);
        drop(checks);

        if let Some(mut previous) = previous {
            previous.stop();
            info!(check = %name, "Replaced health check");
        } else {
            info!(check = %name, "Registered health check");
        }
    }

    /// Remove a check and stop its schedule. Returns whether it existed.
    pub fn unregister_health_check(&self, name: &str) -> bool {
        let removed = self.shared.checks.write().remove(name);
        match removed {
            Some(mut registered) => {
                registered.stop();
                info!(check = %name, "Unregistered health check");
                true
            }
            None => false,
        }
    }

    /// Probe one dependency now, outside the schedule
    ///
    /// # Errors
    ///
    /// Returns [`Error::CheckNotFound`] if no check has that name.
    pub async fn check_health(&self, name: &str) -> Result<HealthReport> {
        let check = self
            .shared
            .checks
            .read()
            .get(name)
            .map(|registered| Arc::clone(&registered.check))
            .ok_or_else(|| Error::CheckNotFound(name.to_string()))?;
        Ok(self.shared.run_check(&check).await)
    }

    /// Probe every registered dependency once, concurrently
    pub async fn check_all(&self) -> Vec<HealthReport> {
        let checks: Vec<Arc<HealthCheck>> = self
            .shared
            .checks
            .read()
            .values()
            .map(|registered| Arc::clone(&registered.check))
            .collect();
        let mut reports =
            futures::future::join_all(checks.iter().map(|check| self.shared.run_check(check)))
                .await;
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        reports
    }

    /// Status of one check
    pub fn status(&self, name: &str) -> Option<ServiceStatus> {
        self.shared
            .checks
            .read()
            .get(name)
            .map(|registered| registered.check.status())
    }

    /// Worst status across all checks; UNKNOWN when none are registered
    pub fn get_overall_status(&self) -> ServiceStatus {
        self.shared
            .checks
            .read()
            .values()
            .map(|registered| registered.check.status())
            .max()
            .unwrap_or(ServiceStatus::Unknown)
    }

    /// Subscribe to status transitions
    pub fn add_status_listener<F>(&self, listener: F)
    where
        F: Fn(&StatusChange) + Send + Sync + 'static,
    {
        self.shared.listeners.write().push(Arc::new(listener));
    }

    /// Reports for every check, sorted by name
    pub fn reports(&self) -> Vec<HealthReport> {
        let mut reports: Vec<HealthReport> = self
            .shared
            .checks
            .read()
            .values()
            .map(|registered| registered.check.report())
            .collect();
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        reports
    }

    /// Number of registered checks
    pub fn len(&self) -> usize {
        self.shared.checks.read().len()
    }

    /// True when no checks are registered
    pub fn is_empty(&self) -> bool {
        self.shared.checks.read().is_empty()
    }

    /// Whether background probing is active
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.root.is_cancelled()
    }

    /// Start background probing for every enabled check
    pub fn start(&self) {
        if self.root.is_cancelled() || self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut checks = self.shared.checks.write();
        for registered in checks.values_mut().filter(|r| r.task.is_none()) {
            registered.task = self.schedule(registered);
        }
        info!(checks = checks.len(), "Health check service started");
    }

    /// Cancel all scheduled probes. The service cannot be restarted.
    pub fn shutdown(&self) {
        self.root.cancel();
        for registered in self.shared.checks.write().values_mut() {
            registered.stop();
        }
        info!("Health check service stopped");
    }

    fn schedule(&self, registered: &Registered) -> Option<JoinHandle<()>> {
        let check = Arc::clone(&registered.check);
        if !check.config().enabled {
            debug!(check = %check.name(), "Health check disabled, not scheduling");
            return None;
        }
        let shared = Arc::clone(&self.shared);
        let cancel = registered.cancel.clone();
        let interval = check.config().interval;
        if interval < MIN_INTERVAL {
            warn!(
                check = %check.name(),
                interval_ms = interval.as_millis(),
                "Health check interval too short, using {}ms",
                MIN_INTERVAL.as_millis()
            );
        }
        let interval = interval.max(MIN_INTERVAL);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = shared.run_check(&check) => {}
                }
            }
            debug!(check = %check.name(), "Health check schedule stopped");
        }))
    }
}

impl Default for HealthCheckService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HealthCheckService {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

impl fmt::Debug for HealthCheckService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheckService")
            .field("checks", &self.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
