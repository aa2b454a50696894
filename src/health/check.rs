//! A single debounced health check

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use super::{HealthProbe, ProbeOutcome, ServiceStatus, StatusChange};
use crate::config::HealthCheckConfig;

#[derive(Debug)]
struct CheckState {
    status: ServiceStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_latency: Option<Duration>,
    last_error: Option<String>,
    last_checked: Option<DateTime<Utc>>,
    last_status_change: Option<DateTime<Utc>>,
    total_probes: u64,
    total_failures: u64,
}

/// A named probe plus its debounced status
pub struct HealthCheck {
    config: HealthCheckConfig,
    probe: Arc<dyn HealthProbe>,
    state: Mutex<CheckState>,
    // One probe at a time, so transitions are observed in the order applied
    serial: tokio::sync::Mutex<()>,
}

impl HealthCheck {
    /// Create a check in the UNKNOWN state
    pub fn new(config: HealthCheckConfig, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            config,
            probe,
            state: Mutex::new(CheckState {
                status: ServiceStatus::Unknown,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_latency: None,
                last_error: None,
                last_checked: None,
                last_status_change: None,
                total_probes: 0,
                total_failures: 0,
            }),
            serial: tokio::sync::Mutex::new(()),
        }
    }

    /// Check name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Check configuration
    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Current confirmed status
    pub fn status(&self) -> ServiceStatus {
        self.state.lock().status
    }

    /// Run the probe once, bounded by the configured timeout.
    ///
    /// Timeouts, errors and panics inside the probe all count as failures.
    /// Returns the transition this probe caused, if any.
    pub async fn run_probe(&self) -> Option<StatusChange> {
        let _serial = self.serial.lock().await;
        self.probe_once().await
    }

    /// Like [`HealthCheck::run_probe`], calling `on_change` before the next
    /// probe of this check may start
    pub(crate) async fn run_probe_with<F>(&self, on_change: F) -> Option<StatusChange>
    where
        F: FnOnce(&StatusChange),
    {
        let _serial = self.serial.lock().await;
        let change = self.probe_once().await;
        if let Some(change) = &change {
            on_change(change);
        }
        change
    }

    async fn probe_once(&self) -> Option<StatusChange> {
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.config.timeout,
            AssertUnwindSafe(self.probe.probe()).catch_unwind(),
        )
        .await;
        let latency = started.elapsed();

        let outcome = match result {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(e))) => ProbeOutcome::Down(e.to_string()),
            Ok(Err(panic)) => ProbeOutcome::Down(format!("probe panicked: {}", panic_message(&*panic))),
            Err(_) => ProbeOutcome::Down(format!(
                "probe timed out after {}ms",
                self.config.timeout.as_millis()
            )),
        };

        self.apply(&outcome, latency)
    }

    /// Feed one probe outcome into the state machine
    pub fn apply(&self, outcome: &ProbeOutcome, latency: Duration) -> Option<StatusChange> {
        let mut state = self.state.lock();
        let now = Utc::now();
        state.total_probes += 1;
        state.last_checked = Some(now);
        state.last_latency = Some(latency);

        let previous = state.status;
        let (next, reason) = match outcome {
            ProbeOutcome::Up => {
                state.consecutive_successes += 1;
                state.consecutive_failures = 0;
                state.last_error = None;
                let next = if state.consecutive_successes >= self.config.consecutive_successes {
                    ServiceStatus::Healthy
                } else {
                    previous
                };
                (next, None)
            }
            ProbeOutcome::Down(reason) => {
                state.total_failures += 1;
                state.consecutive_failures += 1;
                state.consecutive_successes = 0;
                state.last_error = Some(reason.clone());
                let next = if state.consecutive_failures >= self.config.consecutive_failures {
                    ServiceStatus::Unhealthy
                } else {
                    previous
                };
                (next, Some(reason.clone()))
            }
            ProbeOutcome::Degraded(reason) => {
                state.consecutive_failures = 0;
                state.consecutive_successes = 0;
                state.last_error = Some(reason.clone());
                (ServiceStatus::Degraded, Some(reason.clone()))
            }
        };

        if next == previous {
            return None;
        }

        state.status = next;
        state.last_status_change = Some(now);
        Some(StatusChange {
            name: self.config.name.clone(),
            previous,
            current: next,
            reason,
            at: now,
        })
    }

    /// Serializable snapshot of the check
    pub fn report(&self) -> HealthReport {
        let state = self.state.lock();
        HealthReport {
            name: self.config.name.clone(),
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            last_latency_ms: state
                .last_latency
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            last_error: state.last_error.clone(),
            last_checked: state.last_checked,
            last_status_change: state.last_status_change,
            total_probes: state.total_probes,
            total_failures: state.total_failures,
        }
    }
}

impl fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheck")
            .field("name", &self.config.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Health check snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Check name
    pub name: String,
    /// Confirmed status
    pub status: ServiceStatus,
    /// Failed probes in a row
    pub consecutive_failures: u32,
    /// Successful probes in a row
    pub consecutive_successes: u32,
    /// Latency of the last probe
    pub last_latency_ms: Option<u64>,
    /// Reason given by the last failed or degraded probe
    pub last_error: Option<String>,
    /// When the last probe finished
    pub last_checked: Option<DateTime<Utc>>,
    /// When the status last changed
    pub last_status_change: Option<DateTime<Utc>>,
    /// Probes run
    pub total_probes: u64,
    /// Probes that failed
    pub total_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::FnProbe;
    use crate::{Error, Result};

    fn config(consecutive_failures: u32, consecutive_successes: u32) -> HealthCheckConfig {
        HealthCheckConfig {
            name: "coinbase".to_string(),
            timeout: Duration::from_secs(1),
            consecutive_failures,
            consecutive_successes,
            ..HealthCheckConfig::default()
        }
    }

    fn check_with<F, Fut>(config: HealthCheckConfig, probe: F) -> HealthCheck
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<ProbeOutcome>> + Send + 'static,
    {
        HealthCheck::new(config, Arc::new(FnProbe::new(probe)))
    }

    fn noop_check(config: HealthCheckConfig) -> HealthCheck {
        check_with(config, || async { Ok(ProbeOutcome::Up) })
    }

    fn down() -> ProbeOutcome {
        ProbeOutcome::Down("refused".to_string())
    }

    #[test]
    fn test_hysteresis_between_thresholds() {
        let check = noop_check(config(3, 2));
        assert_eq!(check.status(), ServiceStatus::Unknown);

        assert!(check.apply(&down(), Duration::ZERO).is_none());
        assert!(check.apply(&down(), Duration::ZERO).is_none());
        assert_eq!(check.status(), ServiceStatus::Unknown);

        let change = check.apply(&down(), Duration::ZERO).unwrap();
        assert_eq!(change.previous, ServiceStatus::Unknown);
        assert_eq!(change.current, ServiceStatus::Unhealthy);
        assert_eq!(change.reason.as_deref(), Some("refused"));

        // A single success does not flip an unhealthy dependency
        assert!(check.apply(&ProbeOutcome::Up, Duration::ZERO).is_none());
        assert_eq!(check.status(), ServiceStatus::Unhealthy);
        assert!(check.apply(&down(), Duration::ZERO).is_none());
        assert!(check.apply(&ProbeOutcome::Up, Duration::ZERO).is_none());

        let change = check.apply(&ProbeOutcome::Up, Duration::ZERO).unwrap();
        assert_eq!(change.current, ServiceStatus::Healthy);
    }

    #[test]
    fn test_repeated_outcomes_do_not_refire() {
        let check = noop_check(config(1, 1));
        assert!(check.apply(&ProbeOutcome::Up, Duration::ZERO).is_some());
        assert!(check.apply(&ProbeOutcome::Up, Duration::ZERO).is_none());
        assert!(check.apply(&ProbeOutcome::Up, Duration::ZERO).is_none());
    }

    #[test]
    fn test_degraded_applies_immediately() {
        let check = noop_check(config(3, 2));
        check.apply(&ProbeOutcome::Up, Duration::ZERO);
        check.apply(&ProbeOutcome::Up, Duration::ZERO);
        assert_eq!(check.status(), ServiceStatus::Healthy);

        let change = check
            .apply(&ProbeOutcome::Degraded("slow".to_string()), Duration::from_secs(2))
            .unwrap();
        assert_eq!(change.current, ServiceStatus::Degraded);

        let report = check.report();
        assert_eq!(report.consecutive_successes, 0);
        assert_eq!(report.total_failures, 0);
        assert_eq!(report.last_latency_ms, Some(2000));

        // Recovery still needs the full success streak
        assert!(check.apply(&ProbeOutcome::Up, Duration::ZERO).is_none());
        assert_eq!(
            check.apply(&ProbeOutcome::Up, Duration::ZERO).unwrap().current,
            ServiceStatus::Healthy
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_failure() {
        let check = check_with(config(1, 1), || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ProbeOutcome::Up)
        });

        let change = check.run_probe().await.unwrap();
        assert_eq!(change.current, ServiceStatus::Unhealthy);
        assert_eq!(
            check.report().last_error.as_deref(),
            Some("probe timed out after 1000ms")
        );
    }

    #[tokio::test]
    async fn test_probe_error_and_panic_count_as_failures() {
        let failing = check_with(config(1, 1), || async {
            Err::<ProbeOutcome, _>(Error::connection("connection reset"))
        });
        assert_eq!(
            failing.run_probe().await.unwrap().current,
            ServiceStatus::Unhealthy
        );

        let panicking = check_with(config(1, 1), || async {
            if true {
                panic!("probe bug");
            }
            Ok(ProbeOutcome::Up)
        });
        let change = panicking.run_probe().await.unwrap();
        assert_eq!(change.current, ServiceStatus::Unhealthy);
        assert_eq!(
            change.reason.as_deref(),
            Some("probe panicked: probe bug")
        );
    }
}
