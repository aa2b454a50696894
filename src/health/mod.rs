//! Dependency health surveillance
//!
//! Each [`HealthCheck`] owns a probe and a debounced status: a dependency is
//! only marked UNHEALTHY after `consecutive_failures` failed probes and only
//! recovers to HEALTHY after `consecutive_successes` good ones. The
//! [`HealthCheckService`] schedules probes in the background, answers
//! on-demand checks and notifies listeners on every status transition.

mod check;
mod http;
mod service;

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use check::{HealthCheck, HealthReport};
pub use http::HttpProbe;
pub use service::{HealthCheckService, StatusListener};

use crate::Result;

/// Dependency status, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Probes are passing
    Healthy,
    /// Not enough probes yet to decide
    Unknown,
    /// Reachable but impaired
    Degraded,
    /// Probes are failing
    Unhealthy,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Unknown => "unknown",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        })
    }
}

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Dependency answered correctly
    Up,
    /// Dependency answered, but something is off
    Degraded(String),
    /// Dependency did not answer correctly
    Down(String),
}

/// A status transition, delivered to listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    /// Check name
    pub name: String,
    /// Status before the transition
    pub previous: ServiceStatus,
    /// Status after the transition
    pub current: ServiceStatus,
    /// Failure or degradation reason, if any
    pub reason: Option<String>,
    /// When the transition happened
    pub at: DateTime<Utc>,
}

/// Something that can tell whether a dependency is usable.
///
/// Returning `Err` is equivalent to [`ProbeOutcome::Down`].
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe the dependency once
    async fn probe(&self) -> Result<ProbeOutcome>;
}

/// Adapts an async closure into a [`HealthProbe`]
pub struct FnProbe<F> {
    probe: F,
}

impl<F> FnProbe<F> {
    /// Wrap `probe`
    pub fn new(probe: F) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<ProbeOutcome>> + Send,
{
    async fn probe(&self) -> Result<ProbeOutcome> {
        (self.probe)().await
    }
}
