//! Resilience core for calls to unreliable external dependencies
//!
//! Protects exchange endpoints, cache backends and other remote services
//! from cascading failure.
//!
//! # Features
//!
//! - **Circuit breakers**: per-dependency fast-fail state machines
//! - **Retries**: fixed, linear or exponential backoff with jitter
//! - **Connection pools**: bounded, FIFO-fair, per-host capped sessions
//! - **Health checks**: debounced background probes with status listeners
//! - **Adapters**: breaker → retry → timeout → fallback composition
//!
//! Everything is reached through a [`ResilienceRegistry`] built once per
//! process from a loaded [`config::Config`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod health;
pub mod pool;
pub mod registry;

pub use error::{Error, Result};
pub use registry::{RegistrySnapshot, ResilienceRegistry};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns [`Error::Internal`] if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
