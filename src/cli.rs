//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::humantime_serde::parse_duration;

/// Circuit breakers, retries, pools and health checks for external dependencies
#[derive(Parser, Debug)]
#[command(name = "resilience-core")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "RESILIENCE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "RESILIENCE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "RESILIENCE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to watch mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate and print the effective configuration
    Config {
        /// Print one dependency with defaults applied
        #[arg(short, long)]
        dependency: Option<String>,
    },

    /// Probe every configured dependency once and print the reports
    Check {
        /// Exit non-zero unless every dependency is healthy
        #[arg(long)]
        strict: bool,
    },

    /// Run scheduled health checks until interrupted (default)
    Watch {
        /// Log a status snapshot at this interval (e.g. "30s", "5m")
        #[arg(long, value_parser = parse_interval)]
        report_every: Option<Duration>,
    },
}

fn parse_interval(s: &str) -> Result<Duration, String> {
    let interval = parse_duration(s).map_err(|e| format!("invalid duration '{s}': {e}"))?;
    if interval.is_zero() {
        return Err("interval must be greater than zero".to_string());
    }
    Ok(interval)
}
