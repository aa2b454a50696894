//! resilience-core - run and inspect dependency health checks

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use resilience_core::{
    ResilienceRegistry,
    cli::{Cli, Command},
    config::Config,
    health::ServiceStatus,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Some(Command::Config { ref dependency }) => run_config(&cli, dependency.as_deref()),
        Some(Command::Check { strict }) => run_check(&cli, strict).await,
        Some(Command::Watch { report_every }) => run_watch(&cli, report_every).await,
        None => run_watch(&cli, None).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    Config::load(cli.config.as_deref()).context("Failed to load configuration")
}

/// Print the effective configuration
fn run_config(cli: &Cli, dependency: Option<&str>) -> anyhow::Result<ExitCode> {
    let config = load_config(cli)?;
    let yaml = match dependency {
        Some(name) => serde_yaml::to_string(&config.dependency(name)),
        None => serde_yaml::to_string(&config),
    }
    .context("Failed to render configuration")?;

    println!("{yaml}");
    Ok(ExitCode::SUCCESS)
}

/// Probe every configured dependency once
async fn run_check(cli: &Cli, strict: bool) -> anyhow::Result<ExitCode> {
    let registry = ResilienceRegistry::new(load_config(cli)?);
    let count = registry
        .register_configured_probes()
        .context("Failed to build health probes")?;
    if count == 0 {
        warn!("No dependency has a probe configured");
    }

    let reports = registry.health().check_all().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&reports).context("Failed to serialize reports")?
    );

    let unhealthy = reports.iter().any(|r| {
        if strict {
            r.status != ServiceStatus::Healthy
        } else {
            r.status == ServiceStatus::Unhealthy
        }
    });
    registry.shutdown();

    Ok(if unhealthy {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Run scheduled health checks until Ctrl-C
async fn run_watch(cli: &Cli, report_every: Option<Duration>) -> anyhow::Result<ExitCode> {
    let config = load_config(cli)?;
    let health_enabled = config.health.enabled;
    let registry = Arc::new(ResilienceRegistry::new(config));

    let count = registry
        .register_configured_probes()
        .context("Failed to build health probes")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        dependencies = registry.config().dependencies.len(),
        probes = count,
        "Starting resilience watch"
    );

    registry.health().add_status_listener(|change| {
        info!(
            check = %change.name,
            from = %change.previous,
            to = %change.current,
            "Status transition"
        );
    });

    if health_enabled {
        registry.health().start();
    } else {
        warn!("Scheduled health checks are disabled");
    }
    let maintenance = registry.pools().spawn_maintenance(Duration::from_secs(30));

    let reporter = report_every.map(|interval| {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match serde_json::to_string(&registry.snapshot()) {
                    Ok(snapshot) => info!(%snapshot, "Resilience snapshot"),
                    Err(e) => warn!("Failed to serialize snapshot: {e}"),
                }
            }
        })
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    maintenance.abort();
    if let Some(reporter) = reporter {
        reporter.abort();
    }
    let overall = registry.health().get_overall_status();
    registry.shutdown();

    info!(status = %overall, "Watch stopped");
    Ok(ExitCode::SUCCESS)
}
