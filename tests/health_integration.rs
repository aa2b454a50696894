//! Health check service integration tests - debouncing, listeners and scheduling

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use resilience_core::Error;
use resilience_core::config::HealthCheckConfig;
use resilience_core::health::{
    FnProbe, HealthCheck, HealthCheckService, ProbeOutcome, ServiceStatus, StatusChange,
};

fn check_config(name: &str, failures: u32, successes: u32) -> HealthCheckConfig {
    HealthCheckConfig {
        name: name.to_string(),
        enabled: true,
        interval: Duration::from_secs(5),
        timeout: Duration::from_secs(1),
        consecutive_failures: failures,
        consecutive_successes: successes,
    }
}

fn toggled_check(name: &str, up: Arc<AtomicBool>, failures: u32, successes: u32) -> HealthCheck {
    HealthCheck::new(
        check_config(name, failures, successes),
        Arc::new(FnProbe::new(move || {
            let up = up.load(Ordering::SeqCst);
            async move {
                if up {
                    Ok(ProbeOutcome::Up)
                } else {
                    Err(Error::connection("no route to host"))
                }
            }
        })),
    )
}

#[tokio::test]
async fn test_probe_sequence_fires_exactly_two_notifications() {
    let service = HealthCheckService::new();
    let script = Arc::new(Mutex::new(VecDeque::from([false, false, true, true])));
    service.register_health_check(HealthCheck::new(
        check_config("coinbase", 2, 2),
        Arc::new(FnProbe::new(move || {
            let up = script.lock().pop_front().unwrap_or(true);
            async move {
                Ok(if up {
                    ProbeOutcome::Up
                } else {
                    ProbeOutcome::Down("HTTP 502 Bad Gateway".to_string())
                })
            }
        })),
    ));

    let changes: Arc<Mutex<Vec<StatusChange>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);
    service.add_status_listener(move |change| sink.lock().push(change.clone()));

    for _ in 0..4 {
        service.check_health("coinbase").await.unwrap();
    }

    let changes = changes.lock();
    assert_eq!(changes.len(), 2);
    assert_eq!(
        (changes[0].previous, changes[0].current),
        (ServiceStatus::Unknown, ServiceStatus::Unhealthy)
    );
    assert_eq!(changes[0].reason.as_deref(), Some("HTTP 502 Bad Gateway"));
    assert_eq!(
        (changes[1].previous, changes[1].current),
        (ServiceStatus::Unhealthy, ServiceStatus::Healthy)
    );
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_probes_track_recovery() {
    let service = HealthCheckService::new();
    let up = Arc::new(AtomicBool::new(false));
    service.register_health_check(toggled_check("redis", Arc::clone(&up), 2, 2));

    let transitions = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&transitions);
    service.add_status_listener(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    service.start();
    // Probes at 0s and 5s
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(service.get_overall_status(), ServiceStatus::Unhealthy);

    up.store(true, Ordering::SeqCst);
    // Probes at 10s and 15s
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(service.get_overall_status(), ServiceStatus::Healthy);
    assert_eq!(transitions.load(Ordering::SeqCst), 2);

    service.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_failing_dependency_does_not_affect_others() {
    let service = HealthCheckService::new();
    service.register_health_check(toggled_check(
        "binance",
        Arc::new(AtomicBool::new(true)),
        1,
        1,
    ));
    service.register_health_check(HealthCheck::new(
        check_config("kraken", 1, 1),
        Arc::new(FnProbe::new(|| async {
            if true {
                panic!("probe crashed");
            }
            Ok(ProbeOutcome::Up)
        })),
    ));
    service.start();

    tokio::time::sleep(Duration::from_secs(11)).await;

    let reports = service.reports();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].name, "binance");
    assert_eq!(reports[0].status, ServiceStatus::Healthy);
    assert!(reports[0].total_probes >= 3);
    assert_eq!(reports[1].status, ServiceStatus::Unhealthy);
    assert!(reports[1].total_probes >= 3);
    assert_eq!(service.get_overall_status(), ServiceStatus::Unhealthy);

    service.shutdown();
}

#[tokio::test]
async fn test_unregister_removes_from_aggregate() {
    let service = HealthCheckService::new();
    service.register_health_check(toggled_check(
        "bybit",
        Arc::new(AtomicBool::new(false)),
        1,
        1,
    ));
    service.check_health("bybit").await.unwrap();
    assert_eq!(service.get_overall_status(), ServiceStatus::Unhealthy);

    assert!(service.unregister_health_check("bybit"));
    assert!(service.is_empty());
    assert_eq!(service.get_overall_status(), ServiceStatus::Unknown);
    assert!(matches!(
        service.check_health("bybit").await,
        Err(Error::CheckNotFound(_))
    ));
}
