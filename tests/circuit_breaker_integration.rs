//! Circuit breaker integration tests - per-dependency configuration and call path

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use resilience_core::Error;
use resilience_core::config::CircuitBreakerConfig;
use resilience_core::failsafe::{CircuitBreaker, CircuitState};

fn config(failure_threshold: u32, success_threshold: u32, timeout: Duration) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        name: String::new(),
        enabled: true,
        failure_threshold,
        success_threshold,
        timeout,
    }
}

#[test]
fn test_circuit_breaker_with_custom_config() {
    // Stricter configuration
    let cb = CircuitBreaker::new("kraken", &config(3, 4, Duration::from_secs(60)));

    // Should open after 3 failures (not default 5)
    for _ in 0..2 {
        cb.record_failure();
    }
    assert!(cb.can_proceed());

    cb.record_failure(); // Third failure
    assert!(!cb.can_proceed());
}

#[test]
fn test_circuit_breaker_with_lenient_config() {
    // More lenient configuration for flaky dependencies
    let cb = CircuitBreaker::new("flaky-exchange", &config(10, 2, Duration::from_secs(30)));

    for _ in 0..5 {
        cb.record_failure();
    }
    assert!(cb.can_proceed());

    for _ in 0..5 {
        cb.record_failure();
    }
    assert!(!cb.can_proceed());
}

#[test]
fn test_status_message_format() {
    let cb = CircuitBreaker::new("binance", &config(3, 2, Duration::from_secs(30)));

    let message = cb.status_message();
    assert!(message.contains("binance"));
    assert!(message.contains("closed"));

    for _ in 0..3 {
        cb.record_failure();
    }
    let message = cb.status_message();
    assert!(message.contains("Dependency 'binance'"));
    assert!(message.contains("circuit breaker is open"));
    assert!(message.contains("3 failures"));
    assert!(message.contains("retry in"));
    assert!(message.contains("seconds"));
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_fails_fast_until_timeout() {
    let cb = CircuitBreaker::new("coinbase", &config(2, 1, Duration::from_secs(10)));
    let invocations = AtomicU32::new(0);

    for _ in 0..2 {
        let result: Result<(), Error> = cb
            .call(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err(Error::connection("connection reset"))
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(cb.state(), CircuitState::Open);

    for _ in 0..5 {
        let result = cb
            .call(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(cb.metrics().rejected_calls, 5);

    tokio::time::advance(Duration::from_secs(10)).await;

    let value = cb.call(|| async { Ok(5) }).await.unwrap();
    assert_eq!(value, 5);
    assert_eq!(cb.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_half_open_calls_all_pass() {
    let cb = Arc::new(CircuitBreaker::new("bybit", &config(1, 3, Duration::from_secs(1))));
    cb.record_failure();
    tokio::time::advance(Duration::from_secs(1)).await;

    let mut handles = Vec::new();
    for _ in 0..3 {
        let cb = Arc::clone(&cb);
        handles.push(tokio::spawn(async move {
            cb.call(|| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, Error>(())
            })
            .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.metrics().total_trips, 1);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_failure_reopens() {
    let cb = CircuitBreaker::new("okx", &config(1, 2, Duration::from_secs(5)));
    cb.record_failure();
    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(cb.metrics().state, CircuitState::Open);
    assert!(cb.can_proceed());
    assert_eq!(cb.state(), CircuitState::HalfOpen);

    cb.call(|| async { Ok::<_, Error>(()) }).await.unwrap();
    let result: Result<(), Error> = cb.call(|| async { Err(Error::Timeout(Duration::from_secs(1))) }).await;
    assert!(result.is_err());

    let metrics = cb.metrics();
    assert_eq!(metrics.state, CircuitState::Open);
    assert_eq!(metrics.total_trips, 2);
    assert_eq!(metrics.current_success_count, 0);
}
