//! Adapter integration tests - breaker, retry and fallback composition end to end

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use resilience_core::adapter::ExchangeClient;
use resilience_core::config::{
    BackoffStrategy, CircuitBreakerConfig, Config, DependencyConfig, RetryConfig, TimeoutConfig,
};
use resilience_core::failsafe::CircuitState;
use resilience_core::health::ServiceStatus;
use resilience_core::{Error, ResilienceRegistry, Result};
use serde_json::{Value, json};

fn registry(failure_threshold: u32, max_attempts: u32) -> ResilienceRegistry {
    let dependency = DependencyConfig {
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold,
            success_threshold: 1,
            timeout: Duration::from_secs(30),
            ..CircuitBreakerConfig::default()
        },
        retry: RetryConfig {
            max_attempts,
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            jitter: true,
            ..RetryConfig::default()
        },
        timeouts: TimeoutConfig {
            attempt: Some(Duration::from_secs(2)),
            deadline: Some(Duration::from_secs(10)),
        },
        ..DependencyConfig::default()
    };
    ResilienceRegistry::new(Config {
        dependencies: HashMap::from([("binance".to_string(), dependency)]),
        ..Config::default()
    })
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_operation_trips_breaker_after_two_calls() {
    let registry = registry(3, 2);
    let adapter = registry.adapter("binance");
    let invocations = Arc::new(AtomicU32::new(0));

    for _ in 0..2 {
        let counter = Arc::clone(&invocations);
        let result: Result<Value> = adapter
            .call(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::connection("connection refused")) }
            })
            .await;
        assert!(matches!(result, Err(Error::RetryExhausted { .. })));
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
    assert_eq!(registry.circuit_breaker("binance").state(), CircuitState::Open);

    let counter = Arc::clone(&invocations);
    let result: Result<Value> = adapter
        .call(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(json!({})) }
        })
        .await;
    assert!(matches!(result, Err(Error::CircuitOpen { .. })));
    assert_eq!(invocations.load(Ordering::SeqCst), 4);

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.circuit_breakers[0].total_trips, 1);
    assert_eq!(snapshot.retry_policies[0].exhaustions, 2);
    assert_eq!(snapshot.adapters[0].short_circuits, 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_rescues_transient_failure_without_tripping() {
    let registry = registry(2, 3);
    let adapter = registry.adapter("binance");
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&attempts);
    let value = adapter
        .call(move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(Error::Transient("rate limited (429)".to_string()))
                } else {
                    Ok("filled")
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(value, "filled");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(adapter.breaker().state(), CircuitState::Closed);
    assert_eq!(adapter.breaker().metrics().current_failure_count, 0);
    assert_eq!(registry.retry_policy("binance").metrics().successes_after_retry, 1);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_recovers_after_timeout() {
    let registry = registry(1, 1);
    let adapter = registry.adapter("binance");

    let result: Result<()> = adapter
        .call(|| async { Err(Error::Timeout(Duration::from_secs(2))) })
        .await;
    assert!(result.is_err());
    assert_eq!(adapter.breaker().state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(30)).await;

    adapter.call(|| async { Ok(()) }).await.unwrap();
    assert_eq!(adapter.breaker().state(), CircuitState::Closed);
}

struct Exchange {
    down: AtomicBool,
}

#[async_trait]
impl ExchangeClient for Exchange {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Value> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::connection("api.binance.com: connection refused"));
        }
        Ok(json!({"symbol": symbol, "price": "3120.55"}))
    }

    async fn fetch_order_book(&self, symbol: &str, depth: u32) -> Result<Value> {
        Ok(json!({"symbol": symbol, "depth": depth}))
    }

    async fn ping(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(Error::connection("api.binance.com: connection refused"))
        } else {
            Ok(())
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_exchange_adapter_degrades_to_last_known_good() {
    let registry = registry(2, 2);
    let client = Arc::new(Exchange {
        down: AtomicBool::new(false),
    });
    let exchange = registry.exchange_adapter("binance", Arc::clone(&client) as Arc<dyn ExchangeClient>);
    registry.register_health_check("binance", exchange.health_probe());

    let fresh = exchange.fetch_ticker("ETH-USDT").await.unwrap();
    registry.health().check_health("binance").await.unwrap();

    client.down.store(true, Ordering::SeqCst);
    let degraded = exchange.fetch_ticker("ETH-USDT").await.unwrap();
    assert_eq!(degraded, fresh);
    assert_eq!(exchange.adapter().breaker().state(), CircuitState::Open);
    assert_eq!(registry.adapter("binance").metrics().fallbacks, 1);

    // The health probe bypasses the open breaker and sees the outage
    for _ in 0..3 {
        registry.health().check_health("binance").await.unwrap();
    }
    assert_eq!(registry.health().status("binance"), Some(ServiceStatus::Unhealthy));
}
