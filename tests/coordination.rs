//! End-to-end coordination flow, all in-process.
//!
//! Walks one trading iteration the way the engine drives it: claim the
//! worker slot, check the signal for freshness, reserve funds, pass the
//! rate limiter, then settle. No external services are involved — every
//! component runs in its local-only mode.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;

use helmsman::balance::{BalanceManager, BalanceManagerConfig};
use helmsman::dedup::{SignalDeduplicator, SignalEvent};
use helmsman::monitor::{HealthStatus, MonitorConfig, ProcessMonitor};
use helmsman::ratelimit::{RateLimit, VenueLimits, VenueRateLimiter};
use helmsman::workers::{CoordinatorConfig, WorkerCoordinator, WorkerState};

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn signal(price: f64) -> SignalEvent {
    SignalEvent {
        symbol: "BTCUSDT".into(),
        direction: "BUY".into(),
        strategy: "momentum".into(),
        timestamp: Utc::now(),
        strength: Some(0.82),
        price_level: Some(price),
        metadata: None,
    }
}

#[tokio::test]
async fn one_trading_iteration_passes_every_gate_once() {
    // Wiring, local-only.
    let coordinator = WorkerCoordinator::new(CoordinatorConfig::default());
    let dedup = SignalDeduplicator::new(None, None, Duration::from_secs(300), 10_000);
    let balances = BalanceManager::new(BalanceManagerConfig::default(), Vec::new(), None);
    let limiter = {
        let mut limits = HashMap::new();
        limits.insert(
            "bybit".to_string(),
            VenueLimits::new("bybit", RateLimit::new(100, 1000, 10))
                .endpoint("order", RateLimit::new(100, 1000, 10)),
        );
        VenueRateLimiter::with_limits(limits, None)
    };
    let monitor = ProcessMonitor::new(MonitorConfig::default(), None, None);

    balances
        .update_balance("bybit", "USDT", dec("5000"), dec("5000"), Decimal::ZERO)
        .await;

    // The engine claims its singleton slot; a second instance is refused.
    let engine = coordinator
        .register("trading_engine", None, None)
        .expect("engine slot");
    assert!(coordinator.register("trading_engine", None, None).is_none());
    coordinator.heartbeat(&engine, Some(WorkerState::Running), None, None, None);
    monitor
        .heartbeat("trading_engine", Some(HealthStatus::Healthy), Some(1), None)
        .await;

    // Gate 1: the candidate signal is fresh.
    assert!(dedup.check_and_register(&signal(50_000.0)).await);

    // Gate 2: funds are held for the order.
    let hold = balances
        .reserve("bybit", "USDT", dec("1500"), "order", None, None)
        .await
        .expect("reservation");

    // Gate 3: permission to hit the venue.
    let delay = limiter.acquire("bybit", "order", None).await;
    assert_eq!(delay, 0.0);

    // (The order goes out through an external client here.)

    // Settlement: release the hold, mark the iteration's task done.
    assert_eq!(
        coordinator.assign_task("iteration-1", "trading_engine"),
        Some(engine.clone())
    );
    assert!(coordinator.complete_task("iteration-1", &engine));
    assert!(balances.release(&hold).await);

    // A replay of the same signal inside the TTL window is refused at the
    // first gate; funds and the rate budget are untouched by it.
    assert!(!dedup.check_and_register(&signal(50_000.0)).await);

    let summary = balances.balance_summary();
    assert_eq!(summary.total_reservations, 0);
    assert_eq!(summary.stats.successful_reservations, 1);

    let stats = dedup.stats();
    assert_eq!(stats.counters.unique_signals, 1);
    assert_eq!(stats.counters.duplicates_found, 1);
}

#[tokio::test]
async fn oversized_order_is_stopped_before_the_venue_is_touched() {
    let dedup = SignalDeduplicator::new(None, None, Duration::from_secs(300), 10_000);
    let balances = BalanceManager::new(BalanceManagerConfig::default(), Vec::new(), None);
    let limiter = VenueRateLimiter::new(None);

    balances
        .update_balance("bybit", "USDT", dec("100"), dec("100"), Decimal::ZERO)
        .await;

    assert!(dedup.check_and_register(&signal(49_500.0)).await);

    // The balance gate refuses; the caller never reaches the rate limiter,
    // so the venue's request budget stays untouched.
    let hold = balances
        .reserve("bybit", "USDT", dec("1500"), "order", None, None)
        .await;
    assert!(hold.is_none());
    assert!(limiter.stats(Some("bybit")).is_empty());
}

#[tokio::test]
async fn components_start_and_stop_cleanly_together() {
    let coordinator = Arc::new(WorkerCoordinator::new(CoordinatorConfig::default()));
    let dedup = Arc::new(SignalDeduplicator::new(
        None,
        None,
        Duration::from_secs(300),
        10_000,
    ));
    let balances = Arc::new(BalanceManager::new(
        BalanceManagerConfig::default(),
        Vec::new(),
        None,
    ));
    let monitor = Arc::new(ProcessMonitor::new(MonitorConfig::default(), None, None));

    coordinator.start();
    dedup.start();
    balances.start();
    monitor.start();

    // Stop in reverse order; a second stop is a warning, not an error.
    monitor.stop().await;
    balances.stop().await;
    dedup.stop().await;
    coordinator.stop().await;

    monitor.stop().await;
    balances.stop().await;
    dedup.stop().await;
    coordinator.stop().await;
}
