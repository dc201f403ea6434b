//! Coordination-core daemon: wires the components together and runs them
//! until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use helmsman::balance::{BalanceManager, BalanceManagerConfig};
use helmsman::db::{self, TransactionManager};
use helmsman::dedup::SignalDeduplicator;
use helmsman::kv::KvStore;
use helmsman::monitor::{MonitorConfig, ProcessMonitor};
use helmsman::ratelimit::VenueRateLimiter;
use helmsman::workers::{CoordinatorConfig, WorkerCoordinator};
use helmsman::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting coordination core");

    let kv = match &config.redis_url {
        Some(url) => match KvStore::connect(url).await {
            Ok(kv) => {
                info!("connected KV shadow store");
                Some(kv)
            }
            Err(e) => {
                warn!(error = %e, "KV store unavailable, running without shadow");
                None
            }
        },
        None => None,
    };

    let pool = match &config.database_url {
        Some(url) => Some(
            db::connect_pool(url, config.max_db_connections)
                .await
                .context("connecting to Postgres")?,
        ),
        None => {
            warn!("DATABASE_URL not set, persistence disabled");
            None
        }
    };

    // Held for the daemon's lifetime; venue callers acquire through it.
    let _rate_limiter = Arc::new(VenueRateLimiter::new(kv.clone()));

    let dedup = Arc::new(SignalDeduplicator::new(
        pool.clone(),
        kv.clone(),
        config.dedup_ttl,
        config.dedup_cache_max,
    ));
    dedup.start();

    // Venue clients are injected by the host application; the daemon run
    // starts with an empty set and still sweeps reservations.
    let balances = Arc::new(BalanceManager::new(
        BalanceManagerConfig {
            update_interval: config.balance_update_interval,
            stale_after: config.balance_stale_after,
            fail_closed: config.balance_fail_closed,
            reservation_ttl: config.reservation_ttl,
            ..Default::default()
        },
        Vec::new(),
        kv.clone(),
    ));
    balances.start();

    let coordinator = Arc::new(WorkerCoordinator::new(CoordinatorConfig {
        heartbeat_timeout: config.worker_heartbeat_timeout,
        cleanup_interval: config.worker_cleanup_interval,
    }));
    coordinator.start();

    let monitor = Arc::new(ProcessMonitor::new(
        MonitorConfig {
            monitoring_interval: config.monitoring_interval,
            heartbeat_timeout: config.monitor_heartbeat_timeout,
            disk_path: config.monitor_disk_path.clone(),
        },
        pool.clone(),
        kv.clone(),
    ));
    monitor.start();
    monitor.register_component("coordination_core", None);

    let transactions = pool.clone().map(|pool| Arc::new(TransactionManager::new(pool)));
    if transactions.is_some() {
        info!("transaction orchestrator ready");
    }

    info!("coordination core running, ctrl-c to stop");
    let mut heartbeat = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = heartbeat.tick() => {
                monitor
                    .heartbeat("coordination_core", None, None, None)
                    .await;
            }
        }
    }

    info!("shutting down");
    monitor.stop().await;
    coordinator.stop().await;
    balances.stop().await;
    dedup.stop().await;
    if let Some(pool) = pool {
        pool.close().await;
    }
    info!("shutdown complete");

    Ok(())
}
