//! Application configuration loaded from the environment.

use std::time::Duration;

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

/// Configuration for the coordination core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string. Components that persist state accept
    /// running without it (local-only mode).
    pub database_url: Option<String>,
    /// Redis connection string for the shadow store.
    pub redis_url: Option<String>,
    /// Max pooled Postgres connections.
    pub max_db_connections: u32,

    /// Cadence of per-venue balance refresh.
    pub balance_update_interval: Duration,
    /// Age beyond which a cached balance counts as stale.
    pub balance_stale_after: Duration,
    /// Reject availability checks against stale balances.
    pub balance_fail_closed: bool,
    /// Default reservation lifetime.
    pub reservation_ttl: Duration,

    /// Dedup fingerprint TTL.
    pub dedup_ttl: Duration,
    /// In-process fingerprint cache cap.
    pub dedup_cache_max: usize,

    /// Worker heartbeat liveness window.
    pub worker_heartbeat_timeout: Duration,
    /// Dead-worker sweep cadence.
    pub worker_cleanup_interval: Duration,

    /// Component heartbeat liveness window (process monitor).
    pub monitor_heartbeat_timeout: Duration,
    /// System metrics sampling cadence.
    pub monitoring_interval: Duration,
    /// Preferred mount for disk usage sampling.
    pub monitor_disk_path: String,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            redis_url: std::env::var("REDIS_URL").ok(),
            max_db_connections: env_u64("MAX_DB_CONNECTIONS", 10) as u32,

            balance_update_interval: Duration::from_secs(env_u64(
                "BALANCE_UPDATE_INTERVAL_SECS",
                30,
            )),
            balance_stale_after: Duration::from_secs(env_u64("BALANCE_STALE_AFTER_SECS", 300)),
            balance_fail_closed: env_bool("BALANCE_FAIL_CLOSED", false),
            reservation_ttl: Duration::from_secs(env_u64("RESERVATION_TTL_SECS", 300)),

            dedup_ttl: Duration::from_secs(env_u64("DEDUP_TTL_SECS", 300)),
            dedup_cache_max: env_u64("DEDUP_CACHE_MAX", 10_000) as usize,

            worker_heartbeat_timeout: Duration::from_secs(env_u64(
                "HEARTBEAT_TIMEOUT_SECS",
                120,
            )),
            worker_cleanup_interval: Duration::from_secs(env_u64(
                "WORKER_CLEANUP_INTERVAL_SECS",
                60,
            )),

            monitor_heartbeat_timeout: Duration::from_secs(env_u64(
                "MONITOR_HEARTBEAT_TIMEOUT_SECS",
                300,
            )),
            monitoring_interval: Duration::from_secs(env_u64("MONITORING_INTERVAL_SECS", 30)),
            monitor_disk_path: std::env::var("MONITOR_DISK_PATH").unwrap_or_else(|_| "/".into()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            max_db_connections: 10,
            balance_update_interval: Duration::from_secs(30),
            balance_stale_after: Duration::from_secs(300),
            balance_fail_closed: false,
            reservation_ttl: Duration::from_secs(300),
            dedup_ttl: Duration::from_secs(300),
            dedup_cache_max: 10_000,
            worker_heartbeat_timeout: Duration::from_secs(120),
            worker_cleanup_interval: Duration::from_secs(60),
            monitor_heartbeat_timeout: Duration::from_secs(300),
            monitoring_interval: Duration::from_secs(30),
            monitor_disk_path: "/".into(),
        }
    }
}
