//! Database-level health monitoring.
//!
//! Complements the process monitor with store-side gauges: pool
//! occupancy, connectivity latency, long-running transactions, and lock
//! contention. Every probe is best-effort — a failed query degrades the
//! snapshot, never the caller. The connectivity probe runs under a
//! circuit breaker so a store that is down is not hammered on every
//! collection pass.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::{debug, error};

use super::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitStatus};
use crate::error::CoreError;

/// Connection-pool occupancy.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolGauges {
    pub total_connections: u32,
    pub idle_connections: u32,
    pub active_connections: u32,
    pub usage_percentage: f64,
}

/// One collected snapshot of database health.
#[derive(Debug, Clone, Serialize)]
pub struct DbHealthSnapshot {
    pub collected_at: DateTime<Utc>,
    pub reachable: bool,
    /// `SELECT 1` round trip; pinned high when unreachable.
    pub response_time_ms: f64,
    /// Active statements older than five minutes.
    pub long_running_transactions: i64,
    /// Ungranted locks.
    pub blocked_queries: i64,
    pub pool: PoolGauges,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DbStatus {
    Good,
    Degraded,
    Critical,
}

/// Threshold verdict over a snapshot, with human-readable findings.
#[derive(Debug, Clone, Serialize)]
pub struct DbAssessment {
    pub status: DbStatus,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

const POOL_USAGE_WARN_PCT: f64 = 90.0;
const RESPONSE_TIME_WARN_MS: f64 = 500.0;
const LONG_TXN_WARN: i64 = 1;
const UNREACHABLE_RESPONSE_MS: f64 = 9999.0;

pub struct DbMonitor {
    pool: PgPool,
    probe_breaker: CircuitBreaker,
}

impl DbMonitor {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            probe_breaker: CircuitBreaker::new(
                "db_health_probe",
                CircuitBreakerConfig {
                    failure_threshold: 3,
                    recovery_timeout: Duration::from_secs(30),
                    success_threshold: 1,
                    call_timeout: Duration::from_secs(5),
                },
            ),
        }
    }

    pub fn pool_gauges(&self) -> PoolGauges {
        let total = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        let active = total.saturating_sub(idle);
        PoolGauges {
            total_connections: total,
            idle_connections: idle,
            active_connections: active,
            usage_percentage: if total > 0 {
                f64::from(active) / f64::from(total) * 100.0
            } else {
                0.0
            },
        }
    }

    /// Collect one snapshot. Individual probe failures zero their gauge
    /// and are logged; only reachability itself is reflected back.
    ///
    /// While the probe circuit is open the snapshot reports unreachable
    /// without touching the store, and the contention gauges are skipped.
    pub async fn collect(&self) -> DbHealthSnapshot {
        let started = std::time::Instant::now();
        let probe = self
            .probe_breaker
            .call(|| async {
                sqlx::query("SELECT 1")
                    .fetch_one(&self.pool)
                    .await
                    .map(|_| ())
                    .map_err(CoreError::from_sqlx)
            })
            .await;
        let reachable = match probe {
            Ok(()) => true,
            Err(CoreError::TransientRemote(msg)) => {
                debug!(%msg, "health probe rejected by open circuit");
                false
            }
            Err(e) => {
                error!(error = %e, "database health probe failed");
                false
            }
        };
        let response_time_ms = if reachable {
            started.elapsed().as_secs_f64() * 1000.0
        } else {
            UNREACHABLE_RESPONSE_MS
        };

        let (long_running_transactions, blocked_queries) = if reachable {
            (
                self.count_query(
                    "SELECT COUNT(*) FROM pg_stat_activity \
                     WHERE state = 'active' AND query_start < NOW() - INTERVAL '5 minutes'",
                )
                .await,
                self.count_query("SELECT COUNT(*) FROM pg_locks WHERE NOT granted")
                    .await,
            )
        } else {
            (0, 0)
        };

        DbHealthSnapshot {
            collected_at: Utc::now(),
            reachable,
            response_time_ms,
            long_running_transactions,
            blocked_queries,
            pool: self.pool_gauges(),
        }
    }

    async fn count_query(&self, sql: &str) -> i64 {
        match sqlx::query(sql).fetch_one(&self.pool).await {
            Ok(row) => row.try_get::<i64, _>(0).unwrap_or(0),
            Err(e) => {
                debug!(error = %e, "db gauge query failed");
                0
            }
        }
    }

    /// Collect and assess in one call.
    pub async fn health_report(&self) -> (DbHealthSnapshot, DbAssessment) {
        let snapshot = self.collect().await;
        let assessment = assess(&snapshot);
        (snapshot, assessment)
    }

    /// State of the probe circuit, for dashboards.
    pub fn breaker_status(&self) -> CircuitStatus {
        self.probe_breaker.status()
    }
}

/// Classify a snapshot against the built-in thresholds.
pub fn assess(snapshot: &DbHealthSnapshot) -> DbAssessment {
    let mut issues = Vec::new();
    let mut recommendations = Vec::new();
    let mut status = DbStatus::Good;

    let mut degrade = |status: &mut DbStatus| {
        if *status == DbStatus::Good {
            *status = DbStatus::Degraded;
        }
    };

    if !snapshot.reachable {
        status = DbStatus::Critical;
        issues.push("database is unreachable".to_string());
        recommendations
            .push("verify the database server and network path are up".to_string());
    }

    if snapshot.pool.usage_percentage > POOL_USAGE_WARN_PCT {
        degrade(&mut status);
        issues.push(format!(
            "connection pool at {:.1}% of capacity",
            snapshot.pool.usage_percentage
        ));
        recommendations.push(
            "raise max_connections or hunt for leaked connections".to_string(),
        );
    }

    if snapshot.reachable && snapshot.response_time_ms > RESPONSE_TIME_WARN_MS {
        degrade(&mut status);
        issues.push(format!(
            "health probe took {:.0}ms",
            snapshot.response_time_ms
        ));
        recommendations.push("inspect server load and slow queries".to_string());
    }

    if snapshot.long_running_transactions >= LONG_TXN_WARN {
        degrade(&mut status);
        issues.push(format!(
            "{} transaction(s) active for over five minutes",
            snapshot.long_running_transactions
        ));
        recommendations
            .push("find and terminate stuck transactions in pg_stat_activity".to_string());
    }

    if snapshot.blocked_queries > 0 {
        degrade(&mut status);
        issues.push(format!(
            "{} query(ies) waiting on ungranted locks",
            snapshot.blocked_queries
        ));
        recommendations.push("check pg_locks for lock ordering conflicts".to_string());
    }

    DbAssessment {
        status,
        issues,
        recommendations,
    }
}
