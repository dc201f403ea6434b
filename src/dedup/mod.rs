//! Signal deduplication over a transient event stream.
//!
//! [`SignalDeduplicator::check_and_register`] answers "has an equivalent
//! signal been seen within the TTL window?" exactly once per fingerprint.
//! Lookup escalates local map → KV shadow → durable store; registration
//! goes the other way. On any internal error the signal is treated as
//! fresh — downstream admission (balance, rate limit) stays the final
//! guard.

mod fingerprint;

pub use fingerprint::{SignalEvent, SignalFingerprint};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, Result};
use crate::kv::KvStore;

/// Fraction of the cache dropped when the size cap is exceeded.
const EVICT_FRACTION: f64 = 0.1;

/// Counters kept by the deduplicator. The invariant
/// `total_checks == duplicates_found + unique_signals + error_defaults`
/// holds at every quiescent point.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupStats {
    pub total_checks: u64,
    pub duplicates_found: u64,
    pub unique_signals: u64,
    /// Checks that failed internally and defaulted to "fresh".
    pub error_defaults: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Snapshot of the stats with derived rates, for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct DedupStatsSnapshot {
    #[serde(flatten)]
    pub counters: DedupStats,
    pub local_cache_size: usize,
    pub duplicate_rate: f64,
    pub cache_hit_rate: f64,
}

/// Row shape returned by [`SignalDeduplicator::recent_signals`].
#[derive(Debug, Clone, Serialize)]
pub struct RecentSignal {
    pub fingerprint: String,
    pub symbol: String,
    pub direction: String,
    pub strategy: String,
    pub created_at: DateTime<Utc>,
    pub signal_strength: Option<f64>,
    pub price_level: Option<f64>,
}

pub struct SignalDeduplicator {
    pool: Option<PgPool>,
    kv: Option<KvStore>,
    ttl: Duration,
    cache_max: usize,
    cache: Mutex<HashMap<String, DateTime<Utc>>>,
    stats: Mutex<DedupStats>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalDeduplicator {
    pub fn new(pool: Option<PgPool>, kv: Option<KvStore>, ttl: Duration, cache_max: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            pool,
            kv,
            ttl,
            cache_max,
            cache: Mutex::new(HashMap::new()),
            stats: Mutex::new(DedupStats::default()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// True iff no equivalent signal was seen within the TTL window. The
    /// fingerprint is registered as a side effect, so a second call with an
    /// equivalent signal returns false until the window expires.
    ///
    /// Fails open: internal errors log, bump `error_defaults`, and return
    /// true.
    pub async fn check_and_register(&self, event: &SignalEvent) -> bool {
        self.stats.lock().total_checks += 1;

        let fp = SignalFingerprint::from_event(event);
        let digest = fp.digest();

        match self.check_inner(&fp, &digest, event).await {
            Ok(is_fresh) => is_fresh,
            Err(e) => {
                error!(digest, error = %e, "dedup check failed, defaulting to fresh");
                self.stats.lock().error_defaults += 1;
                true
            }
        }
    }

    async fn check_inner(
        &self,
        fp: &SignalFingerprint,
        digest: &str,
        event: &SignalEvent,
    ) -> Result<bool> {
        if self.seen_in_cache(digest).await {
            let mut stats = self.stats.lock();
            stats.duplicates_found += 1;
            stats.cache_hits += 1;
            debug!(digest, symbol = %fp.symbol, "duplicate signal (cache)");
            return Ok(false);
        }

        if self.seen_in_store(digest).await? {
            {
                let mut stats = self.stats.lock();
                stats.duplicates_found += 1;
                stats.cache_misses += 1;
            }
            debug!(digest, symbol = %fp.symbol, "duplicate signal (store)");
            self.remember(digest).await;
            return Ok(false);
        }

        self.register(fp, digest, event).await?;
        self.stats.lock().unique_signals += 1;
        debug!(digest, symbol = %fp.symbol, "registered unique signal");
        Ok(true)
    }

    /// Local map, then KV shadow. A KV hit is pulled into the local map.
    async fn seen_in_cache(&self, digest: &str) -> bool {
        let now = Utc::now();
        {
            let mut cache = self.cache.lock();
            if let Some(first_seen) = cache.get(digest) {
                let age = (now - *first_seen).to_std().unwrap_or_default();
                if age <= self.ttl {
                    return true;
                }
                cache.remove(digest);
            }
        }

        if let Some(kv) = &self.kv {
            if kv.exists(&format!("signal:{digest}")).await == Some(true) {
                self.cache.lock().insert(digest.to_string(), now);
                return true;
            }
        }

        false
    }

    /// Durable-store lookup, bounded to rows inside the TTL window.
    async fn seen_in_store(&self, digest: &str) -> Result<bool> {
        let Some(pool) = &self.pool else {
            return Ok(false);
        };
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl)
                .map_err(|e| CoreError::InvalidInput(format!("dedup ttl out of range: {e}")))?;

        let row = sqlx::query(
            "SELECT 1 FROM signal_fingerprints \
             WHERE fingerprint = $1 AND created_at >= $2 LIMIT 1",
        )
        .bind(digest)
        .bind(cutoff)
        .fetch_optional(pool)
        .await
        .map_err(CoreError::from_sqlx)?;

        Ok(row.is_some())
    }

    async fn register(
        &self,
        fp: &SignalFingerprint,
        digest: &str,
        event: &SignalEvent,
    ) -> Result<()> {
        if let Some(pool) = &self.pool {
            sqlx::query(
                "INSERT INTO signal_fingerprints \
                 (fingerprint, symbol, direction, strategy, timestamp_minute, \
                  signal_strength, price_level, created_at, metadata) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                 ON CONFLICT (fingerprint) DO NOTHING",
            )
            .bind(digest)
            .bind(&fp.symbol)
            .bind(&fp.direction)
            .bind(&fp.strategy)
            .bind(fp.timestamp_minute)
            .bind(fp.signal_strength)
            .bind(fp.price_level)
            .bind(Utc::now())
            .bind(event.metadata.clone())
            .execute(pool)
            .await
            .map_err(CoreError::from_sqlx)?;
        }

        self.remember(digest).await;
        Ok(())
    }

    /// Cache a fingerprint locally (evicting the oldest tenth when over the
    /// cap) and mirror it to the KV store with the dedup TTL.
    async fn remember(&self, digest: &str) {
        {
            let mut cache = self.cache.lock();
            cache.insert(digest.to_string(), Utc::now());

            if cache.len() > self.cache_max {
                let drop_count = ((self.cache_max as f64 * EVICT_FRACTION) as usize).max(1);
                let mut entries: Vec<(String, DateTime<Utc>)> =
                    cache.iter().map(|(k, v)| (k.clone(), *v)).collect();
                entries.sort_by_key(|(_, seen)| *seen);
                for (key, _) in entries.into_iter().take(drop_count) {
                    cache.remove(&key);
                }
            }
        }

        if let Some(kv) = &self.kv {
            kv.set_ex(
                &format!("signal:{digest}"),
                "1",
                self.ttl.as_secs().max(1) as usize,
            )
            .await;
        }
    }

    /// Signals registered in the last `minutes`, newest first, optionally
    /// filtered by symbol. Capped at 1000 rows.
    pub async fn recent_signals(
        &self,
        symbol: Option<&str>,
        minutes: i64,
    ) -> Result<Vec<RecentSignal>> {
        let Some(pool) = &self.pool else {
            return Ok(Vec::new());
        };
        let since = Utc::now() - chrono::Duration::minutes(minutes);

        let mut sql = String::from(
            "SELECT fingerprint, symbol, direction, strategy, created_at, \
             signal_strength, price_level \
             FROM signal_fingerprints WHERE created_at >= $1",
        );
        if symbol.is_some() {
            sql.push_str(" AND symbol = $2");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT 1000");

        let mut query = sqlx::query(&sql).bind(since);
        if let Some(symbol) = symbol {
            query = query.bind(symbol);
        }

        let rows = query
            .fetch_all(pool)
            .await
            .map_err(CoreError::from_sqlx)?;

        rows.iter()
            .map(|row| {
                Ok(RecentSignal {
                    fingerprint: row.try_get("fingerprint").map_err(CoreError::from_sqlx)?,
                    symbol: row.try_get("symbol").map_err(CoreError::from_sqlx)?,
                    direction: row.try_get("direction").map_err(CoreError::from_sqlx)?,
                    strategy: row.try_get("strategy").map_err(CoreError::from_sqlx)?,
                    created_at: row.try_get("created_at").map_err(CoreError::from_sqlx)?,
                    signal_strength: row
                        .try_get("signal_strength")
                        .map_err(CoreError::from_sqlx)?,
                    price_level: row.try_get("price_level").map_err(CoreError::from_sqlx)?,
                })
            })
            .collect()
    }

    /// Delete durable rows and local cache entries older than
    /// `older_than_hours`.
    pub async fn cleanup_old_records(&self, older_than_hours: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::hours(older_than_hours);

        let mut deleted = 0;
        if let Some(pool) = &self.pool {
            let result = sqlx::query("DELETE FROM signal_fingerprints WHERE created_at < $1")
                .bind(cutoff)
                .execute(pool)
                .await
                .map_err(CoreError::from_sqlx)?;
            deleted = result.rows_affected();
        }

        let removed_local = {
            let mut cache = self.cache.lock();
            let before = cache.len();
            cache.retain(|_, seen| *seen >= cutoff);
            before - cache.len()
        };

        info!(deleted, removed_local, "purged old signal fingerprints");
        Ok(deleted)
    }

    pub fn stats(&self) -> DedupStatsSnapshot {
        let counters = self.stats.lock().clone();
        let checked = counters.cache_hits + counters.cache_misses;
        DedupStatsSnapshot {
            duplicate_rate: if counters.total_checks > 0 {
                counters.duplicates_found as f64 / counters.total_checks as f64
            } else {
                0.0
            },
            cache_hit_rate: if checked > 0 {
                counters.cache_hits as f64 / checked as f64
            } else {
                0.0
            },
            local_cache_size: self.cache.lock().len(),
            counters,
        }
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = DedupStats::default();
    }

    /// Spawn the hourly purge loop.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("signal deduplicator already started");
            return;
        }

        let dedup = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = dedup.cleanup_old_records(24).await {
                            error!(error = %e, "fingerprint purge failed");
                        }
                    }
                }
            }
        }));
        info!("signal deduplicator started");
    }

    /// Stop the purge loop. Idempotent; a second stop only warns.
    pub async fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        if handles.is_empty() {
            warn!("signal deduplicator already stopped");
            return;
        }
        let _ = self.shutdown.send(true);
        for handle in handles {
            let _ = handle.await;
        }
        info!("signal deduplicator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn local_dedup() -> SignalDeduplicator {
        SignalDeduplicator::new(None, None, Duration::from_secs(300), 10_000)
    }

    fn event_at(h: u32, m: u32, s: u32) -> SignalEvent {
        SignalEvent {
            symbol: "BTCUSDT".into(),
            direction: "BUY".into(),
            strategy: "s1".into(),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 1, h, m, s).unwrap(),
            strength: Some(0.80),
            price_level: Some(50_000.0),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn first_signal_is_fresh_second_is_duplicate() {
        let dedup = local_dedup();
        assert!(dedup.check_and_register(&event_at(12, 0, 5)).await);
        assert!(!dedup.check_and_register(&event_at(12, 0, 55)).await);
        // Next minute bucket is a new fingerprint again.
        assert!(dedup.check_and_register(&event_at(12, 1, 1)).await);
    }

    #[tokio::test]
    async fn expired_ttl_makes_the_signal_fresh_again() {
        let dedup = SignalDeduplicator::new(None, None, Duration::ZERO, 10_000);
        assert!(dedup.check_and_register(&event_at(12, 0, 5)).await);
        // Zero TTL: the cached entry is already expired on the next check.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(dedup.check_and_register(&event_at(12, 0, 6)).await);
    }

    #[tokio::test]
    async fn counters_add_up() {
        let dedup = local_dedup();
        dedup.check_and_register(&event_at(12, 0, 5)).await;
        dedup.check_and_register(&event_at(12, 0, 6)).await;
        dedup.check_and_register(&event_at(12, 1, 0)).await;

        let stats = dedup.stats();
        assert_eq!(stats.counters.total_checks, 3);
        assert_eq!(stats.counters.unique_signals, 2);
        assert_eq!(stats.counters.duplicates_found, 1);
        assert_eq!(
            stats.counters.total_checks,
            stats.counters.duplicates_found
                + stats.counters.unique_signals
                + stats.counters.error_defaults
        );
        assert!(stats.duplicate_rate > 0.0);
    }

    #[tokio::test]
    async fn cache_evicts_oldest_tenth_when_over_cap() {
        let dedup = SignalDeduplicator::new(None, None, Duration::from_secs(300), 10);
        for m in 0..11u32 {
            assert!(dedup.check_and_register(&event_at(12, m, 0)).await);
        }
        assert!(dedup.stats().local_cache_size <= 10);
    }

    #[tokio::test]
    async fn distinct_symbols_do_not_collide() {
        let dedup = local_dedup();
        let mut eth = event_at(12, 0, 5);
        eth.symbol = "ETHUSDT".into();
        assert!(dedup.check_and_register(&event_at(12, 0, 5)).await);
        assert!(dedup.check_and_register(&eth).await);
    }

    #[tokio::test]
    async fn start_stop_is_idempotent() {
        let dedup = Arc::new(local_dedup());
        dedup.start();
        dedup.start();
        dedup.stop().await;
        dedup.stop().await;
    }
}
