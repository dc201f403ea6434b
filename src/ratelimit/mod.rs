//! Per-venue, per-endpoint request throttling.
//!
//! Outbound venue calls pass through [`VenueRateLimiter::acquire`], which
//! sleeps as needed so that both the venue's global budget and the
//! endpoint-specific budget hold over a trailing 60-second window. The
//! optional Redis mirror is consulted first so several observers can see
//! one shared window, but the in-process window is always authoritative
//! and takes over on any KV trouble.

mod limits;
mod window;

pub use limits::{builtin_limits, conservative_default, RateLimit, VenueLimits};
pub use window::{SlidingWindow, WINDOW_SECS};

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::kv::KvStore;

/// Bounded number of check→sleep→recheck passes before an acquire records
/// its entry regardless and returns the accumulated wait.
const ADMIT_PASSES: u32 = 5;

/// TTL on mirrored window keys; anything older is outside the window.
const KEY_TTL_SECS: usize = 60;

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Usage counters for one `(venue, endpoint)` pair.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointStats {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub average_wait_secs: f64,
    pub max_wait_secs: f64,
}

impl EndpointStats {
    fn observe(&mut self, elapsed: f64, blocked: bool) {
        self.total_requests += 1;
        if blocked {
            self.blocked_requests += 1;
        }
        let n = self.total_requests as f64;
        self.average_wait_secs = (self.average_wait_secs * (n - 1.0) + elapsed) / n;
        self.max_wait_secs = self.max_wait_secs.max(elapsed);
    }
}

pub struct VenueRateLimiter {
    limits: HashMap<String, VenueLimits>,
    windows: Mutex<HashMap<String, SlidingWindow>>,
    stats: Mutex<HashMap<String, EndpointStats>>,
    kv: Option<KvStore>,
}

impl VenueRateLimiter {
    pub fn new(kv: Option<KvStore>) -> Self {
        Self::with_limits(builtin_limits(), kv)
    }

    pub fn with_limits(limits: HashMap<String, VenueLimits>, kv: Option<KvStore>) -> Self {
        Self {
            limits,
            windows: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            kv,
        }
    }

    /// Wait until a request with `weight` may go out to `venue`/`endpoint`.
    ///
    /// Returns the total time slept. Unknown venues are throttled with the
    /// conservative default table.
    pub async fn acquire(&self, venue: &str, endpoint: &str, weight: Option<u32>) -> f64 {
        let start = unix_now();

        let fallback;
        let config = match self.limits.get(venue) {
            Some(config) => config,
            None => {
                warn!(venue, "unknown venue, applying conservative default limits");
                fallback = conservative_default(venue);
                &fallback
            }
        };

        let endpoint_limit = config.limit_for(endpoint);
        let weight = weight.unwrap_or(endpoint_limit.default_weight);

        let global_key = format!("rate_limit:{venue}:global");
        let mut waited = self.admit(&global_key, &config.global_limit, weight).await;

        if endpoint != "default" {
            let endpoint_key = format!("rate_limit:{venue}:{endpoint}");
            waited += self.admit(&endpoint_key, endpoint_limit, weight).await;
        }

        let elapsed = unix_now() - start;
        self.stats
            .lock()
            .entry(format!("{venue}:{endpoint}"))
            .or_default()
            .observe(elapsed, waited > 0.0);

        waited
    }

    /// check → sleep → recheck loop for one window key.
    ///
    /// Timestamps only move forward, so repeated passes converge; after
    /// [`ADMIT_PASSES`] the entry is recorded regardless so a congested key
    /// cannot starve a caller forever.
    async fn admit(&self, key: &str, limit: &RateLimit, weight: u32) -> f64 {
        let mut waited = 0.0;
        for pass in 0..ADMIT_PASSES {
            let force = pass + 1 == ADMIT_PASSES;
            let wait = self.try_admit(key, limit, weight, force).await;
            if wait <= 0.0 {
                return waited;
            }
            debug!(key, wait_secs = wait, "throttling request");
            waited += wait;
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
        waited
    }

    /// One admission pass. Returns zero when the entry was recorded, else
    /// the proposed wait. `force` records even over the limit.
    async fn try_admit(&self, key: &str, limit: &RateLimit, weight: u32, force: bool) -> f64 {
        let now = unix_now();

        if let Some(kv) = &self.kv {
            if let Some(wait) = self.kv_wait(kv, key, limit, now).await {
                if wait > 0.0 && !force {
                    return wait;
                }
                kv.zadd_with_ttl(key, &format!("{now}:{weight}"), now, KEY_TTL_SECS)
                    .await;
                self.record_local(key, now, weight);
                return 0.0;
            }
            // KV unreachable: the local window decides.
        }

        let mut windows = self.windows.lock();
        let window = windows.entry(key.to_string()).or_default();
        window.prune(now);
        let wait = window.proposed_wait(now, limit);
        if wait > 0.0 && !force {
            return wait;
        }
        window.record(now, weight);
        0.0
    }

    /// Proposed wait according to the mirrored window; `None` when the KV
    /// store could not answer.
    async fn kv_wait(&self, kv: &KvStore, key: &str, limit: &RateLimit, now: f64) -> Option<f64> {
        let count = kv.prune_and_count(key, now - WINDOW_SECS).await?;

        if count >= limit.per_minute as u64 {
            if let Some(oldest) = kv.zoldest_score(key).await {
                return Some((oldest + WINDOW_SECS - now).max(0.0));
            }
        }

        let last_second = kv.zcount(key, now - 1.0, now).await?;
        if last_second >= limit.per_second as u64 {
            return Some(1.0 - (now % 1.0));
        }

        Some(0.0)
    }

    /// Mirror an admission into the local window so the process can keep
    /// deciding on its own after losing the KV store.
    fn record_local(&self, key: &str, now: f64, weight: u32) {
        let mut windows = self.windows.lock();
        let window = windows.entry(key.to_string()).or_default();
        window.prune(now);
        window.record(now, weight);
    }

    /// Stats per `(venue, endpoint)`, optionally filtered to one venue.
    pub fn stats(&self, venue: Option<&str>) -> HashMap<String, EndpointStats> {
        let stats = self.stats.lock();
        match venue {
            Some(venue) => {
                let prefix = format!("{venue}:");
                stats
                    .iter()
                    .filter(|(k, _)| k.starts_with(&prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            }
            None => stats.clone(),
        }
    }

    pub fn reset_stats(&self, venue: Option<&str>) {
        let mut stats = self.stats.lock();
        match venue {
            Some(venue) => {
                let prefix = format!("{venue}:");
                stats.retain(|k, _| !k.starts_with(&prefix));
            }
            None => stats.clear(),
        }
    }

    /// Current window occupancy for one venue, for dashboards.
    pub fn current_usage(&self, venue: &str) -> serde_json::Value {
        let Some(config) = self.limits.get(venue) else {
            return serde_json::json!({});
        };

        let now = unix_now();
        let mut windows = self.windows.lock();
        let mut usage = serde_json::Map::new();

        let mut scope = |key: String, name: &str, limit: &RateLimit| {
            let window = windows.entry(key).or_default();
            window.prune(now);
            usage.insert(
                name.to_string(),
                serde_json::json!({
                    "per_minute": { "current": window.len(), "limit": limit.per_minute },
                    "per_second": {
                        "current": window.count_since(now - 1.0),
                        "limit": limit.per_second,
                    },
                }),
            );
        };

        scope(
            format!("rate_limit:{venue}:global"),
            "global",
            &config.global_limit,
        );
        for (endpoint, limit) in &config.endpoint_limits {
            scope(format!("rate_limit:{venue}:{endpoint}"), endpoint, limit);
        }

        serde_json::Value::Object(usage)
    }

    /// Drop window entries older than `older_than` from both the local maps
    /// and the KV mirror, and forget empty keys.
    pub async fn cleanup_old_data(&self, older_than: Duration) {
        let cutoff = unix_now() - older_than.as_secs_f64();

        if let Some(kv) = &self.kv {
            let keys = kv.keys("rate_limit:*").await;
            for key in &keys {
                kv.zremrangebyscore(key, cutoff).await;
            }
            info!(keys = keys.len(), "pruned mirrored rate-limit windows");
        }

        let mut windows = self.windows.lock();
        for window in windows.values_mut() {
            window.prune(cutoff + WINDOW_SECS);
        }
        let before = windows.len();
        windows.retain(|_, w| !w.is_empty());
        let dropped = before - windows.len();
        if dropped > 0 {
            info!(dropped, "dropped empty rate-limit windows");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> VenueRateLimiter {
        VenueRateLimiter::new(None)
    }

    /// Limiter with a tight, clock-independent per-minute budget so the
    /// tests never race a real second boundary.
    fn tight_limiter(per_minute: u32) -> VenueRateLimiter {
        let mut limits = HashMap::new();
        limits.insert(
            "testex".to_string(),
            VenueLimits::new("testex", RateLimit::new(1000, per_minute, 10)),
        );
        VenueRateLimiter::with_limits(limits, None)
    }

    #[tokio::test(start_paused = true)]
    async fn full_minute_window_forces_a_wait() {
        let rl = tight_limiter(3);
        for _ in 0..3 {
            let wait = rl.acquire("testex", "default", None).await;
            assert_eq!(wait, 0.0);
        }
        let wait = rl.acquire("testex", "default", None).await;
        assert!(wait > 0.0, "fourth call should be throttled");
    }

    #[tokio::test]
    async fn unknown_venue_uses_conservative_default() {
        let rl = limiter();
        let wait = rl.acquire("garage_exchange", "order", None).await;
        assert_eq!(wait, 0.0);
        let stats = rl.stats(Some("garage_exchange"));
        assert_eq!(stats["garage_exchange:order"].total_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_requests_show_up_in_stats() {
        let rl = tight_limiter(3);
        for _ in 0..4 {
            rl.acquire("testex", "default", None).await;
        }
        let stats = rl.stats(Some("testex"));
        let default = &stats["testex:default"];
        assert_eq!(default.total_requests, 4);
        assert_eq!(default.blocked_requests, 1);
    }

    #[tokio::test]
    async fn stats_filter_and_reset_by_venue() {
        let rl = limiter();
        rl.acquire("bybit", "order", None).await;
        rl.acquire("okx", "order", None).await;

        assert_eq!(rl.stats(Some("bybit")).len(), 1);
        assert_eq!(rl.stats(None).len(), 2);

        rl.reset_stats(Some("bybit"));
        assert!(rl.stats(Some("bybit")).is_empty());
        assert_eq!(rl.stats(Some("okx")).len(), 1);
    }

    #[tokio::test]
    async fn current_usage_reports_window_occupancy() {
        let rl = limiter();
        rl.acquire("bybit", "order", None).await;
        rl.acquire("bybit", "order", None).await;

        let usage = rl.current_usage("bybit");
        assert_eq!(usage["global"]["per_minute"]["current"], 2);
        assert_eq!(usage["order"]["per_minute"]["current"], 2);
        assert_eq!(usage["order"]["per_minute"]["limit"], 100);
    }

    #[tokio::test]
    async fn cleanup_drops_empty_windows() {
        let rl = limiter();
        rl.acquire("bybit", "order", None).await;
        // Everything is younger than the cutoff, nothing is dropped.
        rl.cleanup_old_data(Duration::from_secs(3600)).await;
        assert_eq!(rl.current_usage("bybit")["order"]["per_minute"]["current"], 1);
    }

    #[tokio::test]
    async fn weight_defaults_come_from_endpoint_config() {
        let rl = limiter();
        // binance get_balance carries default weight 5; the call still
        // occupies a single window slot.
        rl.acquire("binance", "get_balance", None).await;
        let usage = rl.current_usage("binance");
        assert_eq!(usage["get_balance"]["per_minute"]["current"], 1);
    }
}
