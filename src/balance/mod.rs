//! Cached venue balances with reservation accounting.
//!
//! The manager keeps one authoritative map of `(venue, asset)` balances,
//! refreshed from venue clients on a cadence, plus the set of active
//! reservations — client-side holds on funds that have not yet been
//! committed to an exchange. Availability checks and reservations for the
//! same key serialize on one lock, so two concurrent reservations can never
//! both pass when only one fits.
//!
//! All admission arithmetic is `rust_decimal`; floats appear only in the
//! observability snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{RetryConfig, RetryHandler};
use crate::kv::KvStore;
use crate::venues::VenueClient;

/// Cached balance row for one `(venue, asset)` pair.
///
/// `locked` is the exchange-acknowledged hold; reservations are tracked
/// separately because the venue does not know about them.
#[derive(Debug, Clone)]
pub struct AssetBalance {
    pub venue: String,
    pub asset: String,
    pub total: Decimal,
    pub available: Decimal,
    pub locked: Decimal,
    pub last_updated: DateTime<Utc>,
}

/// A client-side hold on funds, destroyed by release, TTL expiry, or stop.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: String,
    pub venue: String,
    pub asset: String,
    pub amount: Decimal,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct BalanceManagerConfig {
    /// Cadence of per-venue balance refresh.
    pub update_interval: Duration,
    /// Age beyond which a cached balance counts as stale.
    pub stale_after: Duration,
    /// Reject availability checks against stale balances.
    pub fail_closed: bool,
    /// Default reservation lifetime.
    pub reservation_ttl: Duration,
    /// Floor that must remain after any admitted operation.
    pub minimum_residual: Decimal,
}

impl Default for BalanceManagerConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(300),
            fail_closed: false,
            reservation_ttl: Duration::from_secs(300),
            minimum_residual: Decimal::new(1, 3), // 0.001
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BalanceStats {
    pub total_checks: u64,
    pub successful_reservations: u64,
    pub failed_reservations: u64,
    pub balance_updates: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Float-typed view of one balance row for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceView {
    pub total: f64,
    pub available: f64,
    pub locked: f64,
    pub reserved: f64,
    pub effective_available: f64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceSummary {
    pub total_venues: usize,
    pub total_assets: usize,
    pub total_reservations: usize,
    pub reservations_by_venue: HashMap<String, usize>,
    pub estimated_usdt_value: f64,
    pub last_update_times: HashMap<String, DateTime<Utc>>,
    pub stats: BalanceStats,
}

#[derive(Default)]
struct State {
    balances: HashMap<(String, String), AssetBalance>,
    reservations: HashMap<String, Reservation>,
    last_venue_update: HashMap<String, DateTime<Utc>>,
}

impl State {
    /// Sum of unexpired reservations for one `(venue, asset)`.
    fn reserved_amount(&self, venue: &str, asset: &str, now: DateTime<Utc>) -> Decimal {
        self.reservations
            .values()
            .filter(|r| r.venue == venue && r.asset == asset && r.expires_at > now)
            .map(|r| r.amount)
            .sum()
    }
}

pub struct BalanceManager {
    config: BalanceManagerConfig,
    state: Mutex<State>,
    kv: Option<KvStore>,
    venues: Vec<Arc<dyn VenueClient>>,
    stats: Mutex<BalanceStats>,
    fetch_retry: RetryHandler,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BalanceManager {
    pub fn new(
        config: BalanceManagerConfig,
        venues: Vec<Arc<dyn VenueClient>>,
        kv: Option<KvStore>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        // A flaky venue fetch gets a couple of quick retries before the
        // cycle gives up and waits for the next refresh tick.
        let fetch_retry = RetryHandler::new(
            "venue_balance_fetch",
            RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(2),
                ..Default::default()
            },
        )
        .expect("static venue-fetch retry config is valid");

        Self {
            config,
            state: Mutex::new(State::default()),
            kv,
            venues,
            stats: Mutex::new(BalanceStats::default()),
            fetch_retry,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Whether `amount` of `asset` can be taken from `venue` right now.
    ///
    /// Returns `(false, reason)` on denial; denial is a result, not an
    /// error. `include_reservations` subtracts active holds first.
    pub async fn check_availability(
        &self,
        venue: &str,
        asset: &str,
        amount: Decimal,
        include_reservations: bool,
    ) -> (bool, String) {
        self.stats.lock().total_checks += 1;
        self.ensure_cached(venue, asset).await;
        let state = self.state.lock();
        self.check_locked(&state, venue, asset, amount, include_reservations)
    }

    /// The admission check proper. Caller holds the state lock, which is
    /// what serializes it with reservation creation.
    fn check_locked(
        &self,
        state: &State,
        venue: &str,
        asset: &str,
        amount: Decimal,
        include_reservations: bool,
    ) -> (bool, String) {
        if amount <= Decimal::ZERO {
            return (false, format!("invalid amount {amount}"));
        }

        let Some(balance) = state.balances.get(&(venue.to_string(), asset.to_string())) else {
            return (false, format!("no balance for {asset} on {venue}"));
        };

        let now = Utc::now();
        if self.config.fail_closed {
            let age = (now - balance.last_updated).to_std().unwrap_or_default();
            if age > self.config.stale_after {
                return (
                    false,
                    format!("balance for {asset} on {venue} is stale ({age:?})"),
                );
            }
        }

        let mut available = balance.available;
        if include_reservations {
            available -= state.reserved_amount(venue, asset, now);
        }

        if available < amount {
            return (
                false,
                format!("insufficient: available {available}, requested {amount}"),
            );
        }

        let remaining = available - amount;
        if remaining < self.config.minimum_residual {
            return (
                false,
                format!("operation would leave only {remaining} {asset}"),
            );
        }

        (true, String::new())
    }

    /// Atomically re-check availability and create a reservation.
    ///
    /// `None` means rejection (insufficient funds, residual floor, unknown
    /// balance); the denial reason is logged. On success the reservation is
    /// mirrored to the KV store with its own TTL.
    pub async fn reserve(
        &self,
        venue: &str,
        asset: &str,
        amount: Decimal,
        purpose: &str,
        ttl: Option<Duration>,
        metadata: Option<serde_json::Value>,
    ) -> Option<String> {
        self.ensure_cached(venue, asset).await;

        let ttl = ttl.unwrap_or(self.config.reservation_ttl);
        let reservation = {
            let mut state = self.state.lock();
            self.stats.lock().total_checks += 1;
            let (ok, reason) = self.check_locked(&state, venue, asset, amount, true);
            if !ok {
                warn!(venue, asset, %amount, reason, "reservation rejected");
                self.stats.lock().failed_reservations += 1;
                return None;
            }

            let now = Utc::now();
            let reservation = Reservation {
                id: Uuid::new_v4().to_string(),
                venue: venue.to_string(),
                asset: asset.to_string(),
                amount,
                purpose: purpose.to_string(),
                created_at: now,
                expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
                metadata,
            };
            state
                .reservations
                .insert(reservation.id.clone(), reservation.clone());
            reservation
        };

        self.stats.lock().successful_reservations += 1;
        info!(
            venue,
            asset,
            %amount,
            id = %reservation.id,
            purpose,
            "reserved balance"
        );

        if let Some(kv) = &self.kv {
            let ttl_secs = ttl.as_secs().max(1) as usize;
            let payload = serde_json::json!({
                "venue": reservation.venue,
                "asset": reservation.asset,
                "amount": reservation.amount.to_string(),
                "purpose": reservation.purpose,
                "created_at": reservation.created_at,
                "expires_at": reservation.expires_at,
            });
            kv.set_ex(
                &format!("reservation:{}", reservation.id),
                &payload.to_string(),
                ttl_secs,
            )
            .await;
        }

        Some(reservation.id)
    }

    /// Release a reservation before its TTL. False when the id is unknown
    /// (already released or expired).
    pub async fn release(&self, reservation_id: &str) -> bool {
        let removed = self.state.lock().reservations.remove(reservation_id);
        match removed {
            Some(reservation) => {
                info!(
                    id = reservation_id,
                    venue = %reservation.venue,
                    asset = %reservation.asset,
                    amount = %reservation.amount,
                    "released reservation"
                );
                if let Some(kv) = &self.kv {
                    kv.del(&format!("reservation:{reservation_id}")).await;
                }
                true
            }
            None => {
                warn!(id = reservation_id, "release of unknown reservation");
                false
            }
        }
    }

    /// Replace the cached balance row for `(venue, asset)`.
    pub async fn update_balance(
        &self,
        venue: &str,
        asset: &str,
        total: Decimal,
        available: Decimal,
        locked: Decimal,
    ) -> bool {
        if total < Decimal::ZERO || available < Decimal::ZERO || locked < Decimal::ZERO {
            warn!(venue, asset, "rejected negative balance update");
            return false;
        }

        let balance = AssetBalance {
            venue: venue.to_string(),
            asset: asset.to_string(),
            total,
            available,
            locked,
            last_updated: Utc::now(),
        };

        {
            let mut state = self.state.lock();
            state
                .last_venue_update
                .insert(venue.to_string(), balance.last_updated);
            state
                .balances
                .insert((venue.to_string(), asset.to_string()), balance.clone());
        }
        self.stats.lock().balance_updates += 1;
        debug!(venue, asset, %available, "balance updated");

        if let Some(kv) = &self.kv {
            let payload = serde_json::json!({
                "total": balance.total.to_string(),
                "available": balance.available.to_string(),
                "locked": balance.locked.to_string(),
                "last_updated": balance.last_updated,
            });
            kv.set_ex(
                &format!("balance:{venue}:{asset}"),
                &payload.to_string(),
                60,
            )
            .await;
        }

        true
    }

    /// Warm-start a missing balance row from the KV mirror. Admission never
    /// depends on this — a cold cache simply reports "no balance".
    async fn ensure_cached(&self, venue: &str, asset: &str) {
        let key = (venue.to_string(), asset.to_string());
        if self.state.lock().balances.contains_key(&key) {
            self.stats.lock().cache_hits += 1;
            return;
        }
        self.stats.lock().cache_misses += 1;

        let Some(kv) = &self.kv else { return };
        let Some(raw) = kv.get(&format!("balance:{venue}:{asset}")).await else {
            return;
        };

        let parsed: Option<AssetBalance> = serde_json::from_str::<serde_json::Value>(&raw)
            .ok()
            .and_then(|v| {
                let field = |name: &str| {
                    v.get(name)
                        .and_then(|x| x.as_str())
                        .and_then(|s| s.parse::<Decimal>().ok())
                };
                Some(AssetBalance {
                    venue: venue.to_string(),
                    asset: asset.to_string(),
                    total: field("total")?,
                    available: field("available")?,
                    locked: field("locked")?,
                    last_updated: Utc::now(),
                })
            });

        if let Some(balance) = parsed {
            debug!(venue, asset, available = %balance.available, "balance warm-started from kv");
            self.state.lock().balances.entry(key).or_insert(balance);
        }
    }

    /// All cached balances with reservation-adjusted availability, floats at
    /// this edge only.
    pub fn all_balances(&self, venue: Option<&str>) -> HashMap<String, HashMap<String, BalanceView>> {
        let state = self.state.lock();
        let now = Utc::now();
        let mut out: HashMap<String, HashMap<String, BalanceView>> = HashMap::new();

        for ((v, asset), balance) in &state.balances {
            if venue.is_some_and(|want| want != v) {
                continue;
            }
            let reserved = state.reserved_amount(v, asset, now);
            let effective = balance.available - reserved;
            out.entry(v.clone()).or_default().insert(
                asset.clone(),
                BalanceView {
                    total: balance.total.to_f64().unwrap_or(0.0),
                    available: balance.available.to_f64().unwrap_or(0.0),
                    locked: balance.locked.to_f64().unwrap_or(0.0),
                    reserved: reserved.to_f64().unwrap_or(0.0),
                    effective_available: effective.to_f64().unwrap_or(0.0),
                    last_updated: balance.last_updated,
                },
            );
        }
        out
    }

    pub fn balance_summary(&self) -> BalanceSummary {
        let state = self.state.lock();
        let mut venues: Vec<&str> = state.balances.keys().map(|(v, _)| v.as_str()).collect();
        venues.sort_unstable();
        venues.dedup();

        let mut reservations_by_venue: HashMap<String, usize> = HashMap::new();
        for r in state.reservations.values() {
            *reservations_by_venue.entry(r.venue.clone()).or_default() += 1;
        }

        let usdt: Decimal = state
            .balances
            .iter()
            .filter(|((_, asset), _)| asset == "USDT")
            .map(|(_, b)| b.available)
            .sum();

        BalanceSummary {
            total_venues: venues.len(),
            total_assets: state.balances.len(),
            total_reservations: state.reservations.len(),
            reservations_by_venue,
            estimated_usdt_value: usdt.to_f64().unwrap_or(0.0),
            last_update_times: state.last_venue_update.clone(),
            stats: self.stats.lock().clone(),
        }
    }

    /// Drop expired reservations, returning how many were removed.
    pub async fn sweep_expired_reservations(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<Reservation> = {
            let mut state = self.state.lock();
            let ids: Vec<String> = state
                .reservations
                .values()
                .filter(|r| r.expires_at <= now)
                .map(|r| r.id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| state.reservations.remove(&id))
                .collect()
        };

        for reservation in &expired {
            info!(
                id = %reservation.id,
                venue = %reservation.venue,
                asset = %reservation.asset,
                amount = %reservation.amount,
                "expired reservation removed"
            );
            if let Some(kv) = &self.kv {
                kv.del(&format!("reservation:{}", reservation.id)).await;
            }
        }
        expired.len()
    }

    /// Pull fresh balances for one venue through its client. Transient
    /// fetch failures are retried with backoff before the cycle is skipped.
    async fn refresh_venue(&self, client: &Arc<dyn VenueClient>) {
        let venue = client.venue().to_string();
        let rows = match self.fetch_retry.execute(|| client.fetch_balances()).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(venue, error = %e, "balance fetch failed");
                return;
            }
        };

        let count = rows.len();
        for row in rows {
            self.update_balance(
                &venue,
                &row.asset.to_uppercase(),
                row.total,
                row.available,
                row.frozen,
            )
            .await;
        }
        debug!(venue, assets = count, "refreshed venue balances");
    }

    /// Launch one refresh loop per venue plus the expiry sweep.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("balance manager already started");
            return;
        }

        for client in &self.venues {
            let manager = Arc::clone(self);
            let client = Arc::clone(client);
            let mut shutdown = self.shutdown.subscribe();
            let interval = self.config.update_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => manager.refresh_venue(&client).await,
                    }
                }
            }));
        }

        {
            let manager = Arc::clone(self);
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(60));
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            manager.sweep_expired_reservations().await;
                        }
                    }
                }
            }));
        }

        info!(venues = self.venues.len(), "balance manager started");
    }

    /// Cancel background loops and await them. Idempotent.
    pub async fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        if handles.is_empty() {
            warn!("balance manager already stopped");
            return;
        }
        let _ = self.shutdown.send(true);
        for handle in handles {
            let _ = handle.await;
        }
        info!("balance manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::venues::BalanceRow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    /// Venue client that fails its first fetch with a transient error.
    struct FlakyVenue {
        calls: AtomicU32,
    }

    #[async_trait]
    impl VenueClient for FlakyVenue {
        fn venue(&self) -> &str {
            "bybit"
        }

        async fn fetch_balances(&self) -> crate::error::Result<Vec<BalanceRow>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(CoreError::TransientRemote("venue returned 502".into()))
            } else {
                Ok(vec![BalanceRow {
                    asset: "usdt".into(),
                    total: dec("100"),
                    available: dec("90"),
                    frozen: dec("10"),
                }])
            }
        }
    }

    fn manager() -> BalanceManager {
        BalanceManager::new(BalanceManagerConfig::default(), Vec::new(), None)
    }

    async fn funded(venue: &str, asset: &str, available: &str) -> BalanceManager {
        let m = manager();
        assert!(
            m.update_balance(venue, asset, dec(available), dec(available), Decimal::ZERO)
                .await
        );
        m
    }

    #[tokio::test]
    async fn availability_respects_amount_and_residual_floor() {
        let m = funded("bybit", "USDT", "100").await;

        let (ok, _) = m.check_availability("bybit", "USDT", dec("50"), true).await;
        assert!(ok);

        let (ok, reason) = m.check_availability("bybit", "USDT", dec("100"), true).await;
        assert!(!ok, "sweeping the account must fail: {reason}");

        let (ok, _) = m
            .check_availability("bybit", "USDT", dec("99.999"), true)
            .await;
        assert!(ok, "leaving exactly the residual floor is allowed");
    }

    #[tokio::test]
    async fn unknown_balance_is_denied() {
        let m = manager();
        let (ok, reason) = m.check_availability("bybit", "USDT", dec("1"), true).await;
        assert!(!ok);
        assert!(reason.contains("no balance"));
    }

    #[tokio::test]
    async fn only_one_of_two_contending_reservations_wins() {
        let m = Arc::new(funded("bybit", "USDT", "1000").await);

        let (a, b) = tokio::join!(
            m.reserve("bybit", "USDT", dec("700"), "order", None, None),
            m.reserve("bybit", "USDT", dec("700"), "order", None, None),
        );
        assert!(
            a.is_some() ^ b.is_some(),
            "exactly one reservation must win: {a:?} / {b:?}"
        );

        // Releasing the winner frees the funds again.
        let winner = a.or(b).unwrap();
        assert!(m.release(&winner).await);
        let third = m.reserve("bybit", "USDT", dec("700"), "order", None, None).await;
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn reserve_then_release_restores_availability() {
        let m = funded("bybit", "USDT", "1000").await;
        let before = m.all_balances(None)["bybit"]["USDT"].effective_available;

        let id = m
            .reserve("bybit", "USDT", dec("400"), "order", None, None)
            .await
            .unwrap();
        assert!(m.release(&id).await);
        assert!(!m.release(&id).await, "double release reports false");

        let after = m.all_balances(None)["bybit"]["USDT"].effective_available;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn expired_reservations_are_swept() {
        let m = funded("bybit", "USDT", "1000").await;
        let id = m
            .reserve(
                "bybit",
                "USDT",
                dec("900"),
                "order",
                Some(Duration::ZERO),
                None,
            )
            .await
            .unwrap();

        // Expired holds no longer count against availability even before
        // the sweep runs.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (ok, _) = m.check_availability("bybit", "USDT", dec("900"), true).await;
        assert!(ok);

        assert_eq!(m.sweep_expired_reservations().await, 1);
        assert!(!m.release(&id).await);
    }

    #[tokio::test]
    async fn include_reservations_flag_controls_the_check() {
        let m = funded("bybit", "USDT", "1000").await;
        m.reserve("bybit", "USDT", dec("800"), "order", None, None)
            .await
            .unwrap();

        let (with, _) = m.check_availability("bybit", "USDT", dec("500"), true).await;
        assert!(!with);
        let (without, _) = m
            .check_availability("bybit", "USDT", dec("500"), false)
            .await;
        assert!(without);
    }

    #[tokio::test]
    async fn fail_closed_rejects_stale_balances() {
        let config = BalanceManagerConfig {
            stale_after: Duration::ZERO,
            fail_closed: true,
            ..Default::default()
        };
        let m = BalanceManager::new(config, Vec::new(), None);
        m.update_balance("bybit", "USDT", dec("100"), dec("100"), Decimal::ZERO)
            .await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        let (ok, reason) = m.check_availability("bybit", "USDT", dec("1"), true).await;
        assert!(!ok);
        assert!(reason.contains("stale"));
    }

    #[tokio::test]
    async fn negative_updates_are_rejected() {
        let m = manager();
        assert!(
            !m.update_balance("bybit", "USDT", dec("-1"), dec("0"), Decimal::ZERO)
                .await
        );
    }

    #[tokio::test]
    async fn summary_counts_venues_assets_and_reservations() {
        let m = funded("bybit", "USDT", "1000").await;
        m.update_balance("bybit", "BTC", dec("2"), dec("2"), Decimal::ZERO)
            .await;
        m.update_balance("okx", "USDT", dec("50"), dec("50"), Decimal::ZERO)
            .await;
        m.reserve("bybit", "USDT", dec("10"), "order", None, None)
            .await
            .unwrap();

        let summary = m.balance_summary();
        assert_eq!(summary.total_venues, 2);
        assert_eq!(summary.total_assets, 3);
        assert_eq!(summary.total_reservations, 1);
        assert_eq!(summary.reservations_by_venue["bybit"], 1);
        assert!((summary.estimated_usdt_value - 1050.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn venue_refresh_retries_transient_fetch_failures() {
        let client: Arc<dyn VenueClient> = Arc::new(FlakyVenue {
            calls: AtomicU32::new(0),
        });
        let m = BalanceManager::new(
            BalanceManagerConfig::default(),
            vec![Arc::clone(&client)],
            None,
        );

        m.refresh_venue(&client).await;

        // First fetch failed, the retry succeeded and landed the rows.
        let balances = m.all_balances(Some("bybit"));
        assert!((balances["bybit"]["USDT"].available - 90.0).abs() < 1e-9);
        let metrics = m.fetch_retry.metrics();
        assert_eq!(metrics.total_attempts, 2);
        assert_eq!(metrics.retried_operations, 1);
    }

    #[tokio::test]
    async fn stats_track_reservation_outcomes() {
        let m = funded("bybit", "USDT", "100").await;
        m.reserve("bybit", "USDT", dec("50"), "order", None, None)
            .await
            .unwrap();
        assert!(m
            .reserve("bybit", "USDT", dec("500"), "order", None, None)
            .await
            .is_none());

        let summary = m.balance_summary();
        assert_eq!(summary.stats.successful_reservations, 1);
        assert_eq!(summary.stats.failed_reservations, 1);
        assert_eq!(summary.stats.balance_updates, 1);
    }
}
