//! Per-venue rate-limit tables.
//!
//! The numbers mirror each venue's published REST limits with headroom;
//! unknown venues get a deliberately conservative default.

use std::collections::HashMap;

/// Limit set for one key (a venue's global budget or one endpoint).
#[derive(Debug, Clone)]
pub struct RateLimit {
    pub per_second: u32,
    pub per_minute: u32,
    /// Burst allowance above the steady rate before a hard wait.
    pub burst: u32,
    /// Weight applied when the caller does not pass one.
    pub default_weight: u32,
}

impl RateLimit {
    pub fn new(per_second: u32, per_minute: u32, burst: u32) -> Self {
        Self {
            per_second,
            per_minute,
            burst,
            default_weight: 1,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.default_weight = weight;
        self
    }
}

/// Limits for one venue: a global budget plus endpoint-specific overrides.
#[derive(Debug, Clone)]
pub struct VenueLimits {
    pub venue: String,
    pub global_limit: RateLimit,
    pub endpoint_limits: HashMap<String, RateLimit>,
}

impl VenueLimits {
    pub fn new(venue: &str, global_limit: RateLimit) -> Self {
        Self {
            venue: venue.to_string(),
            global_limit,
            endpoint_limits: HashMap::new(),
        }
    }

    pub fn endpoint(mut self, name: &str, limit: RateLimit) -> Self {
        self.endpoint_limits.insert(name.to_string(), limit);
        self
    }

    /// Limit governing `endpoint`, falling back to the global budget.
    pub fn limit_for(&self, endpoint: &str) -> &RateLimit {
        self.endpoint_limits
            .get(endpoint)
            .unwrap_or(&self.global_limit)
    }
}

/// Fallback applied to venues missing from the table: 5/s, 300/min, burst 10.
pub fn conservative_default(venue: &str) -> VenueLimits {
    VenueLimits::new(venue, RateLimit::new(5, 300, 10))
}

/// Built-in tables for the venues the platform trades on.
pub fn builtin_limits() -> HashMap<String, VenueLimits> {
    let mut limits = HashMap::new();

    limits.insert(
        "bybit".to_string(),
        VenueLimits::new("bybit", RateLimit::new(10, 600, 50))
            .endpoint("order", RateLimit::new(5, 100, 10))
            .endpoint("cancel_order", RateLimit::new(10, 100, 10))
            .endpoint("get_positions", RateLimit::new(5, 120, 5))
            .endpoint("get_balance", RateLimit::new(2, 120, 5))
            .endpoint("market_data", RateLimit::new(50, 1200, 100)),
    );

    limits.insert(
        "binance".to_string(),
        VenueLimits::new("binance", RateLimit::new(10, 1200, 20))
            .endpoint("order", RateLimit::new(1, 60, 5))
            .endpoint("cancel_order", RateLimit::new(1, 100, 10))
            .endpoint("get_positions", RateLimit::new(1, 10, 2).with_weight(5))
            .endpoint("get_balance", RateLimit::new(1, 10, 2).with_weight(5))
            .endpoint("market_data", RateLimit::new(20, 1200, 50)),
    );

    limits.insert(
        "okx".to_string(),
        VenueLimits::new("okx", RateLimit::new(10, 600, 30))
            .endpoint("order", RateLimit::new(5, 60, 10))
            .endpoint("cancel_order", RateLimit::new(10, 60, 15))
            .endpoint("get_positions", RateLimit::new(5, 10, 3))
            .endpoint("get_balance", RateLimit::new(1, 10, 2))
            .endpoint("market_data", RateLimit::new(20, 600, 40)),
    );

    limits.insert(
        "gate".to_string(),
        VenueLimits::new("gate", RateLimit::new(10, 900, 30))
            .endpoint("order", RateLimit::new(10, 300, 20))
            .endpoint("cancel_order", RateLimit::new(10, 300, 20))
            .endpoint("get_positions", RateLimit::new(10, 300, 10))
            .endpoint("get_balance", RateLimit::new(10, 300, 10))
            .endpoint("market_data", RateLimit::new(10, 900, 30)),
    );

    // Second-tier venues share one cautious profile.
    for venue in ["kucoin", "htx", "bingx"] {
        limits.insert(
            venue.to_string(),
            VenueLimits::new(venue, RateLimit::new(5, 300, 20))
                .endpoint("order", RateLimit::new(2, 60, 5))
                .endpoint("cancel_order", RateLimit::new(5, 100, 10))
                .endpoint("get_positions", RateLimit::new(2, 60, 3))
                .endpoint("get_balance", RateLimit::new(1, 30, 2))
                .endpoint("market_data", RateLimit::new(10, 300, 20)),
        );
    }

    limits
}
