//! Canonical signal fingerprints.
//!
//! A fingerprint collapses near-duplicate signals: the timestamp is
//! coarsened to its minute bucket and the float fields are rounded to four
//! decimals before hashing, so the same intent re-emitted within a minute
//! hashes identically.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A candidate trading signal as emitted by the strategy layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEvent {
    pub symbol: String,
    /// `BUY` or `SELL`.
    pub direction: String,
    pub strategy: String,
    pub timestamp: DateTime<Utc>,
    pub strength: Option<f64>,
    pub price_level: Option<f64>,
    /// Opaque payload carried through to the fingerprint table.
    pub metadata: Option<serde_json::Value>,
}

/// The identity fields a signal is deduplicated on.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalFingerprint {
    pub symbol: String,
    pub direction: String,
    pub strategy: String,
    /// Unix seconds floored to the minute.
    pub timestamp_minute: i64,
    pub signal_strength: Option<f64>,
    pub price_level: Option<f64>,
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

impl SignalFingerprint {
    pub fn from_event(event: &SignalEvent) -> Self {
        let ts = event.timestamp.timestamp();
        Self {
            symbol: event.symbol.clone(),
            direction: event.direction.clone(),
            strategy: event.strategy.clone(),
            timestamp_minute: ts - ts.rem_euclid(60),
            signal_strength: event.strength.map(round4),
            price_level: event.price_level.map(round4),
        }
    }

    /// First 16 hex characters of the SHA-256 of the sorted-key JSON form.
    pub fn digest(&self) -> String {
        let mut fields: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
        fields.insert("direction", self.direction.as_str().into());
        fields.insert(
            "price_level",
            self.price_level.map_or(serde_json::Value::Null, |v| v.into()),
        );
        fields.insert(
            "signal_strength",
            self.signal_strength
                .map_or(serde_json::Value::Null, |v| v.into()),
        );
        fields.insert("strategy", self.strategy.as_str().into());
        fields.insert("symbol", self.symbol.as_str().into());
        fields.insert("timestamp_minute", self.timestamp_minute.into());

        // BTreeMap iterates in key order, so the serialization is canonical.
        let canonical = serde_json::to_string(&fields).unwrap_or_default();
        let hash = Sha256::digest(canonical.as_bytes());
        hex::encode(hash)[..16].to_string()
    }
}
