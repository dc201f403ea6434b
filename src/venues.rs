//! Exchange-client capability consumed by the balance manager.
//!
//! Concrete venue clients live outside this crate; the coordination core
//! only needs the ability to pull a balance sheet.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::Result;

/// One asset row as reported by a venue.
#[derive(Debug, Clone)]
pub struct BalanceRow {
    pub asset: String,
    pub total: Decimal,
    pub available: Decimal,
    /// Amount locked in open orders, as acknowledged by the exchange.
    pub frozen: Decimal,
}

/// Minimal exchange-client surface.
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Name of the venue this client talks to (e.g. `bybit`).
    fn venue(&self) -> &str;

    /// Fetch the current balance sheet for the account.
    async fn fetch_balances(&self) -> Result<Vec<BalanceRow>>;
}
