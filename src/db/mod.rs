//! Durable-store access: pool construction, transactional scopes, and the
//! generic bulk repository.

mod monitoring;
mod repository;
mod resilience;
mod transaction;

pub use monitoring::{assess, DbAssessment, DbHealthSnapshot, DbMonitor, DbStatus, PoolGauges};
pub use repository::{BulkUpdate, Condition, Repository, SqlValue, TableRecord};
pub use resilience::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState,
    CircuitStatus, RetryConfig, RetryHandler, RetryMetrics,
};
pub use transaction::{
    savepoint, TransactionManager, TransactionMetrics, TransactionState, TransactionStats,
    TxOperation, UnitOfWork,
};

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::error::{CoreError, Result};

/// Open the shared Postgres pool.
pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .map_err(CoreError::from_sqlx)
}

/// Pool handle without touching the network; connections are established
/// on first use.
pub fn connect_pool_lazy(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_lazy(database_url)
        .map_err(CoreError::from_sqlx)
}
