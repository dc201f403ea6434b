//! Transactional scopes, savepoints, deadlock retry, and Unit of Work.
//!
//! Order and trade records must land atomically, so every primitive here
//! guarantees the scope contract: the connection goes back to the pool and
//! the transaction is either committed or rolled back on every exit path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::postgres::{PgConnection, PgPool};
use tracing::{debug, error, info, warn};

use crate::error::{is_connection_loss, is_deadlock, CoreError, Result};

/// How long completed transaction metrics stay visible.
const METRICS_RETENTION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Pending,
    Active,
    Committed,
    RolledBack,
    Failed,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Pending => "pending",
            TransactionState::Active => "active",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled_back",
            TransactionState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionMetrics {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub state: TransactionState,
    pub operation_count: usize,
    pub error: Option<String>,
}

impl TransactionMetrics {
    fn new(id: String) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            ended_at: None,
            state: TransactionState::Pending,
            operation_count: 0,
            error: None,
        }
    }

    pub fn duration_ms(&self) -> Option<f64> {
        self.ended_at.map(|end| {
            (end - self.started_at)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64()
                * 1000.0
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransactionStats {
    pub active_transactions: usize,
    pub total_transactions: u64,
    pub committed_transactions: usize,
    pub failed_transactions: usize,
    pub avg_duration_ms: f64,
    pub longest_duration_ms: f64,
}

/// One operation in a multi-statement transaction. `Fn` (not `FnOnce`)
/// because a deadlock retry re-runs the whole sequence.
pub type TxOperation = Arc<
    dyn for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, sqlx::Result<serde_json::Value>>
        + Send
        + Sync,
>;

/// Normalize an isolation-level argument to its SQL form.
pub fn normalize_isolation(level: &str) -> Result<&'static str> {
    match level {
        "read_committed" => Ok("READ COMMITTED"),
        "repeatable_read" => Ok("REPEATABLE READ"),
        "serializable" => Ok("SERIALIZABLE"),
        other => Err(CoreError::InvalidInput(format!(
            "unknown isolation level '{other}'"
        ))),
    }
}

/// Backoff before deadlock-retry attempt `attempt` (1-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs_f64(0.1 * f64::from(2u32.saturating_pow(attempt)))
}

fn valid_savepoint_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .enumerate()
            .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()))
}

/// Scoped savepoint inside an open transaction: RELEASE on success,
/// ROLLBACK TO SAVEPOINT on error. Names must be unique within their
/// enclosing transaction; releasing does not commit anything.
pub async fn savepoint<'a, T, F>(conn: &'a mut PgConnection, name: &str, f: F) -> Result<T>
where
    F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, sqlx::Result<T>>,
{
    // Savepoint names cannot be bound as parameters, so they are restricted
    // to identifier characters before being interpolated.
    if !valid_savepoint_name(name) {
        return Err(CoreError::InvalidInput(format!(
            "invalid savepoint name '{name}'"
        )));
    }

    sqlx::query(&format!("SAVEPOINT {name}"))
        .execute(&mut *conn)
        .await
        .map_err(CoreError::from_sqlx)?;
    debug!(name, "savepoint created");

    match f(&mut *conn).await {
        Ok(value) => {
            sqlx::query(&format!("RELEASE SAVEPOINT {name}"))
                .execute(&mut *conn)
                .await
                .map_err(CoreError::from_sqlx)?;
            debug!(name, "savepoint released");
            Ok(value)
        }
        Err(e) => {
            if let Err(rb) = sqlx::query(&format!("ROLLBACK TO SAVEPOINT {name}"))
                .execute(&mut *conn)
                .await
            {
                error!(name, error = %rb, "rollback to savepoint failed");
            } else {
                warn!(name, error = %e, "rolled back to savepoint");
            }
            Err(CoreError::from_sqlx(e))
        }
    }
}

/// What to do with a failed attempt inside `execute_in_transaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryDecision {
    /// Deadlock within budget: back off and rerun the sequence.
    Deadlock,
    /// Connection went away: rerun once on a fresh pool acquisition.
    Reconnect,
    Propagate,
}

fn classify_retry(
    error: &sqlx::Error,
    attempt: u32,
    max_retries: u32,
    reacquired: bool,
) -> RetryDecision {
    if is_deadlock(error) && attempt < max_retries {
        RetryDecision::Deadlock
    } else if is_connection_loss(error) && !reacquired {
        RetryDecision::Reconnect
    } else {
        RetryDecision::Propagate
    }
}

pub struct TransactionManager {
    pool: PgPool,
    metrics: Mutex<HashMap<String, TransactionMetrics>>,
    counter: AtomicU64,
}

impl TransactionManager {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            metrics: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("txn_{}_{n}", Utc::now().timestamp())
    }

    /// Drop metrics of transactions that completed more than a minute ago.
    fn prune_metrics(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(METRICS_RETENTION).unwrap_or_default();
        self.metrics
            .lock()
            .retain(|_, m| m.ended_at.map_or(true, |end| end >= cutoff));
    }

    fn finish_metric(&self, id: &str, state: TransactionState, error: Option<String>) {
        let mut metrics = self.metrics.lock();
        if let Some(m) = metrics.get_mut(id) {
            m.state = state;
            m.ended_at = Some(Utc::now());
            m.error = error;
        }
    }

    /// Run `f` inside a transaction at `isolation`.
    ///
    /// The connection is acquired from the pool, the isolation level is set
    /// before BEGIN, and COMMIT/ROLLBACK plus pool release happen on every
    /// exit path.
    pub async fn transaction<T, F>(&self, isolation: &str, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, sqlx::Result<T>> + Send,
    {
        let iso = normalize_isolation(isolation)?;
        self.prune_metrics();

        let id = self.next_id();
        self.metrics
            .lock()
            .insert(id.clone(), TransactionMetrics::new(id.clone()));

        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                self.finish_metric(&id, TransactionState::Failed, Some(e.to_string()));
                return Err(CoreError::from_sqlx(e));
            }
        };

        let begin = async {
            sqlx::query(&format!("SET TRANSACTION ISOLATION LEVEL {iso}"))
                .execute(&mut *conn)
                .await?;
            sqlx::query("BEGIN").execute(&mut *conn).await
        }
        .await;
        if let Err(e) = begin {
            self.finish_metric(&id, TransactionState::Failed, Some(e.to_string()));
            return Err(CoreError::from_sqlx(e));
        }

        if let Some(m) = self.metrics.lock().get_mut(&id) {
            m.state = TransactionState::Active;
        }
        debug!(id, isolation = iso, "transaction started");

        match f(&mut *conn).await {
            Ok(value) => match sqlx::query("COMMIT").execute(&mut *conn).await {
                Ok(_) => {
                    self.finish_metric(&id, TransactionState::Committed, None);
                    debug!(id, "transaction committed");
                    Ok(value)
                }
                Err(e) => {
                    self.finish_metric(&id, TransactionState::Failed, Some(e.to_string()));
                    error!(id, error = %e, "commit failed");
                    Err(CoreError::from_sqlx(e))
                }
            },
            Err(e) => {
                if let Err(rb) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    error!(id, error = %rb, "rollback failed");
                }
                let state = if is_deadlock(&e) {
                    TransactionState::Failed
                } else {
                    TransactionState::RolledBack
                };
                self.finish_metric(&id, state, Some(e.to_string()));
                warn!(id, error = %e, "transaction rolled back");
                Err(CoreError::from_sqlx(e))
            }
        }
        // `conn` drops here on every path, returning to the pool.
    }

    /// Run `operations` on one connection inside one transaction, retrying
    /// the whole sequence on deadlock with exponential backoff.
    ///
    /// Returns the operations' results in order. Deadlocks retry up to
    /// `max_retries` times (at most `max_retries + 1` attempts); a lost
    /// connection is retried exactly once on a freshly acquired pool
    /// connection; every other error propagates on the first occurrence.
    pub async fn execute_in_transaction(
        &self,
        operations: &[TxOperation],
        isolation: &str,
        max_retries: u32,
    ) -> Result<Vec<serde_json::Value>> {
        let mut attempt: u32 = 0;
        let mut reacquired = false;
        loop {
            let ops: Vec<TxOperation> = operations.to_vec();
            let result = self
                .transaction(isolation, move |conn| {
                    Box::pin(async move {
                        let mut results = Vec::with_capacity(ops.len());
                        for op in &ops {
                            results.push(op(&mut *conn).await?);
                        }
                        Ok(results)
                    })
                })
                .await;

            match result {
                Err(CoreError::TransientDatabase(e)) => {
                    match classify_retry(&e, attempt, max_retries, reacquired) {
                        RetryDecision::Deadlock => {
                            attempt += 1;
                            let delay = backoff_delay(attempt);
                            warn!(
                                attempt,
                                max_retries,
                                delay_ms = delay.as_millis() as u64,
                                "deadlock detected, retrying transaction"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::Reconnect => {
                            // The next `transaction` call acquires a fresh
                            // connection from the pool.
                            reacquired = true;
                            warn!(
                                error = %e,
                                "connection lost, retrying once on a fresh pool connection"
                            );
                        }
                        RetryDecision::Propagate => {
                            if is_deadlock(&e) {
                                error!(max_retries, "deadlock retries exhausted");
                            }
                            return Err(CoreError::TransientDatabase(e));
                        }
                    }
                }
                other => return other,
            }
        }
    }

    /// Metrics of recent transactions (active plus those completed within
    /// the last minute).
    pub fn transaction_metrics(&self) -> Vec<TransactionMetrics> {
        self.prune_metrics();
        let mut metrics: Vec<TransactionMetrics> =
            self.metrics.lock().values().cloned().collect();
        metrics.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        metrics
    }

    pub fn transaction_stats(&self) -> TransactionStats {
        let retained = self.transaction_metrics();
        aggregate_stats(&retained, self.counter.load(Ordering::Relaxed))
    }
}

fn aggregate_stats(metrics: &[TransactionMetrics], total: u64) -> TransactionStats {
    let durations: Vec<f64> = metrics.iter().filter_map(|m| m.duration_ms()).collect();
    TransactionStats {
        active_transactions: metrics
            .iter()
            .filter(|m| m.state == TransactionState::Active)
            .count(),
        total_transactions: total,
        committed_transactions: metrics
            .iter()
            .filter(|m| m.state == TransactionState::Committed)
            .count(),
        failed_transactions: metrics
            .iter()
            .filter(|m| m.state == TransactionState::Failed)
            .count(),
        avg_duration_ms: if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        },
        longest_duration_ms: durations.iter().copied().fold(0.0, f64::max),
    }
}

/// Collects operations and commits them atomically, or discards them.
pub struct UnitOfWork {
    manager: Arc<TransactionManager>,
    operations: Mutex<Vec<TxOperation>>,
}

impl UnitOfWork {
    pub fn new(manager: Arc<TransactionManager>) -> Self {
        Self {
            manager,
            operations: Mutex::new(Vec::new()),
        }
    }

    pub fn register_operation(&self, operation: TxOperation) {
        self.operations.lock().push(operation);
    }

    pub fn pending_operations(&self) -> usize {
        self.operations.lock().len()
    }

    /// Execute every registered operation in one transaction. Operations
    /// are cleared whether the commit succeeds or fails.
    pub async fn commit(&self) -> Result<Vec<serde_json::Value>> {
        let operations: Vec<TxOperation> = self.operations.lock().drain(..).collect();
        if operations.is_empty() {
            warn!("unit of work committed with no registered operations");
            return Ok(Vec::new());
        }

        let count = operations.len();
        let results = self
            .manager
            .execute_in_transaction(&operations, "read_committed", 3)
            .await?;
        info!(operations = count, "unit of work committed");
        Ok(results)
    }

    /// Discard pending operations without executing them.
    pub fn rollback(&self) {
        let dropped = {
            let mut operations = self.operations.lock();
            let n = operations.len();
            operations.clear();
            n
        };
        info!(dropped, "unit of work rolled back");
    }
}
