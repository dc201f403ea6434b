//! Error kinds shared across the coordination core.
//!
//! Admission denials (duplicate signal, insufficient balance, occupied
//! worker kind) are *not* errors — they are negative results carried in the
//! return types of the components that produce them. This enum covers the
//! failures that callers must branch on.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Rejected at the boundary before any state change.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Remote cache or venue fetch failed; a fallback path was or can be taken.
    #[error("transient remote failure: {0}")]
    TransientRemote(String),

    /// Retryable database failure (deadlock, lost connection).
    #[error("transient database failure: {0}")]
    TransientDatabase(#[source] sqlx::Error),

    /// Non-retryable database failure (syntax, constraint, authorization).
    #[error("database failure: {0}")]
    Database(#[source] sqlx::Error),

    /// Caller-supplied deadline expired.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Component is stopping; the operation was not attempted.
    #[error("{0} is shutting down")]
    ShuttingDown(&'static str),

    /// A bug: internal bookkeeping disagreed with itself. Logged and
    /// surfaced, never a panic.
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

impl CoreError {
    /// Stable machine-readable tag for logs and callers that match on kind.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::TransientRemote(_) => "transient_remote",
            CoreError::TransientDatabase(_) => "transient_database",
            CoreError::Database(_) => "database",
            CoreError::Timeout(_) => "timeout",
            CoreError::ShuttingDown(_) => "shutting_down",
            CoreError::Invariant(_) => "invariant",
        }
    }

    /// Classify an sqlx error into the transient/persistent split.
    ///
    /// Deadlocks (40P01) and serialization failures (40001) are retryable;
    /// pool/connection losses get one re-acquisition attempt at the call
    /// site; everything else propagates immediately.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        if is_deadlock(&err) || is_connection_loss(&err) {
            CoreError::TransientDatabase(err)
        } else {
            CoreError::Database(err)
        }
    }
}

/// True when the error is a Postgres deadlock (or serialization conflict
/// reported the same way by the server).
pub fn is_deadlock(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("40P01") | Some("40001"))
                || db.message().contains("deadlock")
        }
        _ => false,
    }
}

/// True when the connection itself went away and a fresh pool acquisition
/// might succeed.
pub fn is_connection_loss(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(CoreError::InvalidInput("x".into()).kind(), "invalid_input");
        assert_eq!(
            CoreError::ShuttingDown("balance_manager").kind(),
            "shutting_down"
        );
        assert_eq!(
            CoreError::Timeout(std::time::Duration::from_secs(1)).kind(),
            "timeout"
        );
    }

    #[test]
    fn io_errors_classify_as_transient() {
        let err = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(is_connection_loss(&err));
        assert_eq!(CoreError::from_sqlx(err).kind(), "transient_database");
    }

    #[test]
    fn row_not_found_classifies_as_persistent() {
        let err = sqlx::Error::RowNotFound;
        assert!(!is_deadlock(&err));
        assert_eq!(CoreError::from_sqlx(err).kind(), "database");
    }
}
