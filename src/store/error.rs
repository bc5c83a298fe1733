//! Store error type
//!
//! Systemic failures (pool exhaustion, store unreachable, bad arguments) surface
//! as `StoreError`. Per-record and per-phase failures never do: they are folded
//! into the operation's report instead (see `IngestReport`, `CompactionReport`,
//! `BackupRecord`).

use rusqlite::ErrorCode;

#[derive(Debug)]
pub enum StoreError {
    /// SQLite failure on a mutating path
    Database(rusqlite::Error),

    /// Pool could not be built
    Pool(String),

    /// Timed out waiting for a pooled connection (retryable)
    PoolTimeout(String),

    Io(std::io::Error),

    Serialization(serde_json::Error),

    /// Caller passed something unusable (programming error)
    InvalidArgument(String),

    /// Write collided with an immutable record (e.g. duplicate session id)
    Conflict(String),

    /// Operation stopped at a phase/table boundary on request
    Cancelled(String),

    /// Read path failure - distinct from a legitimately empty result
    Query(String),

    /// Backup archive unusable (missing manifest, checksum mismatch, ...)
    Backup(String),
}

impl StoreError {
    /// Wrap a SQLite error raised on a read path
    pub fn query(err: rusqlite::Error) -> Self {
        StoreError::Query(err.to_string())
    }

    /// Whether retrying the same call later can reasonably succeed
    ///
    /// True for pool acquisition timeouts and SQLITE_BUSY / SQLITE_LOCKED.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::PoolTimeout(_) => true,
            StoreError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

// r2d2's `get()` only fails once `connection_timeout` elapses
impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        StoreError::PoolTimeout(err.to_string())
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Pool(e) => write!(f, "Pool error: {}", e),
            StoreError::PoolTimeout(e) => write!(f, "Pool acquisition timed out: {}", e),
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::Serialization(e) => write!(f, "Serialization error: {}", e),
            StoreError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            StoreError::Conflict(e) => write!(f, "Conflict: {}", e),
            StoreError::Cancelled(stage) => write!(f, "Cancelled before {}", stage),
            StoreError::Query(e) => write!(f, "Query error: {}", e),
            StoreError::Backup(e) => write!(f, "Backup error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Database(e) => Some(e),
            StoreError::Io(e) => Some(e),
            StoreError::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

/// True when a rusqlite error is a UNIQUE / PRIMARY KEY violation
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => e.code == ErrorCode::ConstraintViolation,
        _ => false,
    }
}
