//! Bounded SQLite connection pool
//!
//! Thin wrapper over r2d2 + r2d2_sqlite:
//! - `acquire()` hands out an idle connection or opens a new one under the cap
//! - each new physical connection runs `apply_optimized_pragmas` exactly once
//!   (pool init hook)
//! - `release()` (or dropping the guard) returns the connection; r2d2 closes
//!   surplus idle connections on its own
//! - acquisition waits at most `acquire_timeout`, then fails with a retryable
//!   `StoreError::PoolTimeout`

use super::error::StoreError;
use crate::sqlite_pragma::{apply_optimized_pragmas, PragmaSettings};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Snapshot of pool bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolState {
    pub connections: u32,
    pub idle: u32,
    pub max_size: u32,
}

pub struct ConnectionPool {
    inner: Pool<SqliteConnectionManager>,
    max_size: u32,
}

impl ConnectionPool {
    /// Open a pool for the database at `path`
    ///
    /// Creates the parent directory if needed. Connections are opened lazily;
    /// the first one is opened here so an unreachable store fails fast.
    pub fn open(
        path: impl AsRef<Path>,
        max_size: u32,
        acquire_timeout: Duration,
        settings: PragmaSettings,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path)
            .with_init(move |conn| apply_optimized_pragmas(conn, &settings));

        let inner = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(0))
            .connection_timeout(acquire_timeout)
            .build(manager)
            .map_err(|e| StoreError::Pool(e.to_string()))?;

        let pool = Self { inner, max_size };

        // Surface open/PRAGMA failures now rather than on first use
        drop(pool.acquire()?);

        log::info!(
            "✅ Connection pool ready: {} (max {} connections)",
            path.display(),
            max_size
        );

        Ok(pool)
    }

    /// Get a connection, waiting up to the configured timeout
    pub fn acquire(&self) -> Result<PooledConnection, StoreError> {
        self.inner.get().map_err(|e| {
            log::warn!("⏳ Pool acquisition timed out: {}", e);
            StoreError::from(e)
        })
    }

    /// Return a connection to the pool
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    pub fn state(&self) -> PoolState {
        let state = self.inner.state();
        PoolState {
            connections: state.connections,
            idle: state.idle_connections,
            max_size: self.max_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_pool(dir: &Path, max_size: u32) -> ConnectionPool {
        ConnectionPool::open(
            dir.join("pool.db"),
            max_size,
            Duration::from_millis(100),
            PragmaSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_connections_configured_on_open() {
        let dir = tempdir().unwrap();
        let pool = open_pool(dir.path(), 2);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();

        for conn in [&a, &b] {
            let mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .unwrap();
            assert_eq!(mode.to_lowercase(), "wal");
            let temp_store: i64 = conn
                .query_row("PRAGMA temp_store", [], |row| row.get(0))
                .unwrap();
            assert_eq!(temp_store, 2);
        }
    }

    #[test]
    fn test_release_reuses_connection() {
        let dir = tempdir().unwrap();
        let pool = open_pool(dir.path(), 3);

        let conn = pool.acquire().unwrap();
        pool.release(conn);
        let _conn = pool.acquire().unwrap();

        let state = pool.state();
        assert!(state.connections <= 3);
        assert_eq!(state.max_size, 3);
    }

    #[test]
    fn test_exhausted_pool_times_out_retryably() {
        let dir = tempdir().unwrap();
        let pool = open_pool(dir.path(), 1);

        let held = pool.acquire().unwrap();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, StoreError::PoolTimeout(_)));
        assert!(err.is_retryable());

        // Once released, acquisition succeeds again
        pool.release(held);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let _pool = ConnectionPool::open(
            nested.join("store.db"),
            1,
            Duration::from_millis(100),
            PragmaSettings::default(),
        )
        .unwrap();
        assert!(nested.join("store.db").exists());
    }
}
