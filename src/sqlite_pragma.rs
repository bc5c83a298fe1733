//! Connection-level PRAGMAs shared by every pooled SQLite connection
//!
//! Applied exactly once per physical connection (pool init hook):
//! - WAL journal (concurrent readers alongside a single writer)
//! - synchronous = NORMAL (safe with WAL, far fewer fsyncs)
//! - temp_store = MEMORY
//! - larger page cache + mmap
//! - WAL autocheckpoint every 1000 pages
//! - busy_timeout so lock contention waits instead of failing immediately

use rusqlite::Connection;
use std::time::Duration;

/// Tunables for [`apply_optimized_pragmas`]
#[derive(Debug, Clone)]
pub struct PragmaSettings {
    /// Page cache size in pages
    pub cache_pages: i64,

    /// Memory-mapped I/O window in bytes (0 disables)
    pub mmap_size: i64,

    /// WAL autocheckpoint threshold in pages
    pub wal_autocheckpoint: i64,

    /// How long a statement waits on a locked database before SQLITE_BUSY
    pub busy_timeout: Duration,
}

impl Default for PragmaSettings {
    fn default() -> Self {
        Self {
            cache_pages: 10_000,
            mmap_size: 256 * 1024 * 1024,
            wal_autocheckpoint: 1000,
            busy_timeout: Duration::from_millis(5_000),
        }
    }
}

/// Apply optimized PRAGMAs to a freshly opened connection
pub fn apply_optimized_pragmas(
    conn: &Connection,
    settings: &PragmaSettings,
) -> rusqlite::Result<()> {
    conn.busy_timeout(settings.busy_timeout)?;

    // journal_mode returns the resulting mode as a row
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        log::warn!("⚠️  SQLite refused WAL mode (got '{}')", mode);
    }

    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "cache_size", settings.cache_pages)?;
    conn.pragma_update(None, "wal_autocheckpoint", settings.wal_autocheckpoint)?;
    conn.pragma_update(None, "mmap_size", settings.mmap_size)?;

    Ok(())
}
