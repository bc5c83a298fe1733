//! Schema migrations
//!
//! SQL lives in `/sql/` and is compiled in. Files run in name order
//! (00_, 01_, ...) and must be idempotent (`IF NOT EXISTS`, `INSERT OR IGNORE`).

use rusqlite::Connection;

/// Embedded migrations, applied in order
const MIGRATIONS: &[(&str, &str)] = &[
    ("00_schema_meta.sql", include_str!("../../sql/00_schema_meta.sql")),
    ("01_candles.sql", include_str!("../../sql/01_candles.sql")),
    ("02_aligned_candles.sql", include_str!("../../sql/02_aligned_candles.sql")),
    (
        "03_coherence_observations.sql",
        include_str!("../../sql/03_coherence_observations.sql"),
    ),
    ("04_operation_log.sql", include_str!("../../sql/04_operation_log.sql")),
];

/// Tables holding market data; these are what backups snapshot and restore replaces
///
/// Audit tables (`operation_log`, `backup_log`) are not listed: restore never
/// rewrites the history of backups and operations.
pub const DATA_TABLES: &[&str] = &[
    "candles",
    "aligned_candles",
    "alignment_sessions",
    "coherence_observations",
];

/// Run all embedded migrations
pub fn run_schema_migrations(conn: &Connection) -> rusqlite::Result<()> {
    log::info!("🔧 Running schema migrations");

    for (name, sql) in MIGRATIONS {
        log::debug!("   ├─ Executing: {}", name);
        conn.execute_batch(sql)?;
    }

    log::info!("✅ Schema ready (version {})", schema_version(conn)?);
    Ok(())
}

/// Current schema version from `schema_meta`
pub fn schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: String = conn.query_row(
        "SELECT value FROM schema_meta WHERE key = 'schema_version'",
        [],
        |row| row.get(0),
    )?;
    Ok(version.parse().unwrap_or(0))
}
