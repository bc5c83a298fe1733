//! Maintenance - compaction and retention cleanup
//!
//! Compaction:
//! 1. WAL checkpoint (TRUNCATE)
//! 2. VACUUM → ANALYZE → REINDEX, in that order
//!
//! A failed phase is logged and recorded in its `PhaseOutcome`; later phases
//! still run. Size is `page_count × page_size` before and after.
//!
//! Retention deletes rows strictly older than the cutoff (`< cutoff`), table
//! by table, then compacts. Dry-run only counts. A table that fails is
//! recorded in its `TableRetention` and the remaining tables still run; the
//! report is then `partial`.
//!
//! Both honor a `CancelFlag` between phases / tables. Retention cancelled
//! before its first table is an error; cancelled later it reports what was
//! already committed.

use super::error::StoreError;
use super::oplog::OperationStatus;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Tables subject to retention and the column holding their age
pub const RETENTION_TARGETS: &[(&str, &str)] = &[
    ("candles", "timestamp"),
    ("aligned_candles", "timestamp"),
    ("coherence_observations", "observed_at"),
];

/// Cooperative cancellation for long maintenance/backup runs
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` if cancellation was requested before `stage`
    pub fn check(&self, stage: &str) -> Result<(), StoreError> {
        if self.is_cancelled() {
            log::warn!("🛑 Cancelled before {}", stage);
            return Err(StoreError::Cancelled(stage.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub phase: String,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl PhaseOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub size_before: u64,
    pub size_after: u64,
    pub checkpoint_error: Option<String>,
    pub phases: Vec<PhaseOutcome>,
    pub duration_ms: u64,
}

impl CompactionReport {
    pub fn status(&self) -> OperationStatus {
        let failed = self.phases.iter().filter(|p| !p.succeeded()).count();
        if failed == 0 {
            OperationStatus::Success
        } else if failed == self.phases.len() {
            OperationStatus::Failed
        } else {
            OperationStatus::Partial
        }
    }

    pub fn bytes_reclaimed(&self) -> i64 {
        self.size_before as i64 - self.size_after as i64
    }

    /// Phase errors joined for the operation log
    pub fn error_summary(&self) -> Option<String> {
        let errors: Vec<String> = self
            .phases
            .iter()
            .filter_map(|p| p.error.as_ref().map(|e| format!("{}: {}", p.phase, e)))
            .collect();
        if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        }
    }
}

/// Database size in bytes as `page_count × page_size`
pub fn database_size(conn: &Connection) -> rusqlite::Result<u64> {
    let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
    Ok((page_count * page_size).max(0) as u64)
}

/// Checkpoint the WAL, then VACUUM, ANALYZE, REINDEX
pub fn compact(conn: &Connection, cancel: &CancelFlag) -> Result<CompactionReport, StoreError> {
    let start = Instant::now();
    cancel.check("compaction")?;

    let size_before = database_size(conn)?;
    log::info!("🧹 Compaction starting ({} bytes)", size_before);

    let checkpoint_error = conn
        .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
        .err()
        .map(|e| {
            log::warn!("   ├─ ⚠️  WAL checkpoint failed: {}", e);
            e.to_string()
        });

    let mut phases = Vec::with_capacity(3);
    for (phase, sql) in [("vacuum", "VACUUM"), ("analyze", "ANALYZE"), ("reindex", "REINDEX")] {
        cancel.check(phase)?;

        let phase_start = Instant::now();
        let error = match conn.execute_batch(sql) {
            Ok(()) => None,
            Err(e) => {
                log::error!("   ├─ ❌ {} failed: {}", sql, e);
                Some(e.to_string())
            }
        };
        let duration_ms = phase_start.elapsed().as_millis() as u64;

        if error.is_none() {
            log::info!("   ├─ ✅ {} ({}ms)", sql, duration_ms);
        }

        phases.push(PhaseOutcome {
            phase: phase.to_string(),
            duration_ms,
            error,
        });
    }

    let size_after = database_size(conn)?;
    let report = CompactionReport {
        size_before,
        size_after,
        checkpoint_error,
        phases,
        duration_ms: start.elapsed().as_millis() as u64,
    };

    log::info!(
        "   └─ Compaction {}: {} → {} bytes ({}ms)",
        report.status(),
        report.size_before,
        report.size_after,
        report.duration_ms
    );

    Ok(report)
}

/// How long rows are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_age_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { max_age_days: 365 }
    }
}

impl RetentionPolicy {
    pub fn days(max_age_days: u32) -> Self {
        Self { max_age_days }
    }

    /// Rows with an age column strictly below this are eligible for deletion
    pub fn cutoff(&self, now: i64) -> i64 {
        now - self.max_age_days as i64 * 86_400
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRetention {
    pub table: String,
    pub column: String,
    pub eligible: u64,
    pub deleted: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub cutoff: i64,
    pub dry_run: bool,
    pub tables: Vec<TableRetention>,
    pub total_eligible: u64,
    pub total_deleted: u64,
    /// Present when rows were deleted and compaction completed
    pub compaction: Option<CompactionReport>,
    /// Why the closing compaction did not complete (failure or cancellation)
    pub compaction_error: Option<String>,
    /// Stage at which the run was cancelled, if it was
    pub cancelled_at: Option<String>,
    pub duration_ms: u64,
}

impl RetentionReport {
    pub fn status(&self) -> OperationStatus {
        let failed_tables = self.tables.iter().filter(|t| t.error.is_some()).count();
        if !self.tables.is_empty() && failed_tables == self.tables.len() {
            return OperationStatus::Failed;
        }
        if failed_tables > 0 || self.cancelled_at.is_some() || self.compaction_error.is_some() {
            return OperationStatus::Partial;
        }
        if self.dry_run {
            return OperationStatus::DryRun;
        }
        match &self.compaction {
            Some(c) if c.status() != OperationStatus::Success => OperationStatus::Partial,
            _ => OperationStatus::Success,
        }
    }

    /// Table, compaction and cancellation errors joined for the operation log
    pub fn error_summary(&self) -> Option<String> {
        let mut errors: Vec<String> = self
            .tables
            .iter()
            .filter_map(|t| t.error.as_ref().map(|e| format!("{}: {}", t.table, e)))
            .collect();
        if let Some(e) = &self.compaction_error {
            errors.push(format!("compaction: {}", e));
        }
        if let Some(stage) = &self.cancelled_at {
            errors.push(format!("cancelled before {}", stage));
        }
        if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        }
    }
}

fn count_older(conn: &Connection, table: &str, column: &str, cutoff: i64) -> rusqlite::Result<u64> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE {} < ?1", table, column);
    let n: i64 = conn.query_row(&sql, params![cutoff], |row| row.get(0))?;
    Ok(n as u64)
}

/// `(eligible, deleted)` for one table; the delete runs in its own transaction
fn retain_table(
    conn: &mut Connection,
    table: &str,
    column: &str,
    cutoff: i64,
    dry_run: bool,
) -> rusqlite::Result<(u64, u64)> {
    if dry_run {
        return Ok((count_older(conn, table, column, cutoff)?, 0));
    }
    let tx = conn.transaction()?;
    let eligible = count_older(&tx, table, column, cutoff)?;
    let sql = format!("DELETE FROM {} WHERE {} < ?1", table, column);
    let deleted = tx.execute(&sql, params![cutoff])? as u64;
    tx.commit()?;
    Ok((eligible, deleted))
}

/// Count (dry run) or delete rows older than `cutoff` in every retention table
///
/// Each table is deleted in its own transaction. When anything was deleted,
/// the run ends with a compaction.
pub fn cleanup(
    conn: &mut Connection,
    cutoff: i64,
    dry_run: bool,
    cancel: &CancelFlag,
) -> Result<RetentionReport, StoreError> {
    let start = Instant::now();
    log::info!(
        "🗓️  Retention {} (cutoff {})",
        if dry_run { "dry run" } else { "cleanup" },
        cutoff
    );

    let mut tables = Vec::with_capacity(RETENTION_TARGETS.len());
    let mut cancelled_at = None;
    for (table, column) in RETENTION_TARGETS {
        if let Err(e) = cancel.check(table) {
            if tables.is_empty() {
                return Err(e);
            }
            cancelled_at = Some(table.to_string());
            break;
        }

        let (eligible, deleted, error) = match retain_table(conn, table, column, cutoff, dry_run) {
            Ok((eligible, deleted)) => {
                log::info!(
                    "   ├─ {}: {} eligible, {} deleted",
                    table,
                    eligible,
                    deleted
                );
                (eligible, deleted, None)
            }
            Err(e) => {
                log::warn!("   ├─ ⚠️  {}: retention failed: {}", table, e);
                (0, 0, Some(e.to_string()))
            }
        };

        tables.push(TableRetention {
            table: table.to_string(),
            column: column.to_string(),
            eligible,
            deleted,
            error,
        });
    }

    let total_eligible = tables.iter().map(|t| t.eligible).sum();
    let total_deleted: u64 = tables.iter().map(|t| t.deleted).sum();

    let (compaction, compaction_error) = if total_deleted > 0 {
        match compact(conn, cancel) {
            Ok(report) => (Some(report), None),
            Err(e) => {
                log::warn!("   ├─ ⚠️  Compaction after retention did not complete: {}", e);
                (None, Some(e.to_string()))
            }
        }
    } else {
        (None, None)
    };

    let report = RetentionReport {
        cutoff,
        dry_run,
        tables,
        total_eligible,
        total_deleted,
        compaction,
        compaction_error,
        cancelled_at,
        duration_ms: start.elapsed().as_millis() as u64,
    };

    log::info!(
        "   └─ Retention {}: {} eligible, {} deleted ({}ms)",
        report.status(),
        report.total_eligible,
        report.total_deleted,
        report.duration_ms
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_pragma::{apply_optimized_pragmas, PragmaSettings};
    use crate::store::schema::run_schema_migrations;
    use tempfile::tempdir;

    fn file_conn(dir: &std::path::Path) -> Connection {
        let conn = Connection::open(dir.join("m.db")).unwrap();
        apply_optimized_pragmas(&conn, &PragmaSettings::default()).unwrap();
        run_schema_migrations(&conn).unwrap();
        conn
    }

    fn insert_candles(conn: &Connection, timestamps: &[i64]) {
        for ts in timestamps {
            conn.execute(
                "INSERT INTO candles (symbol, timestamp, open, high, low, close, volume, ingested_at)
                 VALUES ('BTCUSD', ?1, 1, 1, 1, 1, 1, 0)",
                [ts],
            )
            .unwrap();
        }
    }

    #[test]
    fn test_compaction_runs_all_phases() {
        let dir = tempdir().unwrap();
        let conn = file_conn(dir.path());
        insert_candles(&conn, &(0..500).collect::<Vec<_>>());
        conn.execute("DELETE FROM candles WHERE timestamp < 400", []).unwrap();

        let report = compact(&conn, &CancelFlag::new()).unwrap();
        let names: Vec<&str> = report.phases.iter().map(|p| p.phase.as_str()).collect();
        assert_eq!(names, vec!["vacuum", "analyze", "reindex"]);
        assert_eq!(report.status(), OperationStatus::Success);
        assert!(report.size_after <= report.size_before);
        assert!(report.error_summary().is_none());
    }

    #[test]
    fn test_failed_phase_does_not_stop_later_phases() {
        let dir = tempdir().unwrap();
        let conn = file_conn(dir.path());

        // VACUUM cannot run inside an open transaction
        conn.execute_batch("BEGIN").unwrap();
        let report = compact(&conn, &CancelFlag::new()).unwrap();
        conn.execute_batch("COMMIT").unwrap();

        assert!(!report.phases[0].succeeded());
        assert!(report.phases[1].succeeded());
        assert!(report.phases[2].succeeded());
        assert_eq!(report.status(), OperationStatus::Partial);
        assert!(report.error_summary().unwrap().starts_with("vacuum:"));
    }

    #[test]
    fn test_cancelled_compaction() {
        let dir = tempdir().unwrap();
        let conn = file_conn(dir.path());
        let cancel = CancelFlag::new();
        cancel.cancel();

        let err = compact(&conn, &cancel).unwrap_err();
        assert!(matches!(err, StoreError::Cancelled(_)));
    }

    #[test]
    fn test_retention_dry_run_matches_execute() {
        let dir = tempdir().unwrap();
        let mut conn = file_conn(dir.path());
        insert_candles(&conn, &[100, 199, 200, 201, 300]);
        conn.execute(
            "INSERT INTO coherence_observations (source_timeframe, target_timeframe, symbol,
                coherence_score, period_start, period_end, issues_json, observed_at)
             VALUES ('1h', '4h', 'BTCUSD', 1.0, 0, 0, '[]', 50)",
            [],
        )
        .unwrap();

        let dry = cleanup(&mut conn, 200, true, &CancelFlag::new()).unwrap();
        assert_eq!(dry.status(), OperationStatus::DryRun);
        assert_eq!(dry.tables[0].eligible, 2);
        assert_eq!(dry.tables[2].eligible, 1);
        assert_eq!(dry.total_eligible, 3);
        assert_eq!(dry.total_deleted, 0);

        let real = cleanup(&mut conn, 200, false, &CancelFlag::new()).unwrap();
        assert_eq!(real.total_deleted, dry.total_eligible);
        assert!(real.compaction.is_some());

        // the row exactly at the cutoff survives
        let remaining: Vec<i64> = conn
            .prepare("SELECT timestamp FROM candles ORDER BY timestamp")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(remaining, vec![200, 201, 300]);
    }

    #[test]
    fn test_failing_table_does_not_stop_retention() {
        let dir = tempdir().unwrap();
        let mut conn = file_conn(dir.path());
        insert_candles(&conn, &[100, 300]);
        conn.execute(
            "INSERT INTO coherence_observations (source_timeframe, target_timeframe, symbol,
                coherence_score, period_start, period_end, issues_json, observed_at)
             VALUES ('1h', '4h', 'BTCUSD', 1.0, 0, 0, '[]', 50)",
            [],
        )
        .unwrap();
        conn.execute_batch(
            "CREATE TRIGGER keep_aligned BEFORE DELETE ON aligned_candles
             BEGIN SELECT RAISE(ABORT, 'aligned rows are pinned'); END;",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO aligned_candles (symbol, timeframe, timestamp, open, high, low, close, volume,
                alignment_session_id, coherence_score, data_quality_score, gap_count, created_at)
             VALUES ('BTCUSD', '1h', 0, 1, 1, 1, 1, 1, 's1', 1.0, 1.0, 0, 0)",
            [],
        )
        .unwrap();

        let report = cleanup(&mut conn, 200, false, &CancelFlag::new()).unwrap();
        assert_eq!(report.status(), OperationStatus::Partial);
        assert!(report.tables[0].error.is_none());
        assert!(report.tables[1].error.as_deref().unwrap().contains("pinned"));
        assert_eq!(report.tables[2].deleted, 1);
        assert_eq!(report.total_deleted, 2);
        assert!(report.error_summary().unwrap().starts_with("aligned_candles:"));

        let candles: i64 = conn.query_row("SELECT COUNT(*) FROM candles", [], |row| row.get(0)).unwrap();
        let aligned: i64 = conn.query_row("SELECT COUNT(*) FROM aligned_candles", [], |row| row.get(0)).unwrap();
        assert_eq!((candles, aligned), (1, 1));
    }

    #[test]
    fn test_interrupted_retention_is_partial() {
        let dir = tempdir().unwrap();
        let mut conn = file_conn(dir.path());
        insert_candles(&conn, &[100, 300]);

        let complete = cleanup(&mut conn, 200, false, &CancelFlag::new()).unwrap();
        assert_eq!(complete.status(), OperationStatus::Success);
        assert!(complete.error_summary().is_none());

        let compaction_cancelled = RetentionReport {
            compaction: None,
            compaction_error: Some(StoreError::Cancelled("compaction".to_string()).to_string()),
            ..complete.clone()
        };
        assert_eq!(compaction_cancelled.status(), OperationStatus::Partial);
        assert!(compaction_cancelled.error_summary().unwrap().starts_with("compaction:"));

        let stopped_early = RetentionReport {
            cancelled_at: Some("aligned_candles".to_string()),
            ..complete
        };
        assert_eq!(stopped_early.status(), OperationStatus::Partial);
    }

    #[test]
    fn test_retention_cutoff() {
        let policy = RetentionPolicy::days(30);
        assert_eq!(policy.cutoff(10_000_000), 10_000_000 - 30 * 86_400);
        assert_eq!(RetentionPolicy::default().max_age_days, 365);
    }
}
