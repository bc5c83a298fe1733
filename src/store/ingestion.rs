//! Ingestion engine - batched, validated, upsert-on-conflict candle writes
//!
//! Per batch:
//! 1. Validate every record (bad rows are dropped and counted, never fatal)
//! 2. Commit the survivors in ONE transaction:
//!    `INSERT ... ON CONFLICT(symbol, timestamp) DO UPDATE` (last write wins)
//! 3. A failure inside the transaction rolls back that batch only; the next
//!    batch still runs
//!
//! There is no cross-batch atomicity. The caller always gets a report with
//! what was committed, never an all-or-nothing error.

use super::oplog::OperationStatus;
use super::types::Candle;
use super::validator::RecordValidator;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

const UPSERT_CANDLE_SQL: &str = r#"
    INSERT INTO candles (symbol, timestamp, open, high, low, close, volume, ingested_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT(symbol, timestamp) DO UPDATE SET
        open = excluded.open,
        high = excluded.high,
        low = excluded.low,
        close = excluded.close,
        volume = excluded.volume,
        ingested_at = excluded.ingested_at
"#;

/// Batching knobs for `bulk_write`
#[derive(Debug, Clone, Copy)]
pub struct IngestSettings {
    /// Records per transaction
    pub batch_size: usize,

    /// Log progress every N committed records
    pub progress_interval: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            progress_interval: 100_000,
        }
    }
}

/// Outcome of one `bulk_write` call
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    /// Rows written (inserted or replaced)
    pub committed: usize,

    /// Records that failed validation
    pub rejected: usize,

    /// Rejections by validation error kind
    pub rejected_by_kind: BTreeMap<String, usize>,

    /// Batches whose transaction rolled back
    pub failed_batches: usize,

    /// Valid records lost to rolled-back batches
    pub failed_records: usize,

    pub batches: usize,
    pub duration_ms: u64,

    /// First error message from a rolled-back batch, if any
    pub first_error: Option<String>,
}

impl IngestReport {
    pub fn status(&self) -> OperationStatus {
        if self.failed_batches > 0 && self.committed == 0 {
            OperationStatus::Failed
        } else if self.failed_batches > 0 || self.rejected > 0 {
            OperationStatus::Partial
        } else {
            OperationStatus::Success
        }
    }

    /// Every record committed, nothing rejected or rolled back
    pub fn is_clean(&self) -> bool {
        self.rejected == 0 && self.failed_batches == 0
    }
}

/// Validate and commit `records` in batches over one connection
///
/// Arguments:
/// - `conn`: connection held for the whole call (one writer per call)
/// - `validator`: record validator
/// - `settings`: batch size / progress interval
/// - `records`: raw candles in caller order; later duplicates win
/// - `now`: stamp written to `ingested_at`
pub fn bulk_write(
    conn: &mut Connection,
    validator: &RecordValidator,
    settings: IngestSettings,
    records: &[Candle],
    now: i64,
) -> IngestReport {
    let start = Instant::now();
    let mut report = IngestReport::default();
    let batch_size = settings.batch_size.max(1);
    let progress_interval = settings.progress_interval.max(1);
    let mut next_progress = progress_interval;

    for (batch_idx, chunk) in records.chunks(batch_size).enumerate() {
        report.batches += 1;

        let mut valid = Vec::with_capacity(chunk.len());
        for record in chunk {
            match validator.validate(record) {
                Ok(candle) => valid.push(candle),
                Err(e) => {
                    log::debug!(
                        "⚠️  Rejected candle {}@{}: {}",
                        record.symbol,
                        record.timestamp,
                        e
                    );
                    report.rejected += 1;
                    *report.rejected_by_kind.entry(e.kind().to_string()).or_insert(0) += 1;
                }
            }
        }

        if valid.is_empty() {
            continue;
        }

        match commit_batch(conn, &valid, now) {
            Ok(written) => {
                report.committed += written;
                log::debug!(
                    "✅ Batch {} committed: {} rows ({} rejected so far)",
                    batch_idx,
                    written,
                    report.rejected
                );
            }
            Err(e) => {
                log::warn!(
                    "❌ Batch {} rolled back ({} records): {}",
                    batch_idx,
                    valid.len(),
                    e
                );
                report.failed_batches += 1;
                report.failed_records += valid.len();
                if report.first_error.is_none() {
                    report.first_error = Some(e.to_string());
                }
            }
        }

        while report.committed >= next_progress {
            log::info!("📊 Ingestion progress: {} records committed", next_progress);
            next_progress += progress_interval;
        }
    }

    report.duration_ms = start.elapsed().as_millis() as u64;

    if !records.is_empty() {
        log::info!(
            "📥 Bulk write: {} committed, {} rejected, {} failed batches ({}ms)",
            report.committed,
            report.rejected,
            report.failed_batches,
            report.duration_ms
        );
    }

    report
}

/// Upsert one batch atomically; on error the transaction is dropped (rolled back)
fn commit_batch(conn: &mut Connection, rows: &[Candle], now: i64) -> rusqlite::Result<usize> {
    let tx = conn.transaction()?;

    {
        let mut stmt = tx.prepare_cached(UPSERT_CANDLE_SQL)?;
        for c in rows {
            stmt.execute(params![
                c.symbol, c.timestamp, c.open, c.high, c.low, c.close, c.volume, now,
            ])?;
        }
    }

    tx.commit()?;
    Ok(rows.len())
}
