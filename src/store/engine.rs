//! CandleStore - the single handle over pool, cache, validator and audit log
//!
//! Built once with `open()`, shared behind an `Arc`, shut down with `close()`.
//! Every method takes `&self`; SQLite serializes writers, the pool bounds
//! concurrency, the cache has its own lock.
//!
//! Mutating operations append to the operation log. A failure to append is
//! logged and never changes the operation's result.

use super::alignment::{self, AlignedCandle, AlignedWriteReport, AlignmentSession};
use super::backup::{
    self, BackupEntry, BackupKind, BackupPlan, BackupRecord, BackupStatus, RestoreOutcome,
};
use super::coherence::{self, CoherenceObservation, CoherenceStats};
use super::config::StoreConfig;
use super::error::StoreError;
use super::ingestion::{self, IngestReport, IngestSettings};
use super::maintenance::{self, CancelFlag, CompactionReport, RetentionPolicy, RetentionReport};
use super::oplog::{self, OperationKind, OperationLogEntry, OperationStatus};
use super::pool::{ConnectionPool, PoolState, PooledConnection};
use super::quality::{self, QualityReport};
use super::query::{self, CacheStats, QueryCache};
use super::schema::{run_schema_migrations, DATA_TABLES};
use super::types::{Candle, CandleQuery, Column, ProjectedRow, SeriesBar, Timeframe};
use super::validator::{system_clock, Clock, RecordValidator};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Instant;

/// How many symbols an operation-log scope names before summarizing
const SCOPE_SYMBOLS: usize = 10;

/// Row counts and sizes for operators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub table_rows: BTreeMap<String, u64>,
    pub symbols: usize,
    pub database_size: u64,
    pub pool: PoolState,
    pub cache: CacheStats,
}

/// Outcome of a restore attempt; `outcome` is set only on success
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreReport {
    pub record: BackupRecord,
    pub outcome: Option<RestoreOutcome>,
}

pub struct CandleStore {
    config: StoreConfig,
    pool: ConnectionPool,
    cache: QueryCache,
    validator: RecordValidator,
    now_fn: Clock,
}

impl CandleStore {
    /// Open (or create) the store described by `config`
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Self::open_with_clock(config, system_clock())
    }

    /// Open with an injected clock (unix seconds), for deterministic tests
    pub fn open_with_clock(config: StoreConfig, now_fn: Clock) -> Result<Self, StoreError> {
        config.validate().map_err(StoreError::InvalidArgument)?;

        log::info!("🗄️  Opening candle store: {}", config.db_path.display());

        let pool = ConnectionPool::open(
            &config.db_path,
            config.pool_size,
            config.pool_timeout(),
            config.pragma_settings(),
        )?;

        {
            let conn = pool.acquire()?;
            run_schema_migrations(&conn)?;
        }

        let cache = QueryCache::new(config.cache_ttl(), config.cache_max_rows);
        let validator = RecordValidator::new(config.min_timestamp, now_fn.clone());

        log::info!("   ├─ Pool: {} connections max", config.pool_size);
        log::info!(
            "   ├─ Cache: {}s TTL, < {} rows per result",
            config.cache_ttl_secs,
            config.cache_max_rows
        );
        log::info!("   └─ Batch size: {}", config.batch_size);

        Ok(Self {
            config,
            pool,
            cache,
            validator,
            now_fn,
        })
    }

    /// Checkpoint the WAL and release every connection
    pub fn close(self) -> Result<(), StoreError> {
        let conn = self.pool.acquire()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        if let Err(e) = conn.execute_batch("PRAGMA optimize") {
            log::warn!("⚠️  PRAGMA optimize failed on close: {}", e);
        }
        drop(conn);

        log::info!("👋 Candle store closed: {}", self.config.db_path.display());
        Ok(())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn now(&self) -> i64 {
        (self.now_fn)()
    }

    fn conn(&self) -> Result<PooledConnection, StoreError> {
        self.pool.acquire()
    }

    fn log_operation(&self, conn: &Connection, entry: OperationLogEntry) {
        if let Err(e) = oplog::append_entry(conn, &entry) {
            log::warn!(
                "⚠️  Operation log append failed ({} {}): {}",
                entry.operation,
                entry.status,
                e
            );
        }
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Validate and upsert candles in batches
    ///
    /// Only a systemic failure (no connection) is an `Err`; rejected records
    /// and rolled-back batches are reported in the `IngestReport`.
    pub fn bulk_write(&self, records: &[Candle]) -> Result<IngestReport, StoreError> {
        let started_at = self.now();
        let mut conn = self.conn()?;

        let settings = IngestSettings {
            batch_size: self.config.batch_size,
            progress_interval: self.config.progress_interval,
        };
        let report = ingestion::bulk_write(&mut conn, &self.validator, settings, records, started_at);

        if report.committed > 0 {
            self.cache.invalidate();
        }

        let mut entry = OperationLogEntry::new(
            OperationKind::BulkWrite,
            report.status(),
            symbol_scope(records.iter().map(|c| c.symbol.as_str())),
            started_at,
        )
        .with_records(report.committed as u64)
        .with_duration_ms(report.duration_ms)
        .with_metadata(json!({
            "submitted": records.len(),
            "rejected": report.rejected,
            "rejected_by_kind": report.rejected_by_kind,
            "batches": report.batches,
            "failed_batches": report.failed_batches,
            "failed_records": report.failed_records,
        }));
        if let Some(err) = &report.first_error {
            entry = entry.with_error(err.clone());
        }
        self.log_operation(&conn, entry);

        Ok(report)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Candles for a symbol in ascending timestamp order
    pub fn query(&self, request: &CandleQuery) -> Result<Vec<Candle>, StoreError> {
        let symbol = check_symbol(&request.symbol)?;
        check_range(request.start, request.end)?;
        let request: Cow<'_, CandleQuery> = if symbol == request.symbol {
            Cow::Borrowed(request)
        } else {
            Cow::Owned(CandleQuery {
                symbol: symbol.to_string(),
                ..request.clone()
            })
        };
        let request = request.as_ref();

        self.cache.candles(request, || {
            let conn = self.conn()?;
            query::fetch_candles(&conn, request).map_err(StoreError::query)
        })
    }

    /// `query` projected onto `columns` (values in the requested order)
    pub fn query_columns(
        &self,
        request: &CandleQuery,
        columns: &[Column],
    ) -> Result<Vec<ProjectedRow>, StoreError> {
        if columns.is_empty() {
            return Err(StoreError::InvalidArgument(
                "at least one column must be requested".to_string(),
            ));
        }
        let candles = self.query(request)?;
        Ok(query::project(&candles, columns))
    }

    /// Row count without materializing rows
    pub fn count(
        &self,
        symbol: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<u64, StoreError> {
        let symbol = check_symbol(symbol)?;
        check_range(start, end)?;
        let conn = self.conn()?;
        query::count_candles(&conn, symbol, start, end).map_err(StoreError::query)
    }

    /// Newest `n` candles, oldest first
    pub fn latest(&self, symbol: &str, n: usize) -> Result<Vec<Candle>, StoreError> {
        let symbol = check_symbol(symbol)?;
        if n == 0 {
            return Ok(Vec::new());
        }
        self.cache.latest(symbol, n, || {
            let conn = self.conn()?;
            query::fetch_latest(&conn, symbol, n).map_err(StoreError::query)
        })
    }

    pub fn symbols(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        query::list_symbols(&conn).map_err(StoreError::query)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn invalidate_cache(&self) {
        self.cache.invalidate();
    }

    pub fn pool_state(&self) -> PoolState {
        self.pool.state()
    }

    // ------------------------------------------------------------------
    // Quality & alignment
    // ------------------------------------------------------------------

    /// Read-only quality report over one symbol or the whole store
    pub fn analyze(&self, symbol: Option<&str>) -> Result<QualityReport, StoreError> {
        let symbol = symbol.map(check_symbol).transpose()?;
        let conn = self.conn()?;
        quality::analyze(&conn, symbol, &self.config.thresholds).map_err(StoreError::query)
    }

    /// Score and upsert aligned series for one timeframe, all symbols atomically
    pub fn store_aligned(
        &self,
        series_by_symbol: &BTreeMap<String, Vec<SeriesBar>>,
        timeframe: Timeframe,
        session_id: &str,
    ) -> Result<AlignedWriteReport, StoreError> {
        if session_id.trim().is_empty() {
            return Err(StoreError::InvalidArgument("session_id is empty".to_string()));
        }
        for symbol in series_by_symbol.keys() {
            check_symbol(symbol)?;
        }

        let started_at = self.now();
        let start = Instant::now();
        let mut conn = self.conn()?;
        let scope = format!(
            "{} {}",
            timeframe,
            symbol_scope(series_by_symbol.keys().map(String::as_str))
        );

        let result = alignment::write_aligned(
            &mut conn,
            series_by_symbol,
            timeframe,
            session_id,
            &self.config.thresholds,
            started_at,
        );

        match result {
            Ok(report) => {
                self.cache.invalidate();
                log::info!(
                    "📐 Aligned {} rows for {} symbols ({} / session {})",
                    report.rows_written,
                    report.symbols.len(),
                    timeframe,
                    session_id
                );
                let entry = OperationLogEntry::new(
                    OperationKind::StoreAligned,
                    OperationStatus::Success,
                    scope,
                    started_at,
                )
                .with_records(report.rows_written as u64)
                .with_duration_ms(report.duration_ms)
                .with_metadata(json!({ "session_id": session_id }));
                self.log_operation(&conn, entry);
                Ok(report)
            }
            Err(e) => {
                log::error!("❌ Aligned write failed ({} / {}): {}", timeframe, session_id, e);
                let entry = OperationLogEntry::new(
                    OperationKind::StoreAligned,
                    OperationStatus::Failed,
                    scope,
                    started_at,
                )
                .with_duration_ms(start.elapsed().as_millis() as u64)
                .with_error(e.to_string())
                .with_metadata(json!({ "session_id": session_id }));
                self.log_operation(&conn, entry);
                Err(e.into())
            }
        }
    }

    /// Aligned series per symbol; a symbol without data maps to an empty series
    pub fn get_aligned<S: AsRef<str>>(
        &self,
        symbols: &[S],
        timeframe: Timeframe,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<BTreeMap<String, Vec<AlignedCandle>>, StoreError> {
        check_range(start, end)?;

        let mut out = BTreeMap::new();
        for symbol in symbols {
            let symbol = check_symbol(symbol.as_ref())?;
            let rows = self.cache.aligned(symbol, timeframe, start, end, || {
                let conn = self.conn()?;
                alignment::fetch_aligned(&conn, symbol, timeframe, start, end)
                    .map_err(StoreError::query)
            })?;
            out.insert(symbol.to_string(), rows);
        }
        Ok(out)
    }

    /// Persist an alignment session; duplicate ids are a `Conflict`
    pub fn record_session(&self, session: &AlignmentSession) -> Result<i64, StoreError> {
        if session.session_id.trim().is_empty() {
            return Err(StoreError::InvalidArgument("session_id is empty".to_string()));
        }

        let started_at = self.now();
        let conn = self.conn()?;
        let result = alignment::insert_session(&conn, session);

        let (status, error) = match &result {
            Ok(_) => (OperationStatus::Success, None),
            Err(e) => (OperationStatus::Failed, Some(e.to_string())),
        };
        let mut entry = OperationLogEntry::new(
            OperationKind::RecordSession,
            status,
            session.session_id.clone(),
            started_at,
        )
        .with_records(session.symbols.len() as u64)
        .with_metadata(json!({
            "aggregate_quality": session.aggregate_quality,
            "gaps": session.gaps.len(),
        }));
        if let Some(err) = error {
            entry = entry.with_error(err);
        }
        self.log_operation(&conn, entry);

        result
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<AlignmentSession>, StoreError> {
        let conn = self.conn()?;
        alignment::fetch_session(&conn, session_id)
    }

    pub fn latest_session(&self) -> Result<Option<AlignmentSession>, StoreError> {
        let conn = self.conn()?;
        alignment::latest_session(&conn)
    }

    // ------------------------------------------------------------------
    // Coherence
    // ------------------------------------------------------------------

    pub fn record_coherence(&self, obs: &CoherenceObservation) -> Result<i64, StoreError> {
        check_symbol(&obs.symbol)?;
        let conn = self.conn()?;
        Ok(coherence::insert_observation(&conn, obs)?)
    }

    /// Roll aligned `source` bars up to `target` and compare with stored bars
    ///
    /// The result is recorded as a coherence observation. `Ok(None)` when
    /// there is no target bar in range.
    pub fn check_cross_timeframe(
        &self,
        symbol: &str,
        source: Timeframe,
        target: Timeframe,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Option<CoherenceObservation>, StoreError> {
        let symbol = check_symbol(symbol)?;
        check_range(start, end)?;
        if !target.is_multiple_of(&source) {
            return Err(StoreError::InvalidArgument(format!(
                "{} is not a whole multiple of {}",
                target, source
            )));
        }

        let started_at = self.now();
        let start_instant = Instant::now();
        let conn = self.conn()?;

        let target_bars = alignment::fetch_aligned(&conn, symbol, target, start, end)
            .map_err(StoreError::query)?;
        let (first, last) = match (target_bars.first(), target_bars.last()) {
            (Some(f), Some(l)) => (f.timestamp, l.timestamp),
            _ => {
                log::info!("🔍 No {} bars for {} in range, nothing to compare", target, symbol);
                return Ok(None);
            }
        };
        let source_bars = alignment::fetch_aligned(
            &conn,
            symbol,
            source,
            Some(first),
            Some(last + target.seconds() - 1),
        )
        .map_err(StoreError::query)?;

        let check = match coherence::compare_timeframes(&source_bars, &target_bars, source, target) {
            Some(check) => check,
            None => return Ok(None),
        };

        let mut obs = CoherenceObservation {
            id: None,
            source_timeframe: source,
            target_timeframe: target,
            symbol: symbol.to_string(),
            coherence_score: check.score,
            period_start: check.period_start,
            period_end: check.period_end,
            issues: check.issues,
            observed_at: started_at,
        };
        obs.id = Some(coherence::insert_observation(&conn, &obs)?);

        let status = if obs.coherence_score < self.config.thresholds.low_coherence {
            log::warn!(
                "⚠️  Low coherence {}→{} {}: {:.3} ({} issues)",
                source,
                target,
                symbol,
                obs.coherence_score,
                obs.issues.len()
            );
            OperationStatus::Partial
        } else {
            log::info!(
                "🔍 Coherence {}→{} {}: {:.3}",
                source,
                target,
                symbol,
                obs.coherence_score
            );
            OperationStatus::Success
        };

        let entry = OperationLogEntry::new(
            OperationKind::CoherenceCheck,
            status,
            format!("{} {}->{}", symbol, source, target),
            started_at,
        )
        .with_records(check.compared as u64)
        .with_duration_ms(start_instant.elapsed().as_millis() as u64)
        .with_metadata(json!({
            "coherence_score": obs.coherence_score,
            "agreeing": check.agreeing,
        }));
        self.log_operation(&conn, entry);

        Ok(Some(obs))
    }

    /// Coherence summary per (source, target) pair
    pub fn get_coherence_stats(
        &self,
        pair: Option<(Timeframe, Timeframe)>,
    ) -> Result<Vec<CoherenceStats>, StoreError> {
        let conn = self.conn()?;
        coherence::coherence_stats(&conn, pair, self.config.thresholds.low_coherence)
            .map_err(StoreError::query)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    pub fn compact(&self, cancel: &CancelFlag) -> Result<CompactionReport, StoreError> {
        let started_at = self.now();
        let conn = self.conn()?;

        match maintenance::compact(&conn, cancel) {
            Ok(report) => {
                let mut entry = OperationLogEntry::new(
                    OperationKind::Compaction,
                    report.status(),
                    "database",
                    started_at,
                )
                .with_duration_ms(report.duration_ms)
                .with_metadata(json!({
                    "size_before": report.size_before,
                    "size_after": report.size_after,
                }));
                if let Some(err) = report.error_summary() {
                    entry = entry.with_error(err);
                }
                self.log_operation(&conn, entry);
                Ok(report)
            }
            Err(e) => {
                self.log_operation(&conn, failed_entry(OperationKind::Compaction, "database", started_at, &e));
                Err(e)
            }
        }
    }

    /// Retention cleanup; `dry_run` only counts what would go
    pub fn cleanup(
        &self,
        policy: RetentionPolicy,
        dry_run: bool,
        cancel: &CancelFlag,
    ) -> Result<RetentionReport, StoreError> {
        let started_at = self.now();
        let cutoff = policy.cutoff(started_at);
        let scope = format!("older than {} days", policy.max_age_days);
        let mut conn = self.conn()?;

        let result = maintenance::cleanup(&mut conn, cutoff, dry_run, cancel);

        // Deletes commit per table, so even a cancelled run may have removed rows
        if !dry_run {
            self.cache.invalidate();
        }

        match result {
            Ok(report) => {
                let mut entry = OperationLogEntry::new(
                    OperationKind::RetentionCleanup,
                    report.status(),
                    scope,
                    started_at,
                )
                .with_records(if dry_run {
                    report.total_eligible
                } else {
                    report.total_deleted
                })
                .with_duration_ms(report.duration_ms)
                .with_metadata(json!({
                    "cutoff": report.cutoff,
                    "dry_run": dry_run,
                    "eligible": report.total_eligible,
                }));
                if let Some(error) = report.error_summary() {
                    entry = entry.with_error(error);
                }
                self.log_operation(&conn, entry);
                Ok(report)
            }
            Err(e) => {
                self.log_operation(&conn, failed_entry(OperationKind::RetentionCleanup, &scope, started_at, &e));
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Backup & restore
    // ------------------------------------------------------------------

    /// Back up into the configured backup directory
    pub fn backup(&self, kind: BackupKind, cancel: &CancelFlag) -> BackupRecord {
        let root = self.config.backup_dir.clone();
        self.backup_to(kind, &root, cancel)
    }

    /// Back up into `root`; failures come back as a `Failed` record
    ///
    /// Without a connection the record cannot be written to `backup_log`, so
    /// that case is only returned and logged.
    pub fn backup_to(&self, kind: BackupKind, root: &Path, cancel: &CancelFlag) -> BackupRecord {
        let created_at = self.now();
        let plan = BackupPlan {
            kind,
            root: root.to_path_buf(),
            tracked_dirs: self.config.tracked_dirs.clone(),
            retention: self.config.retention,
            created_at,
        };

        let conn = match self.conn() {
            Ok(conn) => conn,
            Err(e) => {
                let record = BackupRecord {
                    id: None,
                    kind,
                    destination: root.to_path_buf(),
                    size_before: 0,
                    size_after: 0,
                    compression_ratio: 0.0,
                    duration_ms: 0,
                    status: BackupStatus::Failed,
                    error: Some(e.to_string()),
                    created_at,
                };
                log::error!(
                    "❌ Backup could not start (attempt not recorded in backup_log): {}",
                    e
                );
                return record;
            }
        };

        let mut record = backup::create_backup(&conn, &plan, cancel);
        self.register_backup(&conn, &mut record);
        record
    }

    /// Write the record to `backup_log` and the operation log
    fn register_backup(&self, conn: &Connection, record: &mut BackupRecord) {
        match backup::insert_backup_record(conn, record) {
            Ok(id) => record.id = Some(id),
            Err(e) => log::warn!("⚠️  backup_log append failed: {}", e),
        }

        let (kind, status) = match (record.kind, record.status) {
            (BackupKind::Restore, s) => (OperationKind::Restore, s),
            (_, s) => (OperationKind::Backup, s),
        };
        let status = match status {
            BackupStatus::Success => OperationStatus::Success,
            BackupStatus::Failed => OperationStatus::Failed,
            BackupStatus::Cancelled => OperationStatus::Cancelled,
        };

        let mut entry = OperationLogEntry::new(
            kind,
            status,
            record.destination.to_string_lossy(),
            record.created_at,
        )
        .with_duration_ms(record.duration_ms)
        .with_metadata(json!({
            "backup_type": record.kind.as_str(),
            "size_before": record.size_before,
            "size_after": record.size_after,
            "compression_ratio": record.compression_ratio,
        }));
        if let Some(err) = &record.error {
            entry = entry.with_error(err.clone());
        }
        self.log_operation(conn, entry);
    }

    /// Restore data tables and tracked directories from an archive
    ///
    /// Never returns an error: a failed restore leaves the live store as it
    /// was and comes back with a `Failed` record.
    pub fn restore(&self, archive: &Path, cancel: &CancelFlag) -> RestoreReport {
        let created_at = self.now();
        let start = Instant::now();

        let result = self.conn().and_then(|mut conn| {
            let outcome =
                backup::restore_backup(&mut conn, archive, &self.config.tracked_dirs, cancel);
            Ok((conn, outcome))
        });

        let (conn, outcome) = match result {
            Ok((conn, outcome)) => (Some(conn), outcome),
            Err(e) => (None, Err(e)),
        };

        if outcome.is_ok() {
            self.cache.invalidate();
        }

        let mut record = BackupRecord {
            id: None,
            kind: BackupKind::Restore,
            destination: archive.to_path_buf(),
            size_before: 0,
            size_after: 0,
            compression_ratio: 0.0,
            duration_ms: start.elapsed().as_millis() as u64,
            status: BackupStatus::Success,
            error: None,
            created_at,
        };

        let outcome = match outcome {
            Ok(outcome) => {
                record.size_before = outcome.size_before;
                record.size_after = outcome.size_after;
                if outcome.size_before > 0 {
                    record.compression_ratio =
                        outcome.size_after as f64 / outcome.size_before as f64;
                }
                Some(outcome)
            }
            Err(e) => {
                log::error!("❌ Restore from {} failed: {}", archive.display(), e);
                record.status = match e {
                    StoreError::Cancelled(_) => BackupStatus::Cancelled,
                    _ => BackupStatus::Failed,
                };
                record.error = Some(e.to_string());
                None
            }
        };

        match conn {
            Some(conn) => self.register_backup(&conn, &mut record),
            None => log::warn!("⚠️  Restore attempt not registered: no connection"),
        }

        RestoreReport { record, outcome }
    }

    /// Archives in the configured backup directory, newest first
    pub fn list_backups(&self) -> Result<Vec<BackupEntry>, StoreError> {
        backup::list_backups(&self.config.backup_dir)
    }

    pub fn backup_history(&self, limit: usize) -> Result<Vec<BackupRecord>, StoreError> {
        let conn = self.conn()?;
        backup::fetch_backup_history(&conn, limit).map_err(StoreError::query)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn recent_operations(
        &self,
        limit: usize,
        kind: Option<OperationKind>,
    ) -> Result<Vec<OperationLogEntry>, StoreError> {
        let conn = self.conn()?;
        oplog::recent_entries(&conn, limit, kind).map_err(StoreError::query)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn()?;

        let mut table_rows = BTreeMap::new();
        for table in DATA_TABLES.iter().chain(["operation_log", "backup_log"].iter()) {
            let n: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                .map_err(StoreError::query)?;
            table_rows.insert(table.to_string(), n as u64);
        }

        let symbols = query::list_symbols(&conn).map_err(StoreError::query)?.len();
        let database_size = maintenance::database_size(&conn).map_err(StoreError::query)?;
        drop(conn);

        Ok(StoreStats {
            table_rows,
            symbols,
            database_size,
            pool: self.pool.state(),
            cache: self.cache.stats(),
        })
    }

    /// Run compaction + retention cleanup once (scheduler tick)
    pub fn run_maintenance(&self, policy: RetentionPolicy, cancel: &CancelFlag) -> Result<(), StoreError> {
        let retention = self.cleanup(policy, false, cancel)?;
        // cleanup compacts on its own when it deleted anything
        if retention.total_deleted == 0 {
            self.compact(cancel)?;
        }
        Ok(())
    }
}

fn failed_entry(kind: OperationKind, scope: &str, started_at: i64, err: &StoreError) -> OperationLogEntry {
    let status = match err {
        StoreError::Cancelled(_) => OperationStatus::Cancelled,
        _ => OperationStatus::Failed,
    };
    OperationLogEntry::new(kind, status, scope, started_at).with_error(err.to_string())
}

/// The symbol with surrounding whitespace removed, as ingestion stores it
fn check_symbol(symbol: &str) -> Result<&str, StoreError> {
    let symbol = symbol.trim();
    if symbol.is_empty() {
        return Err(StoreError::InvalidArgument("symbol is empty".to_string()));
    }
    Ok(symbol)
}

fn check_range(start: Option<i64>, end: Option<i64>) -> Result<(), StoreError> {
    if let (Some(s), Some(e)) = (start, end) {
        if s > e {
            return Err(StoreError::InvalidArgument(format!(
                "inverted range: start {} > end {}",
                s, e
            )));
        }
    }
    Ok(())
}

/// "A,B,C" or "A,B,... (+N more)" for operation-log scopes
fn symbol_scope<'a>(symbols: impl Iterator<Item = &'a str>) -> String {
    let distinct: BTreeSet<&str> = symbols.map(str::trim).filter(|s| !s.is_empty()).collect();
    if distinct.is_empty() {
        return "-".to_string();
    }
    let named: Vec<&str> = distinct.iter().take(SCOPE_SYMBOLS).copied().collect();
    let more = distinct.len().saturating_sub(SCOPE_SYMBOLS);
    if more > 0 {
        format!("{} (+{} more)", named.join(","), more)
    } else {
        named.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    const NOW: i64 = 1_700_000_000;

    fn open_store(dir: &Path) -> CandleStore {
        let config = StoreConfig::new(dir.join("store.db")).with_pool_size(4);
        CandleStore::open_with_clock(config, Arc::new(|| NOW)).unwrap()
    }

    fn candle(symbol: &str, ts: i64, close: f64) -> Candle {
        Candle::new(symbol, ts, 100.0, 110.0, 90.0, close, 1.0)
    }

    #[test]
    fn test_store_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CandleStore>();
    }

    #[test]
    fn test_bulk_write_is_logged() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let mut records = vec![candle("BTCUSD", NOW - 60, 100.0), candle("ETHUSD", NOW - 60, 100.0)];
        records.push(Candle::new("BTCUSD", NOW, 100.0, 10.0, 20.0, 100.0, 1.0));
        let report = store.bulk_write(&records).unwrap();
        assert_eq!(report.committed, 2);

        let ops = store.recent_operations(10, Some(OperationKind::BulkWrite)).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].status, OperationStatus::Partial);
        assert_eq!(ops[0].scope, "BTCUSD,ETHUSD");
        assert_eq!(ops[0].records_processed, 2);
        assert_eq!(ops[0].metadata.as_ref().unwrap()["rejected"], 1);
        assert_eq!(ops[0].started_at, NOW);
    }

    #[test]
    fn test_argument_errors() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        assert!(matches!(
            store.query(&CandleQuery::symbol("  ")),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.query(&CandleQuery::symbol("BTCUSD").between(10, 5)),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.query_columns(&CandleQuery::symbol("BTCUSD"), &[]),
            Err(StoreError::InvalidArgument(_))
        ));

        let h1: Timeframe = "1h".parse().unwrap();
        let m45: Timeframe = "45m".parse().unwrap();
        assert!(matches!(
            store.check_cross_timeframe("BTCUSD", h1, m45, None, None),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_reads_trim_symbol_like_ingestion() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store
            .bulk_write(&[candle(" BTCUSD ", NOW - 120, 101.0), candle("BTCUSD", NOW - 60, 102.0)])
            .unwrap();

        let rows = store.query(&CandleQuery::symbol(" BTCUSD ")).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|c| c.symbol == "BTCUSD"));
        assert_eq!(store.count("BTCUSD\t", None, None).unwrap(), 2);
        assert_eq!(store.latest(" BTCUSD", 1).unwrap()[0].close, 102.0);
        assert_eq!(store.analyze(Some("BTCUSD ")).unwrap().total_rows, 2);
    }

    #[test]
    fn test_missing_symbol_is_empty_not_error() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        assert!(store.query(&CandleQuery::symbol("NOPE")).unwrap().is_empty());
        assert!(store.latest("NOPE", 5).unwrap().is_empty());
        assert_eq!(store.count("NOPE", None, None).unwrap(), 0);

        let aligned = store
            .get_aligned(&["NOPE"], "1h".parse().unwrap(), None, None)
            .unwrap();
        assert_eq!(aligned.get("NOPE"), Some(&Vec::new()));
    }

    #[test]
    fn test_symbol_scope() {
        assert_eq!(symbol_scope(["B", "A", "B"].into_iter()), "A,B");
        assert_eq!(symbol_scope(std::iter::empty()), "-");
        let many: Vec<String> = (0..12).map(|i| format!("S{:02}", i)).collect();
        assert_eq!(
            symbol_scope(many.iter().map(String::as_str)),
            "S00,S01,S02,S03,S04,S05,S06,S07,S08,S09 (+2 more)"
        );
    }

    #[test]
    fn test_stats_and_close() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store.bulk_write(&[candle("BTCUSD", NOW, 100.0)]).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.table_rows["candles"], 1);
        assert_eq!(stats.table_rows["operation_log"], 1);
        assert_eq!(stats.symbols, 1);
        assert!(stats.database_size > 0);
        assert_eq!(stats.pool.max_size, 4);

        store.close().unwrap();
    }
}
