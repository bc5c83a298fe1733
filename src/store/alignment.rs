//! Alignment store - derived per-timeframe materialization
//!
//! Each `write_aligned` call:
//! 1. Scores every symbol's series once (`quality::score_series`)
//! 2. Upserts all rows of all symbols in ONE transaction, keyed by
//!    (symbol, timeframe, timestamp), tagged with session id + scores
//!
//! Sessions are immutable: a second write of the same `session_id` is a
//! conflict, never an overwrite.

use super::error::{is_unique_violation, StoreError};
use super::quality::{score_series, QualityThresholds, SeriesScores};
use super::types::{SeriesBar, Timeframe};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

/// One stored aligned row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedCandle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: i64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub alignment_session_id: String,
    pub coherence_score: f64,
    pub data_quality_score: f64,
    pub gap_count: u32,
}

impl AlignedCandle {
    pub fn bar(&self) -> SeriesBar {
        SeriesBar {
            timestamp: self.timestamp,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// Per-symbol outcome of an aligned write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolAlignment {
    pub symbol: String,
    pub rows: usize,
    pub scores: SeriesScores,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedWriteReport {
    pub session_id: String,
    pub timeframe: Timeframe,
    pub symbols: Vec<SymbolAlignment>,
    pub rows_written: usize,
    pub duration_ms: u64,
}

/// Gaps detected in one (symbol, timeframe) series
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapSummary {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub gap_count: u32,
}

/// Companion record written once per alignment run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentSession {
    pub session_id: String,
    pub symbols: Vec<String>,
    pub timeframes: Vec<Timeframe>,
    pub aggregate_quality: f64,
    pub timeline_start: Option<i64>,
    pub timeline_end: Option<i64>,
    pub gaps: Vec<GapSummary>,
    pub created_at: i64,
}

impl AlignmentSession {
    /// Summarize the aligned writes of one run
    ///
    /// Aggregate quality is the mean `data_quality_score` over every
    /// (symbol, timeframe) written; timeline bounds span all of them.
    pub fn from_reports(
        session_id: impl Into<String>,
        reports: &[AlignedWriteReport],
        created_at: i64,
    ) -> Self {
        let mut symbols = BTreeSet::new();
        let mut timeframes = BTreeSet::new();
        let mut gaps = Vec::new();
        let mut quality_sum = 0.0;
        let mut quality_n = 0usize;
        let mut timeline_start: Option<i64> = None;
        let mut timeline_end: Option<i64> = None;

        for report in reports {
            timeframes.insert(report.timeframe);
            for s in &report.symbols {
                symbols.insert(s.symbol.clone());
                quality_sum += s.scores.data_quality_score;
                quality_n += 1;

                if let Some(first) = s.first_timestamp {
                    timeline_start = Some(timeline_start.map_or(first, |t| t.min(first)));
                }
                if let Some(last) = s.last_timestamp {
                    timeline_end = Some(timeline_end.map_or(last, |t| t.max(last)));
                }
                if s.scores.gap_count > 0 {
                    gaps.push(GapSummary {
                        symbol: s.symbol.clone(),
                        timeframe: report.timeframe,
                        gap_count: s.scores.gap_count,
                    });
                }
            }
        }

        Self {
            session_id: session_id.into(),
            symbols: symbols.into_iter().collect(),
            timeframes: timeframes.into_iter().collect(),
            aggregate_quality: if quality_n == 0 {
                0.0
            } else {
                quality_sum / quality_n as f64
            },
            timeline_start,
            timeline_end,
            gaps,
            created_at,
        }
    }
}

const UPSERT_ALIGNED_SQL: &str = r#"
    INSERT INTO aligned_candles (
        symbol, timeframe, timestamp, open, high, low, close, volume,
        alignment_session_id, coherence_score, data_quality_score, gap_count, created_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
    ON CONFLICT(symbol, timeframe, timestamp) DO UPDATE SET
        open = excluded.open,
        high = excluded.high,
        low = excluded.low,
        close = excluded.close,
        volume = excluded.volume,
        alignment_session_id = excluded.alignment_session_id,
        coherence_score = excluded.coherence_score,
        data_quality_score = excluded.data_quality_score,
        gap_count = excluded.gap_count,
        created_at = excluded.created_at
"#;

/// Score and upsert every series in one transaction
pub fn write_aligned(
    conn: &mut Connection,
    series_by_symbol: &BTreeMap<String, Vec<SeriesBar>>,
    timeframe: Timeframe,
    session_id: &str,
    thresholds: &QualityThresholds,
    now: i64,
) -> rusqlite::Result<AlignedWriteReport> {
    let start = Instant::now();
    let tf_label = timeframe.to_string();
    let mut symbols = Vec::with_capacity(series_by_symbol.len());
    let mut rows_written = 0usize;

    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(UPSERT_ALIGNED_SQL)?;

        for (symbol, bars) in series_by_symbol {
            let scores = score_series(bars, thresholds);

            for bar in bars {
                // NaN/inf land as NULL: they are missing, not values
                let field = |v: Option<f64>| v.filter(|x| x.is_finite());
                stmt.execute(params![
                    symbol,
                    tf_label,
                    bar.timestamp,
                    field(bar.open),
                    field(bar.high),
                    field(bar.low),
                    field(bar.close),
                    field(bar.volume),
                    session_id,
                    scores.coherence_score,
                    scores.data_quality_score,
                    scores.gap_count,
                    now,
                ])?;
            }

            rows_written += bars.len();
            symbols.push(SymbolAlignment {
                symbol: symbol.clone(),
                rows: bars.len(),
                scores,
                first_timestamp: bars.iter().map(|b| b.timestamp).min(),
                last_timestamp: bars.iter().map(|b| b.timestamp).max(),
            });

            log::debug!(
                "   ├─ {} {}: {} rows (coherence {:.3}, quality {:.3}, gaps {})",
                symbol,
                tf_label,
                bars.len(),
                scores.coherence_score,
                scores.data_quality_score,
                scores.gap_count
            );
        }
    }
    tx.commit()?;

    Ok(AlignedWriteReport {
        session_id: session_id.to_string(),
        timeframe,
        symbols,
        rows_written,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

fn aligned_from_row(row: &Row) -> rusqlite::Result<AlignedCandle> {
    let tf: String = row.get(1)?;
    let timeframe = tf.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(AlignedCandle {
        symbol: row.get(0)?,
        timeframe,
        timestamp: row.get(2)?,
        open: row.get(3)?,
        high: row.get(4)?,
        low: row.get(5)?,
        close: row.get(6)?,
        volume: row.get(7)?,
        alignment_session_id: row.get(8)?,
        coherence_score: row.get(9)?,
        data_quality_score: row.get(10)?,
        gap_count: row.get(11)?,
    })
}

/// Ascending aligned rows for one symbol/timeframe (bounds inclusive)
pub fn fetch_aligned(
    conn: &Connection,
    symbol: &str,
    timeframe: Timeframe,
    start: Option<i64>,
    end: Option<i64>,
) -> rusqlite::Result<Vec<AlignedCandle>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT symbol, timeframe, timestamp, open, high, low, close, volume,
               alignment_session_id, coherence_score, data_quality_score, gap_count
        FROM aligned_candles
        WHERE timeframe = ?1 AND symbol = ?2
          AND (?3 IS NULL OR timestamp >= ?3)
          AND (?4 IS NULL OR timestamp <= ?4)
        ORDER BY timestamp ASC
        "#,
    )?;

    let rows = stmt.query_map(
        params![timeframe.to_string(), symbol, start, end],
        aligned_from_row,
    )?;
    let candles = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(candles)
}

/// Insert a session record; an existing `session_id` is a `Conflict`
pub fn insert_session(conn: &Connection, session: &AlignmentSession) -> Result<i64, StoreError> {
    let symbols_json = serde_json::to_string(&session.symbols)?;
    let timeframes_json = serde_json::to_string(&session.timeframes)?;
    let gaps_json = serde_json::to_string(&session.gaps)?;

    let result = conn.execute(
        r#"
        INSERT INTO alignment_sessions (
            session_id, symbols_json, timeframes_json, aggregate_quality,
            timeline_start, timeline_end, gaps_json, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            session.session_id,
            symbols_json,
            timeframes_json,
            session.aggregate_quality,
            session.timeline_start,
            session.timeline_end,
            gaps_json,
            session.created_at,
        ],
    );

    match result {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!(
            "alignment session '{}' already recorded",
            session.session_id
        ))),
        Err(e) => Err(e.into()),
    }
}

const SELECT_SESSION_SQL: &str = r#"
    SELECT session_id, symbols_json, timeframes_json, aggregate_quality,
           timeline_start, timeline_end, gaps_json, created_at
    FROM alignment_sessions
"#;

type RawSession = (String, String, String, f64, Option<i64>, Option<i64>, String, i64);

fn raw_session(row: &Row) -> rusqlite::Result<RawSession> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn decode_session(raw: RawSession) -> Result<AlignmentSession, StoreError> {
    let (session_id, symbols, timeframes, aggregate_quality, timeline_start, timeline_end, gaps, created_at) = raw;
    Ok(AlignmentSession {
        session_id,
        symbols: serde_json::from_str(&symbols)?,
        timeframes: serde_json::from_str(&timeframes)?,
        aggregate_quality,
        timeline_start,
        timeline_end,
        gaps: serde_json::from_str(&gaps)?,
        created_at,
    })
}

pub fn fetch_session(conn: &Connection, session_id: &str) -> Result<Option<AlignmentSession>, StoreError> {
    let sql = format!("{} WHERE session_id = ?1", SELECT_SESSION_SQL);
    let raw = conn
        .query_row(&sql, [session_id], raw_session)
        .optional()
        .map_err(StoreError::query)?;
    raw.map(decode_session).transpose()
}

pub fn latest_session(conn: &Connection) -> Result<Option<AlignmentSession>, StoreError> {
    let sql = format!("{} ORDER BY id DESC LIMIT 1", SELECT_SESSION_SQL);
    let raw = conn
        .query_row(&sql, [], raw_session)
        .optional()
        .map_err(StoreError::query)?;
    raw.map(decode_session).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::run_schema_migrations;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_schema_migrations(&conn).unwrap();
        conn
    }

    fn hourly(n: usize) -> Vec<SeriesBar> {
        (0..n)
            .map(|i| SeriesBar::complete(1_700_000_000 + i as i64 * 3_600, 10.0, 11.0, 9.0, 10.5, 100.0))
            .collect()
    }

    #[test]
    fn test_write_and_fetch_aligned() {
        let mut conn = test_conn();
        let tf: Timeframe = "1h".parse().unwrap();

        let mut series = BTreeMap::new();
        series.insert("BTCUSD".to_string(), hourly(5));
        let mut holey = hourly(4);
        holey[2].close = None;
        series.insert("ETHUSD".to_string(), holey);

        let report = write_aligned(&mut conn, &series, tf, "s1", &QualityThresholds::default(), 1).unwrap();
        assert_eq!(report.rows_written, 9);
        assert_eq!(report.symbols.len(), 2);

        let btc = fetch_aligned(&conn, "BTCUSD", tf, None, None).unwrap();
        assert_eq!(btc.len(), 5);
        assert!(btc.iter().all(|r| r.coherence_score == 1.0 && r.gap_count == 0));
        assert_eq!(btc[0].alignment_session_id, "s1");

        let eth = fetch_aligned(&conn, "ETHUSD", tf, None, None).unwrap();
        assert_eq!(eth[2].close, None);
        assert_eq!(eth[0].coherence_score, 0.75);

        // other timeframes are a separate keyspace
        let other = fetch_aligned(&conn, "BTCUSD", "4h".parse().unwrap(), None, None).unwrap();
        assert!(other.is_empty());
    }

    #[test]
    fn test_rewrite_replaces_rows() {
        let mut conn = test_conn();
        let tf: Timeframe = "1h".parse().unwrap();
        let mut series = BTreeMap::new();
        series.insert("BTCUSD".to_string(), hourly(3));

        write_aligned(&mut conn, &series, tf, "s1", &QualityThresholds::default(), 1).unwrap();
        write_aligned(&mut conn, &series, tf, "s2", &QualityThresholds::default(), 2).unwrap();

        let rows = fetch_aligned(&conn, "BTCUSD", tf, None, None).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.alignment_session_id == "s2"));
    }

    #[test]
    fn test_session_roundtrip_and_conflict() {
        let mut conn = test_conn();
        let tf: Timeframe = "1h".parse().unwrap();
        let mut bars = hourly(6);
        // 3h hole against a 1h median delta -> one gap
        bars.remove(3);
        bars.remove(2);
        let mut series = BTreeMap::new();
        series.insert("BTCUSD".to_string(), bars);

        let report = write_aligned(&mut conn, &series, tf, "run-1", &QualityThresholds::default(), 1).unwrap();
        let session = AlignmentSession::from_reports("run-1", &[report], 42);

        assert_eq!(session.symbols, vec!["BTCUSD"]);
        assert_eq!(session.timeframes, vec![tf]);
        assert_eq!(session.aggregate_quality, 1.0);
        assert_eq!(session.timeline_start, Some(1_700_000_000));
        assert_eq!(session.timeline_end, Some(1_700_000_000 + 5 * 3_600));
        assert_eq!(session.gaps.len(), 1);

        insert_session(&conn, &session).unwrap();
        let err = insert_session(&conn, &session).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let read = fetch_session(&conn, "run-1").unwrap().unwrap();
        assert_eq!(read, session);
        assert!(fetch_session(&conn, "missing").unwrap().is_none());
        assert_eq!(latest_session(&conn).unwrap().unwrap().session_id, "run-1");
    }

    #[test]
    fn test_failed_write_leaves_nothing() {
        let mut conn = test_conn();
        conn.execute_batch(
            "CREATE TRIGGER no_eth BEFORE INSERT ON aligned_candles
             WHEN NEW.symbol = 'ETHUSD'
             BEGIN SELECT RAISE(ABORT, 'blocked'); END;",
        )
        .unwrap();

        let mut series = BTreeMap::new();
        series.insert("BTCUSD".to_string(), hourly(3));
        series.insert("ETHUSD".to_string(), hourly(3));

        let tf: Timeframe = "1h".parse().unwrap();
        assert!(write_aligned(&mut conn, &series, tf, "s1", &QualityThresholds::default(), 1).is_err());
        assert!(fetch_aligned(&conn, "BTCUSD", tf, None, None).unwrap().is_empty());
    }
}
