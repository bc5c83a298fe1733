//! Cross-timeframe coherence
//!
//! A finer series (e.g. 1h) rolled up into the coarser bucket size (e.g. 4h)
//! should reproduce the coarser bars. `compare_timeframes` measures how often
//! it does; results are appended to `coherence_observations` and summarized
//! per (source, target) pair by `coherence_stats`.

use super::alignment::AlignedCandle;
use super::types::Timeframe;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// Relative OHLC tolerance when comparing a rollup with a stored bar
pub const PRICE_TOLERANCE: f64 = 0.001;

/// At most this many disagreements are listed per check
pub const MAX_ISSUES: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoherenceObservation {
    pub id: Option<i64>,
    pub source_timeframe: Timeframe,
    pub target_timeframe: Timeframe,
    pub symbol: String,
    pub coherence_score: f64,
    pub period_start: i64,
    pub period_end: i64,
    pub issues: Vec<String>,
    pub observed_at: i64,
}

/// Aggregate over all observations of one timeframe pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoherenceStats {
    pub source_timeframe: Timeframe,
    pub target_timeframe: Timeframe,
    pub observations: u64,
    pub avg_coherence: f64,
    pub min_coherence: f64,
    pub max_coherence: f64,
    pub low_coherence_count: u64,
}

/// Result of one rollup-vs-stored comparison
#[derive(Debug, Clone, PartialEq)]
pub struct CrossCheck {
    pub compared: usize,
    pub agreeing: usize,
    pub score: f64,
    pub period_start: i64,
    pub period_end: i64,
    pub issues: Vec<String>,
}

pub fn insert_observation(conn: &Connection, obs: &CoherenceObservation) -> rusqlite::Result<i64> {
    let issues_json = serde_json::to_string(&obs.issues)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    conn.execute(
        r#"
        INSERT INTO coherence_observations (
            source_timeframe, target_timeframe, symbol, coherence_score,
            period_start, period_end, issues_json, observed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            obs.source_timeframe.to_string(),
            obs.target_timeframe.to_string(),
            obs.symbol,
            obs.coherence_score,
            obs.period_start,
            obs.period_end,
            issues_json,
            obs.observed_at,
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Per-pair coherence summary, optionally restricted to one pair
pub fn coherence_stats(
    conn: &Connection,
    pair: Option<(Timeframe, Timeframe)>,
    low_threshold: f64,
) -> rusqlite::Result<Vec<CoherenceStats>> {
    let (source, target) = match pair {
        Some((s, t)) => (Some(s.to_string()), Some(t.to_string())),
        None => (None, None),
    };

    let mut stmt = conn.prepare(
        r#"
        SELECT source_timeframe, target_timeframe, COUNT(*),
               AVG(coherence_score), MIN(coherence_score), MAX(coherence_score),
               SUM(CASE WHEN coherence_score < ?3 THEN 1 ELSE 0 END)
        FROM coherence_observations
        WHERE (?1 IS NULL OR source_timeframe = ?1)
          AND (?2 IS NULL OR target_timeframe = ?2)
        GROUP BY source_timeframe, target_timeframe
        ORDER BY source_timeframe, target_timeframe
        "#,
    )?;

    let rows = stmt.query_map(params![source, target, low_threshold], |row| {
        let parse = |idx: usize, s: String| -> rusqlite::Result<Timeframe> {
            s.parse().map_err(|e: String| {
                rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
            })
        };
        Ok(CoherenceStats {
            source_timeframe: parse(0, row.get(0)?)?,
            target_timeframe: parse(1, row.get(1)?)?,
            observations: row.get::<_, i64>(2)? as u64,
            avg_coherence: row.get(3)?,
            min_coherence: row.get(4)?,
            max_coherence: row.get(5)?,
            low_coherence_count: row.get::<_, i64>(6)? as u64,
        })
    })?;

    let stats = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(stats)
}

fn note(issues: &mut Vec<String>, msg: String) {
    if issues.len() < MAX_ISSUES {
        issues.push(msg);
    }
}

fn within_tolerance(rolled: f64, stored: f64) -> bool {
    let scale = stored.abs().max(f64::EPSILON);
    (rolled - stored).abs() / scale <= PRICE_TOLERANCE
}

/// Roll `source` bars up into `target`-sized buckets and compare
///
/// Both slices must be ascending by timestamp. For each target bar at `t`
/// the bucket is every source bar in `[t, t + target)`. A bucket with fewer
/// than `target / source` bars, or any missing OHLC field, disagrees.
/// Returns `None` when there is no target bar to compare.
pub fn compare_timeframes(
    source: &[AlignedCandle],
    target: &[AlignedCandle],
    source_tf: Timeframe,
    target_tf: Timeframe,
) -> Option<CrossCheck> {
    let first = target.first()?;
    let last = target.last()?;
    let expected = (target_tf.seconds() / source_tf.seconds()) as usize;

    let mut agreeing = 0usize;
    let mut issues = Vec::new();

    for bar in target {
        let lo = source.partition_point(|s| s.timestamp < bar.timestamp);
        let hi = source.partition_point(|s| s.timestamp < bar.timestamp + target_tf.seconds());
        let bucket = &source[lo..hi];

        if bucket.len() < expected {
            note(
                &mut issues,
                format!(
                    "{}: incomplete bucket ({} of {} {} bars)",
                    bar.timestamp,
                    bucket.len(),
                    expected,
                    source_tf
                ),
            );
            continue;
        }

        let (Some(open), Some(high), Some(low), Some(close)) = (bar.open, bar.high, bar.low, bar.close) else {
            note(&mut issues, format!("{}: target bar has missing fields", bar.timestamp));
            continue;
        };

        let rolled_open = bucket.first().and_then(|b| b.open);
        let rolled_close = bucket.last().and_then(|b| b.close);
        let highs: Option<Vec<f64>> = bucket.iter().map(|b| b.high).collect();
        let lows: Option<Vec<f64>> = bucket.iter().map(|b| b.low).collect();

        let (Some(r_open), Some(r_close), Some(highs), Some(lows)) = (rolled_open, rolled_close, highs, lows) else {
            note(&mut issues, format!("{}: source bucket has missing fields", bar.timestamp));
            continue;
        };
        let r_high = highs.iter().copied().fold(f64::MIN, f64::max);
        let r_low = lows.iter().copied().fold(f64::MAX, f64::min);

        let mismatches: Vec<String> = [
            ("open", r_open, open),
            ("high", r_high, high),
            ("low", r_low, low),
            ("close", r_close, close),
        ]
        .iter()
        .filter(|(_, rolled, stored)| !within_tolerance(*rolled, *stored))
        .map(|(field, rolled, stored)| format!("{} {} vs {}", field, rolled, stored))
        .collect();

        if mismatches.is_empty() {
            agreeing += 1;
        } else {
            note(&mut issues, format!("{}: {}", bar.timestamp, mismatches.join(", ")));
        }
    }

    Some(CrossCheck {
        compared: target.len(),
        agreeing,
        score: agreeing as f64 / target.len() as f64,
        period_start: first.timestamp,
        period_end: last.timestamp,
        issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::run_schema_migrations;

    fn bar(tf: Timeframe, ts: i64, o: f64, h: f64, l: f64, c: f64) -> AlignedCandle {
        AlignedCandle {
            symbol: "BTCUSD".to_string(),
            timeframe: tf,
            timestamp: ts,
            open: Some(o),
            high: Some(h),
            low: Some(l),
            close: Some(c),
            volume: Some(1.0),
            alignment_session_id: "s".to_string(),
            coherence_score: 1.0,
            data_quality_score: 1.0,
            gap_count: 0,
        }
    }

    fn tfs() -> (Timeframe, Timeframe) {
        ("1h".parse().unwrap(), "4h".parse().unwrap())
    }

    /// 8 hourly bars and the two 4h bars they roll up to
    fn consistent() -> (Vec<AlignedCandle>, Vec<AlignedCandle>) {
        let (h1, h4) = tfs();
        let source: Vec<AlignedCandle> = (0..8)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar(h1, i * 3_600, base, base + 2.0, base - 1.0, base + 1.0)
            })
            .collect();
        let target = vec![
            bar(h4, 0, 100.0, 105.0, 99.0, 104.0),
            bar(h4, 14_400, 104.0, 109.0, 103.0, 108.0),
        ];
        (source, target)
    }

    #[test]
    fn test_consistent_rollup_scores_one() {
        let (h1, h4) = tfs();
        let (source, target) = consistent();
        let check = compare_timeframes(&source, &target, h1, h4).unwrap();
        assert_eq!(check.score, 1.0);
        assert_eq!(check.compared, 2);
        assert!(check.issues.is_empty());
        assert_eq!((check.period_start, check.period_end), (0, 14_400));
    }

    #[test]
    fn test_corrupted_target_bar_reported() {
        let (h1, h4) = tfs();
        let (source, mut target) = consistent();
        target[1].high = Some(150.0);

        let check = compare_timeframes(&source, &target, h1, h4).unwrap();
        assert_eq!(check.score, 0.5);
        assert_eq!(check.issues.len(), 1);
        assert!(check.issues[0].starts_with("14400: high"));
    }

    #[test]
    fn test_tolerance_and_incomplete_buckets() {
        let (h1, h4) = tfs();
        let (mut source, mut target) = consistent();

        // 0.05% off is within tolerance
        target[0].close = Some(104.0 * 1.0005);
        // drop one hourly bar from the second bucket
        source.remove(6);

        let check = compare_timeframes(&source, &target, h1, h4).unwrap();
        assert_eq!(check.agreeing, 1);
        assert!(check.issues[0].contains("incomplete bucket (3 of 4 1h bars)"));
    }

    #[test]
    fn test_nothing_to_compare() {
        let (h1, h4) = tfs();
        let (source, _) = consistent();
        assert!(compare_timeframes(&source, &[], h1, h4).is_none());
    }

    #[test]
    fn test_stats_group_by_pair() {
        let conn = Connection::open_in_memory().unwrap();
        run_schema_migrations(&conn).unwrap();
        let (h1, h4) = tfs();
        let d1: Timeframe = "1d".parse().unwrap();

        for (target, score) in [(h4, 1.0), (h4, 0.5), (d1, 0.99)] {
            insert_observation(
                &conn,
                &CoherenceObservation {
                    id: None,
                    source_timeframe: h1,
                    target_timeframe: target,
                    symbol: "BTCUSD".to_string(),
                    coherence_score: score,
                    period_start: 0,
                    period_end: 1,
                    issues: vec![],
                    observed_at: 0,
                },
            )
            .unwrap();
        }

        let all = coherence_stats(&conn, None, 0.95).unwrap();
        assert_eq!(all.len(), 2);

        let pair = coherence_stats(&conn, Some((h1, h4)), 0.95).unwrap();
        assert_eq!(pair.len(), 1);
        let s = &pair[0];
        assert_eq!(s.observations, 2);
        assert_eq!(s.avg_coherence, 0.75);
        assert_eq!(s.min_coherence, 0.5);
        assert_eq!(s.max_coherence, 1.0);
        assert_eq!(s.low_coherence_count, 1);
    }
}
