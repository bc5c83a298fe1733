//! Quality & coherence analyzer
//!
//! Two halves:
//! - `analyze`: diagnostic report over stored candles (read-only)
//! - `score_series`: per-series scores attached to aligned rows
//!
//! Both are pure over their inputs; `analyze` only streams rows out of SQLite
//! into a `QualityAccumulator`.

use super::types::{Candle, SeriesBar};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Heuristic thresholds for quality and coherence scoring
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// |close - open| / open above this is an extreme move
    pub max_body_move: f64,

    /// (high - low) / low above this is an extreme move
    pub max_range: f64,

    /// A timestamp delta above `gap_multiplier × median delta` is a gap
    pub gap_multiplier: f64,

    /// Coherence observations below this count as low-coherence
    pub low_coherence: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            max_body_move: 0.20,
            max_range: 0.30,
            gap_multiplier: 2.0,
            low_coherence: 0.95,
        }
    }
}

impl QualityThresholds {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.max_body_move > 0.0) {
            return Err("max_body_move must be positive".to_string());
        }
        if !(self.max_range > 0.0) {
            return Err("max_range must be positive".to_string());
        }
        if !(self.gap_multiplier >= 1.0) {
            return Err("gap_multiplier must be at least 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.low_coherence) {
            return Err("low_coherence must lie in [0, 1]".to_string());
        }
        Ok(())
    }
}

/// Issue breakdown for one symbol
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SymbolQuality {
    pub symbol: String,
    pub total_rows: u64,
    pub duplicate_count: u64,
    pub invalid_ohlc_count: u64,
    pub zero_volume_count: u64,
    pub extreme_move_count: u64,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
    /// 100 - issues/rows × 100, floored at 0
    pub score: f64,
}

impl SymbolQuality {
    pub fn issue_count(&self) -> u64 {
        self.duplicate_count
            + self.invalid_ohlc_count
            + self.zero_volume_count
            + self.extreme_move_count
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityReport {
    pub total_rows: u64,
    pub duplicate_count: u64,
    pub invalid_ohlc_count: u64,
    pub zero_volume_count: u64,
    pub extreme_move_count: u64,
    pub per_symbol: BTreeMap<String, SymbolQuality>,
}

impl QualityReport {
    pub fn per_symbol_score(&self) -> BTreeMap<String, f64> {
        self.per_symbol
            .iter()
            .map(|(symbol, q)| (symbol.clone(), q.score))
            .collect()
    }

    pub fn issue_count(&self) -> u64 {
        self.duplicate_count
            + self.invalid_ohlc_count
            + self.zero_volume_count
            + self.extreme_move_count
    }
}

/// Folds candles (sorted by symbol, timestamp) into a `QualityReport`
///
/// A duplicate is every row after the first for the same key, so a key seen
/// three times contributes two.
pub struct QualityAccumulator {
    thresholds: QualityThresholds,
    report: QualityReport,
    last_key: Option<(String, i64)>,
}

impl QualityAccumulator {
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self {
            thresholds,
            report: QualityReport::default(),
            last_key: None,
        }
    }

    pub fn observe(&mut self, candle: &Candle) {
        let t = self.thresholds;
        let entry = self
            .report
            .per_symbol
            .entry(candle.symbol.clone())
            .or_insert_with(|| SymbolQuality {
                symbol: candle.symbol.clone(),
                ..Default::default()
            });

        entry.total_rows += 1;
        entry.first_timestamp = Some(entry.first_timestamp.map_or(candle.timestamp, |f| f.min(candle.timestamp)));
        entry.last_timestamp = Some(entry.last_timestamp.map_or(candle.timestamp, |l| l.max(candle.timestamp)));

        let is_duplicate = matches!(
            &self.last_key,
            Some((s, ts)) if *s == candle.symbol && *ts == candle.timestamp
        );
        if is_duplicate {
            entry.duplicate_count += 1;
        } else {
            self.last_key = Some((candle.symbol.clone(), candle.timestamp));
        }

        if !ohlc_invariants_hold(candle) {
            entry.invalid_ohlc_count += 1;
        }

        if candle.volume == 0.0 {
            entry.zero_volume_count += 1;
        }

        if is_extreme_move(candle, &t) {
            entry.extreme_move_count += 1;
        }
    }

    pub fn finish(mut self) -> QualityReport {
        let report = &mut self.report;
        for q in report.per_symbol.values_mut() {
            q.score = symbol_score(q.issue_count(), q.total_rows);
            report.total_rows += q.total_rows;
            report.duplicate_count += q.duplicate_count;
            report.invalid_ohlc_count += q.invalid_ohlc_count;
            report.zero_volume_count += q.zero_volume_count;
            report.extreme_move_count += q.extreme_move_count;
        }
        self.report
    }
}

/// Stored-row re-check of the validator's OHLC invariants
pub fn ohlc_invariants_hold(c: &Candle) -> bool {
    c.open > 0.0
        && c.high > 0.0
        && c.low > 0.0
        && c.close > 0.0
        && c.high >= c.low
        && c.high >= c.open.max(c.close)
        && c.low <= c.open.min(c.close)
        && c.volume >= 0.0
}

fn is_extreme_move(c: &Candle, t: &QualityThresholds) -> bool {
    let body = if c.open > 0.0 {
        (c.close - c.open).abs() / c.open
    } else {
        0.0
    };
    let range = if c.low > 0.0 {
        (c.high - c.low) / c.low
    } else {
        0.0
    };
    body > t.max_body_move || range > t.max_range
}

fn symbol_score(issues: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (100.0 - (issues as f64 / total as f64) * 100.0).max(0.0)
}

/// Scan stored candles (optionally one symbol) into a quality report
pub fn analyze(
    conn: &Connection,
    symbol: Option<&str>,
    thresholds: &QualityThresholds,
) -> rusqlite::Result<QualityReport> {
    let mut stmt = conn.prepare(
        r#"
        SELECT symbol, timestamp, open, high, low, close, volume
        FROM candles
        WHERE (?1 IS NULL OR symbol = ?1)
        ORDER BY symbol, timestamp
        "#,
    )?;

    let mut acc = QualityAccumulator::new(*thresholds);
    let mut rows = stmt.query(params![symbol])?;
    while let Some(row) = rows.next()? {
        let candle = Candle {
            symbol: row.get(0)?,
            timestamp: row.get(1)?,
            open: row.get(2)?,
            high: row.get(3)?,
            low: row.get(4)?,
            close: row.get(5)?,
            volume: row.get(6)?,
        };
        acc.observe(&candle);
    }

    Ok(acc.finish())
}

/// Scores attached to every aligned row of one (symbol, timeframe) series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesScores {
    pub coherence_score: f64,
    pub completeness: f64,
    pub data_quality_score: f64,
    pub gap_count: u32,
}

impl SeriesScores {
    pub const EMPTY: SeriesScores = SeriesScores {
        coherence_score: 0.0,
        completeness: 0.0,
        data_quality_score: 0.0,
        gap_count: 0,
    };
}

/// Score a whole series once
pub fn score_series(bars: &[SeriesBar], thresholds: &QualityThresholds) -> SeriesScores {
    if bars.is_empty() {
        return SeriesScores::EMPTY;
    }

    let coherence = coherence_score(bars);
    let completeness = completeness(bars);
    let timestamps: Vec<i64> = bars.iter().map(|b| b.timestamp).collect();

    SeriesScores {
        coherence_score: coherence,
        completeness,
        data_quality_score: (0.6 * completeness + 0.4 * coherence).clamp(0.0, 1.0),
        gap_count: gap_count(&timestamps, thresholds.gap_multiplier),
    }
}

/// Fraction of bars whose OHLC relationships hold; a missing field fails the bar
pub fn coherence_score(bars: &[SeriesBar]) -> f64 {
    if bars.is_empty() {
        return 0.0;
    }

    let coherent = bars
        .iter()
        .filter(|b| match (b.open, b.high, b.low, b.close) {
            (Some(o), Some(h), Some(l), Some(c)) => {
                h >= o.max(c) && l <= o.min(c) && h >= l
            }
            _ => false,
        })
        .count();

    (coherent as f64 / bars.len() as f64).clamp(0.0, 1.0)
}

/// Fraction of present fields across the five OHLCV columns
pub fn completeness(bars: &[SeriesBar]) -> f64 {
    if bars.is_empty() {
        return 0.0;
    }
    let present: usize = bars.iter().map(SeriesBar::present_fields).sum();
    (present as f64 / (bars.len() * 5) as f64).clamp(0.0, 1.0)
}

/// Count of consecutive deltas exceeding `multiplier × median delta`
///
/// Timestamps are sorted first. Fewer than two rows, or a non-positive median
/// (all timestamps equal), means no gaps.
pub fn gap_count(timestamps: &[i64], multiplier: f64) -> u32 {
    if timestamps.len() < 2 {
        return 0;
    }

    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();

    let mut deltas: Vec<f64> = sorted.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
    let median_delta = match median(&mut deltas) {
        Some(m) if m > 0.0 => m,
        _ => return 0,
    };

    let limit = multiplier * median_delta;
    sorted
        .windows(2)
        .filter(|w| (w[1] - w[0]) as f64 > limit)
        .count() as u32
}

/// Median of `values` (sorts in place)
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}
