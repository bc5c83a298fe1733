//! Core data types for the candle store
//!
//! All types map to tables in `/sql/`:
//! - `candles` → `Candle`
//! - `aligned_candles` → `AlignedCandle` (see `alignment.rs`)
//!
//! Callers only ever receive owned copies of these; nothing hands out
//! references into storage.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One OHLCV observation for a symbol at a timestamp (unix seconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        symbol: impl Into<String>,
        timestamp: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// Projectable candle columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Column {
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl Column {
    pub const ALL: [Column; 5] = [
        Column::Open,
        Column::High,
        Column::Low,
        Column::Close,
        Column::Volume,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Column::Open => "open",
            Column::High => "high",
            Column::Low => "low",
            Column::Close => "close",
            Column::Volume => "volume",
        }
    }

    pub fn value_of(&self, candle: &Candle) -> f64 {
        match self {
            Column::Open => candle.open,
            Column::High => candle.high,
            Column::Low => candle.low,
            Column::Close => candle.close,
            Column::Volume => candle.volume,
        }
    }
}

impl FromStr for Column {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" | "o" => Ok(Column::Open),
            "high" | "h" => Ok(Column::High),
            "low" | "l" => Ok(Column::Low),
            "close" | "c" => Ok(Column::Close),
            "volume" | "v" => Ok(Column::Volume),
            other => Err(format!("unknown column: {}", other)),
        }
    }
}

/// Column-projected query row; `values` follow the requested column order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedRow {
    pub timestamp: i64,
    pub values: Vec<f64>,
}

/// Range read request for the primary store
///
/// Bounds are inclusive. `limit` keeps the first N rows in ascending order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandleQuery {
    pub symbol: String,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub limit: Option<usize>,
}

impl CandleQuery {
    pub fn symbol(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            start: None,
            end: None,
            limit: None,
        }
    }

    pub fn between(mut self, start: i64, end: i64) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn since(mut self, start: i64) -> Self {
        self.start = Some(start);
        self
    }

    pub fn until(mut self, end: i64) -> Self {
        self.end = Some(end);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Candle interval, e.g. `1m`, `15m`, `4h`, `1d`
///
/// Stored as its canonical label (largest whole unit), so `60m` and `1h`
/// name the same keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe {
    seconds: i64,
}

impl Timeframe {
    pub fn from_seconds(seconds: i64) -> Result<Self, String> {
        if seconds <= 0 {
            return Err(format!("timeframe must be positive, got {}s", seconds));
        }
        Ok(Self { seconds })
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    /// Whether `self` is a whole multiple of `finer` (and not finer itself)
    pub fn is_multiple_of(&self, finer: &Timeframe) -> bool {
        self.seconds > finer.seconds && self.seconds % finer.seconds == 0
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.seconds;
        if s % 604_800 == 0 {
            write!(f, "{}w", s / 604_800)
        } else if s % 86_400 == 0 {
            write!(f, "{}d", s / 86_400)
        } else if s % 3_600 == 0 {
            write!(f, "{}h", s / 3_600)
        } else if s % 60 == 0 {
            write!(f, "{}m", s / 60)
        } else {
            write!(f, "{}s", s)
        }
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s.len() < 2 {
            return Err(format!("invalid timeframe: '{}'", s));
        }
        let (num_str, unit) = s.split_at(s.len() - 1);
        let n: i64 = num_str
            .parse()
            .map_err(|_| format!("invalid timeframe: '{}'", s))?;
        let mult = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3_600,
            "d" => 86_400,
            "w" => 604_800,
            _ => return Err(format!("invalid timeframe unit in '{}'", s)),
        };
        let seconds = n
            .checked_mul(mult)
            .ok_or_else(|| format!("timeframe too large: '{}'", s))?;
        Timeframe::from_seconds(seconds)
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.to_string()
    }
}

/// One bar of a series handed to the alignment store
///
/// Fields are optional: upstream alignment may leave holes, which count
/// against completeness rather than being rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesBar {
    pub timestamp: i64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
}

impl SeriesBar {
    /// Fully populated bar
    pub fn complete(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open: Some(open),
            high: Some(high),
            low: Some(low),
            close: Some(close),
            volume: Some(volume),
        }
    }

    /// Number of present (non-missing, finite) OHLCV fields, 0..=5
    pub fn present_fields(&self) -> usize {
        [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .filter(|v| v.map_or(false, f64::is_finite))
            .count()
    }
}

impl From<&Candle> for SeriesBar {
    fn from(c: &Candle) -> Self {
        SeriesBar::complete(c.timestamp, c.open, c.high, c.low, c.close, c.volume)
    }
}
