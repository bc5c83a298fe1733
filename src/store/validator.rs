//! Record validator - timestamp normalization + OHLCV domain invariants
//!
//! Checks run in a fixed order and the first violation wins:
//! 1. symbol present
//! 2. open/high/low/close > 0
//! 3. high >= low
//! 4. open and close within [low, high]
//! 5. volume >= 0
//! 6. timestamp within [min_timestamp, now + max_future_secs]
//!
//! Bad records are rejected, never repaired.

use super::types::Candle;
use std::sync::Arc;

/// 2010-01-01T00:00:00Z
pub const MIN_PLAUSIBLE_TIMESTAMP: i64 = 1_262_304_000;

/// Anything above this is treated as a millisecond timestamp
pub const MILLIS_THRESHOLD: i64 = 10_000_000_000;

/// How far into the future a candle may be stamped (one year)
pub const MAX_FUTURE_SECS: i64 = 365 * 86_400;

/// Clock used for plausibility checks and row stamping
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// System clock (unix seconds)
pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp())
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptySymbol,
    InvalidPrice { field: &'static str, value: f64 },
    InvertedRange { high: f64, low: f64 },
    OutOfRangeField { field: &'static str, value: f64 },
    ImplausibleTimestamp { timestamp: i64 },
}

impl ValidationError {
    /// Stable kind label used for rejection counters
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::EmptySymbol => "EmptySymbol",
            ValidationError::InvalidPrice { .. } => "InvalidPrice",
            ValidationError::InvertedRange { .. } => "InvertedRange",
            ValidationError::OutOfRangeField { .. } => "OutOfRangeField",
            ValidationError::ImplausibleTimestamp { .. } => "ImplausibleTimestamp",
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::EmptySymbol => write!(f, "symbol is empty"),
            ValidationError::InvalidPrice { field, value } => {
                write!(f, "{} must be positive, got {}", field, value)
            }
            ValidationError::InvertedRange { high, low } => {
                write!(f, "high ({}) is below low ({})", high, low)
            }
            ValidationError::OutOfRangeField { field, value } => {
                write!(f, "{} out of range: {}", field, value)
            }
            ValidationError::ImplausibleTimestamp { timestamp } => {
                write!(f, "implausible timestamp: {}", timestamp)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Normalize millisecond-resolution timestamps to seconds
pub fn normalize_timestamp(timestamp: i64) -> i64 {
    if timestamp > MILLIS_THRESHOLD {
        timestamp / 1000
    } else {
        timestamp
    }
}

/// Validates candles against OHLCV invariants
pub struct RecordValidator {
    min_timestamp: i64,
    max_future_secs: i64,
    now_fn: Clock,
}

impl RecordValidator {
    pub fn new(min_timestamp: i64, now_fn: Clock) -> Self {
        Self {
            min_timestamp,
            max_future_secs: MAX_FUTURE_SECS,
            now_fn,
        }
    }

    /// Validate a single candle
    ///
    /// Returns a normalized copy (trimmed symbol, timestamp in seconds) or the
    /// first invariant it violates.
    pub fn validate(&self, candle: &Candle) -> Result<Candle, ValidationError> {
        let symbol = candle.symbol.trim();
        if symbol.is_empty() {
            return Err(ValidationError::EmptySymbol);
        }

        // NaN fails `> 0.0`, infinities are not prices either
        for (field, value) in [
            ("open", candle.open),
            ("high", candle.high),
            ("low", candle.low),
            ("close", candle.close),
        ] {
            if !(value > 0.0) || !value.is_finite() {
                return Err(ValidationError::InvalidPrice { field, value });
            }
        }

        if candle.high < candle.low {
            return Err(ValidationError::InvertedRange {
                high: candle.high,
                low: candle.low,
            });
        }

        for (field, value) in [("open", candle.open), ("close", candle.close)] {
            if value < candle.low || value > candle.high {
                return Err(ValidationError::OutOfRangeField { field, value });
            }
        }

        if !(candle.volume >= 0.0) || !candle.volume.is_finite() {
            return Err(ValidationError::OutOfRangeField {
                field: "volume",
                value: candle.volume,
            });
        }

        let timestamp = normalize_timestamp(candle.timestamp);
        let latest = (self.now_fn)() + self.max_future_secs;
        if timestamp < self.min_timestamp || timestamp > latest {
            return Err(ValidationError::ImplausibleTimestamp { timestamp });
        }

        Ok(Candle {
            symbol: symbol.to_string(),
            timestamp,
            ..candle.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn validator() -> RecordValidator {
        RecordValidator::new(MIN_PLAUSIBLE_TIMESTAMP, Arc::new(|| NOW))
    }

    fn good() -> Candle {
        Candle::new("BTCUSD", NOW - 3_600, 100.0, 110.0, 95.0, 105.0, 12.5)
    }

    #[test]
    fn test_valid_candle_passes() {
        let out = validator().validate(&good()).unwrap();
        assert_eq!(out, good());
    }

    #[test]
    fn test_millisecond_timestamp_normalized() {
        let mut c = good();
        c.timestamp = (NOW - 60) * 1000;
        let out = validator().validate(&c).unwrap();
        assert_eq!(out.timestamp, NOW - 60);
    }

    #[test]
    fn test_symbol_trimmed_and_required() {
        let mut c = good();
        c.symbol = "  ETHUSD ".to_string();
        assert_eq!(validator().validate(&c).unwrap().symbol, "ETHUSD");

        c.symbol = "   ".to_string();
        assert_eq!(validator().validate(&c), Err(ValidationError::EmptySymbol));
    }

    #[test]
    fn test_non_positive_prices_rejected() {
        let mut c = good();
        c.open = -1.0;
        let err = validator().validate(&c).unwrap_err();
        assert_eq!(err.kind(), "InvalidPrice");

        let mut c = good();
        c.low = 0.0;
        assert_eq!(
            validator().validate(&c),
            Err(ValidationError::InvalidPrice { field: "low", value: 0.0 })
        );

        let mut c = good();
        c.close = f64::NAN;
        assert_eq!(validator().validate(&c).unwrap_err().kind(), "InvalidPrice");
    }

    #[test]
    fn test_inverted_range_rejected() {
        let c = Candle::new("BTCUSD", NOW, 15.0, 10.0, 20.0, 15.0, 1.0);
        assert_eq!(
            validator().validate(&c),
            Err(ValidationError::InvertedRange { high: 10.0, low: 20.0 })
        );
    }

    #[test]
    fn test_open_close_outside_range_rejected() {
        let mut c = good();
        c.close = 111.0;
        assert_eq!(
            validator().validate(&c),
            Err(ValidationError::OutOfRangeField { field: "close", value: 111.0 })
        );

        let mut c = good();
        c.open = 94.0;
        assert_eq!(validator().validate(&c).unwrap_err().kind(), "OutOfRangeField");
    }

    #[test]
    fn test_negative_volume_rejected_zero_allowed() {
        let mut c = good();
        c.volume = 0.0;
        assert!(validator().validate(&c).is_ok());

        c.volume = -0.01;
        assert_eq!(
            validator().validate(&c),
            Err(ValidationError::OutOfRangeField { field: "volume", value: -0.01 })
        );
    }

    #[test]
    fn test_timestamp_plausibility_window() {
        let mut c = good();
        c.timestamp = MIN_PLAUSIBLE_TIMESTAMP - 1;
        assert_eq!(validator().validate(&c).unwrap_err().kind(), "ImplausibleTimestamp");

        c.timestamp = MIN_PLAUSIBLE_TIMESTAMP;
        assert!(validator().validate(&c).is_ok());

        c.timestamp = NOW + MAX_FUTURE_SECS;
        assert!(validator().validate(&c).is_ok());

        c.timestamp = NOW + MAX_FUTURE_SECS + 1;
        assert_eq!(validator().validate(&c).unwrap_err().kind(), "ImplausibleTimestamp");
    }

    #[test]
    fn test_check_order_price_before_range() {
        // Negative price AND inverted range: price check runs first
        let c = Candle::new("BTCUSD", NOW, -5.0, 10.0, 20.0, 15.0, 1.0);
        assert_eq!(validator().validate(&c).unwrap_err().kind(), "InvalidPrice");
    }

    #[test]
    fn test_relaxed_lower_bound() {
        let v = RecordValidator::new(0, Arc::new(|| NOW));
        let c = Candle::new("BTCUSD", 100, 10.0, 11.0, 9.0, 10.5, 1.0);
        assert_eq!(v.validate(&c).unwrap().timestamp, 100);
    }
}
