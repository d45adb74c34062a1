//! Time and decimal helpers shared across the pipeline.
//!
//! All records carry nanosecond wall-clock timestamps; fixed-grid aggregation
//! aligns windows to the Unix epoch.

use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Nanoseconds per millisecond.
pub const NS_PER_MS: u64 = 1_000_000;

/// Nanoseconds per second.
pub const NS_PER_SEC: u64 = 1_000_000_000;

/// Current wall-clock time as nanoseconds since the Unix epoch.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Epoch-aligned window start for a timestamp and grid width.
pub fn window_start(ts_ns: u64, width_ns: u64) -> u64 {
    ts_ns - (ts_ns % width_ns)
}

/// Venue timestamps arrive in milliseconds; records carry nanoseconds.
pub fn ms_to_ns(ts_ms: u64) -> u64 {
    ts_ms * NS_PER_MS
}

/// Parse a venue decimal string ("67650.00") into an exact decimal.
pub fn parse_decimal(value: &str) -> Result<Decimal, rust_decimal::Error> {
    Decimal::from_str(value)
}

/// Lossless-enough f64 view of a decimal for derived float metrics.
pub fn dec_to_f64(value: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or(0.0)
}

/// Convert a derived float metric back into the record decimal domain.
///
/// Non-finite values collapse to zero so a degenerate divide upstream can
/// never poison a sink row.
pub fn f64_to_dec(value: f64) -> Decimal {
    use rust_decimal::prelude::FromPrimitive;
    if !value.is_finite() {
        return Decimal::ZERO;
    }
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_start_alignment() {
        let width = 5 * NS_PER_SEC;
        assert_eq!(window_start(0, width), 0);
        assert_eq!(window_start(4_999_999_999, width), 0);
        assert_eq!(window_start(5_000_000_000, width), 5_000_000_000);
        assert_eq!(window_start(12_345_678_901, width), 10_000_000_000);
    }

    #[test]
    fn test_parse_decimal_exact() {
        let d = parse_decimal("67650.00").unwrap();
        assert_eq!(d.to_string(), "67650.00");
        assert!(parse_decimal("not-a-number").is_err());
    }

    #[test]
    fn test_f64_round_trip_guards() {
        assert_eq!(f64_to_dec(f64::NAN), Decimal::ZERO);
        assert_eq!(f64_to_dec(f64::INFINITY), Decimal::ZERO);
        assert_eq!(f64_to_dec(1.5), Decimal::new(15, 1));
    }

    #[test]
    fn test_ms_to_ns() {
        assert_eq!(ms_to_ns(1_699_999_999_123), 1_699_999_999_123_000_000);
    }
}
