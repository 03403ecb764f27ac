//! Price indicators over candle series.

use rust_decimal::Decimal;

use crate::types::Candle;

/// Volume-weighted average of typical prices.
///
/// With zero total volume this falls back to the last close. Empty input yields `None`.
pub fn vwap(candles: &[Candle]) -> Option<Decimal> {
    let last = candles.last()?;
    let mut weighted = Decimal::ZERO;
    let mut volume = Decimal::ZERO;
    for candle in candles {
        let v = Decimal::from(candle.volume);
        weighted += candle.typical_price() * v;
        volume += v;
    }
    if volume.is_zero() {
        Some(last.close)
    } else {
        Some(weighted / volume)
    }
}

/// True range of `current` given the previous close.
pub fn true_range(current: &Candle, prev_close: Decimal) -> Decimal {
    // True Range = max(H-L, |H-Pc|, |L-Pc|)
    let hl = current.high - current.low;
    let hpc = (current.high - prev_close).abs();
    let lpc = (current.low - prev_close).abs();
    hl.max(hpc).max(lpc)
}

/// Average True Range over the last `period` true ranges.
///
/// Needs at least `period + 1` candles.
pub fn atr(candles: &[Candle], period: usize) -> Option<Decimal> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let sum: Decimal = candles
        .windows(2)
        .rev()
        .take(period)
        .map(|pair| true_range(&pair[1], pair[0].close))
        .sum();
    Some(sum / Decimal::from(period))
}

/// Mean volume of the last `lookback` candles.
pub fn average_volume(candles: &[Candle], lookback: usize) -> Option<Decimal> {
    let start = candles.len().saturating_sub(lookback);
    let window = &candles[start..];
    if window.is_empty() {
        return None;
    }
    let total: u64 = window.iter().map(|c| c.volume).sum();
    Some(Decimal::from(total) / Decimal::from(window.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bar(i: i64, high: i64, low: i64, close: i64, volume: u64) -> Candle {
        Candle::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 3, 45, 0).unwrap() + Duration::minutes(5 * i),
            Decimal::new(close, 0),
            Decimal::new(high, 0),
            Decimal::new(low, 0),
            Decimal::new(close, 0),
            volume,
        )
    }

    #[test]
    fn test_vwap_weights_by_volume() {
        // typical prices 100 and 103
        let candles = vec![bar(0, 101, 99, 100, 100), bar(1, 104, 102, 103, 300)];
        let v = vwap(&candles).unwrap();
        assert_eq!(v, Decimal::new(10225, 2));
    }

    #[test]
    fn test_vwap_zero_volume_uses_last_close() {
        let candles = vec![bar(0, 101, 99, 100, 0), bar(1, 104, 102, 103, 0)];
        assert_eq!(vwap(&candles), Some(Decimal::new(103, 0)));
        assert_eq!(vwap(&[]), None);
    }

    #[test]
    fn test_atr_uses_gaps() {
        let candles = vec![
            bar(0, 102, 98, 100, 1),
            bar(1, 103, 101, 102, 1), // TR 3 (|103-100|)
            bar(2, 102, 96, 97, 1),   // TR 6
            bar(3, 99, 97, 98, 1),    // TR 2
        ];
        assert_eq!(atr(&candles, 3), Some(Decimal::new(11, 0) / Decimal::from(3)));
        assert_eq!(atr(&candles, 2), Some(Decimal::new(4, 0)));
        assert_eq!(atr(&candles, 4), None);
    }

    #[test]
    fn test_average_volume_lookback() {
        let candles: Vec<_> = (0..6).map(|i| bar(i, 101, 99, 100, (i as u64 + 1) * 10)).collect();
        assert_eq!(average_volume(&candles, 3), Some(Decimal::new(50, 0)));
        assert_eq!(average_volume(&candles, 100), Some(Decimal::new(35, 0)));
        assert_eq!(average_volume(&[], 3), None);
    }
}
