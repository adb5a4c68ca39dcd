/// Average True Range (ATR) indicator
///
/// Measures market volatility by calculating the average of true ranges over a period.
/// True Range is the greatest of:
/// - Current High - Current Low
/// - Abs(Current High - Previous Close)
/// - Abs(Current Low - Previous Close)
///
/// Uses Wilder's smoothing for the moving average.
use crate::models::Candle;

fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    candles
        .windows(2)
        .map(|pair| {
            let high = pair[1].high;
            let low = pair[1].low;
            let prev_close = pair[0].close;

            (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs())
        })
        .collect()
}

/// Calculate ATR for the given candles
///
/// Returns the current ATR value, or None if insufficient data
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    calculate_atr_series(candles, period).last().copied()
}

/// Calculate ATR and return all intermediate values
///
/// The first value corresponds to candle index `period`
pub fn calculate_atr_series(candles: &[Candle], period: usize) -> Vec<f64> {
    if period == 0 || candles.len() < period + 1 {
        return Vec::new();
    }

    let trs = true_ranges(candles);

    // First ATR is simple average of first 'period' true ranges
    let first_atr: f64 = trs.iter().take(period).sum::<f64>() / period as f64;

    let mut series = Vec::with_capacity(trs.len() - period + 1);
    series.push(first_atr);

    let mut atr = first_atr;
    for tr in &trs[period..] {
        atr = (atr * (period as f64 - 1.0) + tr) / period as f64;
        series.push(atr);
    }

    series
}

/// Mean of the last `lookback` ATR values (current included)
///
/// Falls back to the mean of whatever is available when the series is shorter.
pub fn average_atr(candles: &[Candle], period: usize, lookback: usize) -> Option<f64> {
    let series = calculate_atr_series(candles, period);
    if series.is_empty() || lookback == 0 {
        return None;
    }
    let tail = &series[series.len().saturating_sub(lookback)..];
    Some(tail.iter().sum::<f64>() / tail.len() as f64)
}

/// Current ATR relative to its trailing average (1.0 = normal volatility)
pub fn volatility_ratio(current_atr: f64, average_atr: f64) -> Option<f64> {
    if average_atr <= 0.0 || !average_atr.is_finite() {
        return None;
    }
    Some(current_atr / average_atr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn create_test_candles(prices: &[(f64, f64, f64, f64)]) -> Vec<Candle> {
        let start = Utc::now();
        prices
            .iter()
            .enumerate()
            .map(|(i, &(open, high, low, close))| Candle {
                timestamp: start + Duration::minutes(3 * i as i64),
                open,
                high,
                low,
                close,
                volume: 1000.0,
            })
            .collect()
    }

    #[test]
    fn test_calculate_atr_flat_range() {
        let candles = create_test_candles(&[(100.0, 101.0, 99.0, 100.0); 15]);
        let atr = calculate_atr(&candles, 14).unwrap();

        // Every true range is exactly high - low
        assert!((atr - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_calculate_atr_high_volatility() {
        let candles = create_test_candles(&[
            (100.0, 105.0, 95.0, 102.0),
            (102.0, 110.0, 98.0, 105.0),
            (105.0, 108.0, 92.0, 95.0),
            (95.0, 103.0, 88.0, 100.0),
            (100.0, 115.0, 97.0, 110.0),
            (110.0, 112.0, 95.0, 98.0),
            (98.0, 108.0, 90.0, 105.0),
            (105.0, 120.0, 100.0, 115.0),
            (115.0, 118.0, 105.0, 110.0),
            (110.0, 125.0, 108.0, 120.0),
            (120.0, 130.0, 115.0, 125.0),
            (125.0, 128.0, 110.0, 115.0),
            (115.0, 122.0, 105.0, 118.0),
            (118.0, 130.0, 115.0, 125.0),
            (125.0, 135.0, 120.0, 130.0),
        ]);

        assert!(calculate_atr(&candles, 14).unwrap() > 10.0);
    }

    #[test]
    fn test_insufficient_data() {
        let candles = create_test_candles(&[(100.0, 101.0, 99.0, 100.0); 2]);
        assert!(calculate_atr(&candles, 14).is_none());
        assert!(average_atr(&candles, 14, 50).is_none());
    }

    #[test]
    fn test_atr_series_length() {
        let candles = create_test_candles(&[(100.0, 105.0, 95.0, 100.0); 20]);
        // 20 candles → 19 true ranges → 19 - 14 + 1 values
        assert_eq!(calculate_atr_series(&candles, 14).len(), 6);
    }

    #[test]
    fn test_average_atr_after_spike() {
        let mut prices = vec![(100.0, 101.0, 99.0, 100.0); 30];
        prices.extend(vec![(100.0, 110.0, 90.0, 100.0); 5]);
        let candles = create_test_candles(&prices);

        let current = calculate_atr(&candles, 14).unwrap();
        let average = average_atr(&candles, 14, 50).unwrap();
        assert!(current > average);

        let ratio = volatility_ratio(current, average).unwrap();
        assert!(ratio > 1.0);
    }

    #[test]
    fn test_volatility_ratio_zero_average() {
        assert!(volatility_ratio(2.0, 0.0).is_none());
    }
}
