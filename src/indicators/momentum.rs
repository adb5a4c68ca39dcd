/// Momentum exhaustion measure used by the trailing stop
///
/// Compares the mean absolute close-to-close move over the last `lookback`
/// closes with the mean move over the `lookback` closes before them.
/// A ratio well below 1.0 means the trend is running out of steam.
pub fn momentum_ratio(closes: &[f64], lookback: usize) -> Option<f64> {
    if lookback < 2 || closes.len() < lookback * 2 {
        return None;
    }

    let recent = &closes[closes.len() - lookback..];
    let earlier = &closes[closes.len() - lookback * 2..closes.len() - lookback];

    let earlier_move = mean_abs_move(earlier);
    if earlier_move == 0.0 {
        return None;
    }

    Some(mean_abs_move(recent) / earlier_move)
}

/// Mean absolute change per candle (dollars per candle)
pub fn mean_abs_move(closes: &[f64]) -> f64 {
    if closes.len() < 2 {
        return 0.0;
    }
    let total: f64 = closes.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    total / (closes.len() - 1) as f64
}
