use super::SignalSource;
use crate::indicators::{calculate_bollinger, calculate_rsi, calculate_sma, BollingerBands};
use crate::models::{Candle, Signal};

/// Configuration for the RSI + Bollinger + volume breakout signal
#[derive(Debug, Clone)]
pub struct RsiBollingerConfig {
    pub rsi_period: usize,
    pub bb_period: usize,
    pub bb_std: f64,
    pub volume_period: usize,
    pub volume_multiplier: f64, // Volume spike threshold vs. volume SMA
    pub min_candles: usize,
}

impl Default for RsiBollingerConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            bb_period: 20,
            bb_std: 2.0,
            volume_period: 20,
            volume_multiplier: 1.5,
            min_candles: 100,
        }
    }
}

/// Breakout signal: momentum (RSI) + band break or expansion + volume spike
pub struct RsiBollingerSignal {
    config: RsiBollingerConfig,
}

struct Snapshot {
    rsi: f64,
    prev_rsi: f64,
    bands: BollingerBands,
    prev_bands: BollingerBands,
    close: f64,
    volume: f64,
    volume_sma: f64,
}

impl RsiBollingerSignal {
    pub fn new(config: RsiBollingerConfig) -> Self {
        Self { config }
    }

    fn snapshot(&self, candles: &[Candle]) -> Option<Snapshot> {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
        let prev = closes.len().checked_sub(1)?;

        let last = candles.last()?;
        Some(Snapshot {
            rsi: calculate_rsi(&closes, self.config.rsi_period)?,
            prev_rsi: calculate_rsi(&closes[..prev], self.config.rsi_period)?,
            bands: calculate_bollinger(&closes, self.config.bb_period, self.config.bb_std)?,
            prev_bands: calculate_bollinger(
                &closes[..prev],
                self.config.bb_period,
                self.config.bb_std,
            )?,
            close: last.close,
            volume: last.volume,
            volume_sma: calculate_sma(&volumes, self.config.volume_period)?,
        })
    }
}

impl Default for RsiBollingerSignal {
    fn default() -> Self {
        Self::new(RsiBollingerConfig::default())
    }
}

impl SignalSource for RsiBollingerSignal {
    fn detect(&self, candles: &[Candle]) -> Signal {
        if candles.len() < self.config.min_candles {
            return Signal::None;
        }
        let Some(s) = self.snapshot(candles) else {
            return Signal::None;
        };

        let expanding = s.bands.width() > s.prev_bands.width();
        let volume_spike = s.volume > s.volume_sma * self.config.volume_multiplier;

        let rsi_buy = s.rsi > 50.0 && s.rsi > s.prev_rsi && s.prev_rsi >= 40.0;
        let bb_buy = s.close > s.bands.middle && (s.close > s.prev_bands.upper || expanding);
        if rsi_buy && bb_buy && volume_spike {
            tracing::info!(
                price = s.close,
                rsi = format!("{:.1}", s.rsi),
                "BUY signal detected"
            );
            return Signal::Buy;
        }

        let rsi_sell = s.rsi < 50.0 && s.rsi < s.prev_rsi && s.prev_rsi <= 60.0;
        let bb_sell = s.close < s.bands.middle && (s.close < s.prev_bands.lower || expanding);
        if rsi_sell && bb_sell && volume_spike {
            tracing::info!(
                price = s.close,
                rsi = format!("{:.1}", s.rsi),
                "SELL signal detected"
            );
            return Signal::Sell;
        }

        Signal::None
    }

    fn name(&self) -> &str {
        "rsi_bollinger_volume"
    }

    fn min_candles_required(&self) -> usize {
        self.config.min_candles
    }
}
