// Signal generation module
pub mod rsi_bollinger;

use crate::models::{Candle, Signal};

pub use rsi_bollinger::{RsiBollingerConfig, RsiBollingerSignal};

/// Source of discrete trade signals
///
/// Callers must only pass committed history: the last candle in `candles`
/// has to be closed. Evaluating an in-progress candle leaks look-ahead.
pub trait SignalSource: Send + Sync {
    /// Detect a signal on the most recent closed candle
    fn detect(&self, candles: &[Candle]) -> Signal;

    /// Get signal source name
    fn name(&self) -> &str;

    /// Minimum candles required before `detect` can emit anything
    fn min_candles_required(&self) -> usize;
}
