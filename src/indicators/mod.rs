// Technical indicators module
// ATR and momentum feed the trailing stop; RSI and Bollinger feed the reference signal

pub mod atr;
pub mod momentum;
pub mod moving_average;
pub mod rsi;

pub use atr::{average_atr, calculate_atr, calculate_atr_series, volatility_ratio};
pub use momentum::{mean_abs_move, momentum_ratio};
pub use moving_average::{calculate_bollinger, calculate_sma, BollingerBands};
pub use rsi::calculate_rsi;
