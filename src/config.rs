use crate::models::Timeframe;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Full bot configuration
///
/// Layered as: built-in defaults → optional TOML file → `PERPGUARD_*` environment
/// variables (nested keys separated by `__`, e.g. `PERPGUARD_RISK__LEVERAGE=20`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub sizing: SizingConfig,
    pub market: MarketRules,
    pub risk: RiskConfig,
    pub verify: VerifyConfig,
    pub reconcile: ReconcileConfig,
    pub breaker: BreakerConfig,
    pub control: ControlConfig,
    pub logging: LogConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbol: "ETH/USDT:USDT".to_string(),
            timeframe: Timeframe::from_seconds(180),
            sizing: SizingConfig::default(),
            market: MarketRules::default(),
            risk: RiskConfig::default(),
            verify: VerifyConfig::default(),
            reconcile: ReconcileConfig::default(),
            breaker: BreakerConfig::default(),
            control: ControlConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    pub notional_usdt: f64,
    pub leverage: f64,
    pub margin_buffer: f64, // Free margin must cover notional * buffer
    pub fill_tolerance: f64,
    pub min_fill_ratio: f64, // Fills at or below this ratio abort the entry
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            notional_usdt: 50.0,
            leverage: 30.0,
            margin_buffer: 1.1,
            fill_tolerance: 0.95,
            min_fill_ratio: 0.5,
        }
    }
}

/// Exchange precision rules for the traded symbol
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketRules {
    pub quantity_step: f64,
    pub min_quantity: f64,
}

impl Default for MarketRules {
    fn default() -> Self {
        Self {
            quantity_step: 0.001,
            min_quantity: 0.001,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub atr_period: usize,
    pub initial_sl_mult: f64,
    pub breakeven_trigger_r: f64,
    pub trail_activate_r: f64,

    pub enable_dynamic_trailing: bool,
    pub trail_base_mult: f64, // Used when dynamic trailing is off
    pub trail_tight_mult: f64,   // R < medium_tier_r
    pub trail_medium_mult: f64,  // medium_tier_r <= R < loose_tier_r
    pub trail_loose_mult: f64,   // R >= loose_tier_r
    pub medium_tier_r: f64,
    pub loose_tier_r: f64,

    pub enable_volatility_adjust: bool,
    pub volatility_lookback: usize,
    pub high_volatility_ratio: f64,
    pub high_volatility_widen: f64,
    pub low_volatility_ratio: f64,
    pub low_volatility_tighten: f64,

    pub enable_momentum_trailing: bool,
    pub momentum_lookback: usize,
    pub momentum_slow_threshold: f64,
    pub momentum_tight_mult: f64,

    pub long_update_epsilon: f64,  // In ATR units
    pub short_update_epsilon: f64, // In ATR units

    pub enable_partial_exits: bool,
    pub partial_exit_1_r: f64,
    pub partial_exit_1_pct: f64,
    pub partial_exit_2_r: f64,
    pub partial_exit_2_pct: f64,

    pub emergency_stop_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            atr_period: 14,
            initial_sl_mult: 1.1,
            breakeven_trigger_r: 1.0,
            trail_activate_r: 1.0,

            enable_dynamic_trailing: true,
            trail_base_mult: 1.8,
            trail_tight_mult: 1.5,
            trail_medium_mult: 1.8,
            trail_loose_mult: 2.5,
            medium_tier_r: 3.0,
            loose_tier_r: 6.0,

            enable_volatility_adjust: true,
            volatility_lookback: 50,
            high_volatility_ratio: 1.5,
            high_volatility_widen: 1.4,
            low_volatility_ratio: 0.7,
            low_volatility_tighten: 0.7,

            enable_momentum_trailing: true,
            momentum_lookback: 5,
            momentum_slow_threshold: 0.3,
            momentum_tight_mult: 0.3,

            long_update_epsilon: 0.1,
            short_update_epsilon: 0.3,

            enable_partial_exits: true,
            partial_exit_1_r: 2.0,
            partial_exit_1_pct: 0.40,
            partial_exit_2_r: 4.0,
            partial_exit_2_pct: 0.30,

            emergency_stop_pct: 0.03,
        }
    }
}

/// Order placement / verification retry budgets
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    pub stop_placement_attempts: u32,
    pub verify_polls: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub cancel_attempts: u32,
    pub cancel_retry_delay_ms: u64,
    pub emergency_cancel_attempts: u32,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            stop_placement_attempts: 3,
            verify_polls: 5,
            backoff_base_ms: 500, // 0.5s, 1s, 2s, 4s, 5s
            backoff_cap_ms: 5_000,
            cancel_attempts: 3,
            cancel_retry_delay_ms: 500,
            emergency_cancel_attempts: 5,
        }
    }
}

impl VerifyConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn cancel_retry_delay(&self) -> Duration {
        Duration::from_millis(self.cancel_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
    pub max_orphan_age_secs: i64,
    pub orphan_alert_threshold: usize,
    pub max_orders_before_entry: usize,
    pub order_history_ttl_secs: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_orphan_age_secs: 300,
            orphan_alert_threshold: 10,
            max_orders_before_entry: 5,
            order_history_ttl_secs: 3600,
        }
    }
}

/// Failure ceilings; reaching any one trips the breaker
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub max_sl_failures: u32,
    pub max_network_failures: u32,
    pub max_cancel_failures: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_sl_failures: 3,
            max_network_failures: 10,
            max_cancel_failures: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub candle_timeout_secs: u64,
    pub candle_close_threshold: f64,
    pub min_candles: usize,
    pub max_candles: usize,
    pub history_candles: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            candle_timeout_secs: 15,
            candle_close_threshold: 0.95,
            min_candles: 100,
            max_candles: 500,
            history_candles: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub filter: String,
    pub trade_log: PathBuf,
    pub state_log: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "perpguard=info".to_string(),
            trade_log: PathBuf::from("logs/trades/trade_log.txt"),
            state_log: PathBuf::from("logs/state_debug.log"),
        }
    }
}

impl BotConfig {
    /// Load configuration from an optional file plus `PERPGUARD_*` env overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("PERPGUARD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: BotConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that would make the risk engine misbehave
    pub fn validate(&self) -> anyhow::Result<()> {
        let risk = &self.risk;

        if self.symbol.trim().is_empty() {
            anyhow::bail!("symbol must not be empty");
        }
        if self.sizing.notional_usdt <= 0.0 || self.sizing.leverage <= 0.0 {
            anyhow::bail!("notional_usdt and leverage must be positive");
        }
        if !(0.0..1.0).contains(&self.sizing.min_fill_ratio)
            || self.sizing.fill_tolerance <= self.sizing.min_fill_ratio
            || self.sizing.fill_tolerance > 1.0
        {
            anyhow::bail!("fill ratios must satisfy 0 <= min_fill_ratio < fill_tolerance <= 1");
        }
        if self.market.quantity_step <= 0.0 {
            anyhow::bail!("quantity_step must be positive");
        }
        if risk.initial_sl_mult <= 0.0 || risk.atr_period == 0 {
            anyhow::bail!("initial_sl_mult and atr_period must be positive");
        }
        if risk.medium_tier_r >= risk.loose_tier_r {
            anyhow::bail!("trailing tiers must increase: medium_tier_r < loose_tier_r");
        }
        for pct in [risk.partial_exit_1_pct, risk.partial_exit_2_pct] {
            if pct <= 0.0 || pct >= 1.0 {
                anyhow::bail!("partial exit fractions must be in (0, 1), got {}", pct);
            }
        }
        if risk.partial_exit_2_r < risk.partial_exit_1_r {
            anyhow::bail!("partial_exit_2_r must not be below partial_exit_1_r");
        }
        if risk.emergency_stop_pct <= 0.0 || risk.emergency_stop_pct >= 1.0 {
            anyhow::bail!("emergency_stop_pct must be in (0, 1)");
        }
        if self.breaker.max_sl_failures == 0
            || self.breaker.max_network_failures == 0
            || self.breaker.max_cancel_failures == 0
        {
            anyhow::bail!("circuit breaker ceilings must be at least 1");
        }
        if self.verify.stop_placement_attempts == 0 || self.verify.verify_polls == 0 {
            anyhow::bail!("verification budgets must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.control.candle_close_threshold) {
            anyhow::bail!("candle_close_threshold must be in [0, 1]");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = BotConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.timeframe.seconds(), 180);
        assert_eq!(cfg.breaker.max_sl_failures, 3);
        assert_eq!(cfg.risk.partial_exit_1_pct, 0.40);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "symbol = \"BTC/USDT:USDT\"\ntimeframe = \"5m\"\n\n[risk]\ntrail_tight_mult = 1.2\n\n[breaker]\nmax_sl_failures = 2"
        )
        .unwrap();

        let cfg = BotConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.symbol, "BTC/USDT:USDT");
        assert_eq!(cfg.timeframe.seconds(), 300);
        assert_eq!(cfg.risk.trail_tight_mult, 1.2);
        assert_eq!(cfg.breaker.max_sl_failures, 2);
        // Untouched sections keep their defaults
        assert_eq!(cfg.risk.trail_loose_mult, 2.5);
        assert_eq!(cfg.sizing.leverage, 30.0);
    }

    #[test]
    fn test_validate_rejects_bad_partial_fraction() {
        let mut cfg = BotConfig::default();
        cfg.risk.partial_exit_1_pct = 1.2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_ceiling() {
        let mut cfg = BotConfig::default();
        cfg.breaker.max_cancel_failures = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_tiers() {
        let mut cfg = BotConfig::default();
        cfg.risk.medium_tier_r = 7.0;
        assert!(cfg.validate().is_err());
    }
}
