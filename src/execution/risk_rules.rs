//! Pure risk maths for the position manager: R-multiples, trailing distance
//! tiers, volatility/momentum adjustment, stop-update hysteresis and
//! quantity rounding. Nothing here touches the exchange.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::config::RiskConfig;
use crate::models::PositionSide;

/// Slack for R threshold comparisons: R computed from prices carries float error
pub const R_EPSILON: f64 = 1e-9;

/// Profit expressed in units of initial risk, sign-adjusted per side
pub fn r_multiple(side: PositionSide, entry: f64, risk_distance: f64, price: f64) -> f64 {
    side.direction() * (price - entry) / risk_distance
}

/// `r >= threshold` with float slack
pub fn reaches(r: f64, threshold: f64) -> bool {
    r + R_EPSILON >= threshold
}

/// Entry size: `(notional / price) * leverage`, floored to the exchange step
pub fn entry_quantity(notional: f64, price: f64, leverage: f64, step: f64) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    floor_to_step(notional / price * leverage, step)
}

/// Floor a quantity to the exchange's step size
pub fn floor_to_step(quantity: f64, step: f64) -> f64 {
    let (Some(q), Some(s)) = (Decimal::from_f64(quantity), Decimal::from_f64(step)) else {
        return 0.0;
    };
    if s.is_zero() {
        return quantity;
    }
    ((q / s).floor() * s).to_f64().unwrap_or(0.0)
}

/// Round a quantity to the nearest step (bookkeeping after fills)
pub fn round_to_step(quantity: f64, step: f64) -> f64 {
    let (Some(q), Some(s)) = (Decimal::from_f64(quantity), Decimal::from_f64(step)) else {
        return quantity;
    };
    if s.is_zero() {
        return quantity;
    }
    ((q / s).round() * s).to_f64().unwrap_or(quantity)
}

/// Stop `pct` away from entry on the losing side, used when a recovered
/// position has no stop order
pub fn emergency_stop_price(side: PositionSide, entry: f64, pct: f64) -> f64 {
    entry * (1.0 - side.direction() * pct)
}

/// Whether `candidate` reduces risk compared to `current`
pub fn is_tighter(side: PositionSide, candidate: f64, current: f64) -> bool {
    match side {
        PositionSide::Long => candidate > current,
        PositionSide::Short => candidate < current,
    }
}

/// Hysteresis: only move the stop when it improves by more than `epsilon * atr`
pub fn should_update_stop(
    cfg: &RiskConfig,
    side: PositionSide,
    current: f64,
    candidate: f64,
    atr: f64,
) -> bool {
    match side {
        PositionSide::Long => candidate > current + cfg.long_update_epsilon * atr,
        PositionSide::Short => candidate < current - cfg.short_update_epsilon * atr,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailTier {
    Base,
    Tight,
    Medium,
    Loose,
}

/// Multiplier of ATR for the current R, before volatility/momentum adjustment
pub fn tier_multiplier(cfg: &RiskConfig, r: f64) -> (TrailTier, f64) {
    if !cfg.enable_dynamic_trailing {
        return (TrailTier::Base, cfg.trail_base_mult);
    }
    if !reaches(r, cfg.medium_tier_r) {
        (TrailTier::Tight, cfg.trail_tight_mult)
    } else if !reaches(r, cfg.loose_tier_r) {
        (TrailTier::Medium, cfg.trail_medium_mult)
    } else {
        (TrailTier::Loose, cfg.trail_loose_mult)
    }
}

/// Scale factor from current ATR / average ATR
pub fn volatility_factor(cfg: &RiskConfig, ratio: Option<f64>) -> f64 {
    match ratio {
        Some(ratio) if cfg.enable_volatility_adjust => {
            if ratio > cfg.high_volatility_ratio {
                cfg.high_volatility_widen
            } else if ratio < cfg.low_volatility_ratio {
                cfg.low_volatility_tighten
            } else {
                1.0
            }
        }
        _ => 1.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailPlan {
    pub tier: TrailTier,
    pub distance: f64,
    pub momentum_exhausted: bool,
}

/// Trailing distance for the current R and market conditions
///
/// Exhausted momentum forces the distance down to `momentum_tight_mult * atr`
/// whenever that is smaller than the tier/volatility result.
pub fn trail_distance(
    cfg: &RiskConfig,
    atr: f64,
    r: f64,
    volatility_ratio: Option<f64>,
    momentum_ratio: Option<f64>,
) -> TrailPlan {
    let (tier, multiplier) = tier_multiplier(cfg, r);
    let mut distance = multiplier * atr * volatility_factor(cfg, volatility_ratio);

    let momentum_exhausted = cfg.enable_momentum_trailing
        && momentum_ratio.is_some_and(|m| m < cfg.momentum_slow_threshold);
    if momentum_exhausted {
        distance = distance.min(cfg.momentum_tight_mult * atr);
    }

    TrailPlan {
        tier,
        distance,
        momentum_exhausted,
    }
}

/// Stop price `distance` behind `price`
pub fn trailing_stop(side: PositionSide, price: f64, distance: f64) -> f64 {
    price - side.direction() * distance
}

/// Quantity for a partial exit, or None if rounding leaves nothing tradeable
/// or the exit would close the whole remainder
pub fn partial_exit_quantity(remaining: f64, fraction: f64, step: f64, min_quantity: f64) -> Option<f64> {
    let quantity = floor_to_step(remaining * fraction, step);
    if quantity < min_quantity || quantity >= remaining {
        None
    } else {
        Some(quantity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RiskConfig {
        RiskConfig::default()
    }

    #[test]
    fn test_r_multiple_at_breakeven_trigger() {
        // entry 2100, ATR 2.0, mult 1.1 -> risk 2.2
        let r = r_multiple(PositionSide::Long, 2100.0, 1.1 * 2.0, 2102.2);
        assert!(reaches(r, 1.0));
        assert!(!reaches(r, 1.01));

        let r = r_multiple(PositionSide::Short, 3000.0, 10.0, 2980.0);
        assert_eq!(r, 2.0);
    }

    #[test]
    fn test_entry_quantity_floors_to_step() {
        // 50 USDT at 30x on 2100 -> 0.714285...
        assert_eq!(entry_quantity(50.0, 2100.0, 30.0, 0.001), 0.714);
        assert_eq!(entry_quantity(50.0, 0.0, 30.0, 0.001), 0.0);
    }

    #[test]
    fn test_floor_to_step() {
        assert_eq!(floor_to_step(1.23456, 0.01), 1.23);
        assert_eq!(floor_to_step(0.0009, 0.001), 0.0);
        assert_eq!(floor_to_step(5.0, 1.0), 5.0);
    }

    #[test]
    fn test_round_to_step() {
        assert_eq!(round_to_step(1.0 - 0.4, 0.001), 0.6);
        assert_eq!(round_to_step(0.41999999999, 0.001), 0.42);
    }

    #[test]
    fn test_emergency_stop_price() {
        assert_eq!(emergency_stop_price(PositionSide::Short, 3000.0, 0.03), 3090.0);
        assert_eq!(emergency_stop_price(PositionSide::Long, 2000.0, 0.03), 1940.0);
    }

    #[test]
    fn test_dynamic_tiers() {
        let cfg = cfg();
        assert_eq!(tier_multiplier(&cfg, 1.5), (TrailTier::Tight, 1.5));
        assert_eq!(tier_multiplier(&cfg, 3.0), (TrailTier::Medium, 1.8));
        assert_eq!(tier_multiplier(&cfg, 5.99), (TrailTier::Medium, 1.8));
        assert_eq!(tier_multiplier(&cfg, 6.0), (TrailTier::Loose, 2.5));

        let mut fixed = cfg.clone();
        fixed.enable_dynamic_trailing = false;
        assert_eq!(tier_multiplier(&fixed, 10.0), (TrailTier::Base, 1.8));
    }

    #[test]
    fn test_volatility_factor() {
        let cfg = cfg();
        assert_eq!(volatility_factor(&cfg, Some(1.6)), 1.4);
        assert_eq!(volatility_factor(&cfg, Some(0.5)), 0.7);
        assert_eq!(volatility_factor(&cfg, Some(1.0)), 1.0);
        assert_eq!(volatility_factor(&cfg, None), 1.0);

        let mut off = cfg.clone();
        off.enable_volatility_adjust = false;
        assert_eq!(volatility_factor(&off, Some(3.0)), 1.0);
    }

    #[test]
    fn test_trail_distance_tight_tier() {
        let plan = trail_distance(&cfg(), 2.0, 1.5, None, None);
        assert_eq!(plan.tier, TrailTier::Tight);
        assert_eq!(plan.distance, 3.0);
        assert!(!plan.momentum_exhausted);
        assert!((trailing_stop(PositionSide::Long, 2103.3, plan.distance) - 2100.3).abs() < 1e-9);
    }

    #[test]
    fn test_momentum_exhaustion_overrides_wider_distance() {
        // Loose tier with high volatility: 2.5 * 1.4 * ATR, then forced to 0.3 * ATR
        let plan = trail_distance(&cfg(), 2.0, 7.0, Some(2.0), Some(0.1));
        assert!(plan.momentum_exhausted);
        assert!((plan.distance - 0.6).abs() < 1e-12);

        // Healthy momentum leaves the tier result alone
        let plan = trail_distance(&cfg(), 2.0, 7.0, Some(2.0), Some(0.9));
        assert!((plan.distance - 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_stop_update_hysteresis() {
        let cfg = cfg();
        // Long epsilon 0.1 * ATR 2.0 = 0.2
        assert!(should_update_stop(&cfg, PositionSide::Long, 2100.0, 2100.3, 2.0));
        assert!(!should_update_stop(&cfg, PositionSide::Long, 2100.0, 2100.15, 2.0));
        assert!(!should_update_stop(&cfg, PositionSide::Long, 2100.0, 2099.0, 2.0));

        // Short epsilon 0.3 * ATR 2.0 = 0.6
        assert!(should_update_stop(&cfg, PositionSide::Short, 3000.0, 2999.0, 2.0));
        assert!(!should_update_stop(&cfg, PositionSide::Short, 3000.0, 2999.5, 2.0));
    }

    #[test]
    fn test_partial_exit_quantity() {
        assert_eq!(partial_exit_quantity(1.0, 0.4, 0.001, 0.001), Some(0.4));
        assert_eq!(partial_exit_quantity(0.6, 0.3, 0.001, 0.001), Some(0.18));
        // Too small after rounding
        assert_eq!(partial_exit_quantity(0.002, 0.4, 0.001, 0.001), None);
    }

    #[test]
    fn test_is_tighter() {
        assert!(is_tighter(PositionSide::Long, 2100.0, 2097.8));
        assert!(!is_tighter(PositionSide::Long, 2097.0, 2097.8));
        assert!(is_tighter(PositionSide::Short, 2990.0, 3000.0));
    }
}
