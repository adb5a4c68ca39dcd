use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

use crate::models::{ExchangePosition, PositionSide};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionOrigin {
    /// Opened by this process through a verified entry
    Opened,
    /// Rebuilt from exchange truth after a restart or desync
    Recovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    SignalReversal,
    StopBreached, // Price crossed the stop while no stop order was live
    Shutdown,
    CircuitBreaker,
    ExternalClose, // Exchange position vanished without us closing it
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::SignalReversal => write!(f, "SIGNAL_REVERSAL"),
            ExitReason::StopBreached => write!(f, "STOP_BREACHED"),
            ExitReason::Shutdown => write!(f, "SHUTDOWN"),
            ExitReason::CircuitBreaker => write!(f, "CIRCUIT_BREAKER"),
            ExitReason::ExternalClose => write!(f, "EXTERNAL_CLOSE"),
        }
    }
}

/// The single tracked position, owned by the position manager while open
#[derive(Debug, Clone)]
pub struct Position {
    pub id: Uuid,
    pub side: PositionSide,
    pub origin: PositionOrigin,
    pub entry_price: f64,
    pub original_quantity: f64,
    pub remaining_quantity: f64, // Shrinks on partial exits
    /// None for recovered positions: the original ATR is unknown
    pub initial_risk_distance: Option<f64>,
    pub stop_price: f64,
    pub stop_order_id: Option<String>,
    pub unprotected: bool, // No verified stop order on the exchange
    pub stop_stale: bool,  // Live stop no longer matches price/quantity, re-place
    pub breakeven_triggered: bool,
    pub trailing_active: bool,
    pub trail_distance: Option<f64>,
    pub partial_exit_1_done: bool,
    pub partial_exit_2_done: bool,
    pub entry_notional: f64,
    pub entry_time: DateTime<Utc>,
    pub realized_pnl: f64, // From partial exits so far
}

impl Position {
    /// Fresh position after a confirmed entry fill; unprotected until the stop verifies
    pub fn opened(
        side: PositionSide,
        entry_price: f64,
        quantity: f64,
        risk_distance: f64,
        entry_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            side,
            origin: PositionOrigin::Opened,
            entry_price,
            original_quantity: quantity,
            remaining_quantity: quantity,
            initial_risk_distance: Some(risk_distance),
            stop_price: entry_price - side.direction() * risk_distance,
            stop_order_id: None,
            unprotected: true,
            stop_stale: false,
            breakeven_triggered: false,
            trailing_active: false,
            trail_distance: None,
            partial_exit_1_done: false,
            partial_exit_2_done: false,
            entry_notional: entry_price * quantity,
            entry_time,
            realized_pnl: 0.0,
        }
    }

    /// Rebuild from what the exchange reports, adopting a live stop if one exists
    pub fn recovered(
        exchange: &ExchangePosition,
        existing_stop: Option<(String, f64)>,
        emergency_stop_price: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let (stop_order_id, stop_price, unprotected) = match existing_stop {
            Some((id, price)) => (Some(id), price, false),
            None => (None, emergency_stop_price, true),
        };

        Self {
            id: Uuid::new_v4(),
            side: exchange.side,
            origin: PositionOrigin::Recovered,
            entry_price: exchange.entry_price,
            original_quantity: exchange.quantity,
            remaining_quantity: exchange.quantity,
            initial_risk_distance: None,
            stop_price,
            stop_order_id,
            unprotected,
            stop_stale: false,
            breakeven_triggered: false,
            trailing_active: false,
            trail_distance: None,
            partial_exit_1_done: false,
            partial_exit_2_done: false,
            entry_notional: exchange.entry_price * exchange.quantity,
            entry_time: now,
            realized_pnl: 0.0,
        }
    }

    /// Unrealized PnL on the remaining quantity
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.side.direction() * (price - self.entry_price) * self.remaining_quantity
    }

    /// Profit in units of initial risk; None for recovered positions
    pub fn r_multiple(&self, price: f64) -> Option<f64> {
        self.initial_risk_distance
            .filter(|risk| *risk > 0.0)
            .map(|risk| super::risk_rules::r_multiple(self.side, self.entry_price, risk, price))
    }

    /// Whether `price` has already gone through the stop
    pub fn stop_crossed(&self, price: f64) -> bool {
        match self.side {
            PositionSide::Long => price <= self.stop_price,
            PositionSide::Short => price >= self.stop_price,
        }
    }

    pub fn needs_stop_placement(&self) -> bool {
        self.unprotected || self.stop_stale
    }
}
