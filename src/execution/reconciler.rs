use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use super::position::Position;
use super::position_manager::{EngineState, PositionManager};
use super::risk_rules;
use crate::config::{BotConfig, ReconcileConfig};
use crate::gateway::{ExchangeGateway, GatewayError};
use crate::models::{ExchangePosition, OpenOrder, PositionSide};
use crate::risk::FailureKind;

/// Proof that a pre-entry reconciliation found a flat exchange with no
/// lingering orders. Only `StateReconciler::clear_for_entry` can create one.
#[derive(Debug)]
pub struct EntryClearance {
    _private: (),
}

#[derive(Debug, Error)]
pub enum EntryBlocked {
    #[error("engine is {0}")]
    Busy(&'static str),

    #[error("circuit breaker tripped")]
    BreakerTripped,

    #[error("exchange already holds a {side} position of {quantity}")]
    PositionOpen { side: PositionSide, quantity: f64 },

    #[error("{0} open orders before entry, emergency cleanup run instead")]
    TooManyOrders(usize),

    #[error("{0} lingering orders could not be cleared")]
    OrdersNotCleared(usize),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// Interval pass: orphans get a grace period
    Periodic,
    /// Right before an entry: no grace, every lingering order goes
    PreEntry,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileAction {
    Recovered {
        side: PositionSide,
        quantity: f64,
        entry_price: f64,
        stop_price: f64,
        adopted_stop: bool,
    },
    ClearedPhantom,
    SideResynced { side: PositionSide },
    QuantityAdopted { internal: f64, exchange: f64 },
    OrphansCancelled { targeted: usize, cleared: bool },
    MarkedUnprotected,
    DuplicateStopsCancelled { kept: String, targeted: usize },
    EmergencyCleanup { orders: usize, cleared: bool },
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub exchange_position: Option<ExchangePosition>,
    pub open_orders: usize,
    pub actions: Vec<ReconcileAction>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Cross-checks the position manager against exchange truth and repairs drift
pub struct StateReconciler {
    cfg: ReconcileConfig,
    emergency_stop_pct: f64,
    quantity_step: f64,
    cancel_attempts: u32,
    emergency_cancel_attempts: u32,
    last_run: Option<Instant>,
}

impl StateReconciler {
    pub fn new(config: &BotConfig) -> Self {
        Self {
            cfg: config.reconcile.clone(),
            emergency_stop_pct: config.risk.emergency_stop_pct,
            quantity_step: config.market.quantity_step,
            cancel_attempts: config.verify.cancel_attempts,
            emergency_cancel_attempts: config.verify.emergency_cancel_attempts,
            last_run: None,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.cfg.interval_secs)
    }

    /// Whether the periodic pass is due
    pub fn is_due(&self, now: Instant) -> bool {
        self.last_run
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval())
    }

    /// Pre-entry gate: reconcile with no orphan grace and hand out a
    /// clearance only if the exchange is flat with an empty order book
    pub async fn clear_for_entry<G: ExchangeGateway>(
        &mut self,
        pm: &mut PositionManager<G>,
    ) -> Result<EntryClearance, EntryBlocked> {
        if !pm.is_flat() {
            return Err(EntryBlocked::Busy(pm.state().name()));
        }
        if pm.breakers().is_tripped() {
            return Err(EntryBlocked::BreakerTripped);
        }

        let gateway = Arc::clone(pm.gateway());
        let symbol = pm.verifier().symbol().to_string();

        let orders = gateway.fetch_open_orders(&symbol).await?;
        if orders.len() > self.cfg.max_orders_before_entry {
            tracing::error!(
                "🚨 {} open orders before entry (max {}), skipping entry",
                orders.len(),
                self.cfg.max_orders_before_entry
            );
            self.emergency_cleanup(pm, orders.len()).await;
            return Err(EntryBlocked::TooManyOrders(orders.len()));
        }

        let report = self.reconcile(pm, ReconcileMode::PreEntry).await?;

        if let Some(exchange) = report.exchange_position {
            return Err(EntryBlocked::PositionOpen {
                side: exchange.side,
                quantity: exchange.quantity,
            });
        }
        if !pm.is_flat() {
            return Err(EntryBlocked::Busy(pm.state().name()));
        }

        let remaining = gateway.fetch_open_orders(&symbol).await?.len();
        if remaining > 0 {
            return Err(EntryBlocked::OrdersNotCleared(remaining));
        }

        tracing::debug!(target: "perpguard::state", "Entry cleared: flat, no open orders");
        Ok(EntryClearance { _private: () })
    }

    /// One reconciliation pass
    ///
    /// Gateway failures while building the view abort the pass without
    /// touching internal state.
    pub async fn reconcile<G: ExchangeGateway>(
        &mut self,
        pm: &mut PositionManager<G>,
        mode: ReconcileMode,
    ) -> Result<ReconcileReport, GatewayError> {
        let mut report = ReconcileReport::default();

        // An entry or close in flight owns the state; judging it now would
        // mistake its orders for orphans
        if matches!(pm.state(), EngineState::Entering | EngineState::Closing) {
            tracing::debug!(target: "perpguard::state", state = pm.state().name(), "Reconcile skipped");
            return Ok(report);
        }

        let gateway = Arc::clone(pm.gateway());
        let symbol = pm.verifier().symbol().to_string();

        let exchange = gateway.fetch_position(&symbol).await?;
        let mut orders = gateway.fetch_open_orders(&symbol).await?;
        self.last_run = Some(Instant::now());

        tracing::info!(
            target: "perpguard::state",
            ?mode,
            exchange_position = ?exchange,
            internal = pm.state().name(),
            open_orders = orders.len(),
            "Reconciling"
        );

        if mode == ReconcileMode::Periodic && orders.len() > self.cfg.orphan_alert_threshold {
            let cleared = self.emergency_cleanup(pm, orders.len()).await;
            report.actions.push(ReconcileAction::EmergencyCleanup {
                orders: orders.len(),
                cleared,
            });
            orders = gateway.fetch_open_orders(&symbol).await?;
        }

        match (&exchange, pm.has_open_position()) {
            (Some(exchange), false) => {
                let action = self.recover(pm, exchange, &orders);
                report.actions.push(action);
            }
            (None, true) => {
                pm.clear_phantom();
                tracing::warn!(target: "perpguard::state", "Phantom position cleared");
                report.actions.push(ReconcileAction::ClearedPhantom);
            }
            (Some(exchange), true) => {
                if let Some(action) = self.resync(pm, exchange, &orders) {
                    report.actions.push(action);
                }
            }
            (None, false) => {}
        }

        if exchange.is_none() && !orders.is_empty() {
            if let Some(action) = self.cleanup_orphans(pm, &orders, mode).await {
                report.actions.push(action);
            }
        }

        if let Some(exchange) = &exchange {
            let live = live_stops(&orders);
            let protecting: Vec<&OpenOrder> = live
                .iter()
                .copied()
                .filter(|o| o.side == exchange.side.exit_order_side())
                .collect();

            if protecting.is_empty() {
                if !live.is_empty() {
                    let action = self.cancel_extra_stops(pm, &live, None).await;
                    report.actions.push(action);
                }
                if let Some(position) = pm.position_mut() {
                    if !position.unprotected || position.stop_order_id.is_some() {
                        tracing::error!(
                            target: "perpguard::state",
                            stop_price = position.stop_price,
                            "No stop order on the exchange for an open position"
                        );
                        report.actions.push(ReconcileAction::MarkedUnprotected);
                    }
                    position.unprotected = true;
                    position.stop_order_id = None;
                }
            } else {
                let tracked = pm.position().and_then(|p| p.stop_order_id.clone());
                let canonical = tracked
                    .as_ref()
                    .and_then(|id| protecting.iter().find(|o| &o.id == id))
                    .unwrap_or(&protecting[0]);
                let canonical = *canonical;

                if live.len() > 1 {
                    let action = self.cancel_extra_stops(pm, &live, Some(canonical)).await;
                    report.actions.push(action);
                }
                self.adopt_single_stop(pm, canonical);
            }
        }

        report.exchange_position = exchange;
        report.open_orders = orders.len();

        if !report.is_clean() {
            tracing::info!(
                target: "perpguard::state",
                actions = ?report.actions,
                "Reconcile repaired state"
            );
        }
        Ok(report)
    }

    /// Case 1: exchange holds a position we do not track
    fn recover<G: ExchangeGateway>(
        &self,
        pm: &mut PositionManager<G>,
        exchange: &ExchangePosition,
        orders: &[OpenOrder],
    ) -> ReconcileAction {
        let existing_stop = canonical_stop_candidates(orders, exchange.side)
            .first()
            .and_then(|o| o.stop_price.map(|price| (o.id.clone(), price)));
        let adopted_stop = existing_stop.is_some();
        let emergency = risk_rules::emergency_stop_price(
            exchange.side,
            exchange.entry_price,
            self.emergency_stop_pct,
        );

        let position = Position::recovered(exchange, existing_stop, emergency, Utc::now());
        let action = ReconcileAction::Recovered {
            side: position.side,
            quantity: position.remaining_quantity,
            entry_price: position.entry_price,
            stop_price: position.stop_price,
            adopted_stop,
        };

        tracing::warn!(
            target: "perpguard::state",
            side = %position.side,
            quantity = position.remaining_quantity,
            entry_price = position.entry_price,
            stop_price = position.stop_price,
            adopted_stop,
            "Recovering untracked exchange position"
        );
        pm.adopt_recovered(position);
        action
    }

    /// Both sides hold a position: fix side or quantity drift
    fn resync<G: ExchangeGateway>(
        &self,
        pm: &mut PositionManager<G>,
        exchange: &ExchangePosition,
        orders: &[OpenOrder],
    ) -> Option<ReconcileAction> {
        let position = pm.position_mut()?;

        if position.side != exchange.side {
            tracing::error!(
                target: "perpguard::state",
                internal = %position.side,
                exchange = %exchange.side,
                "Side mismatch, rebuilding position from exchange"
            );
            let existing_stop = canonical_stop_candidates(orders, exchange.side)
                .first()
                .and_then(|o| o.stop_price.map(|price| (o.id.clone(), price)));
            let emergency = risk_rules::emergency_stop_price(
                exchange.side,
                exchange.entry_price,
                self.emergency_stop_pct,
            );
            pm.replace_position(Position::recovered(exchange, existing_stop, emergency, Utc::now()));
            return Some(ReconcileAction::SideResynced {
                side: exchange.side,
            });
        }

        let internal = position.remaining_quantity;
        if (internal - exchange.quantity).abs() > self.quantity_step / 2.0 {
            tracing::warn!(
                target: "perpguard::state",
                internal,
                exchange = exchange.quantity,
                "Quantity drift, adopting exchange quantity"
            );
            position.remaining_quantity = exchange.quantity;
            position.original_quantity = position.original_quantity.max(exchange.quantity);
            position.stop_stale = true;
            return Some(ReconcileAction::QuantityAdopted {
                internal,
                exchange: exchange.quantity,
            });
        }
        None
    }

    /// Case 3: orders with no position behind them
    async fn cleanup_orphans<G: ExchangeGateway>(
        &self,
        pm: &mut PositionManager<G>,
        orders: &[OpenOrder],
        mode: ReconcileMode,
    ) -> Option<ReconcileAction> {
        let now = Utc::now();
        let max_age = match mode {
            ReconcileMode::Periodic => chrono::Duration::seconds(self.cfg.max_orphan_age_secs),
            ReconcileMode::PreEntry => chrono::Duration::zero(),
        };

        let targets: Vec<String> = orders
            .iter()
            .filter(|o| order_age(o, &*pm, now) >= max_age)
            .map(|o| o.id.clone())
            .collect();

        if targets.is_empty() {
            tracing::debug!(
                target: "perpguard::state",
                orders = orders.len(),
                "Orphan orders still inside grace period"
            );
            return None;
        }

        tracing::warn!(
            target: "perpguard::state",
            count = targets.len(),
            ?mode,
            "Cancelling orphan orders"
        );
        let cleared = pm
            .verifier_mut()
            .cancel_all_matching(|o| targets.contains(&o.id), self.cancel_attempts)
            .await;

        Some(ReconcileAction::OrphansCancelled {
            targeted: targets.len(),
            cleared,
        })
    }

    /// Cancel every live stop except `keep`, including stops on the wrong
    /// side of the position
    async fn cancel_extra_stops<G: ExchangeGateway>(
        &self,
        pm: &mut PositionManager<G>,
        stops: &[&OpenOrder],
        keep: Option<&OpenOrder>,
    ) -> ReconcileAction {
        let kept = keep.map(|o| o.id.clone()).unwrap_or_default();
        let extra: Vec<String> = stops
            .iter()
            .filter(|o| o.id != kept)
            .map(|o| o.id.clone())
            .collect();

        tracing::warn!(
            target: "perpguard::state",
            kept = %kept,
            cancelling = extra.len(),
            "Extra stop orders on the exchange, cancelling all but the canonical one"
        );
        for id in &extra {
            pm.verifier_mut().cancel_with_retry(id, self.cancel_attempts).await;
        }

        ReconcileAction::DuplicateStopsCancelled {
            kept,
            targeted: extra.len(),
        }
    }

    /// Point the position at the live stop, flagging it stale if it does
    /// not match the tracked price or quantity
    fn adopt_single_stop<G: ExchangeGateway>(&self, pm: &mut PositionManager<G>, stop: &OpenOrder) {
        let step = self.quantity_step;
        let Some(position) = pm.position_mut() else {
            return;
        };

        position.stop_order_id = Some(stop.id.clone());
        position.unprotected = false;

        let price_matches = stop
            .stop_price
            .is_some_and(|price| (price - position.stop_price).abs() < 1e-9);
        let quantity_matches = (stop.quantity - position.remaining_quantity).abs() <= step / 2.0;
        if !price_matches || !quantity_matches {
            tracing::info!(
                target: "perpguard::state",
                order_id = %stop.id,
                live_price = ?stop.stop_price,
                tracked_price = position.stop_price,
                live_quantity = stop.quantity,
                "Live stop differs from tracked stop, will re-place"
            );
            position.stop_stale = true;
        }
    }

    /// Cancel every order regardless of type; failure trips the breaker
    async fn emergency_cleanup<G: ExchangeGateway>(
        &self,
        pm: &mut PositionManager<G>,
        orders: usize,
    ) -> bool {
        tracing::error!(
            target: "perpguard::state",
            orders,
            "Emergency order cleanup"
        );
        let cleared = pm
            .verifier_mut()
            .cancel_all_matching(|_| true, self.emergency_cancel_attempts)
            .await;

        if !cleared {
            let trip = pm.breakers().force_trip(FailureKind::Cancel);
            tracing::error!("🚨 Emergency cleanup failed: {}", trip);
        }
        cleared
    }
}

/// Stop orders that would reduce a position on `side`, earliest first
fn canonical_stop_candidates(orders: &[OpenOrder], side: PositionSide) -> Vec<&OpenOrder> {
    live_stops(orders)
        .into_iter()
        .filter(|o| o.side == side.exit_order_side())
        .collect()
}

/// Every stop on the book, oldest first
fn live_stops(orders: &[OpenOrder]) -> Vec<&OpenOrder> {
    let mut stops: Vec<&OpenOrder> = orders.iter().filter(|o| o.is_stop()).collect();
    stops.sort_by_key(|o| o.submitted_at);
    stops
}

/// Age from our own submission record when we have one, otherwise the exchange's
fn order_age<G: ExchangeGateway>(
    order: &OpenOrder,
    pm: &PositionManager<G>,
    now: DateTime<Utc>,
) -> chrono::Duration {
    pm.verifier()
        .history()
        .age(&order.id, now)
        .unwrap_or(now - order.submitted_at)
}
