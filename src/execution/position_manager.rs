use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::order_history::OrderHistory;
use super::order_verifier::{OrderVerifier, VerifierError};
use super::position::{ExitReason, Position};
use super::reconciler::EntryClearance;
use super::risk_rules::{self, reaches};
use crate::config::{BotConfig, MarketRules, RiskConfig, SizingConfig};
use crate::gateway::{ExchangeGateway, GatewayError};
use crate::indicators::{average_atr, calculate_atr, momentum_ratio, volatility_ratio};
use crate::journal::{TradeLog, TradeRecord};
use crate::models::{Candle, ExchangePosition, OpenOrder, PositionSide};
use crate::risk::CircuitBreakers;

/// Where the engine is in the position lifecycle
///
/// `Entering` doubles as the re-entrancy guard: no second entry can start
/// while one is in flight.
#[derive(Debug, Clone)]
pub enum EngineState {
    Flat,
    Entering,
    Open(Position),
    Closing,
}

impl EngineState {
    pub fn name(&self) -> &'static str {
        match self {
            EngineState::Flat => "FLAT",
            EngineState::Entering => "ENTERING",
            EngineState::Open(_) => "OPEN",
            EngineState::Closing => "CLOSING",
        }
    }
}

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("entry blocked: engine is {0}")]
    Busy(&'static str),

    #[error("entry blocked: circuit breaker tripped")]
    BreakerTripped,

    #[error("invalid ATR {0}")]
    InvalidAtr(f64),

    #[error("quantity {0} below exchange minimum")]
    QuantityTooSmall(f64),

    #[error("insufficient margin: free {free:.2} < required {required:.2}")]
    InsufficientMargin { free: f64, required: f64 },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Verifier(#[from] VerifierError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryOutcome {
    pub position_id: Uuid,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub protected: bool,
}

/// Market inputs for one risk tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketSnapshot {
    pub price: f64,
    pub atr: f64,
    pub volatility_ratio: Option<f64>,
    pub momentum_ratio: Option<f64>,
}

impl MarketSnapshot {
    pub fn new(price: f64, atr: f64) -> Self {
        Self {
            price,
            atr,
            volatility_ratio: None,
            momentum_ratio: None,
        }
    }

    /// Derive ATR, volatility and momentum ratios from closed candles
    pub fn from_candles(price: f64, candles: &[Candle], risk: &RiskConfig) -> Option<Self> {
        let atr = calculate_atr(candles, risk.atr_period)?;
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        Some(Self {
            price,
            atr,
            volatility_ratio: average_atr(candles, risk.atr_period, risk.volatility_lookback)
                .and_then(|avg| volatility_ratio(atr, avg)),
            momentum_ratio: momentum_ratio(&closes, risk.momentum_lookback),
        })
    }
}

/// What a risk tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub r_multiple: Option<f64>,
    pub stop_updated: Option<f64>,
    pub partial_exits: Vec<u8>,
    pub closed: Option<TradeRecord>,
}

/// Order-side half of the engine; kept apart from the state so a tick can
/// hold `&mut Position` while placing orders
struct RiskDesk<G: ExchangeGateway> {
    verifier: OrderVerifier<G>,
    journal: TradeLog,
    sizing: SizingConfig,
    market: MarketRules,
    risk: RiskConfig,
    cancel_attempts: u32,
}

impl<G: ExchangeGateway> RiskDesk<G> {
    fn record_trade(&self, record: &TradeRecord) {
        if let Err(e) = self.journal.record(record) {
            tracing::warn!("Trade log write failed: {:#}", e);
        }
    }

    /// One risk pass; returns a reason if the position must be closed now
    async fn manage(
        &mut self,
        position: &mut Position,
        snap: &MarketSnapshot,
        report: &mut TickReport,
    ) -> Option<ExitReason> {
        let price = snap.price;

        if stop_breached(position, price) {
            return Some(ExitReason::StopBreached);
        }

        // Recovered positions have no known initial risk: protection only
        let Some(r) = position.r_multiple(price) else {
            let reason = self.protect(position, price).await;
            self.log_status(position, price);
            return reason;
        };
        report.r_multiple = Some(r);

        if self.risk.enable_partial_exits {
            if !position.partial_exit_1_done
                && reaches(r, self.risk.partial_exit_1_r)
                && self.execute_partial_exit(position, 1, price).await
            {
                report.partial_exits.push(1);
            }
            if !position.partial_exit_2_done
                && reaches(r, self.risk.partial_exit_2_r)
                && self.execute_partial_exit(position, 2, price).await
            {
                report.partial_exits.push(2);
            }
        }

        let side = position.side;
        let mut target: Option<f64> = None;
        let mut breakeven_pending = false;

        if !position.breakeven_triggered && reaches(r, self.risk.breakeven_trigger_r) {
            if risk_rules::is_tighter(side, position.entry_price, position.stop_price) {
                target = Some(position.entry_price);
                breakeven_pending = true;
            } else {
                position.breakeven_triggered = true;
            }
        }

        if position.trailing_active || reaches(r, self.risk.trail_activate_r) {
            if !position.trailing_active {
                position.trailing_active = true;
                tracing::info!("📈 Trailing stop activated at {:.2}R", r);
            }

            let plan = risk_rules::trail_distance(
                &self.risk,
                snap.atr,
                r,
                snap.volatility_ratio,
                snap.momentum_ratio,
            );
            position.trail_distance = Some(plan.distance);
            if plan.momentum_exhausted {
                tracing::info!("Momentum exhausted, trail tightened to {:.4}", plan.distance);
            }

            let candidate = risk_rules::trailing_stop(side, price, plan.distance);
            let reference = target.unwrap_or(position.stop_price);
            if risk_rules::should_update_stop(&self.risk, side, reference, candidate, snap.atr) {
                target = Some(candidate);
            }
        }

        match target {
            Some(new_stop) => {
                if self.sync_stop(position, new_stop).await {
                    report.stop_updated = Some(new_stop);
                }
            }
            None if position.needs_stop_placement() => {
                let stop = position.stop_price;
                self.sync_stop(position, stop).await;
            }
            None => {}
        }

        if breakeven_pending && !risk_rules::is_tighter(side, position.entry_price, position.stop_price) {
            position.breakeven_triggered = true;
            tracing::info!("🔒 Breakeven reached, stop at {:.2}", position.stop_price);
        }

        self.log_status(position, price);
        None
    }

    /// Stop placement and breach check only; needs no ATR
    async fn protect(&mut self, position: &mut Position, price: f64) -> Option<ExitReason> {
        if stop_breached(position, price) {
            return Some(ExitReason::StopBreached);
        }
        if position.needs_stop_placement() {
            let stop = position.stop_price;
            self.sync_stop(position, stop).await;
        }
        None
    }

    /// Replace the live stop with one at `new_stop` for the remaining quantity
    ///
    /// Returns true if the tracked stop price changed. `new_stop` must not be
    /// looser than the current stop.
    async fn sync_stop(&mut self, position: &mut Position, new_stop: f64) -> bool {
        // Existing stops go first so reduce-only stops never stack
        if !self
            .verifier
            .cancel_all_matching(OpenOrder::is_stop, self.cancel_attempts)
            .await
        {
            tracing::warn!(
                target: "perpguard::state",
                current = position.stop_price,
                requested = new_stop,
                "Old stop not cleared, keeping current stop"
            );
            return false;
        }

        let changed = new_stop != position.stop_price;
        position.stop_order_id = None;
        position.stop_price = new_stop;

        match self
            .verifier
            .place_and_verify_stop(position.side, position.remaining_quantity, new_stop)
            .await
        {
            Ok(order_id) => {
                position.stop_order_id = Some(order_id);
                position.unprotected = false;
                position.stop_stale = false;
                if changed {
                    tracing::info!("🛡️  Stop moved to {:.2}", new_stop);
                }
            }
            Err(e) => {
                position.unprotected = true;
                tracing::error!("🚨 {} - position UNPROTECTED, will retry next tick", e);
            }
        }
        changed
    }

    async fn execute_partial_exit(&mut self, position: &mut Position, level: u8, price: f64) -> bool {
        let (fraction, tag) = if level == 1 {
            (self.risk.partial_exit_1_pct, "PARTIAL_EXIT_1")
        } else {
            (self.risk.partial_exit_2_pct, "PARTIAL_EXIT_2")
        };

        let Some(quantity) = risk_rules::partial_exit_quantity(
            position.remaining_quantity,
            fraction,
            self.market.quantity_step,
            self.market.min_quantity,
        ) else {
            tracing::warn!(
                "Partial exit {} skipped: {:.4} x {:.2} is below the tradeable minimum",
                level,
                position.remaining_quantity,
                fraction
            );
            return false;
        };

        let fill = match self.verifier.submit_exit(position.side, quantity).await {
            Ok(fill) if fill.filled_quantity > 0.0 => fill,
            Ok(_) => {
                tracing::warn!("Partial exit {} did not fill", level);
                return false;
            }
            Err(e) => {
                tracing::warn!("Partial exit {} failed: {}", level, e);
                return false;
            }
        };

        let closed = fill.filled_quantity;
        let record = TradeRecord::exit(
            position.side,
            position.entry_price,
            fill.avg_fill_price.unwrap_or(price),
            closed,
            tag,
            Utc::now(),
        );

        position.remaining_quantity = risk_rules::round_to_step(
            (position.remaining_quantity - closed).max(0.0),
            self.market.quantity_step,
        );
        position.realized_pnl += record.pnl;
        position.stop_stale = true;
        if level == 1 {
            position.partial_exit_1_done = true;
        } else {
            position.partial_exit_2_done = true;
        }

        tracing::info!(
            "💰 Partial exit {}: {:.4} @ {:.2}, PnL {:+.2} USDT, {:.4} remaining",
            level,
            closed,
            record.exit_price.unwrap_or(price),
            record.pnl,
            position.remaining_quantity
        );
        self.record_trade(&record);
        true
    }

    /// Quantity still open after a close, zero when below the tradeable minimum
    fn leftover(&self, quantity: f64) -> f64 {
        let quantity = risk_rules::round_to_step(quantity.max(0.0), self.market.quantity_step);
        if quantity < self.market.min_quantity {
            0.0
        } else {
            quantity
        }
    }

    /// What the exchange still holds on `side` after a close reported as full.
    /// A failed lookup trusts the fill report.
    async fn exchange_leftover(&self, side: PositionSide) -> f64 {
        let gateway = self.verifier.gateway();
        match gateway.fetch_position(self.verifier.symbol()).await {
            Ok(Some(exchange)) if exchange.side == side => self.leftover(exchange.quantity),
            Ok(_) => 0.0,
            Err(e) => {
                tracing::warn!("Could not confirm close on the exchange: {}", e);
                0.0
            }
        }
    }

    fn log_status(&self, position: &Position, price: f64) {
        let mut flags = String::new();
        if position.breakeven_triggered {
            flags.push_str(" [BE]");
        }
        if position.trailing_active {
            flags.push_str(" [TRAIL]");
        }
        if position.partial_exit_1_done {
            flags.push_str(" [P1]");
        }
        if position.partial_exit_2_done {
            flags.push_str(" [P2]");
        }
        if position.unprotected {
            flags.push_str(" [UNPROTECTED]");
        }

        tracing::info!(
            "{} | Entry: {:.2} | Price: {:.2} | PnL: {:+.2} USDT | SL: {:.2}{}",
            position.side.to_string().to_uppercase(),
            position.entry_price,
            price,
            position.unrealized_pnl(price),
            position.stop_price,
            flags
        );
    }
}

fn stop_breached(position: &Position, price: f64) -> bool {
    let breached = position.unprotected && position.stop_crossed(price);
    if breached {
        tracing::error!(
            "🚨 Price {:.2} is through stop {:.2} and no stop order is live, closing",
            price,
            position.stop_price
        );
    }
    breached
}

/// Owns the single position and every order that protects it
pub struct PositionManager<G: ExchangeGateway> {
    state: EngineState,
    desk: RiskDesk<G>,
    total_pnl: f64, // Realized across closed positions
}

impl<G: ExchangeGateway> PositionManager<G> {
    pub fn new(
        gateway: Arc<G>,
        config: &BotConfig,
        breakers: Arc<CircuitBreakers>,
        journal: TradeLog,
    ) -> Self {
        let history = OrderHistory::new(chrono::Duration::seconds(
            config.reconcile.order_history_ttl_secs,
        ));
        let verifier = OrderVerifier::new(
            gateway,
            config.symbol.clone(),
            config.verify.clone(),
            config.sizing.clone(),
            breakers,
            history,
        );

        Self {
            state: EngineState::Flat,
            desk: RiskDesk {
                verifier,
                journal,
                sizing: config.sizing.clone(),
                market: config.market.clone(),
                risk: config.risk.clone(),
                cancel_attempts: config.verify.cancel_attempts,
            },
            total_pnl: 0.0,
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn position(&self) -> Option<&Position> {
        match &self.state {
            EngineState::Open(position) => Some(position),
            _ => None,
        }
    }

    pub(crate) fn position_mut(&mut self) -> Option<&mut Position> {
        match &mut self.state {
            EngineState::Open(position) => Some(position),
            _ => None,
        }
    }

    pub fn is_flat(&self) -> bool {
        matches!(self.state, EngineState::Flat)
    }

    pub fn has_open_position(&self) -> bool {
        self.position().is_some()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        self.desk.verifier.breakers()
    }

    pub fn journal(&self) -> &TradeLog {
        &self.desk.journal
    }

    pub fn risk_config(&self) -> &RiskConfig {
        &self.desk.risk
    }

    pub fn total_pnl(&self) -> f64 {
        self.total_pnl
    }

    pub(crate) fn verifier(&self) -> &OrderVerifier<G> {
        &self.desk.verifier
    }

    pub(crate) fn verifier_mut(&mut self) -> &mut OrderVerifier<G> {
        &mut self.desk.verifier
    }

    pub fn gateway(&self) -> &Arc<G> {
        self.desk.verifier.gateway()
    }

    /// Unrealized PnL of the open position
    pub fn calculate_pnl(&self, current_price: f64) -> Option<f64> {
        self.position().map(|p| p.unrealized_pnl(current_price))
    }

    /// Enter a new position
    ///
    /// Needs an `EntryClearance`, which only a pre-entry reconciliation can
    /// issue. The stop is placed and verified before returning; if that
    /// fails the position stays open flagged unprotected.
    pub async fn open_position(
        &mut self,
        _clearance: EntryClearance,
        side: PositionSide,
        signal_price: f64,
        atr: f64,
    ) -> Result<EntryOutcome, EntryError> {
        if !self.is_flat() {
            return Err(EntryError::Busy(self.state.name()));
        }
        if self.breakers().is_tripped() {
            return Err(EntryError::BreakerTripped);
        }
        if !(atr.is_finite() && atr > 0.0) {
            return Err(EntryError::InvalidAtr(atr));
        }

        let sizing = &self.desk.sizing;
        let quantity = risk_rules::entry_quantity(
            sizing.notional_usdt,
            signal_price,
            sizing.leverage,
            self.desk.market.quantity_step,
        );
        if quantity < self.desk.market.min_quantity {
            return Err(EntryError::QuantityTooSmall(quantity));
        }

        let required = sizing.notional_usdt * sizing.margin_buffer;
        let free = self.gateway().fetch_balance().await?;
        if free < required {
            return Err(EntryError::InsufficientMargin { free, required });
        }

        self.state = EngineState::Entering;
        let fill = match self.desk.verifier.submit_entry(side, quantity, signal_price).await {
            Ok(fill) => fill,
            Err(e) => {
                self.state = EngineState::Flat;
                return Err(e.into());
            }
        };

        let risk_distance = self.desk.risk.initial_sl_mult * atr;
        let mut position = Position::opened(
            side,
            fill.avg_price,
            fill.filled,
            risk_distance,
            Utc::now(),
        );
        tracing::info!(
            "🟢 Opened {} {:.4} @ {:.2} | SL {:.2} ({:.2} x ATR {:.4})",
            side,
            position.remaining_quantity,
            position.entry_price,
            position.stop_price,
            self.desk.risk.initial_sl_mult,
            atr
        );
        self.desk.record_trade(&TradeRecord::entry(
            side,
            position.entry_price,
            position.remaining_quantity,
            position.entry_time,
        ));

        match self
            .desk
            .verifier
            .place_and_verify_stop(side, position.remaining_quantity, position.stop_price)
            .await
        {
            Ok(order_id) => {
                position.stop_order_id = Some(order_id);
                position.unprotected = false;
            }
            Err(e) => {
                tracing::error!("🚨 Entry stop failed: {} - position UNPROTECTED", e);
            }
        }

        let outcome = EntryOutcome {
            position_id: position.id,
            side,
            quantity: position.remaining_quantity,
            entry_price: position.entry_price,
            stop_price: position.stop_price,
            protected: !position.unprotected,
        };
        self.state = EngineState::Open(position);
        Ok(outcome)
    }

    /// Risk pass on a price update: remediation, partial exits, breakeven,
    /// trailing and stop replacement
    pub async fn on_tick(&mut self, snap: &MarketSnapshot) -> anyhow::Result<TickReport> {
        let mut report = TickReport::default();

        let close_reason = match &mut self.state {
            EngineState::Open(position) => self.desk.manage(position, snap, &mut report).await,
            _ => return Ok(report),
        };

        if let Some(reason) = close_reason {
            report.closed = self.close_position(snap.price, reason).await?;
        }
        Ok(report)
    }

    /// Protection-only pass for when no ATR is available yet: places a
    /// missing or stale stop and closes if price is through an unguarded stop
    pub async fn ensure_protected(&mut self, price: f64) -> anyhow::Result<Option<TradeRecord>> {
        let close_reason = match &mut self.state {
            EngineState::Open(position) => self.desk.protect(position, price).await,
            _ => return Ok(None),
        };

        match close_reason {
            Some(reason) => self.close_position(price, reason).await,
            None => Ok(None),
        }
    }

    /// Close the remaining quantity at market and cancel leftover stops
    ///
    /// Stops are only cancelled once the exchange position is gone. A short
    /// fill shrinks the position, marks its stop for re-placement at the
    /// leftover quantity and returns an error with the position still open.
    pub async fn close_position(
        &mut self,
        price: f64,
        reason: ExitReason,
    ) -> anyhow::Result<Option<TradeRecord>> {
        let mut position = match std::mem::replace(&mut self.state, EngineState::Closing) {
            EngineState::Open(position) => position,
            other => {
                self.state = other;
                return Ok(None);
            }
        };

        let fill = match self
            .desk
            .verifier
            .submit_exit(position.side, position.remaining_quantity)
            .await
        {
            Ok(fill) if fill.filled_quantity > 0.0 => fill,
            Ok(_) => {
                self.state = EngineState::Open(position);
                anyhow::bail!("close order for {} did not fill", reason);
            }
            Err(e) => {
                self.state = EngineState::Open(position);
                return Err(anyhow::Error::new(e).context("closing position"));
            }
        };

        let record = TradeRecord::exit(
            position.side,
            position.entry_price,
            fill.avg_fill_price.unwrap_or(price),
            fill.filled_quantity,
            reason.to_string(),
            Utc::now(),
        );
        self.desk.record_trade(&record);
        position.realized_pnl += record.pnl;

        let mut leftover = self.desk.leftover(position.remaining_quantity - fill.filled_quantity);
        if leftover == 0.0 {
            leftover = self.desk.exchange_leftover(position.side).await;
        }
        if leftover > 0.0 {
            position.remaining_quantity = leftover;
            position.stop_stale = true;
            tracing::error!(
                "⚠️  Close filled {:.4}, {:.4} still open; stop will follow the remainder",
                fill.filled_quantity,
                leftover
            );
            self.state = EngineState::Open(position);
            anyhow::bail!("close for {} partially filled, {:.4} remaining", reason, leftover);
        }

        if !self
            .desk
            .verifier
            .cancel_all_matching(OpenOrder::is_stop, self.desk.cancel_attempts)
            .await
        {
            tracing::warn!("Leftover stop orders after close, reconciliation will clean up");
        }

        let position_pnl = position.realized_pnl;
        self.total_pnl += position_pnl;
        self.state = EngineState::Flat;

        tracing::info!(
            "🔴 Closed {} @ {:.2} ({}) | Position PnL {:+.2} USDT | Total {:+.2} USDT",
            position.side,
            record.exit_price.unwrap_or(price),
            reason,
            position_pnl,
            self.total_pnl
        );
        Ok(Some(record))
    }

    /// Install a position rebuilt from exchange truth. Only valid when flat.
    pub(crate) fn adopt_recovered(&mut self, position: Position) -> bool {
        if !self.is_flat() {
            return false;
        }
        tracing::warn!(
            "♻️  Recovered {} {:.4} @ {:.2}, stop {:.2}{}",
            position.side,
            position.remaining_quantity,
            position.entry_price,
            position.stop_price,
            if position.unprotected { " (needs placement)" } else { "" }
        );
        self.state = EngineState::Open(position);
        true
    }

    /// Replace the tracked position outright (exchange disagrees on side)
    pub(crate) fn replace_position(&mut self, position: Position) {
        self.state = EngineState::Open(position);
    }

    /// Drop a position the exchange no longer has
    ///
    /// There is no fill notification for stop or liquidation fills, so the
    /// exit is logged at the last known stop price as an approximation.
    pub(crate) fn clear_phantom(&mut self) -> Option<Position> {
        let EngineState::Open(position) = std::mem::replace(&mut self.state, EngineState::Flat) else {
            return None;
        };

        let record = TradeRecord::exit(
            position.side,
            position.entry_price,
            position.stop_price,
            position.remaining_quantity,
            ExitReason::ExternalClose.to_string(),
            Utc::now(),
        );
        self.desk.record_trade(&record);
        self.total_pnl += position.realized_pnl + record.pnl;

        tracing::warn!(
            "👻 Position closed outside this process (approx. exit {:.2}), state cleared",
            position.stop_price
        );
        Some(position)
    }

    /// Best-effort flatten for shutdown and breaker trips: every error is logged and swallowed
    pub async fn emergency_flatten(&mut self, price: f64, reason: ExitReason, cancel_attempts: u32) {
        // A short fill leaves the remainder tracked, so try again for it
        let mut attempt = 0;
        while self.has_open_position() && attempt < cancel_attempts.max(1) {
            attempt += 1;
            if let Err(e) = self.close_position(price, reason).await {
                tracing::error!("Emergency close attempt {} failed: {:#}", attempt, e);
            }
        }

        // The exchange may still hold a position we do not track
        let gateway = Arc::clone(self.gateway());
        let symbol = self.desk.verifier.symbol().to_string();
        if let Ok(Some(untracked)) = gateway.fetch_position(&symbol).await {
            self.flatten_untracked(&untracked).await;
        }

        if !self
            .desk
            .verifier
            .cancel_all_matching(|_| true, cancel_attempts)
            .await
        {
            tracing::error!("Emergency cancel-all left orders on the book");
        }
    }

    async fn flatten_untracked(&mut self, exchange: &ExchangePosition) {
        match self
            .desk
            .verifier
            .submit_exit(exchange.side, exchange.quantity)
            .await
        {
            Ok(fill) => tracing::warn!(
                "Flattened untracked {} {:.4}",
                exchange.side,
                fill.filled_quantity
            ),
            Err(e) => tracing::error!("Could not flatten untracked position: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::reconciler::StateReconciler;
    use crate::gateway::PaperExchange;
    use crate::risk::FailureKind;

    fn config() -> BotConfig {
        let mut cfg = BotConfig::default();
        cfg.risk.trail_activate_r = 1.5;
        cfg.risk.enable_partial_exits = false;
        cfg
    }

    fn manager(
        exchange: Arc<PaperExchange>,
        cfg: &BotConfig,
    ) -> (PositionManager<PaperExchange>, StateReconciler) {
        let breakers = Arc::new(CircuitBreakers::new(cfg.breaker.clone()));
        let pm = PositionManager::new(exchange, cfg, breakers, TradeLog::in_memory());
        (pm, StateReconciler::new(cfg))
    }

    async fn open_long(
        pm: &mut PositionManager<PaperExchange>,
        rec: &mut StateReconciler,
        price: f64,
        atr: f64,
    ) -> EntryOutcome {
        let clearance = rec.clear_for_entry(pm).await.unwrap();
        pm.open_position(clearance, PositionSide::Long, price, atr)
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_position_places_verified_stop() {
        let exchange = Arc::new(PaperExchange::new(2100.0, 1000.0));
        let cfg = config();
        let (mut pm, mut rec) = manager(exchange.clone(), &cfg);

        let outcome = open_long(&mut pm, &mut rec, 2100.0, 2.0).await;

        assert!(outcome.protected);
        assert_eq!(outcome.quantity, 0.714);
        assert!((outcome.stop_price - 2097.8).abs() < 1e-9);
        assert_eq!(exchange.resting_stop_count(), 1);
        assert_eq!(exchange.position().unwrap().quantity, 0.714);

        let records = pm.journal().records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, "ENTRY");
    }

    #[tokio::test(start_paused = true)]
    async fn test_prevent_duplicate_positions() {
        let exchange = Arc::new(PaperExchange::new(2100.0, 1000.0));
        let cfg = config();
        let (mut pm, mut rec) = manager(exchange.clone(), &cfg);
        open_long(&mut pm, &mut rec, 2100.0, 2.0).await;

        // Reconciler refuses clearance while a position exists
        assert!(rec.clear_for_entry(&mut pm).await.is_err());
        assert_eq!(exchange.position().unwrap().quantity, 0.714);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breakeven_then_trailing_numeric_scenario() {
        let exchange = Arc::new(PaperExchange::new(2100.0, 1000.0));
        let cfg = config();
        let (mut pm, mut rec) = manager(exchange.clone(), &cfg);
        open_long(&mut pm, &mut rec, 2100.0, 2.0).await;

        // R = 1.0: breakeven
        exchange.set_mark_price(2102.2);
        let report = pm.on_tick(&MarketSnapshot::new(2102.2, 2.0)).await.unwrap();
        let pos = pm.position().unwrap();
        assert!(pos.breakeven_triggered);
        assert!(!pos.trailing_active);
        assert_eq!(pos.stop_price, 2100.0);
        assert_eq!(report.stop_updated, Some(2100.0));

        // R = 1.5: trailing with tight tier 1.5 x 2.0 = 3.0
        exchange.set_mark_price(2103.3);
        pm.on_tick(&MarketSnapshot::new(2103.3, 2.0)).await.unwrap();
        let pos = pm.position().unwrap();
        assert!(pos.trailing_active);
        assert_eq!(pos.trail_distance, Some(3.0));
        assert!((pos.stop_price - 2100.3).abs() < 1e-9);

        // One live stop at the new price
        let stops = exchange.resting_orders();
        assert_eq!(stops.len(), 1);
        assert!((stops[0].stop_price.unwrap() - 2100.3).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_improvement_does_not_move_stop() {
        let exchange = Arc::new(PaperExchange::new(2100.0, 1000.0));
        let cfg = config();
        let (mut pm, mut rec) = manager(exchange.clone(), &cfg);
        open_long(&mut pm, &mut rec, 2100.0, 2.0).await;

        pm.on_tick(&MarketSnapshot::new(2103.3, 2.0)).await.unwrap();
        let submissions = exchange.stop_submissions();

        // Candidate 2100.4 is within epsilon (0.2) of 2100.3
        let report = pm.on_tick(&MarketSnapshot::new(2103.4, 2.0)).await.unwrap();
        assert_eq!(report.stop_updated, None);
        assert_eq!(exchange.stop_submissions(), submissions);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_never_regresses_after_breakeven() {
        let exchange = Arc::new(PaperExchange::new(2100.0, 1000.0));
        let cfg = config();
        let (mut pm, mut rec) = manager(exchange.clone(), &cfg);
        open_long(&mut pm, &mut rec, 2100.0, 2.0).await;

        for price in [2102.2, 2104.0, 2101.0, 2100.5, 2106.0, 2102.0] {
            let before = pm.position().unwrap().stop_price;
            pm.on_tick(&MarketSnapshot::new(price, 2.0)).await.unwrap();
            let pos = pm.position().unwrap();
            assert!(pos.stop_price >= before);
            if pos.breakeven_triggered {
                assert!(pos.stop_price >= pos.entry_price);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_exits_execute_once() {
        let exchange = Arc::new(PaperExchange::new(2000.0, 1000.0));
        let mut cfg = config();
        cfg.risk.enable_partial_exits = true;
        cfg.sizing.notional_usdt = 100.0; // 1.5 ETH at 30x
        let (mut pm, mut rec) = manager(exchange.clone(), &cfg);
        let outcome = open_long(&mut pm, &mut rec, 2000.0, 10.0).await;
        assert_eq!(outcome.quantity, 1.5);

        // risk = 11.0, 2R = 2022, 4R = 2044
        exchange.set_mark_price(2022.0);
        let report = pm.on_tick(&MarketSnapshot::new(2022.0, 10.0)).await.unwrap();
        assert_eq!(report.partial_exits, vec![1]);
        assert_eq!(pm.position().unwrap().remaining_quantity, 0.9);

        exchange.set_mark_price(2025.0);
        for _ in 0..3 {
            let report = pm.on_tick(&MarketSnapshot::new(2025.0, 10.0)).await.unwrap();
            assert!(report.partial_exits.is_empty());
        }

        exchange.set_mark_price(2044.0);
        let report = pm.on_tick(&MarketSnapshot::new(2044.0, 10.0)).await.unwrap();
        assert_eq!(report.partial_exits, vec![2]);
        let pos = pm.position().unwrap();
        assert_eq!(pos.remaining_quantity, 0.63);

        exchange.set_mark_price(2050.0);
        let report = pm.on_tick(&MarketSnapshot::new(2050.0, 10.0)).await.unwrap();
        assert!(report.partial_exits.is_empty());

        // Stop resized to the remaining quantity
        let stops = exchange.resting_orders();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].quantity, 0.63);

        let exits: Vec<_> = pm
            .journal()
            .records()
            .unwrap()
            .into_iter()
            .filter(|r| r.is_exit())
            .collect();
        assert_eq!(exits.len(), 2);
        assert_eq!(exits[0].quantity, 0.6);
        assert_eq!(exits[1].quantity, 0.27);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unverified_stop_leaves_position_unprotected() {
        let exchange = Arc::new(PaperExchange::new(2100.0, 1000.0));
        exchange.set_swallow_stops(true);
        let cfg = config();
        let (mut pm, mut rec) = manager(exchange.clone(), &cfg);

        let outcome = open_long(&mut pm, &mut rec, 2100.0, 2.0).await;

        assert!(!outcome.protected);
        assert!(pm.position().unwrap().unprotected);
        assert_eq!(pm.breakers().failures(FailureKind::StopPlacement), 1);

        // Next tick remediates once the exchange behaves
        exchange.set_swallow_stops(false);
        pm.on_tick(&MarketSnapshot::new(2100.5, 2.0)).await.unwrap();
        assert!(!pm.position().unwrap().unprotected);
        assert_eq!(exchange.resting_stop_count(), 1);
        assert_eq!(pm.breakers().failures(FailureKind::StopPlacement), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unprotected_through_stop_closes() {
        let exchange = Arc::new(PaperExchange::new(2100.0, 1000.0));
        exchange.set_swallow_stops(true);
        let cfg = config();
        let (mut pm, mut rec) = manager(exchange.clone(), &cfg);
        open_long(&mut pm, &mut rec, 2100.0, 2.0).await;

        exchange.set_mark_price(2090.0);
        let report = pm.on_tick(&MarketSnapshot::new(2090.0, 2.0)).await.unwrap();

        let closed = report.closed.unwrap();
        assert_eq!(closed.reason, "STOP_BREACHED");
        assert!(pm.is_flat());
        assert!(exchange.position().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_position_pnl_and_cleanup() {
        let exchange = Arc::new(PaperExchange::new(2100.0, 1000.0));
        let cfg = config();
        let (mut pm, mut rec) = manager(exchange.clone(), &cfg);
        open_long(&mut pm, &mut rec, 2100.0, 2.0).await;

        exchange.set_mark_price(2110.0);
        assert!((pm.calculate_pnl(2110.0).unwrap() - 7.14).abs() < 1e-9);

        let record = pm
            .close_position(2110.0, ExitReason::SignalReversal)
            .await
            .unwrap()
            .unwrap();

        assert!((record.pnl - 7.14).abs() < 1e-9);
        assert_eq!(record.reason, "SIGNAL_REVERSAL");
        assert!(pm.is_flat());
        assert!(exchange.position().is_none());
        assert_eq!(exchange.resting_stop_count(), 0);
        assert!((pm.total_pnl() - 7.14).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_close_fill_keeps_remainder_protected() {
        let exchange = Arc::new(PaperExchange::new(2100.0, 1000.0));
        let cfg = config();
        let (mut pm, mut rec) = manager(exchange.clone(), &cfg);
        open_long(&mut pm, &mut rec, 2100.0, 2.0).await;

        exchange.set_close_fill_ratio(0.5);
        assert!(pm
            .close_position(2100.0, ExitReason::SignalReversal)
            .await
            .is_err());

        // Half closed: the rest is still tracked and the old stop stays live
        let pos = pm.position().unwrap();
        assert!((pos.remaining_quantity - 0.357).abs() < 1e-9);
        assert!(pos.stop_stale);
        assert!((exchange.position().unwrap().quantity - 0.357).abs() < 1e-9);
        assert_eq!(exchange.resting_stop_count(), 1);

        let records = pm.journal().records().unwrap();
        let partial = records.last().unwrap();
        assert_eq!(partial.reason, "SIGNAL_REVERSAL");
        assert!((partial.quantity - 0.357).abs() < 1e-9);

        // Next tick re-places the stop for the remainder
        pm.on_tick(&MarketSnapshot::new(2100.0, 2.0)).await.unwrap();
        let stops = exchange.resting_orders();
        assert_eq!(stops.len(), 1);
        assert!((stops[0].quantity - 0.357).abs() < 1e-9);
        assert!(!pm.position().unwrap().stop_stale);

        exchange.set_close_fill_ratio(1.0);
        pm.close_position(2100.0, ExitReason::SignalReversal)
            .await
            .unwrap();
        assert!(pm.is_flat());
        assert!(exchange.position().is_none());
        assert_eq!(exchange.resting_stop_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfilled_close_changes_nothing() {
        let exchange = Arc::new(PaperExchange::new(2100.0, 1000.0));
        let cfg = config();
        let (mut pm, mut rec) = manager(exchange.clone(), &cfg);
        open_long(&mut pm, &mut rec, 2100.0, 2.0).await;

        exchange.set_close_fill_ratio(0.0);
        assert!(pm.close_position(2100.0, ExitReason::Shutdown).await.is_err());

        let pos = pm.position().unwrap();
        assert_eq!(pos.remaining_quantity, 0.714);
        assert!(!pos.stop_stale);
        assert_eq!(exchange.resting_stop_count(), 1);
        assert_eq!(pm.journal().records().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_protected_without_atr() {
        let exchange = Arc::new(PaperExchange::new(2100.0, 1000.0));
        exchange.set_reject_stops(true);
        let cfg = config();
        let (mut pm, mut rec) = manager(exchange.clone(), &cfg);
        let outcome = open_long(&mut pm, &mut rec, 2100.0, 2.0).await;
        assert!(!outcome.protected);

        exchange.set_reject_stops(false);
        assert!(pm.ensure_protected(2100.5).await.unwrap().is_none());
        assert!(!pm.position().unwrap().unprotected);
        assert_eq!(exchange.resting_stop_count(), 1);

        // Unguarded and through the stop: closed without any ATR input
        let mut other = manager(Arc::new(PaperExchange::new(2100.0, 1000.0)), &cfg);
        other.0.gateway().set_swallow_stops(true);
        open_long(&mut other.0, &mut other.1, 2100.0, 2.0).await;
        other.0.gateway().set_mark_price(2090.0);
        let closed = other.0.ensure_protected(2090.0).await.unwrap().unwrap();
        assert_eq!(closed.reason, "STOP_BREACHED");
        assert!(other.0.is_flat());
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_margin_blocks_entry() {
        let exchange = Arc::new(PaperExchange::new(2100.0, 50.0));
        let cfg = config();
        let (mut pm, mut rec) = manager(exchange.clone(), &cfg);

        let clearance = rec.clear_for_entry(&mut pm).await.unwrap();
        let err = pm
            .open_position(clearance, PositionSide::Long, 2100.0, 2.0)
            .await
            .unwrap_err();

        assert!(matches!(err, EntryError::InsufficientMargin { .. }));
        assert!(pm.is_flat());
        assert!(exchange.position().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_fill_aborts_and_stays_flat() {
        let exchange = Arc::new(PaperExchange::new(2100.0, 1000.0));
        exchange.set_fill_ratio(0.5);
        let cfg = config();
        let (mut pm, mut rec) = manager(exchange.clone(), &cfg);

        let clearance = rec.clear_for_entry(&mut pm).await.unwrap();
        let err = pm
            .open_position(clearance, PositionSide::Long, 2100.0, 2.0)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EntryError::Verifier(VerifierError::InsufficientFill { .. })
        ));
        assert!(pm.is_flat());
        assert!(exchange.position().is_none());
    }

    #[test]
    fn test_snapshot_from_candles_needs_atr_history() {
        let cfg = RiskConfig::default();
        assert!(MarketSnapshot::from_candles(100.0, &[], &cfg).is_none());
    }
}
