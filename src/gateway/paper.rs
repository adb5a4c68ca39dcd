use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::{ExchangeGateway, GatewayError, GatewayResult};
use crate::models::{
    Candle, ExchangePosition, MarketFill, OpenOrder, OrderKind, OrderSide, PositionSide, Timeframe,
};

const STREAM_CAPACITY: usize = 256;
const MAX_HISTORY: usize = 2_000;

/// Market order executed by the paper exchange (kept for inspection)
#[derive(Debug, Clone, PartialEq)]
pub struct PaperTrade {
    pub order_id: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub reduce_only: bool,
    pub triggered_by_stop: bool,
}

#[derive(Debug)]
struct PaperOrder {
    order: OpenOrder,
    hidden_polls: u32,
}

struct PaperState {
    mark_price: f64,
    position: Option<ExchangePosition>,
    orders: Vec<PaperOrder>,
    free_margin: f64,
    fill_ratio: f64,
    close_fill_ratio: f64, // Applies to reduce-only market orders
    stop_visibility_lag: u32,
    swallow_stops: bool,
    reject_stops: bool,
    network_failures: u32,
    cancel_failures: u32,
    next_id: u64,
    connected: bool,
    history: Vec<Candle>,
    subscriber: Option<mpsc::Sender<Candle>>,
    trades: Vec<PaperTrade>,
    stop_submissions: u32,
}

impl PaperState {
    fn next_order_id(&mut self) -> String {
        self.next_id += 1;
        format!("paper-{}", self.next_id)
    }

    fn check_available(&mut self) -> GatewayResult<()> {
        if !self.connected {
            return Err(GatewayError::Disconnected);
        }
        if self.network_failures > 0 {
            self.network_failures -= 1;
            return Err(GatewayError::Network("injected timeout".to_string()));
        }
        Ok(())
    }

    /// Apply a signed fill to the net position, returning realized PnL
    fn apply_fill(&mut self, side: OrderSide, quantity: f64, price: f64) -> f64 {
        let delta = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };

        let (current, entry) = self
            .position
            .as_ref()
            .map(|p| (p.signed_quantity(), p.entry_price))
            .unwrap_or((0.0, price));

        let next = current + delta;
        let mut realized = 0.0;

        if current == 0.0 || current.signum() == delta.signum() {
            // Opening or adding: volume-weighted entry
            let entry_price = if current == 0.0 {
                price
            } else {
                (entry * current.abs() + price * delta.abs()) / next.abs()
            };
            self.position = ExchangePosition::from_signed(next, entry_price);
        } else {
            let closed = delta.abs().min(current.abs());
            realized = (price - entry) * closed * current.signum();

            if next.abs() < 1e-12 {
                self.position = None;
            } else if next.signum() == current.signum() {
                self.position = ExchangePosition::from_signed(next, entry);
            } else {
                // Flipped through zero
                self.position = ExchangePosition::from_signed(next, price);
            }
        }

        self.free_margin += realized;
        realized
    }

    /// Fire resting reduce-only stops crossed by the current mark price
    fn trigger_stops(&mut self) {
        let price = self.mark_price;
        let mut fired = Vec::new();

        for (idx, resting) in self.orders.iter().enumerate() {
            let order = &resting.order;
            let Some(stop) = order.stop_price else { continue };
            if !order.is_stop() {
                continue;
            }
            let crossed = match order.side {
                OrderSide::Sell => price <= stop,
                OrderSide::Buy => price >= stop,
            };
            if crossed {
                fired.push(idx);
            }
        }

        for idx in fired.into_iter().rev() {
            let resting = self.orders.remove(idx);
            let order = resting.order;

            let Some(position) = self.position.clone() else {
                continue;
            };
            if order.reduce_only && position.side.exit_order_side() != order.side {
                continue;
            }

            let quantity = if order.reduce_only {
                order.quantity.min(position.quantity)
            } else {
                order.quantity
            };
            self.apply_fill(order.side, quantity, price);
            self.trades.push(PaperTrade {
                order_id: order.id.clone(),
                side: order.side,
                quantity,
                price,
                reduce_only: order.reduce_only,
                triggered_by_stop: true,
            });

            tracing::debug!(order_id = %order.id, price, "Paper stop triggered");
        }
    }
}

/// In-memory exchange simulating one perpetual futures account
///
/// Behaves like an eventually consistent venue: stops can be hidden from
/// the next few order listings, entries can partially fill, and stop fills
/// happen silently when the mark price crosses them.
pub struct PaperExchange {
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(mark_price: f64, free_margin: f64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                mark_price,
                position: None,
                orders: Vec::new(),
                free_margin,
                fill_ratio: 1.0,
                close_fill_ratio: 1.0,
                stop_visibility_lag: 0,
                swallow_stops: false,
                reject_stops: false,
                network_failures: 0,
                cancel_failures: 0,
                next_id: 0,
                connected: true,
                history: Vec::new(),
                subscriber: None,
                trades: Vec::new(),
                stop_submissions: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mark_price(&self) -> f64 {
        self.lock().mark_price
    }

    /// Move the mark price; crossed stops fill without any notification
    pub fn set_mark_price(&self, price: f64) {
        let mut state = self.lock();
        state.mark_price = price;
        state.trigger_stops();
    }

    pub fn position(&self) -> Option<ExchangePosition> {
        self.lock().position.clone()
    }

    /// Overwrite the exchange position (e.g. a position opened by another process)
    pub fn set_position(&self, position: Option<ExchangePosition>) {
        self.lock().position = position;
    }

    /// Every resting order, including ones not yet visible to listings
    pub fn resting_orders(&self) -> Vec<OpenOrder> {
        self.lock().orders.iter().map(|o| o.order.clone()).collect()
    }

    pub fn resting_stop_count(&self) -> usize {
        self.lock().orders.iter().filter(|o| o.order.is_stop()).count()
    }

    /// Insert an order as if submitted by someone else, visible immediately
    pub fn insert_order(
        &self,
        kind: OrderKind,
        side: OrderSide,
        stop_price: Option<f64>,
        quantity: f64,
        submitted_at: DateTime<Utc>,
    ) -> String {
        let mut state = self.lock();
        let id = state.next_order_id();
        state.orders.push(PaperOrder {
            order: OpenOrder {
                id: id.clone(),
                reduce_only: kind.is_stop(),
                kind,
                side,
                stop_price,
                quantity,
                submitted_at,
            },
            hidden_polls: 0,
        });
        id
    }

    pub fn set_fill_ratio(&self, ratio: f64) {
        self.lock().fill_ratio = ratio.clamp(0.0, 1.0);
    }

    pub fn set_close_fill_ratio(&self, ratio: f64) {
        self.lock().close_fill_ratio = ratio.clamp(0.0, 1.0);
    }

    /// New stops stay invisible for the next `polls` order listings
    pub fn set_stop_visibility_lag(&self, polls: u32) {
        self.lock().stop_visibility_lag = polls;
    }

    /// Accept stop orders but never make them live
    pub fn set_swallow_stops(&self, swallow: bool) {
        self.lock().swallow_stops = swallow;
    }

    pub fn set_reject_stops(&self, reject: bool) {
        self.lock().reject_stops = reject;
    }

    /// The next `count` gateway calls fail with a network error
    pub fn fail_next_calls(&self, count: u32) {
        self.lock().network_failures = count;
    }

    /// The next `count` cancellations fail with a network error
    pub fn fail_next_cancels(&self, count: u32) {
        self.lock().cancel_failures = count;
    }

    pub fn free_margin(&self) -> f64 {
        self.lock().free_margin
    }

    pub fn set_free_margin(&self, margin: f64) {
        self.lock().free_margin = margin;
    }

    pub fn trades(&self) -> Vec<PaperTrade> {
        self.lock().trades.clone()
    }

    pub fn stop_submissions(&self) -> u32 {
        self.lock().stop_submissions
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Seed candle history without touching subscribers
    pub fn seed_history(&self, candles: Vec<Candle>) {
        let mut state = self.lock();
        if let Some(last) = candles.last() {
            state.mark_price = last.close;
        }
        state.history = candles;
    }

    /// Publish a candle update: updates history and mark price, fires stops,
    /// and forwards to the live subscription if there is one
    pub fn push_candle(&self, candle: Candle) {
        let mut state = self.lock();

        match state.history.last_mut() {
            Some(last) if last.timestamp == candle.timestamp => *last = candle.clone(),
            _ => state.history.push(candle.clone()),
        }
        if state.history.len() > MAX_HISTORY {
            let excess = state.history.len() - MAX_HISTORY;
            state.history.drain(..excess);
        }

        state.mark_price = candle.close;
        state.trigger_stops();

        if let Some(tx) = &state.subscriber {
            if tx.try_send(candle).is_err() {
                tracing::debug!("Paper candle subscriber lagging or gone");
            }
        }
    }

    /// Drop the current subscription, as a stalled websocket would
    pub fn drop_stream(&self) {
        self.lock().subscriber = None;
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn fetch_position(&self, _symbol: &str) -> GatewayResult<Option<ExchangePosition>> {
        let mut state = self.lock();
        state.check_available()?;
        Ok(state.position.clone())
    }

    async fn fetch_open_orders(&self, _symbol: &str) -> GatewayResult<Vec<OpenOrder>> {
        let mut state = self.lock();
        state.check_available()?;

        let mut visible = Vec::new();
        for resting in state.orders.iter_mut() {
            if resting.hidden_polls > 0 {
                resting.hidden_polls -= 1;
                continue;
            }
            visible.push(resting.order.clone());
        }
        Ok(visible)
    }

    async fn place_market_order(
        &self,
        _symbol: &str,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
    ) -> GatewayResult<MarketFill> {
        let mut state = self.lock();
        state.check_available()?;

        if quantity <= 0.0 || !quantity.is_finite() {
            return Err(GatewayError::Rejection(format!(
                "invalid quantity {}",
                quantity
            )));
        }

        let mut filled = quantity;
        if !reduce_only {
            filled *= state.fill_ratio;
        } else {
            match &state.position {
                Some(position) if position.side.exit_order_side() == side => {
                    filled = filled.min(position.quantity) * state.close_fill_ratio;
                }
                _ => {
                    return Err(GatewayError::Rejection(
                        "reduce-only order would increase position".to_string(),
                    ))
                }
            }
        }

        let price = state.mark_price;
        let id = state.next_order_id();
        if filled > 0.0 {
            state.apply_fill(side, filled, price);
        }
        state.trades.push(PaperTrade {
            order_id: id.clone(),
            side,
            quantity: filled,
            price,
            reduce_only,
            triggered_by_stop: false,
        });

        Ok(MarketFill {
            id,
            filled_quantity: filled,
            avg_fill_price: (filled > 0.0).then_some(price),
        })
    }

    async fn place_stop_order(
        &self,
        _symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
    ) -> GatewayResult<String> {
        let mut state = self.lock();
        state.check_available()?;
        state.stop_submissions += 1;

        if state.reject_stops {
            return Err(GatewayError::Rejection("order would immediately trigger".to_string()));
        }
        if stop_price <= 0.0 || quantity <= 0.0 {
            return Err(GatewayError::Rejection(format!(
                "invalid stop {} x {}",
                stop_price, quantity
            )));
        }

        let id = state.next_order_id();
        if state.swallow_stops {
            return Ok(id);
        }

        let hidden_polls = state.stop_visibility_lag;
        state.orders.push(PaperOrder {
            order: OpenOrder {
                id: id.clone(),
                kind: OrderKind::StopMarket,
                side,
                stop_price: Some(stop_price),
                quantity,
                reduce_only: true,
                submitted_at: Utc::now(),
            },
            hidden_polls,
        });
        Ok(id)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> GatewayResult<()> {
        let mut state = self.lock();
        state.check_available()?;

        if state.cancel_failures > 0 {
            state.cancel_failures -= 1;
            return Err(GatewayError::Network("cancel timed out".to_string()));
        }

        match state.orders.iter().position(|o| o.order.id == order_id) {
            Some(idx) => {
                state.orders.remove(idx);
                Ok(())
            }
            None => Err(GatewayError::Rejection("Unknown order sent".to_string())),
        }
    }

    async fn fetch_balance(&self) -> GatewayResult<f64> {
        let mut state = self.lock();
        state.check_available()?;
        Ok(state.free_margin)
    }

    async fn fetch_candles(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        limit: usize,
    ) -> GatewayResult<Vec<Candle>> {
        let mut state = self.lock();
        state.check_available()?;
        let start = state.history.len().saturating_sub(limit);
        Ok(state.history[start..].to_vec())
    }

    async fn stream_candles(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
    ) -> GatewayResult<mpsc::Receiver<Candle>> {
        let mut state = self.lock();
        state.check_available()?;
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        state.subscriber = Some(tx);
        Ok(rx)
    }

    async fn disconnect(&self) {
        let mut state = self.lock();
        state.connected = false;
        state.subscriber = None;
        tracing::info!("Paper exchange disconnected");
    }
}

/// Signed helper used by tests and the paper feed
pub fn long_position(quantity: f64, entry_price: f64) -> ExchangePosition {
    ExchangePosition {
        side: PositionSide::Long,
        quantity,
        entry_price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const SYM: &str = "ETH/USDT:USDT";

    fn candle_at(ts: DateTime<Utc>, close: f64) -> Candle {
        Candle {
            timestamp: ts,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[tokio::test]
    async fn test_market_order_partial_fill() {
        let ex = PaperExchange::new(2000.0, 1000.0);
        ex.set_fill_ratio(0.6);

        let fill = ex
            .place_market_order(SYM, OrderSide::Buy, 1.0, false)
            .await
            .unwrap();
        assert!((fill.filled_quantity - 0.6).abs() < 1e-12);
        assert_eq!(fill.avg_fill_price, Some(2000.0));

        let position = ex.position().unwrap();
        assert_eq!(position.side, PositionSide::Long);
        assert!((position.quantity - 0.6).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_reduce_only_partial_fill() {
        let ex = PaperExchange::new(2000.0, 1000.0);
        ex.set_position(Some(long_position(1.0, 2000.0)));
        ex.set_close_fill_ratio(0.25);

        let fill = ex
            .place_market_order(SYM, OrderSide::Sell, 1.0, true)
            .await
            .unwrap();
        assert!((fill.filled_quantity - 0.25).abs() < 1e-12);
        assert!((ex.position().unwrap().quantity - 0.75).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_reduce_only_cannot_increase() {
        let ex = PaperExchange::new(2000.0, 1000.0);
        let result = ex.place_market_order(SYM, OrderSide::Sell, 1.0, true).await;
        assert!(matches!(result, Err(GatewayError::Rejection(_))));
    }

    #[tokio::test]
    async fn test_stop_visibility_lag() {
        let ex = PaperExchange::new(2000.0, 1000.0);
        ex.set_position(Some(long_position(1.0, 2000.0)));
        ex.set_stop_visibility_lag(2);

        let id = ex
            .place_stop_order(SYM, OrderSide::Sell, 1.0, 1990.0)
            .await
            .unwrap();

        assert!(ex.fetch_open_orders(SYM).await.unwrap().is_empty());
        assert!(ex.fetch_open_orders(SYM).await.unwrap().is_empty());
        let orders = ex.fetch_open_orders(SYM).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].id, id);
    }

    #[tokio::test]
    async fn test_stop_fills_silently_on_cross() {
        let ex = PaperExchange::new(2000.0, 1000.0);
        ex.set_position(Some(long_position(1.0, 2000.0)));
        ex.place_stop_order(SYM, OrderSide::Sell, 1.0, 1990.0)
            .await
            .unwrap();

        ex.set_mark_price(1995.0);
        assert!(ex.position().is_some());

        ex.set_mark_price(1989.0);
        assert!(ex.position().is_none());
        assert!(ex.resting_orders().is_empty());
        assert!(ex.trades().last().unwrap().triggered_by_stop);
    }

    #[tokio::test]
    async fn test_cancel_unknown_order_is_rejection() {
        let ex = PaperExchange::new(2000.0, 1000.0);
        let err = ex.cancel_order(SYM, "nope").await.unwrap_err();
        assert!(err.is_unknown_order());
    }

    #[tokio::test]
    async fn test_injected_network_failures() {
        let ex = PaperExchange::new(2000.0, 1000.0);
        ex.fail_next_calls(2);
        assert!(ex.fetch_balance().await.is_err());
        assert!(ex.fetch_balance().await.is_err());
        assert_eq!(ex.fetch_balance().await.unwrap(), 1000.0);
    }

    #[tokio::test]
    async fn test_stream_forwards_and_upserts_history() {
        let ex = PaperExchange::new(2000.0, 1000.0);
        let mut rx = ex.stream_candles(SYM, Timeframe::from_seconds(180)).await.unwrap();

        let ts = Utc::now();
        ex.push_candle(candle_at(ts, 2001.0));
        ex.push_candle(candle_at(ts, 2002.0));
        ex.push_candle(candle_at(ts + Duration::minutes(3), 2003.0));

        assert_eq!(rx.recv().await.unwrap().close, 2001.0);
        assert_eq!(rx.recv().await.unwrap().close, 2002.0);
        assert_eq!(rx.recv().await.unwrap().close, 2003.0);

        let history = ex
            .fetch_candles(SYM, Timeframe::from_seconds(180), 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].close, 2002.0);
        assert_eq!(ex.mark_price(), 2003.0);
    }

    #[tokio::test]
    async fn test_disconnect_rejects_calls() {
        let ex = PaperExchange::new(2000.0, 1000.0);
        ex.disconnect().await;
        assert_eq!(
            ex.fetch_position(SYM).await.unwrap_err(),
            GatewayError::Disconnected
        );
    }
}
