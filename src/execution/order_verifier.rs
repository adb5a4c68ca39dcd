use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

use super::order_history::OrderHistory;
use super::retry::{retry_with_backoff, Backoff, RetryError};
use crate::config::{SizingConfig, VerifyConfig};
use crate::gateway::{ExchangeGateway, GatewayError};
use crate::models::{MarketFill, OpenOrder, PositionSide};
use crate::risk::{CircuitBreakers, FailureKind};

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("entry filled {filled} of {requested}, below the minimum fill ratio")]
    InsufficientFill { requested: f64, filled: f64 },

    #[error("stop at {stop_price} not verified after {attempts} submissions")]
    StopUnverified { stop_price: f64, attempts: u32 },
}

/// Outcome of an accepted entry
#[derive(Debug, Clone, PartialEq)]
pub struct EntryFill {
    pub order_id: String,
    pub requested: f64,
    pub filled: f64,
    pub avg_price: f64,
    pub partial: bool, // Below fill tolerance but above the abort ratio
}

/// Places and cancels orders with bounded retries and existence checks
///
/// Every stop it reports as placed has been observed in the exchange's open
/// order list. Failures feed the circuit breaker.
pub struct OrderVerifier<G: ExchangeGateway> {
    gateway: Arc<G>,
    symbol: String,
    cfg: VerifyConfig,
    sizing: SizingConfig,
    breakers: Arc<CircuitBreakers>,
    history: OrderHistory,
}

impl<G: ExchangeGateway> OrderVerifier<G> {
    pub fn new(
        gateway: Arc<G>,
        symbol: impl Into<String>,
        cfg: VerifyConfig,
        sizing: SizingConfig,
        breakers: Arc<CircuitBreakers>,
        history: OrderHistory,
    ) -> Self {
        Self {
            gateway,
            symbol: symbol.into(),
            cfg,
            sizing,
            breakers,
            history,
        }
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    pub fn history(&self) -> &OrderHistory {
        &self.history
    }

    /// Market entry with fill-ratio checks
    ///
    /// A fill at or below `min_fill_ratio` aborts the entry and the filled
    /// part is flattened (best effort; reconciliation recovers it otherwise).
    pub async fn submit_entry(
        &mut self,
        side: PositionSide,
        quantity: f64,
        reference_price: f64,
    ) -> Result<EntryFill, VerifierError> {
        let fill = self
            .gateway
            .place_market_order(&self.symbol, side.entry_order_side(), quantity, false)
            .await?;
        self.history.record(&fill.id, Utc::now());

        let filled = fill.filled_quantity;
        tracing::info!(
            target: "perpguard::state",
            order_id = %fill.id,
            requested = quantity,
            filled,
            "Entry order filled"
        );

        if filled <= quantity * self.sizing.min_fill_ratio {
            tracing::error!(
                "❌ Entry fill {:.4} / {:.4} ({:.0}%) too small, aborting entry",
                filled,
                quantity,
                filled / quantity * 100.0
            );
            if filled > 0.0 {
                self.flatten_aborted_fill(side, filled).await;
            }
            return Err(VerifierError::InsufficientFill {
                requested: quantity,
                filled,
            });
        }

        let partial = filled < quantity * self.sizing.fill_tolerance;
        if partial {
            tracing::warn!(
                "⚠️  Partial fill {:.4} / {:.4} ({:.1}%), sizing position to filled amount",
                filled,
                quantity,
                filled / quantity * 100.0
            );
        }

        Ok(EntryFill {
            order_id: fill.id,
            requested: quantity,
            filled,
            avg_price: fill.avg_fill_price.unwrap_or(reference_price),
            partial,
        })
    }

    async fn flatten_aborted_fill(&mut self, side: PositionSide, filled: f64) {
        match self.submit_exit(side, filled).await {
            Ok(fill) => tracing::warn!(
                target: "perpguard::state",
                order_id = %fill.id,
                quantity = fill.filled_quantity,
                "Flattened aborted partial entry"
            ),
            Err(e) => tracing::error!(
                target: "perpguard::state",
                error = %e,
                "Could not flatten aborted partial entry, leaving it to reconciliation"
            ),
        }
    }

    /// Reduce-only market order against the position. Not retried: a
    /// timed-out market order may still have executed.
    pub async fn submit_exit(
        &mut self,
        side: PositionSide,
        quantity: f64,
    ) -> Result<MarketFill, GatewayError> {
        let fill = self
            .gateway
            .place_market_order(&self.symbol, side.exit_order_side(), quantity, true)
            .await?;
        self.history.record(&fill.id, Utc::now());
        Ok(fill)
    }

    /// Submit a reduce-only stop and confirm it appears in the open orders
    ///
    /// Makes up to `stop_placement_attempts` submissions, each polled with
    /// exponential backoff. An unconfirmed submission is cancelled before
    /// the next one so retries cannot stack duplicate stops. Exhaustion
    /// counts one stop-placement failure.
    pub async fn place_and_verify_stop(
        &mut self,
        side: PositionSide,
        quantity: f64,
        stop_price: f64,
    ) -> Result<String, VerifierError> {
        let attempts = self.cfg.stop_placement_attempts;
        let mut last_error = None;

        for attempt in 1..=attempts {
            let submitted = self
                .gateway
                .place_stop_order(&self.symbol, side.exit_order_side(), quantity, stop_price)
                .await;

            let order_id = match submitted {
                Ok(id) => id,
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        target: "perpguard::state",
                        attempt,
                        error = %e,
                        "Stop submission failed, retrying"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(self.cfg.backoff_base()).await;
                    continue;
                }
                Err(e) => {
                    tracing::error!(
                        target: "perpguard::state",
                        stop_price,
                        error = %e,
                        "Stop rejected"
                    );
                    last_error = Some(e);
                    break;
                }
            };
            self.history.record(&order_id, Utc::now());

            if self.verify_order_exists(&order_id).await {
                self.breakers.record_success(FailureKind::StopPlacement);
                tracing::info!(
                    target: "perpguard::state",
                    order_id = %order_id,
                    stop_price,
                    quantity,
                    attempt,
                    "Stop verified"
                );
                return Ok(order_id);
            }

            tracing::warn!(
                target: "perpguard::state",
                order_id = %order_id,
                attempt,
                "Stop not visible after polling, cancelling before resubmitting"
            );
            self.cancel_order_quietly(&order_id).await;
        }

        tracing::error!(
            "🚨 Stop at {:.4} could not be verified ({:?}), position is UNPROTECTED",
            stop_price,
            last_error
        );
        self.breakers.record_failure(FailureKind::StopPlacement);
        Err(VerifierError::StopUnverified {
            stop_price,
            attempts,
        })
    }

    /// Poll open orders with backoff until `order_id` shows up
    async fn verify_order_exists(&self, order_id: &str) -> bool {
        let backoff = Backoff::exponential(
            self.cfg.verify_polls,
            self.cfg.backoff_base(),
            self.cfg.backoff_cap(),
        )
        .with_initial_delay();
        let gateway = self.gateway.as_ref();
        let symbol = self.symbol.as_str();

        let result = retry_with_backoff(
            &backoff,
            |attempt| async move {
                tracing::debug!(target: "perpguard::state", order_id, attempt, "Verifying order");
                gateway.fetch_open_orders(symbol).await
            },
            |orders: &Vec<OpenOrder>| orders.iter().any(|o| o.id == order_id),
        )
        .await;

        result.is_ok()
    }

    /// Cancel one order with retries. Unknown-order rejections count as success.
    pub async fn cancel_with_retry(&mut self, order_id: &str, attempts: u32) -> bool {
        let backoff = Backoff::fixed(attempts, self.cfg.cancel_retry_delay());
        let gateway = self.gateway.as_ref();
        let symbol = self.symbol.as_str();

        let result = retry_with_backoff(
            &backoff,
            |_| async move {
                match gateway.cancel_order(symbol, order_id).await {
                    Err(e) if e.is_unknown_order() => Ok(()),
                    other => other,
                }
            },
            |_| true,
        )
        .await;

        match result {
            Ok(()) => {
                self.history.forget(order_id);
                self.breakers.record_success(FailureKind::Cancel);
                tracing::info!(target: "perpguard::state", order_id, "Order cancelled");
                true
            }
            Err(e) => {
                let error = match e {
                    RetryError::Fatal(e) => e.to_string(),
                    RetryError::Exhausted { last_error, .. } => format!("{:?}", last_error),
                };
                tracing::error!(
                    target: "perpguard::state",
                    order_id,
                    error = %error,
                    "Cancel failed"
                );
                self.breakers.record_failure(FailureKind::Cancel);
                false
            }
        }
    }

    /// Single cancel attempt, errors swallowed; breaker untouched
    async fn cancel_order_quietly(&mut self, order_id: &str) {
        if let Err(e) = self.gateway.cancel_order(&self.symbol, order_id).await {
            if !e.is_unknown_order() {
                tracing::debug!(order_id, error = %e, "Quiet cancel failed");
            }
        }
        self.history.forget(order_id);
    }

    /// Cancel every open order matching `predicate`, then re-fetch to confirm
    ///
    /// Returns false if any matching order is still listed (or the listing
    /// itself failed); callers must not assume orders are clear.
    pub async fn cancel_all_matching<P>(&mut self, predicate: P, attempts: u32) -> bool
    where
        P: Fn(&OpenOrder) -> bool,
    {
        let targets: Vec<String> = match self.gateway.fetch_open_orders(&self.symbol).await {
            Ok(orders) => orders
                .iter()
                .filter(|o| predicate(o))
                .map(|o| o.id.clone())
                .collect(),
            Err(e) => {
                tracing::warn!(target: "perpguard::state", error = %e, "Could not list orders to cancel");
                return false;
            }
        };

        if targets.is_empty() {
            return true;
        }

        for order_id in &targets {
            self.cancel_with_retry(order_id, attempts).await;
        }

        match self.gateway.fetch_open_orders(&self.symbol).await {
            Ok(orders) => {
                let remaining = orders.iter().filter(|o| predicate(o)).count();
                tracing::info!(
                    target: "perpguard::state",
                    targeted = targets.len(),
                    remaining,
                    "Cancel sweep finished"
                );
                remaining == 0
            }
            Err(e) => {
                tracing::warn!(target: "perpguard::state", error = %e, "Could not confirm cancel sweep");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::gateway::PaperExchange;
    use crate::models::{OrderKind, OrderSide};

    fn verifier(exchange: Arc<PaperExchange>) -> OrderVerifier<PaperExchange> {
        let cfg = BotConfig::default();
        OrderVerifier::new(
            exchange,
            cfg.symbol.clone(),
            cfg.verify.clone(),
            cfg.sizing.clone(),
            Arc::new(CircuitBreakers::new(cfg.breaker.clone())),
            OrderHistory::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_verified_despite_visibility_lag() {
        let exchange = Arc::new(PaperExchange::new(2100.0, 1000.0));
        exchange.set_stop_visibility_lag(2);
        let mut v = verifier(exchange.clone());

        let id = v
            .place_and_verify_stop(PositionSide::Long, 0.5, 2090.0)
            .await
            .unwrap();

        assert_eq!(exchange.resting_stop_count(), 1);
        assert_eq!(exchange.resting_orders()[0].id, id);
        assert_eq!(exchange.stop_submissions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_swallowed_stop_counts_one_failure() {
        let exchange = Arc::new(PaperExchange::new(2100.0, 1000.0));
        exchange.set_swallow_stops(true);
        let mut v = verifier(exchange.clone());

        let result = v.place_and_verify_stop(PositionSide::Long, 0.5, 2090.0).await;

        assert!(matches!(result, Err(VerifierError::StopUnverified { .. })));
        assert_eq!(exchange.stop_submissions(), 3);
        assert_eq!(v.breakers().failures(FailureKind::StopPlacement), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_stop_is_not_resubmitted() {
        let exchange = Arc::new(PaperExchange::new(2100.0, 1000.0));
        exchange.set_reject_stops(true);
        let mut v = verifier(exchange.clone());

        let result = v.place_and_verify_stop(PositionSide::Short, 1.0, 2110.0).await;

        assert!(result.is_err());
        assert_eq!(exchange.stop_submissions(), 1);
        assert_eq!(v.breakers().failures(FailureKind::StopPlacement), 1);
    }

    #[tokio::test]
    async fn test_fill_ratio_boundary() {
        // Exactly 50% is rejected and flattened
        let exchange = Arc::new(PaperExchange::new(2000.0, 1000.0));
        exchange.set_fill_ratio(0.5);
        let mut v = verifier(exchange.clone());

        let result = v.submit_entry(PositionSide::Long, 1.0, 2000.0).await;
        assert!(matches!(result, Err(VerifierError::InsufficientFill { .. })));
        assert!(exchange.position().is_none());

        // 51% is accepted and reported as partial
        let exchange = Arc::new(PaperExchange::new(2000.0, 1000.0));
        exchange.set_fill_ratio(0.51);
        let mut v = verifier(exchange.clone());

        let fill = v.submit_entry(PositionSide::Long, 1.0, 2000.0).await.unwrap();
        assert!(fill.partial);
        assert!((fill.filled - 0.51).abs() < 1e-12);
        assert_eq!(fill.avg_price, 2000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_matching_only_stops() {
        let exchange = Arc::new(PaperExchange::new(2000.0, 1000.0));
        let now = Utc::now();
        exchange.insert_order(OrderKind::StopMarket, OrderSide::Sell, Some(1990.0), 1.0, now);
        exchange.insert_order(OrderKind::StopMarket, OrderSide::Sell, Some(1985.0), 1.0, now);
        exchange.insert_order(OrderKind::Limit, OrderSide::Buy, None, 1.0, now);
        let mut v = verifier(exchange.clone());

        assert!(v.cancel_all_matching(OpenOrder::is_stop, 3).await);
        assert_eq!(exchange.resting_stop_count(), 0);
        assert_eq!(exchange.resting_orders().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_failures_feed_breaker() {
        let exchange = Arc::new(PaperExchange::new(2000.0, 1000.0));
        let id = exchange.insert_order(
            OrderKind::StopMarket,
            OrderSide::Sell,
            Some(1990.0),
            1.0,
            Utc::now(),
        );
        exchange.fail_next_cancels(10);
        let mut v = verifier(exchange.clone());

        assert!(!v.cancel_with_retry(&id, 3).await);
        assert_eq!(v.breakers().failures(FailureKind::Cancel), 1);
    }

    #[tokio::test]
    async fn test_cancel_unknown_order_is_success() {
        let exchange = Arc::new(PaperExchange::new(2000.0, 1000.0));
        let mut v = verifier(exchange);
        assert!(v.cancel_with_retry("paper-999", 3).await);
    }
}
