// Exchange gateway contract and implementations
pub mod paper;
pub mod synthetic;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{Candle, ExchangePosition, MarketFill, OpenOrder, OrderSide, Timeframe};

pub use paper::PaperExchange;
pub use synthetic::SyntheticFeed;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// Timeouts and transient disconnects; safe to retry with backoff
    #[error("network error: {0}")]
    Network(String),

    /// Invalid price/quantity, insufficient margin, unknown order; never retried
    #[error("rejected by exchange: {0}")]
    Rejection(String),

    #[error("gateway disconnected")]
    Disconnected,
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Network(_))
    }

    /// Rejections that mean the order is already gone (filled or cancelled)
    pub fn is_unknown_order(&self) -> bool {
        match self {
            GatewayError::Rejection(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("unknown order") || msg.contains("does not exist")
            }
            _ => false,
        }
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Authenticated RPC/streaming client for one exchange account
///
/// Positions are eventually consistent with fills, and a stop accepted by
/// `place_stop_order` may not show up in the very next `fetch_open_orders`.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn fetch_position(&self, symbol: &str) -> GatewayResult<Option<ExchangePosition>>;

    async fn fetch_open_orders(&self, symbol: &str) -> GatewayResult<Vec<OpenOrder>>;

    /// May partially fill; `filled_quantity` reports what actually executed
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
    ) -> GatewayResult<MarketFill>;

    /// Places a reduce-only stop-market order and returns its id
    async fn place_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
    ) -> GatewayResult<String>;

    /// Idempotent: cancelling a filled/cancelled order yields an unknown-order rejection
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> GatewayResult<()>;

    async fn fetch_balance(&self) -> GatewayResult<f64>;

    /// Most recent `limit` candles, oldest first (history bootstrap and polling fallback)
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> GatewayResult<Vec<Candle>>;

    /// Subscribe to candle updates (in-progress and closed). Dropping the
    /// receiver cancels the subscription; a closed channel means the stream died.
    async fn stream_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> GatewayResult<mpsc::Receiver<Candle>>;

    async fn disconnect(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(GatewayError::Network("timeout".into()).is_retryable());
        assert!(!GatewayError::Rejection("bad price".into()).is_retryable());
        assert!(!GatewayError::Disconnected.is_retryable());

        assert!(GatewayError::Rejection("Unknown order sent".into()).is_unknown_order());
        assert!(!GatewayError::Network("unknown order".into()).is_unknown_order());
    }
}
