use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// OHLCV candlestick keyed by its open time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>, // Open time
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Candle interval, parsed from exchange notation ("3m", "1h", ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe {
    seconds: u64,
}

impl Timeframe {
    pub fn from_seconds(seconds: u64) -> Self {
        Self { seconds }
    }

    pub fn seconds(&self) -> u64 {
        self.seconds
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds as i64)
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let seconds = match s.trim() {
            "1m" => 60,
            "3m" => 180,
            "5m" => 300,
            "15m" => 900,
            "30m" => 1800,
            "1h" => 3600,
            "4h" => 14400,
            other => return Err(format!("unsupported timeframe: {}", other)),
        };
        Ok(Self { seconds })
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.to_string()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.seconds % 3600 == 0 {
            write!(f, "{}h", self.seconds / 3600)
        } else {
            write!(f, "{}m", self.seconds / 60)
        }
    }
}

/// Direction of the tracked position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// +1 for long, -1 for short
    pub fn direction(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }

    /// Order side that opens this position
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces this position (stops, partial exits, close)
    pub fn exit_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    StopMarket,
    TakeProfitMarket,
    Other(String),
}

impl OrderKind {
    /// Stop-style orders, i.e. protective orders that rest until triggered
    pub fn is_stop(&self) -> bool {
        matches!(self, OrderKind::StopMarket | OrderKind::TakeProfitMarket)
            || matches!(self, OrderKind::Other(name) if name.to_uppercase().contains("STOP"))
    }
}

/// Trading signal emitted once per closed candle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Buy,
    Sell,
    None,
}

impl Signal {
    /// Position side this signal would open, if any
    pub fn entry_side(&self) -> Option<PositionSide> {
        match self {
            Signal::Buy => Some(PositionSide::Long),
            Signal::Sell => Some(PositionSide::Short),
            Signal::None => None,
        }
    }
}

/// Net position as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub side: PositionSide,
    pub quantity: f64, // Always positive
    pub entry_price: f64,
}

impl ExchangePosition {
    /// Build from a signed amount (negative means short). Zero means flat.
    pub fn from_signed(amount: f64, entry_price: f64) -> Option<Self> {
        if amount == 0.0 {
            return None;
        }
        Some(Self {
            side: if amount > 0.0 {
                PositionSide::Long
            } else {
                PositionSide::Short
            },
            quantity: amount.abs(),
            entry_price,
        })
    }

    pub fn signed_quantity(&self) -> f64 {
        self.side.direction() * self.quantity
    }
}

/// Resting order as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub id: String,
    pub kind: OrderKind,
    pub side: OrderSide,
    pub stop_price: Option<f64>,
    pub quantity: f64,
    pub reduce_only: bool,
    pub submitted_at: DateTime<Utc>,
}

impl OpenOrder {
    pub fn is_stop(&self) -> bool {
        self.kind.is_stop()
    }
}

/// Result of a market order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketFill {
    pub id: String,
    pub filled_quantity: f64,
    pub avg_fill_price: Option<f64>,
}
