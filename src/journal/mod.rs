// Append-only trade journal and performance summary
pub mod summary;
pub mod trade_log;

pub use summary::PerformanceSummary;
pub use trade_log::{TradeLog, TradeRecord, ENTRY_REASON, TRADE_LOG_HEADER};
