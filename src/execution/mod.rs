// Order handling, risk engine and the control loop
pub mod candle_buffer;
pub mod control_loop;
pub mod order_history;
pub mod order_verifier;
pub mod position;
pub mod position_manager;
pub mod reconciler;
pub mod retry;
pub mod risk_rules;

pub use candle_buffer::{CandleBuffer, CandleUpdate};
pub use control_loop::{ControlLoop, LoopExit};
pub use order_history::OrderHistory;
pub use order_verifier::{EntryFill, OrderVerifier, VerifierError};
pub use position::{ExitReason, Position, PositionOrigin};
pub use position_manager::{
    EngineState, EntryError, EntryOutcome, MarketSnapshot, PositionManager, TickReport,
};
pub use reconciler::{
    EntryBlocked, EntryClearance, ReconcileAction, ReconcileMode, ReconcileReport, StateReconciler,
};
pub use retry::{retry_with_backoff, Backoff, RetryError, Retryable};
