use serde::Serialize;
use std::fmt;

use super::trade_log::TradeRecord;

/// Performance metrics over the exit lines of a trade log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub profit_factor: f64, // Total wins / Total losses
}

impl PerformanceSummary {
    /// Entries are ignored; every exit (partial or full) counts as a trade
    pub fn from_records(records: &[TradeRecord]) -> Self {
        let pnls: Vec<f64> = records
            .iter()
            .filter(|r| r.is_exit())
            .map(|r| r.pnl)
            .collect();

        let total_trades = pnls.len();
        let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();

        let win_rate = if total_trades > 0 {
            (wins.len() as f64 / total_trades as f64) * 100.0
        } else {
            0.0
        };

        let total_wins: f64 = wins.iter().sum();
        let total_losses: f64 = losses.iter().map(|p| p.abs()).sum();

        let avg_win = if !wins.is_empty() {
            total_wins / wins.len() as f64
        } else {
            0.0
        };
        let avg_loss = if !losses.is_empty() {
            -total_losses / losses.len() as f64
        } else {
            0.0
        };

        let largest_win = wins.iter().copied().fold(0.0, f64::max);
        let largest_loss = losses.iter().copied().fold(0.0, f64::min);

        let profit_factor = if total_losses > 0.0 {
            total_wins / total_losses
        } else if total_wins > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        Self {
            total_trades,
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate,
            total_pnl: pnls.iter().sum(),
            avg_win,
            avg_loss,
            largest_win,
            largest_loss,
            profit_factor,
        }
    }
}

impl fmt::Display for PerformanceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "📊 Performance Summary")?;
        writeln!(f, "  Trades:        {}", self.total_trades)?;
        writeln!(
            f,
            "  Wins/Losses:   {} / {} ({:.1}% win rate)",
            self.winning_trades, self.losing_trades, self.win_rate
        )?;
        writeln!(f, "  Total PnL:     {:+.2} USDT", self.total_pnl)?;
        writeln!(f, "  Avg Win:       {:+.2} USDT", self.avg_win)?;
        writeln!(f, "  Avg Loss:      {:+.2} USDT", self.avg_loss)?;
        writeln!(f, "  Largest Win:   {:+.2} USDT", self.largest_win)?;
        writeln!(f, "  Largest Loss:  {:+.2} USDT", self.largest_loss)?;
        write!(f, "  Profit Factor: {:.2}", self.profit_factor)
    }
}
