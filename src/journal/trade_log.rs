use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::models::PositionSide;

pub const TRADE_LOG_HEADER: &str = "Timestamp | Side | Entry | Exit | Qty | PNL USDT | PNL % | Reason";
pub const ENTRY_REASON: &str = "ENTRY";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One trade log line: an entry, a partial exit, or a close
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub side: PositionSide,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub quantity: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub reason: String,
}

impl TradeRecord {
    pub fn entry(side: PositionSide, entry_price: f64, quantity: f64, at: DateTime<Utc>) -> Self {
        Self {
            timestamp: at,
            side,
            entry_price: Some(entry_price),
            exit_price: None,
            quantity,
            pnl: 0.0,
            pnl_pct: 0.0,
            reason: ENTRY_REASON.to_string(),
        }
    }

    /// Exit of `quantity` (the amount actually closed), PnL computed from it
    pub fn exit(
        side: PositionSide,
        entry_price: f64,
        exit_price: f64,
        quantity: f64,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        let pnl = side.direction() * (exit_price - entry_price) * quantity;
        let notional = entry_price * quantity;
        let pnl_pct = if notional != 0.0 {
            pnl / notional * 100.0
        } else {
            0.0
        };

        Self {
            timestamp: at,
            side,
            entry_price: Some(entry_price),
            exit_price: Some(exit_price),
            quantity,
            pnl,
            pnl_pct,
            reason: reason.into(),
        }
    }

    pub fn is_exit(&self) -> bool {
        self.exit_price.is_some() && self.reason != ENTRY_REASON
    }

    pub fn format_line(&self) -> String {
        let price = |p: Option<f64>| p.map_or_else(|| "N/A".to_string(), |p| format!("{:.2}", p));
        format!(
            "{} UTC | Side: {} | Entry: {} | Exit: {} | Qty: {:.4} | PNL: {:+.2} USDT ({:+.2}%) | Reason: {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.side.entry_order_side(),
            price(self.entry_price),
            price(self.exit_price),
            self.quantity,
            self.pnl,
            self.pnl_pct,
            self.reason
        )
    }

    /// Parse a line written by `format_line`; None for the header or malformed lines
    pub fn parse_line(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.trim().splitn(7, '|').map(str::trim).collect();
        if parts.len() < 7 {
            return None;
        }

        let timestamp = NaiveDateTime::parse_from_str(
            parts[0].trim_end_matches("UTC").trim(),
            TIMESTAMP_FORMAT,
        )
        .ok()?
        .and_utc();

        let side = match field(parts[1], "Side:")? {
            "BUY" => PositionSide::Long,
            "SELL" => PositionSide::Short,
            _ => return None,
        };
        let entry_price = parse_price(field(parts[2], "Entry:")?)?;
        let exit_price = parse_price(field(parts[3], "Exit:")?)?;
        let quantity = field(parts[4], "Qty:")?.parse().ok()?;

        // "+12.50 USDT (+1.23%)"
        let pnl_part = field(parts[5], "PNL:")?;
        let (pnl, rest) = pnl_part.split_once("USDT")?;
        let pnl = pnl.trim().parse().ok()?;
        let pnl_pct = rest
            .trim()
            .trim_start_matches('(')
            .trim_end_matches(')')
            .trim_end_matches('%')
            .parse()
            .ok()?;

        let reason = field(parts[6], "Reason:")?.to_string();

        Some(Self {
            timestamp,
            side,
            entry_price,
            exit_price,
            quantity,
            pnl,
            pnl_pct,
            reason,
        })
    }
}

fn field<'a>(part: &'a str, label: &str) -> Option<&'a str> {
    part.strip_prefix(label).map(str::trim)
}

/// "N/A" -> Some(None), number -> Some(Some(n)), garbage -> None
fn parse_price(s: &str) -> Option<Option<f64>> {
    if s == "N/A" {
        return Some(None);
    }
    s.parse().ok().map(Some)
}

#[derive(Clone)]
enum Sink {
    File(PathBuf),
    Memory(Arc<Mutex<Vec<String>>>),
}

/// Append-only trade log
#[derive(Clone)]
pub struct TradeLog {
    sink: Sink,
}

impl TradeLog {
    /// Log to a file, creating it (with header) and parent directories if needed
    pub fn file(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let is_new = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        if is_new {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening trade log {}", path.display()))?;
            writeln!(file, "{}", TRADE_LOG_HEADER)?;
        }

        Ok(Self {
            sink: Sink::File(path),
        })
    }

    /// Keep lines in memory (tests and dry runs)
    pub fn in_memory() -> Self {
        Self {
            sink: Sink::Memory(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    pub fn record(&self, record: &TradeRecord) -> anyhow::Result<()> {
        let line = record.format_line();
        tracing::info!("📝 {}", line);

        match &self.sink {
            Sink::File(path) => {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("opening trade log {}", path.display()))?;
                writeln!(file, "{}", line)?;
            }
            Sink::Memory(lines) => {
                lines
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(line);
            }
        }
        Ok(())
    }

    /// Records written so far (file contents or in-memory lines)
    pub fn records(&self) -> anyhow::Result<Vec<TradeRecord>> {
        match &self.sink {
            Sink::File(path) => read_records(path),
            Sink::Memory(lines) => Ok(lines
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .iter()
                .filter_map(|l| TradeRecord::parse_line(l))
                .collect()),
        }
    }
}

/// Read every well-formed record from a trade log file
pub fn read_records(path: &Path) -> anyhow::Result<Vec<TradeRecord>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading trade log {}", path.display()))?;
    Ok(contents.lines().filter_map(TradeRecord::parse_line).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_entry_line_format() {
        let rec = TradeRecord::entry(PositionSide::Long, 2100.0, 0.7143, ts());
        assert_eq!(
            rec.format_line(),
            "2024-05-01 12:30:00 UTC | Side: BUY | Entry: 2100.00 | Exit: N/A | Qty: 0.7143 | PNL: +0.00 USDT (+0.00%) | Reason: ENTRY"
        );
        assert!(!rec.is_exit());
    }

    #[test]
    fn test_short_exit_pnl() {
        let rec = TradeRecord::exit(PositionSide::Short, 3000.0, 2970.0, 1.5, "PARTIAL_EXIT_1", ts());
        assert_eq!(rec.pnl, 45.0);
        assert_eq!(rec.pnl_pct, 1.0);
        assert!(rec.format_line().contains("Side: SELL"));
        assert!(rec.format_line().contains("PNL: +45.00 USDT (+1.00%)"));
        assert!(rec.is_exit());
    }

    #[test]
    fn test_parse_line() {
        let line = "2024-05-01 12:30:00 UTC | Side: SELL | Entry: 3000.00 | Exit: 3030.00 | Qty: 1.0000 | PNL: -30.00 USDT (-1.00%) | Reason: EXTERNAL_CLOSE";
        let rec = TradeRecord::parse_line(line).unwrap();

        assert_eq!(rec.timestamp, ts());
        assert_eq!(rec.side, PositionSide::Short);
        assert_eq!(rec.exit_price, Some(3030.0));
        assert_eq!(rec.pnl, -30.0);
        assert_eq!(rec.pnl_pct, -1.0);
        assert_eq!(rec.reason, "EXTERNAL_CLOSE");

        assert!(TradeRecord::parse_line(TRADE_LOG_HEADER).is_none());
        assert!(TradeRecord::parse_line("garbage").is_none());
    }

    #[test]
    fn test_file_log_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades").join("trade_log.txt");

        let log = TradeLog::file(&path).unwrap();
        log.record(&TradeRecord::entry(PositionSide::Long, 2100.0, 1.0, ts()))
            .unwrap();
        let log = TradeLog::file(&path).unwrap();
        log.record(&TradeRecord::exit(PositionSide::Long, 2100.0, 2110.0, 1.0, "SHUTDOWN", ts()))
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.matches(TRADE_LOG_HEADER).count(), 1);
        assert_eq!(contents.lines().count(), 3);

        let records = log.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].pnl, 10.0);
    }

    #[test]
    fn test_memory_log_roundtrip() {
        let log = TradeLog::in_memory();
        log.record(&TradeRecord::entry(PositionSide::Short, 3000.0, 1.5, ts()))
            .unwrap();

        let records = log.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, ENTRY_REASON);
        assert_eq!(records[0].entry_price, Some(3000.0));
    }
}
