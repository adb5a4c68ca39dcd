use crate::models::{Candle, Timeframe};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

/// Thread-safe rolling window of candles for the traded symbol
///
/// Feeds emit several updates for the same candle while it is forming, so
/// candles are upserted by open time: an update for the tail candle replaces
/// it, a newer open time appends.
#[derive(Clone)]
pub struct CandleBuffer {
    data: Arc<RwLock<VecDeque<Candle>>>,
    max_candles: usize,
}

/// What `upsert` did with an incoming candle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleUpdate {
    Appended,
    Replaced,
    Stale, // Older than the tail, ignored
}

impl CandleBuffer {
    /// Create a new candle buffer
    ///
    /// # Arguments
    /// * `max_candles` - Maximum number of candles to keep
    pub fn new(max_candles: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(VecDeque::new())),
            max_candles,
        }
    }

    /// Insert or update a candle
    ///
    /// If the buffer is full, removes the oldest candle
    pub fn upsert(&self, candle: Candle) -> Result<CandleUpdate, String> {
        let mut data = self.data.write().map_err(|e| e.to_string())?;

        let update = match data.back() {
            Some(last) if last.timestamp == candle.timestamp => {
                if let Some(last) = data.back_mut() {
                    *last = candle;
                }
                CandleUpdate::Replaced
            }
            Some(last) if last.timestamp > candle.timestamp => CandleUpdate::Stale,
            _ => {
                data.push_back(candle);
                CandleUpdate::Appended
            }
        };

        while data.len() > self.max_candles {
            data.pop_front();
        }

        Ok(update)
    }

    /// Replace the whole window, e.g. after a bootstrap or polling fetch
    pub fn replace_all(&self, mut candles: Vec<Candle>) -> Result<(), String> {
        let mut data = self.data.write().map_err(|e| e.to_string())?;
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);

        let skip = candles.len().saturating_sub(self.max_candles);
        *data = candles.into_iter().skip(skip).collect();
        Ok(())
    }

    /// Candles safe to hand to a signal source
    ///
    /// Anything followed by a newer candle is closed. The tail counts only
    /// once its interval has (almost) elapsed on the wall clock.
    pub fn closed_candles(
        &self,
        now: DateTime<Utc>,
        timeframe: Timeframe,
        threshold: f64,
    ) -> Result<Vec<Candle>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        let tail = data.len().saturating_sub(1);
        Ok(data
            .iter()
            .enumerate()
            .filter(|(idx, c)| *idx < tail || is_candle_closed(c.timestamp, now, timeframe, threshold))
            .map(|(_, c)| c.clone())
            .collect())
    }

    pub fn last(&self) -> Result<Option<Candle>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data.back().cloned())
    }

    pub fn candle_count(&self) -> Result<usize, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data.len())
    }
}

/// A candle is closed once `threshold` of its interval has elapsed since open.
/// Feeds can deliver the final update at or slightly after nominal close.
pub fn is_candle_closed(
    open_time: DateTime<Utc>,
    now: DateTime<Utc>,
    timeframe: Timeframe,
    threshold: f64,
) -> bool {
    let elapsed_ms = (now - open_time).num_milliseconds() as f64;
    let interval_ms = timeframe.seconds() as f64 * 1000.0;
    elapsed_ms >= interval_ms * threshold
}
