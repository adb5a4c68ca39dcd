use chrono::{DateTime, DurationRound, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::models::{Candle, Timeframe};

/// Random-walk candle generator feeding the paper exchange
///
/// Mostly choppy noise with occasional trend bursts (and volume spikes)
/// so the reference signal fires now and then.
pub struct SyntheticFeed {
    rng: StdRng,
    price: f64,
    base_volume: f64,
    timeframe: Timeframe,
    next_open: DateTime<Utc>,
    burst_left: u32,
    burst_drift: f64,
}

impl SyntheticFeed {
    /// Create a new feed with a seed for reproducibility
    pub fn new(seed: u64, start_price: f64, timeframe: Timeframe) -> Self {
        let now = Utc::now();
        let next_open = now.duration_trunc(timeframe.duration()).unwrap_or(now);

        Self {
            rng: StdRng::seed_from_u64(seed),
            price: start_price,
            base_volume: 1_000.0,
            timeframe,
            next_open,
            burst_left: 0,
            burst_drift: 0.0,
        }
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    /// `count` closed candles ending just before the current slot, oldest first
    pub fn history(&mut self, count: usize) -> Vec<Candle> {
        let step = self.timeframe.duration();
        let start = self.next_open - step * count as i32;

        (0..count)
            .map(|i| {
                let timestamp = start + step * i as i32;
                let (open, close, spike) = self.walk();
                self.create_candle(timestamp, open, close, spike)
            })
            .collect()
    }

    /// Snapshots of the next candle as it forms; the last one is final
    pub fn next_candle(&mut self, updates: usize) -> Vec<Candle> {
        let timestamp = self.next_open;
        self.next_open = self.next_open + self.timeframe.duration();

        let open = self.price;
        let (_, close, spike) = self.walk();
        let updates = updates.max(1);

        let mut forming = Vec::with_capacity(updates);
        let mut high = open.max(close);
        let mut low = open.min(close);
        for i in 1..=updates {
            let progress = i as f64 / updates as f64;
            let mut price = open + (close - open) * progress;
            if i < updates {
                price *= 1.0 + self.rng.gen_range(-0.0005..0.0005);
            }
            high = high.max(price);
            low = low.min(price);

            let volume_scale = if spike { 3.0 } else { 1.0 };
            forming.push(Candle {
                timestamp,
                open,
                high,
                low,
                close: price,
                volume: self.base_volume * volume_scale * progress,
            });
        }
        forming
    }

    /// Advance the walk one candle: (open, close, volume spike)
    fn walk(&mut self) -> (f64, f64, bool) {
        if self.burst_left == 0 && self.rng.gen_bool(0.04) {
            self.burst_left = self.rng.gen_range(4..12);
            self.burst_drift = if self.rng.gen_bool(0.5) { 0.003 } else { -0.003 };
        }

        let open = self.price;
        let noise = self.rng.gen_range(-0.002..0.002);
        let drift = if self.burst_left > 0 {
            self.burst_left -= 1;
            self.burst_drift
        } else {
            0.0
        };
        self.price = (open * (1.0 + drift + noise)).max(1.0);

        (open, self.price, drift != 0.0)
    }

    fn create_candle(&mut self, timestamp: DateTime<Utc>, open: f64, close: f64, spike: bool) -> Candle {
        // Intrabar range around the body
        let noise_pct = 0.001;
        let high = open.max(close) * (1.0 + self.rng.gen_range(0.0..noise_pct));
        let low = open.min(close) * (1.0 - self.rng.gen_range(0.0..noise_pct));

        let mut volume = self.base_volume * self.rng.gen_range(0.7..1.3);
        if spike {
            volume *= 3.0;
        }

        Candle {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_sequential_and_closed() {
        let tf = Timeframe::from_seconds(180);
        let mut feed = SyntheticFeed::new(42, 2000.0, tf);
        let candles = feed.history(200);

        assert_eq!(candles.len(), 200);
        for pair in candles.windows(2) {
            assert_eq!(pair[1].timestamp - pair[0].timestamp, tf.duration());
        }
        assert!(candles.last().unwrap().timestamp < Utc::now());
    }

    #[test]
    fn test_ohlc_consistency() {
        let mut feed = SyntheticFeed::new(7, 2000.0, Timeframe::from_seconds(180));
        let mut candles = feed.history(100);
        candles.extend(feed.next_candle(5));

        for candle in &candles {
            assert!(candle.high >= candle.close && candle.high >= candle.open);
            assert!(candle.low <= candle.close && candle.low <= candle.open);
        }
    }

    #[test]
    fn test_next_candle_updates_share_open_time() {
        let mut feed = SyntheticFeed::new(1, 2000.0, Timeframe::from_seconds(180));
        let history = feed.history(10);

        let updates = feed.next_candle(4);
        assert_eq!(updates.len(), 4);
        assert!(updates.iter().all(|c| c.timestamp == updates[0].timestamp));
        assert!(updates[0].timestamp > history.last().unwrap().timestamp);
        assert_eq!(updates.last().unwrap().close, feed.price());

        let next = feed.next_candle(1);
        assert_eq!(next[0].timestamp - updates[0].timestamp, chrono::Duration::seconds(180));
    }
}
