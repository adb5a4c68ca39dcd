use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Submission times of orders placed by this process
///
/// Diagnostics only: ages used for orphan decisions come from the exchange's
/// own `submitted_at`, this map just annotates log lines.
#[derive(Debug, Clone)]
pub struct OrderHistory {
    submitted: HashMap<String, DateTime<Utc>>,
    ttl: Duration,
}

impl OrderHistory {
    pub fn new(ttl: Duration) -> Self {
        Self {
            submitted: HashMap::new(),
            ttl,
        }
    }

    pub fn record(&mut self, order_id: &str, at: DateTime<Utc>) {
        self.submitted.insert(order_id.to_string(), at);
        self.prune(at);
    }

    pub fn forget(&mut self, order_id: &str) {
        self.submitted.remove(order_id);
    }

    /// Age of an order we submitted, if still tracked
    pub fn age(&self, order_id: &str, now: DateTime<Utc>) -> Option<Duration> {
        self.submitted.get(order_id).map(|at| now - *at)
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.submitted.contains_key(order_id)
    }

    /// Drop entries older than the TTL
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let ttl = self.ttl;
        self.submitted.retain(|_, at| now - *at <= ttl);
    }

    pub fn len(&self) -> usize {
        self.submitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.submitted.is_empty()
    }
}

impl Default for OrderHistory {
    fn default() -> Self {
        Self::new(Duration::hours(1))
    }
}
