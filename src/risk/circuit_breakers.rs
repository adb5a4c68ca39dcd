use crate::config::BreakerConfig;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

/// Failure categories tracked by the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    StopPlacement,
    Network,
    Cancel,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::StopPlacement => write!(f, "stop placement"),
            FailureKind::Network => write!(f, "network"),
            FailureKind::Cancel => write!(f, "cancel"),
        }
    }
}

/// Why the breaker tripped
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerTrip {
    pub kind: FailureKind,
    pub failures: u32,
    pub ceiling: u32,
}

impl fmt::Display for CircuitBreakerTrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failures reached {}/{}",
            self.kind, self.failures, self.ceiling
        )
    }
}

/// Circuit breakers to prevent trading with unknown protection state
///
/// Each category counts consecutive failures and resets on success. Once any
/// ceiling is reached the breaker stays tripped for the life of the process.
#[derive(Debug)]
pub struct CircuitBreakers {
    sl_failures: AtomicU32,
    network_failures: AtomicU32,
    cancel_failures: AtomicU32,
    ceilings: BreakerConfig,
    tripped: AtomicBool,
    first_trip: Mutex<Option<CircuitBreakerTrip>>,
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl CircuitBreakers {
    pub fn new(ceilings: BreakerConfig) -> Self {
        Self {
            sl_failures: AtomicU32::new(0),
            network_failures: AtomicU32::new(0),
            cancel_failures: AtomicU32::new(0),
            ceilings,
            tripped: AtomicBool::new(false),
            first_trip: Mutex::new(None),
        }
    }

    fn counter(&self, kind: FailureKind) -> &AtomicU32 {
        match kind {
            FailureKind::StopPlacement => &self.sl_failures,
            FailureKind::Network => &self.network_failures,
            FailureKind::Cancel => &self.cancel_failures,
        }
    }

    fn ceiling(&self, kind: FailureKind) -> u32 {
        match kind {
            FailureKind::StopPlacement => self.ceilings.max_sl_failures,
            FailureKind::Network => self.ceilings.max_network_failures,
            FailureKind::Cancel => self.ceilings.max_cancel_failures,
        }
    }

    /// Count a failure; returns the trip if this failure reached the ceiling
    pub fn record_failure(&self, kind: FailureKind) -> Option<CircuitBreakerTrip> {
        let failures = self.counter(kind).fetch_add(1, Ordering::SeqCst) + 1;
        let ceiling = self.ceiling(kind);

        tracing::warn!(
            target: "perpguard::state",
            kind = %kind,
            failures,
            ceiling,
            "Failure recorded"
        );

        if failures >= ceiling {
            let trip = CircuitBreakerTrip {
                kind,
                failures,
                ceiling,
            };
            self.latch(&trip);
            tracing::error!(target: "perpguard::state", %trip, "CIRCUIT BREAKER TRIPPED");
            return Some(trip);
        }
        None
    }

    /// Reset the counter for a category after a successful operation
    pub fn record_success(&self, kind: FailureKind) {
        self.counter(kind).store(0, Ordering::SeqCst);
    }

    /// Trip unconditionally, e.g. when an emergency cleanup cannot clear orders
    pub fn force_trip(&self, kind: FailureKind) -> CircuitBreakerTrip {
        let trip = CircuitBreakerTrip {
            kind,
            failures: self.failures(kind),
            ceiling: self.ceiling(kind),
        };
        self.latch(&trip);
        tracing::error!(target: "perpguard::state", %trip, "CIRCUIT BREAKER FORCED");
        trip
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// The trip that latched the breaker, if it has tripped
    pub fn trip(&self) -> Option<CircuitBreakerTrip> {
        self.first_trip
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn latch(&self, trip: &CircuitBreakerTrip) {
        self.tripped.store(true, Ordering::SeqCst);
        let mut first = self
            .first_trip
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if first.is_none() {
            *first = Some(trip.clone());
        }
    }

    pub fn failures(&self, kind: FailureKind) -> u32 {
        self.counter(kind).load(Ordering::SeqCst)
    }

    /// First category at or above its ceiling, if any
    pub fn check(&self) -> Result<(), CircuitBreakerTrip> {
        for kind in [
            FailureKind::StopPlacement,
            FailureKind::Network,
            FailureKind::Cancel,
        ] {
            let failures = self.failures(kind);
            let ceiling = self.ceiling(kind);
            if failures >= ceiling {
                return Err(CircuitBreakerTrip {
                    kind,
                    failures,
                    ceiling,
                });
            }
        }
        Ok(())
    }
}
