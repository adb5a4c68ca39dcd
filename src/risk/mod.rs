// Fail-closed circuit breaker
pub mod circuit_breakers;

pub use circuit_breakers::{CircuitBreakerTrip, CircuitBreakers, FailureKind};
