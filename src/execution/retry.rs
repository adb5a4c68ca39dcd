use crate::gateway::GatewayError;
use std::future::Future;
use std::time::Duration;

/// Errors that know whether another attempt could help
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for GatewayError {
    fn is_retryable(&self) -> bool {
        GatewayError::is_retryable(self)
    }
}

/// Bounded exponential backoff: `min(base * 2^attempt, cap)`
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Sleep before the first attempt too (polling for eventual consistency)
    pub delay_first: bool,
}

impl Backoff {
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            delay_first: false,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::exponential(max_attempts, delay, delay)
    }

    pub fn with_initial_delay(mut self) -> Self {
        self.delay_first = true;
        self
    }

    /// Delay slept before the given 0-based attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// Budget used up; `last_error` is None when every attempt returned an unaccepted value
    Exhausted { attempts: u32, last_error: Option<E> },
    /// Non-retryable error, returned immediately
    Fatal(E),
}

/// Run `op` until its result satisfies `accept`, a fatal error occurs, or the
/// attempt budget is exhausted. `op` receives the 0-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    backoff: &Backoff,
    mut op: F,
    accept: P,
) -> Result<T, RetryError<E>>
where
    E: Retryable,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&T) -> bool,
{
    let mut last_error = None;

    for attempt in 0..backoff.max_attempts {
        if attempt > 0 || backoff.delay_first {
            tokio::time::sleep(backoff.delay_for(attempt)).await;
        }

        match op(attempt).await {
            Ok(value) if accept(&value) => return Ok(value),
            Ok(_) => {}
            Err(e) if !e.is_retryable() => return Err(RetryError::Fatal(e)),
            Err(e) => last_error = Some(e),
        }
    }

    Err(RetryError::Exhausted {
        attempts: backoff.max_attempts,
        last_error,
    })
}
