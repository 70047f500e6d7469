//! Retry policy: maps a failed delivery to its terminal.
//!
//! The policy is pure. It computes a [`Terminal`] from the current headers
//! and the handler error; callers interpret the delay.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::envelope::Headers;

/// Error type returned by message handlers.
#[derive(Debug)]
pub enum HandlerError {
    Retry(String),
    NonRetry(String),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Retry(msg) => write!(f, "retryable error: {msg}"),
            HandlerError::NonRetry(msg) => write!(f, "non-retryable error: {msg}"),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Final disposition of one handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Ack,
    Retry { delay: Duration },
    Dlq { reason: String },
}

/// Delay strategy for retries.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    Constant { delay: Duration },
    /// Full jitter: a delay drawn uniformly from
    /// `[0, min(max, base * 2^attempt)]` inclusive.
    ExponentialJitter { base: Duration, max: Duration },
}

impl Backoff {
    fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Constant { delay } => delay,
            Backoff::ExponentialJitter { base, max } => {
                let base_ms = base.as_millis() as u64;
                let max_ms = max.as_millis() as u64;
                let shift = attempt.min(32);
                let cap = max_ms.min(base_ms.saturating_mul(1u64 << shift));
                let ms = rand::thread_rng().gen_range(0..=cap);
                Duration::from_millis(ms)
            }
        }
    }
}

type RetryablePredicate = Arc<dyn Fn(&HandlerError) -> bool + Send + Sync>;

/// Decides, per failed delivery, between another attempt and the DLQ.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    is_retryable: RetryablePredicate,
}

impl RetryPolicy {
    /// Policy with the default predicate: [`HandlerError::Retry`] is
    /// retryable, [`HandlerError::NonRetry`] is not.
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
            is_retryable: Arc::new(|e| matches!(e, HandlerError::Retry(_))),
        }
    }

    /// Replace the retryability predicate.
    pub fn with_retryable<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&HandlerError) -> bool + Send + Sync + 'static,
    {
        self.is_retryable = Arc::new(predicate);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Compute the terminal for a failed delivery. Evaluated in order:
    /// non-retryable errors go to the DLQ, exhausted attempts go to the DLQ,
    /// everything else retries with a strategy-computed delay.
    pub fn next(&self, headers: &Headers, error: &HandlerError) -> Terminal {
        if !(self.is_retryable)(error) {
            return Terminal::Dlq {
                reason: "non-retryable".to_string(),
            };
        }

        let next_attempt = headers.attempt + 1;
        if next_attempt >= self.max_attempts {
            return Terminal::Dlq {
                reason: format!("maxAttempts({})", self.max_attempts),
            };
        }

        Terminal::Retry {
            delay: self.backoff.delay_for(headers.attempt),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}
