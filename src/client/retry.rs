//! Retry wrapper for client requests.
//!
//! An operation runs up to `max_attempts` times. Between attempts (never
//! after the last one) a fixup step resets whatever state the failure may
//! have left behind, typically by reopening the connection. Exhausting the
//! attempts yields `None`, so "no answer" looks the same as "not connected".

use futures::future::BoxFuture;
use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt, doubled for each later one.
    pub backoff: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            backoff: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Delay before attempt `attempt` (1-based); none before the first.
    pub fn delay_before(&self, attempt: u32) -> Option<Duration> {
        let base = self.backoff?;
        if attempt <= 1 {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        Some(base.saturating_mul(factor))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(3)
    }
}

/// Run `op` against `state` until it succeeds or the policy is exhausted.
///
/// Attempts never overlap: each one finishes (or fails) before `fixup` runs
/// and the next attempt starts.
pub async fn retry_async<S, T, E, Op, Fix>(
    state: &mut S,
    policy: &RetryPolicy,
    mut op: Op,
    mut fixup: Fix,
) -> Option<T>
where
    E: Display,
    Op: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T, E>>,
    Fix: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, ()>,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        if attempt > 1 {
            fixup(state).await;
            if let Some(delay) = policy.delay_before(attempt) {
                tokio::time::sleep(delay).await;
            }
        }
        match op(state).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Request succeeded after retry");
                }
                return Some(value);
            }
            Err(e) => {
                warn!(attempt, max_attempts = attempts, error = %e, "Request attempt failed");
            }
        }
    }
    None
}
