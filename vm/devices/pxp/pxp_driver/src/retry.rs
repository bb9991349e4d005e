// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounded waiting: fixed-backoff retry and register polling.

use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// How often an operation that reports "pending" is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Sleep between attempts.
    pub backoff: Duration,
}

/// The retry budget ran out while the operation was still pending.
#[derive(Debug, Error)]
#[error("still pending after {attempts} attempts")]
pub struct PendingExhausted {
    /// Attempts made.
    pub attempts: u32,
}

/// Runs `op` until it returns `Ok(Some(_))` or fails. `Ok(None)` means the
/// operation is pending and is retried after the policy's backoff.
pub(crate) fn retry_with_backoff<T, E>(
    policy: &RetryPolicy,
    mut op: impl FnMut(u32) -> Result<Option<T>, E>,
) -> Result<T, E>
where
    E: From<PendingExhausted>,
{
    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            std::thread::sleep(policy.backoff);
        }
        if let Some(v) = op(attempt)? {
            return Ok(v);
        }
    }
    Err(PendingExhausted {
        attempts: policy.max_attempts,
    }
    .into())
}

/// A polled condition did not become true in time.
#[derive(Debug, Error)]
#[error("condition not met within {timeout:?}")]
pub struct PollTimeout {
    /// The poll budget.
    pub timeout: Duration,
}

/// Polls `cond` every `interval` until it holds or `timeout` elapses. The
/// condition is checked once more after the deadline.
pub(crate) fn poll_timeout(
    timeout: Duration,
    interval: Duration,
    mut cond: impl FnMut() -> bool,
) -> Result<(), PollTimeout> {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(interval.min(deadline - now));
    }
    if cond() {
        Ok(())
    } else {
        Err(PollTimeout { timeout })
    }
}
