//! Retry policies shared by every provisioning stage
//!
//! A [`RetryPolicy`] is a small value object: a fixed wait interval plus an
//! optional attempt budget. Stages hand it an async operation and get back
//! either the first successful value or, for bounded policies, a
//! [`RetryExhausted`] error carrying the last failure.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// How many times an operation may be attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempts {
    /// Keep trying until the operation succeeds
    Unbounded,
    /// Give up after this many attempts
    Bounded(u32),
}

/// Returned by a bounded policy once its attempt budget is spent
#[derive(Debug, Error)]
#[error("{stage} failed after {attempts} attempts: {last_error}")]
pub struct RetryExhausted<E> {
    pub stage: &'static str,
    pub attempts: u32,
    pub last_error: E,
}

/// Fixed-interval retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    interval: Duration,
    attempts: Attempts,
}

impl RetryPolicy {
    /// Retry forever, sleeping `interval` between attempts
    pub const fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            attempts: Attempts::Unbounded,
        }
    }

    /// Retry at most `max_attempts` times (a budget of zero still runs once)
    pub const fn bounded(interval: Duration, max_attempts: u32) -> Self {
        let max_attempts = if max_attempts == 0 { 1 } else { max_attempts };
        Self {
            interval,
            attempts: Attempts::Bounded(max_attempts),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn attempts(&self) -> Attempts {
        self.attempts
    }

    pub fn is_bounded(&self) -> bool {
        matches!(self.attempts, Attempts::Bounded(_))
    }

    /// Run `op` until it succeeds or the attempt budget is exhausted.
    ///
    /// `op` receives the 1-based attempt number. The policy sleeps between
    /// attempts but never after the last failed one.
    pub async fn run<T, E, F, Fut>(&self, stage: &'static str, mut op: F) -> Result<T, RetryExhausted<E>>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let exhausted = match self.attempts {
                        Attempts::Bounded(max) => attempt >= max,
                        Attempts::Unbounded => false,
                    };

                    warn!(
                        stage = stage,
                        attempt = attempt,
                        error = %e,
                        "Attempt failed"
                    );

                    if exhausted {
                        return Err(RetryExhausted {
                            stage,
                            attempts: attempt,
                            last_error: e,
                        });
                    }
                }
            }

            tokio::time::sleep(self.interval).await;
        }
    }

    /// Run `op` until it succeeds, ignoring any attempt budget.
    ///
    /// Used by stages that have no safe fallback: network discovery,
    /// record persistence and VM destruction.
    pub async fn run_forever<T, E, F, Fut>(&self, stage: &'static str, op: F) -> T
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match Self::unbounded(self.interval).run(stage, op).await {
            Ok(value) => value,
            Err(_) => unreachable!("unbounded retry returned an error"),
        }
    }
}
