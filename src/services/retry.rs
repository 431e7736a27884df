//! Bounded retry policy for per-track network work.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::config::Config;
use crate::error::FatalError;

/// Outcome of one failed attempt.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("{0}")]
    Retryable(String),

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.download_attempts.max(1),
            attempt_timeout: config.attempt_timeout(),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// Bound the time-limited part of one attempt by `attempt_timeout`. A
    /// timeout counts as a retryable failure.
    pub async fn bounded<T, Fut>(&self, work: Fut) -> Result<T, AttemptError>
    where
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        match tokio::time::timeout(self.attempt_timeout, work).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AttemptError::Retryable(format!(
                "attempt timed out after {:?}",
                self.attempt_timeout
            ))),
        }
    }

    /// Run `op` until it succeeds, a fatal error surfaces, or the attempt budget
    /// is spent. `op` wraps its own network work in `bounded`, so setup steps
    /// that must finish (proxy selection) are not cut short. `on_failure` runs
    /// after every retryable failure and before the backoff.
    pub async fn run<T, Op, Fut, OnFail, CleanupFut>(
        &self,
        mut op: Op,
        mut on_failure: OnFail,
    ) -> Result<T, RetryError>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
        OnFail: FnMut(u32) -> CleanupFut,
        CleanupFut: Future<Output = ()>,
    {
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=self.max_attempts {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Fatal(fatal)) => return Err(RetryError::Fatal(fatal)),
                Err(AttemptError::Retryable(reason)) => {
                    warn!("Attempt {}/{} failed: {}", attempt, self.max_attempts, reason);
                    last_error = reason;
                    on_failure(attempt).await;
                }
            }

            if attempt < self.max_attempts && !self.backoff.is_zero() {
                tokio::time::sleep(self.backoff).await;
            }
        }

        Err(RetryError::Exhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }
}
