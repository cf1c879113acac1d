//! Retry decisions shared by every component that talks to the service.
//!
//! [`RetryPolicy::decide`] is a pure function of the attempt count and the
//! observed [`ErrorKind`]; [`RetryPolicy::run`] wraps an async call with it.

use crate::config::secs;
use crate::error::{ApiError, ErrorKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffDecision {
    pub retry: bool,
    pub wait: Duration,
}

impl BackoffDecision {
    pub fn stop() -> Self {
        Self {
            retry: false,
            wait: Duration::ZERO,
        }
    }

    pub fn after(wait: Duration) -> Self {
        Self { retry: true, wait }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    #[serde(with = "secs")]
    pub base_delay: Duration,
    /// Cap on every wait, a server's `Retry-After` included.
    #[serde(with = "secs")]
    pub max_delay: Duration,
    /// Scale every computed wait by a uniform factor in [0.5, 1.5].
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Decide whether to try again after `attempt` attempts have failed, the
    /// last one with `error`.
    pub fn decide(self: &Self, attempt: u32, error: ErrorKind) -> BackoffDecision {
        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            1.0
        };
        self.decide_with_jitter(attempt, error, factor)
    }

    pub fn decide_with_jitter(
        self: &Self,
        attempt: u32,
        error: ErrorKind,
        factor: f64,
    ) -> BackoffDecision {
        if !error.is_retryable() || attempt >= self.max_attempts {
            return BackoffDecision::stop();
        }
        if let ErrorKind::RateLimited {
            retry_after: Some(wait),
        } = error
        {
            return BackoffDecision::after(wait.min(self.max_delay));
        }
        BackoffDecision::after(self.backoff(attempt).mul_f64(factor))
    }

    /// `min(max_delay, base_delay * 2^attempt)`, without jitter.
    pub fn backoff(self: &Self, attempt: u32) -> Duration {
        let exponent = attempt.min(32) as i32;
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Run `operation` until it succeeds, fails with a terminal error, or the
    /// attempt budget is spent. Sleeps between attempts observe `cancel`.
    pub async fn run<F, Fut, T>(
        self: &Self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ApiError::cancelled());
            }
            attempt += 1;
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(attempts = attempt, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let decision = self.decide(attempt, error.kind);
            if !decision.retry {
                if error.kind.is_retryable() {
                    tracing::warn!(error = %error, attempts = attempt, "Retries exhausted");
                }
                return Err(error);
            }

            tracing::warn!(
                error = %error,
                attempt,
                max_attempts = self.max_attempts,
                wait_ms = decision.wait.as_millis() as u64,
                "Call failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ApiError::cancelled()),
                _ = tokio::time::sleep(decision.wait) => {}
            }
        }
    }
}
