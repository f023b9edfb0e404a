//! Bounded-retry action executor
//!
//! Every hardware call in the engine goes through [`execute`]: attempt the
//! action, sleep and retry on retryable failures up to the configured
//! budget, abort immediately on fatal ones. Budgets are per-backend
//! configuration passed in with each call, never ambient state, because
//! hardware classes have very different latency and flakiness profiles.

use anvil_core::HardwareError;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Retry budget for one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Sleep between consecutive attempts.
    pub attempt_interval: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, attempt_interval: Duration) -> Self {
        Self {
            max_attempts,
            attempt_interval,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A retry budget of zero attempts is a configuration error, not a
    /// zero-retry success.
    #[error("retry budget must allow at least one attempt")]
    InvalidBudget,

    /// Fatal failure on some attempt; remaining budget was not consumed.
    #[error("fatal hardware failure on attempt {attempt}: {source}")]
    Fatal {
        attempt: u32,
        source: HardwareError,
    },

    /// The whole budget was spent. Distinguishable from a single-attempt
    /// failure by the attempt count it carries.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: HardwareError,
    },
}

/// Run `action` under `policy`.
///
/// `action` receives the 1-based attempt number. The inter-attempt sleep is
/// the only suspension point added by the executor; it holds no locks.
pub async fn execute<T, F, Fut>(policy: RetryPolicy, mut action: F) -> Result<T, ExecutorError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, HardwareError>>,
{
    if policy.max_attempts == 0 {
        return Err(ExecutorError::InvalidBudget);
    }

    let mut attempt = 0;
    loop {
        attempt += 1;
        match action(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "action succeeded after retries");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() => {
                if attempt >= policy.max_attempts {
                    return Err(ExecutorError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    interval_ms = policy.attempt_interval.as_millis() as u64,
                    error = %err,
                    "retryable hardware failure, will retry"
                );
                tokio::time::sleep(policy.attempt_interval).await;
            }
            Err(err) => {
                return Err(ExecutorError::Fatal {
                    attempt,
                    source: err,
                });
            }
        }
    }
}
