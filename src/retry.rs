//! Retry wrapper for oracle calls.
//!
//! Every external oracle call goes through [`retry_async`]. It is the only
//! place transient failure handling lives: callers see either a value or a
//! fatal error once the attempt budget is spent.
//!
//! # Backoff
//!
//! The wait before attempt `n + 1` is drawn uniformly from
//! `[min_wait, high]`, where `high = clamp(multiplier * 2^(n-1), min_wait, max_wait)`.
//!
//! ```
//! use devloop::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::default();
//! let mut rng = rand::thread_rng();
//! for attempt in 1..policy.max_attempts {
//!     let wait = policy.delay_for(attempt, &mut rng);
//!     assert!(wait >= Duration::from_secs(5));
//!     assert!(wait <= Duration::from_secs(120));
//! }
//! ```

use crate::error::{DevloopError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

// ============================================================================
// Backoff Constants
// ============================================================================

/// Lower bound on the wait between attempts, in seconds.
pub const MIN_WAIT_SECS: u64 = 5;

/// Upper bound on the wait between attempts, in seconds.
pub const MAX_WAIT_SECS: u64 = 120;

/// Total attempts (first call included) before giving up.
pub const MAX_ATTEMPTS: u32 = 8;

/// Multiplier for the exponential component.
pub const BACKOFF_MULTIPLIER: u64 = 1;

/// Randomized exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Floor of every wait, in seconds.
    pub min_wait_secs: u64,
    /// Ceiling of every wait, in seconds.
    pub max_wait_secs: u64,
    /// Scale applied to `2^(attempt-1)`.
    pub multiplier: u64,
    /// Total attempts including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_wait_secs: MIN_WAIT_SECS,
            max_wait_secs: MAX_WAIT_SECS,
            multiplier: BACKOFF_MULTIPLIER,
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Policy that makes a single attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set the attempt budget.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the wait bounds in seconds.
    #[must_use]
    pub fn with_wait_bounds(mut self, min_secs: u64, max_secs: u64) -> Self {
        self.min_wait_secs = min_secs;
        self.max_wait_secs = max_secs;
        self
    }

    /// Validate the policy.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a zero attempt budget or inverted bounds.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DevloopError::invalid_config(
                "retry.max_attempts",
                "must be at least 1",
            ));
        }
        if self.min_wait_secs > self.max_wait_secs {
            return Err(DevloopError::invalid_config(
                "retry.min_wait_secs",
                format!(
                    "{} exceeds retry.max_wait_secs ({})",
                    self.min_wait_secs, self.max_wait_secs
                ),
            ));
        }
        Ok(())
    }

    /// Upper end of the random window after `attempt` failures (1-indexed).
    #[must_use]
    pub fn ceiling_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let exp = self
            .multiplier
            .saturating_mul(2u64.saturating_pow(exponent));
        Duration::from_secs(exp.clamp(self.min_wait_secs, self.max_wait_secs))
    }

    /// Randomized wait to apply after `attempt` failures (1-indexed).
    #[must_use]
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let low = self.min_wait_secs as f64;
        let high = self.ceiling_for(attempt).as_secs_f64();
        if high <= low {
            return Duration::from_secs_f64(low);
        }
        Duration::from_secs_f64(rng.gen_range(low..=high))
    }
}

/// Run `call` under `policy`, retrying retryable failures with backoff.
///
/// `operation` names the call in logs and in the exhaustion error.
///
/// # Errors
///
/// Returns the error unchanged when it is not retryable, or
/// `OracleExhausted` with the last error message once every attempt failed.
pub async fn retry_async<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match call().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Oracle call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                if attempt >= max_attempts {
                    warn!(operation, attempts = attempt, error = %err, "Retry budget exhausted");
                    return Err(DevloopError::OracleExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }

                let delay = policy.delay_for(attempt, &mut rand::thread_rng());
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    wait_secs = delay.as_secs_f64(),
                    error = %err,
                    "Oracle call failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
