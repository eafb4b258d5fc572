//! Bounded retry with exponential backoff
//!
//! Two logically separate retry loops exist in the saga coordinator:
//! version-conflict retries on the balance compare-and-swap, and transient
//! infrastructure retries around individual storage calls. Both are driven
//! by a [`RetryPolicy`], but the budgets are configured independently and
//! never share attempt counts.

use std::future::Future;
use std::time::Duration;

use crate::types::StoreError;

/// Bounded attempt budget with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub base_delay: Duration,

    /// Upper bound the doubling backoff saturates at
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy with the given budget and backoff curve
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Backoff delay after the given failed attempt (1-based)
    ///
    /// Doubles per attempt and saturates at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }
}

/// Run a storage call, retrying transient faults within the policy budget
///
/// Permanent faults and exhausted budgets return the last error unchanged.
/// The closure is invoked once per attempt and must build a fresh future
/// each time.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, mut call: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < policy.max_attempts => {
                tracing::debug!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    %error,
                    "transient store fault, backing off"
                );
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
