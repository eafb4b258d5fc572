//! Engine configuration
//!
//! Retry budgets, backoff curves, timeouts, the idempotency TTL, and the
//! anomaly thresholds are deployment tunables, not constants. Defaults are
//! conservative and safe for a single-region deployment.

use std::time::Duration;

use rust_decimal::Decimal;

use crate::core::retry::RetryPolicy;

/// Tunable parameters for the saga coordinator and its collaborators
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Retry budget for balance compare-and-swap version conflicts
    ///
    /// Kept separate from `infra_retry`: a version conflict means another
    /// writer won, not that the store is unhealthy.
    pub cas_retry: RetryPolicy,

    /// Retry budget for transient infrastructure faults on storage calls
    pub infra_retry: RetryPolicy,

    /// Per-call timeout applied to every storage call
    pub storage_timeout: Duration,

    /// How long a cached idempotency result stays valid
    pub idempotency_ttl: Duration,

    /// Credit limit assigned when a balance record is created lazily
    pub default_credit_limit: Decimal,

    /// Anomaly-detection thresholds
    pub anomaly: AnomalyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            cas_retry: RetryPolicy::new(4, Duration::from_millis(10), Duration::from_millis(80)),
            infra_retry: RetryPolicy::new(3, Duration::from_millis(50), Duration::from_millis(400)),
            storage_timeout: Duration::from_secs(5),
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            default_credit_limit: Decimal::new(10_000, 0),
            anomaly: AnomalyConfig::default(),
        }
    }
}

/// Thresholds for the audit trail's anomaly heuristics
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyConfig {
    /// Relative balance swing that triggers the large-swing alert
    ///
    /// Evaluated as `|after - before| / before` and only when `before > 0`.
    pub swing_ratio: Decimal,

    /// Absolute amount above which a transaction is flagged high-value
    pub high_value_threshold: Decimal,

    /// Transactions per (store, customer) per clock hour before the
    /// high-frequency alert fires
    pub hourly_frequency_limit: u32,

    /// Factor over the old credit limit that flags a limit increase
    pub limit_increase_factor: Decimal,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        AnomalyConfig {
            swing_ratio: Decimal::new(5, 1),                  // 0.5
            high_value_threshold: Decimal::new(50_000, 0),
            hourly_frequency_limit: 100,
            limit_increase_factor: Decimal::new(2, 0),
        }
    }
}
