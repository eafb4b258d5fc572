//! Anomaly heuristics over audited transactions
//!
//! The detector is a constructed dependency of the audit trail, holding its
//! own per-customer hourly counters and an injected clock. The counters are
//! process-local best-effort state: they reset on restart and are not
//! shared across replicas.

use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;

use crate::config::AnomalyConfig;
use crate::core::clock::{Clock, SystemClock};
use crate::types::{CustomerPhone, StoreId};

/// A triggered anomaly rule
///
/// Rules are evaluated independently; one transaction can trigger several.
#[derive(Debug, Clone, PartialEq)]
pub enum Anomaly {
    /// The balance moved by more than the configured ratio in one write
    LargeBalanceSwing {
        /// Observed `|after - before| / before`
        ratio: Decimal,
    },

    /// The transaction amount exceeds the high-value threshold
    HighValueTransaction {
        /// Absolute transaction amount
        amount: Decimal,
    },

    /// Too many transactions for one customer within the current clock hour
    HighFrequency {
        /// Transactions seen this hour, including the current one
        count: u32,
    },

    /// A credit limit was raised past the configured factor of its old value
    LargeLimitIncrease {
        /// Limit before the change
        old_limit: Decimal,
        /// Limit after the change
        new_limit: Decimal,
    },
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Anomaly::LargeBalanceSwing { ratio } => {
                write!(f, "large balance swing (ratio {ratio})")
            }
            Anomaly::HighValueTransaction { amount } => {
                write!(f, "high-value transaction ({amount})")
            }
            Anomaly::HighFrequency { count } => {
                write!(f, "high transaction frequency ({count} this hour)")
            }
            Anomaly::LargeLimitIncrease {
                old_limit,
                new_limit,
            } => {
                write!(f, "large credit limit increase ({old_limit} -> {new_limit})")
            }
        }
    }
}

struct HourlyCounter {
    /// Hours since the epoch the counter belongs to
    hour: i64,
    count: u32,
}

/// Evaluates the anomaly rules for audited events
pub struct AnomalyDetector {
    config: AnomalyConfig,
    clock: Arc<dyn Clock>,
    counters: DashMap<(StoreId, CustomerPhone), HourlyCounter>,
}

impl AnomalyDetector {
    /// Create a detector on the system clock
    pub fn new(config: AnomalyConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a detector on an injected clock
    pub fn with_clock(config: AnomalyConfig, clock: Arc<dyn Clock>) -> Self {
        AnomalyDetector {
            config,
            clock,
            counters: DashMap::new(),
        }
    }

    /// Evaluate the transaction rules
    ///
    /// Bumps the hourly frequency counter as a side effect, so call this
    /// exactly once per committed transaction.
    pub fn check_transaction(
        &self,
        store_id: &str,
        customer_phone: &str,
        amount: Decimal,
        balance_before: Decimal,
        balance_after: Decimal,
    ) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();

        if balance_before > Decimal::ZERO {
            let ratio = (balance_after - balance_before).abs() / balance_before;
            if ratio > self.config.swing_ratio {
                anomalies.push(Anomaly::LargeBalanceSwing { ratio });
            }
        }

        if amount.abs() > self.config.high_value_threshold {
            anomalies.push(Anomaly::HighValueTransaction {
                amount: amount.abs(),
            });
        }

        let count = self.bump_hourly_count(store_id, customer_phone);
        if count > self.config.hourly_frequency_limit {
            anomalies.push(Anomaly::HighFrequency { count });
        }

        anomalies
    }

    /// Evaluate the credit-limit rule
    ///
    /// No alert when the old limit was zero: the first real limit on a
    /// lazily created record is not an increase.
    pub fn check_limit_change(&self, old_limit: Decimal, new_limit: Decimal) -> Option<Anomaly> {
        if old_limit > Decimal::ZERO && new_limit > old_limit * self.config.limit_increase_factor {
            Some(Anomaly::LargeLimitIncrease {
                old_limit,
                new_limit,
            })
        } else {
            None
        }
    }

    fn bump_hourly_count(&self, store_id: &str, customer_phone: &str) -> u32 {
        let hour = self.clock.now().timestamp().div_euclid(3600);
        let key = (store_id.to_string(), customer_phone.to_string());

        let mut entry = self
            .counters
            .entry(key)
            .or_insert(HourlyCounter { hour, count: 0 });
        let counter = entry.value_mut();
        if counter.hour != hour {
            counter.hour = hour;
            counter.count = 0;
        }
        counter.count += 1;
        counter.count
    }
}
