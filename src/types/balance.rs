//! Customer balance record for the khata ledger engine
//!
//! This module defines the `CustomerBalance` record, the only shared mutable
//! state in the system. Every mutation of `outstanding_balance` or
//! `credit_limit` goes through a version-conditioned write that bumps
//! `version` by exactly 1; there is no other write path.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::transaction::{CustomerPhone, StoreId};

/// Persisted running-credit state for one (store, customer) pair
///
/// Created lazily on the first credit sale to an unknown customer and never
/// deleted afterwards, only zeroed. A positive `outstanding_balance` means
/// the customer owes the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerBalance {
    /// Store this balance belongs to
    pub store_id: StoreId,

    /// Customer this balance belongs to
    pub customer_phone: CustomerPhone,

    /// Display name captured when the record was created
    pub customer_name: String,

    /// Signed running balance; positive means the customer owes the store
    #[serde(with = "rust_decimal::serde::str")]
    pub outstanding_balance: Decimal,

    /// Maximum outstanding balance a credit sale may reach (inclusive)
    #[serde(with = "rust_decimal::serde::str")]
    pub credit_limit: Decimal,

    /// Monotonic write counter, starts at 1
    ///
    /// The committed version sequence linearizes all balance mutations for
    /// this (store, customer) pair.
    pub version: u64,

    /// Timestamp of the last committed write
    pub updated_at: DateTime<Utc>,
}

impl CustomerBalance {
    /// Create a fresh zero-balance record at version 1
    pub fn new(
        store_id: impl Into<StoreId>,
        customer_phone: impl Into<CustomerPhone>,
        customer_name: impl Into<String>,
        credit_limit: Decimal,
        created_at: DateTime<Utc>,
    ) -> Self {
        CustomerBalance {
            store_id: store_id.into(),
            customer_phone: customer_phone.into(),
            customer_name: customer_name.into(),
            outstanding_balance: Decimal::ZERO,
            credit_limit,
            version: 1,
            updated_at: created_at,
        }
    }

    /// Credit still available before the limit is hit
    ///
    /// Negative when the balance already exceeds the limit (possible after
    /// a limit decrease or a signed adjustment).
    pub fn available_credit(&self) -> Decimal {
        self.credit_limit - self.outstanding_balance
    }
}
