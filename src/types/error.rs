//! Error types for the khata ledger engine
//!
//! Two layers of errors exist:
//!
//! - [`StoreError`] covers the storage boundary (balance store, ledger,
//!   idempotency store). Transient faults are marked so the coordinator's
//!   infrastructure retry loop can tell them apart from permanent ones.
//! - [`KhataError`] is what callers of the saga coordinator receive.
//!   Business-rule violations are expected, common outcomes returned as
//!   values; only [`KhataError::RollbackFailed`] represents a state that
//!   needs out-of-band operator intervention.

use rust_decimal::Decimal;
use thiserror::Error;

use super::transaction::TransactionId;

/// Errors surfaced by storage adapters
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backing store rejected or failed the call and a retry may succeed
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Description of the fault
        message: String,
    },

    /// The storage call did not complete within the configured timeout
    #[error("store call timed out after {millis}ms")]
    Timeout {
        /// Timeout that elapsed
        millis: u64,
    },

    /// The store returned data the engine cannot interpret
    ///
    /// Not retried; this indicates corruption or a schema mismatch.
    #[error("store returned corrupt data: {message}")]
    Corrupt {
        /// Description of the problem
        message: String,
    },
}

impl StoreError {
    /// Create an Unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        StoreError::Unavailable {
            message: message.into(),
        }
    }

    /// Create a Timeout error
    pub fn timeout(millis: u64) -> Self {
        StoreError::Timeout { millis }
    }

    /// Create a Corrupt error
    pub fn corrupt(message: impl Into<String>) -> Self {
        StoreError::Corrupt {
            message: message.into(),
        }
    }

    /// Whether the infrastructure retry loop should retry this fault
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. } | StoreError::Timeout { .. })
    }
}

/// Errors returned by the saga coordinator
///
/// Business-rule variants are terminal for the request and safe to report
/// to the caller as-is. `OptimisticLockExhausted` and `Store` are transient
/// from the caller's point of view and may be retried later with the same
/// idempotency key. `RollbackFailed` is fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KhataError {
    /// A non-positive amount was supplied where a positive one is required
    #[error("invalid amount {amount}: must be positive")]
    InvalidAmount {
        /// The rejected amount
        amount: Decimal,
    },

    /// The credit sale would push the balance past the credit limit
    #[error("credit limit exceeded for {customer_phone}: outstanding {outstanding} + {amount} > limit {credit_limit}")]
    CreditLimitExceeded {
        /// Customer whose limit would be exceeded
        customer_phone: String,
        /// Outstanding balance at validation time
        outstanding: Decimal,
        /// Requested sale amount
        amount: Decimal,
        /// Configured credit limit
        credit_limit: Decimal,
    },

    /// The payment is non-positive or exceeds the outstanding balance
    #[error("invalid payment amount {amount} for {customer_phone}: outstanding balance is {outstanding}")]
    InvalidPaymentAmount {
        /// Customer being paid down
        customer_phone: String,
        /// Requested payment amount
        amount: Decimal,
        /// Outstanding balance at validation time
        outstanding: Decimal,
    },

    /// No balance record exists for the (store, customer) pair
    #[error("customer {customer_phone} not found in store {store_id}")]
    CustomerNotFound {
        /// Store scope
        store_id: String,
        /// Customer scope
        customer_phone: String,
    },

    /// The referenced transaction does not exist in the ledger
    #[error("transaction {transaction_id} not found")]
    TransactionNotFound {
        /// The missing transaction id
        transaction_id: TransactionId,
    },

    /// The referenced transaction was already reversed
    #[error("transaction {transaction_id} is already reversed")]
    AlreadyReversed {
        /// The transaction that was reversed before
        transaction_id: TransactionId,
    },

    /// Version conflicts persisted past the retry budget
    ///
    /// Transient; the caller may retry later with the same idempotency key.
    #[error("optimistic lock exhausted after {attempts} attempts for {customer_phone}")]
    OptimisticLockExhausted {
        /// Customer whose balance kept moving
        customer_phone: String,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// A mid-saga failure could not be compensated
    ///
    /// The balance and the ledger may now disagree; this requires
    /// out-of-band reconciliation and must never be silently retried.
    #[error("rollback failed for transaction {transaction_id}: {message}")]
    RollbackFailed {
        /// Transaction id of the failed saga attempt
        transaction_id: TransactionId,
        /// What went wrong, including the original fault
        message: String,
    },

    /// An infrastructure failure survived the retry budget
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl KhataError {
    /// Create an InvalidAmount error
    pub fn invalid_amount(amount: Decimal) -> Self {
        KhataError::InvalidAmount { amount }
    }

    /// Create a CreditLimitExceeded error
    pub fn credit_limit_exceeded(
        customer_phone: impl Into<String>,
        outstanding: Decimal,
        amount: Decimal,
        credit_limit: Decimal,
    ) -> Self {
        KhataError::CreditLimitExceeded {
            customer_phone: customer_phone.into(),
            outstanding,
            amount,
            credit_limit,
        }
    }

    /// Create an InvalidPaymentAmount error
    pub fn invalid_payment(
        customer_phone: impl Into<String>,
        amount: Decimal,
        outstanding: Decimal,
    ) -> Self {
        KhataError::InvalidPaymentAmount {
            customer_phone: customer_phone.into(),
            amount,
            outstanding,
        }
    }

    /// Create a CustomerNotFound error
    pub fn customer_not_found(store_id: impl Into<String>, customer_phone: impl Into<String>) -> Self {
        KhataError::CustomerNotFound {
            store_id: store_id.into(),
            customer_phone: customer_phone.into(),
        }
    }

    /// Create a TransactionNotFound error
    pub fn transaction_not_found(transaction_id: impl Into<TransactionId>) -> Self {
        KhataError::TransactionNotFound {
            transaction_id: transaction_id.into(),
        }
    }

    /// Create an AlreadyReversed error
    pub fn already_reversed(transaction_id: impl Into<TransactionId>) -> Self {
        KhataError::AlreadyReversed {
            transaction_id: transaction_id.into(),
        }
    }

    /// Create an OptimisticLockExhausted error
    pub fn lock_exhausted(customer_phone: impl Into<String>, attempts: u32) -> Self {
        KhataError::OptimisticLockExhausted {
            customer_phone: customer_phone.into(),
            attempts,
        }
    }

    /// Create a RollbackFailed error
    pub fn rollback_failed(transaction_id: impl Into<TransactionId>, message: impl Into<String>) -> Self {
        KhataError::RollbackFailed {
            transaction_id: transaction_id.into(),
            message: message.into(),
        }
    }

    /// Whether this failure left the system needing operator reconciliation
    pub fn is_fatal(&self) -> bool {
        matches!(self, KhataError::RollbackFailed { .. })
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KhataError::OptimisticLockExhausted { .. } | KhataError::Store(_)
        )
    }
}
