//! Storage traits the saga coordinator depends on
//!
//! These traits are the boundary toward whatever physical store a deployment
//! chooses. The coordinator only assumes single-item conditional writes: the
//! balance store must support a version-conditioned compare-and-swap, and the
//! ledger must be append-only. Nothing here implies cross-item transactions.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{CustomerBalance, OperationResult, StoreError, Transaction};

/// Outcome of a version-conditioned balance write
///
/// A version conflict is an expected, common outcome under concurrency, not
/// an error: the caller re-reads and retries from fresh state.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The write committed; carries the record as persisted (version bumped)
    Committed(CustomerBalance),

    /// Another writer committed first; the expected version is stale
    VersionConflict,
}

/// Persistence for one `CustomerBalance` record per (store, customer)
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Fetch the balance record, or None if the customer is unknown
    async fn get_balance(
        &self,
        store_id: &str,
        customer_phone: &str,
    ) -> Result<Option<CustomerBalance>, StoreError>;

    /// Create a balance record if absent
    ///
    /// Returns the record as persisted. If a racing creation already
    /// committed, the existing record is returned unchanged so the caller
    /// can proceed against real state.
    async fn create_balance(&self, initial: CustomerBalance) -> Result<CustomerBalance, StoreError>;

    /// Version-conditioned write of `outstanding_balance`
    ///
    /// Commits `new_balance` and bumps the version by exactly 1, but only if
    /// the persisted version still equals `expected_version`.
    async fn compare_and_swap_balance(
        &self,
        store_id: &str,
        customer_phone: &str,
        new_balance: Decimal,
        expected_version: u64,
    ) -> Result<CasOutcome, StoreError>;

    /// Version-conditioned write of `credit_limit`
    ///
    /// Same conditional-write discipline as the balance write; the
    /// outstanding balance is left untouched.
    async fn compare_and_swap_credit_limit(
        &self,
        store_id: &str,
        customer_phone: &str,
        new_limit: Decimal,
        expected_version: u64,
    ) -> Result<CasOutcome, StoreError>;
}

/// Append-only persistence for ledger transactions
#[async_trait]
pub trait TransactionLedger: Send + Sync {
    /// Append a transaction record
    async fn append_transaction(&self, transaction: Transaction) -> Result<(), StoreError>;

    /// Fetch a transaction by id, or None if unknown
    async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Transaction>, StoreError>;

    /// Flip `is_reversed` on a committed transaction
    async fn mark_transaction_reversed(&self, transaction_id: &str) -> Result<(), StoreError>;

    /// Range lookup of a customer's transactions, newest first
    ///
    /// `limit` bounds the result when given.
    async fn list_transactions(
        &self,
        store_id: &str,
        customer_phone: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Transaction>, StoreError>;
}

/// Cache of completed operation results keyed by idempotency key
///
/// Writes are best-effort: a failed put is logged and swallowed by the
/// coordinator, trading a small duplicate-key reuse risk for availability.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Fetch the cached result for a key, or None if absent or expired
    async fn get(&self, key: &str) -> Result<Option<OperationResult>, StoreError>;

    /// Cache a completed result under a key with the given TTL
    async fn put(
        &self,
        key: &str,
        result: &OperationResult,
        ttl: std::time::Duration,
    ) -> Result<(), StoreError>;
}

/// Shared balance store handle
pub type DynBalanceStore = std::sync::Arc<dyn BalanceStore>;
/// Shared ledger handle
pub type DynTransactionLedger = std::sync::Arc<dyn TransactionLedger>;
/// Shared idempotency store handle
pub type DynIdempotencyStore = std::sync::Arc<dyn IdempotencyStore>;
