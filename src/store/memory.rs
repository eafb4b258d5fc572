//! In-memory storage adapters
//!
//! DashMap-backed implementations of the three storage traits. These serve
//! as the reference adapter and the substrate for integration tests; a real
//! deployment swaps in adapters for its key-value or relational store.
//!
//! # Concurrency
//!
//! The balance store holds the DashMap entry guard for the whole
//! compare-and-bump, so each compare-and-swap is linearizable per
//! (store, customer) key. Different keys never contend beyond DashMap's
//! internal sharding.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core::clock::{Clock, SystemClock};
use crate::core::traits::{BalanceStore, CasOutcome, IdempotencyStore, TransactionLedger};
use crate::types::{
    CustomerBalance, CustomerPhone, OperationResult, StoreError, StoreId, Transaction,
    TransactionId,
};

type BalanceKey = (StoreId, CustomerPhone);

/// In-memory `BalanceStore` backed by a concurrent map
pub struct InMemoryBalanceStore {
    balances: DashMap<BalanceKey, CustomerBalance>,
    clock: Arc<dyn Clock>,
}

impl InMemoryBalanceStore {
    /// Create an empty store on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store on an injected clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        InMemoryBalanceStore {
            balances: DashMap::new(),
            clock,
        }
    }

    fn key(store_id: &str, customer_phone: &str) -> BalanceKey {
        (store_id.to_string(), customer_phone.to_string())
    }
}

impl Default for InMemoryBalanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BalanceStore for InMemoryBalanceStore {
    async fn get_balance(
        &self,
        store_id: &str,
        customer_phone: &str,
    ) -> Result<Option<CustomerBalance>, StoreError> {
        Ok(self
            .balances
            .get(&Self::key(store_id, customer_phone))
            .map(|entry| entry.value().clone()))
    }

    async fn create_balance(&self, initial: CustomerBalance) -> Result<CustomerBalance, StoreError> {
        let key = (initial.store_id.clone(), initial.customer_phone.clone());
        let entry = self.balances.entry(key).or_insert(initial);
        Ok(entry.value().clone())
    }

    async fn compare_and_swap_balance(
        &self,
        store_id: &str,
        customer_phone: &str,
        new_balance: Decimal,
        expected_version: u64,
    ) -> Result<CasOutcome, StoreError> {
        let key = Self::key(store_id, customer_phone);
        let Some(mut entry) = self.balances.get_mut(&key) else {
            // Records are never deleted; a missing record means the caller
            // read a world that no longer matches. Treat as a stale view.
            return Ok(CasOutcome::VersionConflict);
        };

        let record = entry.value_mut();
        if record.version != expected_version {
            return Ok(CasOutcome::VersionConflict);
        }

        record.outstanding_balance = new_balance;
        record.version += 1;
        record.updated_at = self.clock.now();
        Ok(CasOutcome::Committed(record.clone()))
    }

    async fn compare_and_swap_credit_limit(
        &self,
        store_id: &str,
        customer_phone: &str,
        new_limit: Decimal,
        expected_version: u64,
    ) -> Result<CasOutcome, StoreError> {
        let key = Self::key(store_id, customer_phone);
        let Some(mut entry) = self.balances.get_mut(&key) else {
            return Ok(CasOutcome::VersionConflict);
        };

        let record = entry.value_mut();
        if record.version != expected_version {
            return Ok(CasOutcome::VersionConflict);
        }

        record.credit_limit = new_limit;
        record.version += 1;
        record.updated_at = self.clock.now();
        Ok(CasOutcome::Committed(record.clone()))
    }
}

/// In-memory append-only `TransactionLedger`
#[derive(Debug, Default)]
pub struct InMemoryTransactionLedger {
    transactions: DashMap<TransactionId, Transaction>,
}

impl InMemoryTransactionLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions held (test inspection)
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Whether the ledger is empty (test inspection)
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

#[async_trait]
impl TransactionLedger for InMemoryTransactionLedger {
    async fn append_transaction(&self, transaction: Transaction) -> Result<(), StoreError> {
        let id = transaction.transaction_id.clone();
        let mut inserted = false;
        self.transactions.entry(id.clone()).or_insert_with(|| {
            inserted = true;
            transaction
        });
        if inserted {
            Ok(())
        } else {
            Err(StoreError::corrupt(format!("duplicate transaction id {id}")))
        }
    }

    async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        Ok(self
            .transactions
            .get(transaction_id)
            .map(|entry| entry.value().clone()))
    }

    async fn mark_transaction_reversed(&self, transaction_id: &str) -> Result<(), StoreError> {
        let Some(mut entry) = self.transactions.get_mut(transaction_id) else {
            return Err(StoreError::corrupt(format!(
                "unknown transaction id {transaction_id}"
            )));
        };
        entry.value_mut().is_reversed = true;
        Ok(())
    }

    async fn list_transactions(
        &self,
        store_id: &str,
        customer_phone: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let mut matching: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|entry| {
                let txn = entry.value();
                txn.store_id == store_id && txn.customer_phone == customer_phone
            })
            .map(|entry| entry.value().clone())
            .collect();

        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}

/// Cached result plus its expiry instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// The completed operation result returned on duplicate submission
    pub cached_result: OperationResult,

    /// Instant after which the record is eligible for garbage collection
    pub expires_at: DateTime<Utc>,
}

/// In-memory `IdempotencyStore` with lazy TTL expiry
///
/// Expired records are dropped on the read path rather than by a sweeper;
/// the map stays small because keys are only written for completed
/// operations.
pub struct InMemoryIdempotencyStore {
    records: DashMap<String, IdempotencyRecord>,
    clock: Arc<dyn Clock>,
}

impl InMemoryIdempotencyStore {
    /// Create an empty store on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store on an injected clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        InMemoryIdempotencyStore {
            records: DashMap::new(),
            clock,
        }
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<OperationResult>, StoreError> {
        let now = self.clock.now();

        if let Some(entry) = self.records.get(key) {
            if entry.value().expires_at > now {
                return Ok(Some(entry.value().cached_result.clone()));
            }
        } else {
            return Ok(None);
        }

        // Expired: drop lazily and report a miss.
        self.records.remove(key);
        Ok(None)
    }

    async fn put(
        &self,
        key: &str,
        result: &OperationResult,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| StoreError::corrupt("idempotency ttl out of range"))?;
        let record = IdempotencyRecord {
            cached_result: result.clone(),
            expires_at: self.clock.now() + ttl,
        };
        self.records.insert(key.to_string(), record);
        Ok(())
    }
}
