//! Khata Credit-Ledger Saga Engine
//! # Overview
//!
//! This library records credit sales, payments, balance adjustments, and
//! reversals for a store's running customer-credit book ("khata") against
//! backing stores that only offer single-item conditional writes. ACID-like
//! behavior — atomic balance+ledger updates, exactly-once processing under
//! retries, and a tamper-evident audit trail — is provided entirely through
//! application-level orchestration (the saga pattern), not database
//! transactions.
//!
//! # Architecture
//!
//! The system is organized into several key components:
//!
//! - [`types`] - Core data types (CustomerBalance, Transaction, errors)
//! - [`core`] - Business logic components:
//!   - [`core::coordinator`] - Saga orchestration and business rules
//!   - [`core::traits`] - The storage boundary (balance store, ledger,
//!     idempotency store)
//!   - [`core::retry`] - Version-conflict and transient-fault retry loops
//! - [`store`] - In-memory reference adapters for the storage traits
//! - [`audit`] - Checksummed audit trail and anomaly detection
//! - [`config`] - Tunable retry budgets, timeouts, TTLs, and thresholds
//!
//! # Operations
//!
//! The coordinator supports four balance-mutating operations:
//!
//! - **Credit sale**: increases the outstanding balance, bounded by the
//!   customer's credit limit. Creates the balance record lazily.
//! - **Payment**: decreases the outstanding balance; overdrafts rejected.
//! - **Adjustment**: applies a signed correction with no limit check.
//! - **Reversal**: applies the inverse of a committed transaction and flags
//!   the original, exactly once.
//!
//! # Concurrency
//!
//! Balance mutations for one (store, customer) pair are linearized by an
//! optimistic version field rather than locks: each saga performs a
//! version-conditioned compare-and-swap and retries from a fresh read when
//! another writer wins. Audit emission is dispatched fire-and-forget and
//! never gates an operation's outcome.

// Module declarations
pub mod audit;
pub mod config;
pub mod core;
pub mod store;
pub mod types;

pub use crate::audit::{AuditEntry, AuditSink, AuditTrail, TracingSink};
pub use crate::config::{AnomalyConfig, EngineConfig};
pub use crate::core::{
    BalanceStore, CasOutcome, IdempotencyStore, RetryPolicy, SagaCoordinator, TransactionLedger,
};
pub use crate::store::{InMemoryBalanceStore, InMemoryIdempotencyStore, InMemoryTransactionLedger};
pub use crate::types::{
    CustomerBalance, KhataError, OperationRequest, OperationResult, RequestContext,
    ReversalRequest, StoreError, Transaction, TransactionId, TransactionType,
};
