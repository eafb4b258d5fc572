//! Storage adapter implementations
//!
//! The engine ships one adapter set: DashMap-backed in-memory stores used
//! as the reference implementation and test substrate. Deployment-specific
//! adapters (key-value, relational) live outside this crate and implement
//! the same traits from [`crate::core::traits`].

pub mod memory;

pub use memory::{
    IdempotencyRecord, InMemoryBalanceStore, InMemoryIdempotencyStore, InMemoryTransactionLedger,
};
