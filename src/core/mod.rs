//! Business logic components
//!
//! - [`traits`] - Storage boundary the coordinator depends on
//! - [`coordinator`] - Saga orchestration, business rules, compensation
//! - [`retry`] - Bounded exponential backoff for the two retry loops
//! - [`clock`] - Injectable time source

pub mod clock;
pub mod coordinator;
pub mod retry;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::SagaCoordinator;
pub use retry::RetryPolicy;
pub use traits::{
    BalanceStore, CasOutcome, DynBalanceStore, DynIdempotencyStore, DynTransactionLedger,
    IdempotencyStore, TransactionLedger,
};
