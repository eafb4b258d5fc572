//! Transaction-related types for the khata ledger engine
//!
//! This module defines the ledger transaction record, the operation kinds
//! the saga coordinator supports, and the line-item snapshot attached to
//! credit sales.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Store identifier
pub type StoreId = String;

/// Customer identifier within a store (normalized phone number)
pub type CustomerPhone = String;

/// Ledger transaction identifier
///
/// Caller-supplied or generated as a UUID v4 when the caller does not
/// provide one.
pub type TransactionId = String;

/// Operation kinds supported by the saga coordinator
///
/// Each variant is one balance-mutating logical operation. The signed
/// transaction amount encodes the direction: credit sales increase the
/// outstanding balance, payments decrease it, adjustments carry their own
/// sign, and reversals carry the inverse of the original amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Goods handed over on credit; increases the outstanding balance
    CreditSale,

    /// Customer pays down the khata; decreases the outstanding balance
    Payment,

    /// Manual correction or waiver applied with an explicit sign
    Adjustment,

    /// Inverse of a previously committed transaction
    Reversal,
}

impl TransactionType {
    /// Stable lowercase label used in audit payloads and log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::CreditSale => "credit_sale",
            TransactionType::Payment => "payment",
            TransactionType::Adjustment => "adjustment",
            TransactionType::Reversal => "reversal",
        }
    }
}

/// One line of the item snapshot attached to a credit sale
///
/// The snapshot is denormalized on purpose: the ledger record must stay
/// meaningful even if the inventory item is later renamed or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    /// Item name as sold
    pub name: String,

    /// Quantity sold
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,

    /// Unit price at the time of sale
    #[serde(with = "rust_decimal::serde::str")]
    pub unit_price: Decimal,
}

/// An immutable ledger record of one committed saga execution
///
/// Created exactly once, after the balance write for the same saga attempt
/// has committed. The only field that may ever change is `is_reversed`,
/// which transitions false to true at most once.
///
/// Invariant: `balance_after - balance_before == amount`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction identifier
    pub transaction_id: TransactionId,

    /// The operation kind that produced this record
    pub transaction_type: TransactionType,

    /// Signed balance delta; positive increases the outstanding balance
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,

    /// Outstanding balance observed before the committed balance write
    #[serde(with = "rust_decimal::serde::str")]
    pub balance_before: Decimal,

    /// Outstanding balance after the committed balance write
    #[serde(with = "rust_decimal::serde::str")]
    pub balance_after: Decimal,

    /// Store this transaction belongs to
    pub store_id: StoreId,

    /// Customer this transaction belongs to
    pub customer_phone: CustomerPhone,

    /// Actor id of whoever recorded the operation
    pub created_by: String,

    /// Idempotency key supplied by the caller, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// Whether a reversal transaction referencing this record has committed
    pub is_reversed: bool,

    /// Back-reference to the reversed transaction (reversals only)
    ///
    /// Lookup-only; the referenced record is never owned or embedded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reversal_of: Option<TransactionId>,

    /// Line-item snapshot (credit sales only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<LineItem>>,

    /// Free-form note attached by the caller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Generate a fresh transaction id
    pub fn generate_id() -> TransactionId {
        Uuid::new_v4().to_string()
    }
}
