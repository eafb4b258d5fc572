//! Operation requests and results for the saga coordinator
//!
//! Inbound operations are described by `OperationRequest` (credit sales,
//! payments, adjustments) and `ReversalRequest` (reversals). Successful
//! executions return an `OperationResult`, which is also the payload cached
//! by the idempotency store for duplicate submissions.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::transaction::{CustomerPhone, LineItem, StoreId, TransactionId};

/// Request metadata propagated into the audit trail
///
/// All fields are optional; the API layer fills in whatever it has.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Caller IP address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    /// Caller user agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Correlation id of the inbound request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Input for a credit sale, payment, or balance adjustment
#[derive(Debug, Clone)]
pub struct OperationRequest {
    /// Store scope of the operation
    pub store_id: StoreId,

    /// Customer scope of the operation
    pub customer_phone: CustomerPhone,

    /// Operation amount; sign conventions are per operation (see coordinator)
    pub amount: Decimal,

    /// Actor recording the operation
    pub created_by: String,

    /// Caller-supplied transaction id; generated when absent
    pub transaction_id: Option<TransactionId>,

    /// Caller-supplied idempotency key
    pub idempotency_key: Option<String>,

    /// Customer display name, used when the balance record is created lazily
    pub customer_name: Option<String>,

    /// Line-item snapshot (credit sales)
    pub items: Option<Vec<LineItem>>,

    /// Free-form note
    pub notes: Option<String>,

    /// Request metadata for the audit trail
    pub context: Option<RequestContext>,
}

impl OperationRequest {
    /// Build a request with the required fields; everything else defaults to None
    pub fn new(
        store_id: impl Into<StoreId>,
        customer_phone: impl Into<CustomerPhone>,
        amount: Decimal,
        created_by: impl Into<String>,
    ) -> Self {
        OperationRequest {
            store_id: store_id.into(),
            customer_phone: customer_phone.into(),
            amount,
            created_by: created_by.into(),
            transaction_id: None,
            idempotency_key: None,
            customer_name: None,
            items: None,
            notes: None,
            context: None,
        }
    }

    /// Attach an idempotency key
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Attach a caller-chosen transaction id
    pub fn with_transaction_id(mut self, id: impl Into<TransactionId>) -> Self {
        self.transaction_id = Some(id.into());
        self
    }

    /// Attach the customer display name for lazy record creation
    pub fn with_customer_name(mut self, name: impl Into<String>) -> Self {
        self.customer_name = Some(name.into());
        self
    }

    /// Attach a line-item snapshot
    pub fn with_items(mut self, items: Vec<LineItem>) -> Self {
        self.items = Some(items);
        self
    }

    /// Attach a free-form note
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Attach request metadata for the audit trail
    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// Input for reversing a previously committed transaction
#[derive(Debug, Clone)]
pub struct ReversalRequest {
    /// The transaction to reverse
    pub original_transaction_id: TransactionId,

    /// Actor recording the reversal
    pub created_by: String,

    /// Caller-supplied idempotency key
    pub idempotency_key: Option<String>,

    /// Free-form note
    pub notes: Option<String>,

    /// Request metadata for the audit trail
    pub context: Option<RequestContext>,
}

impl ReversalRequest {
    /// Build a reversal request for the given original transaction
    pub fn new(original_transaction_id: impl Into<TransactionId>, created_by: impl Into<String>) -> Self {
        ReversalRequest {
            original_transaction_id: original_transaction_id.into(),
            created_by: created_by.into(),
            idempotency_key: None,
            notes: None,
            context: None,
        }
    }

    /// Attach an idempotency key
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Attach a free-form note
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Attach request metadata for the audit trail
    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// Success payload of a saga operation
///
/// This is what duplicate submissions receive back from the idempotency
/// store, so it is serializable and carries everything the caller needs to
/// treat the replay as the original response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    /// Id of the committed ledger transaction
    pub transaction_id: TransactionId,

    /// Outstanding balance before the committed write
    #[serde(with = "rust_decimal::serde::str")]
    pub balance_before: Decimal,

    /// Outstanding balance after the committed write
    #[serde(with = "rust_decimal::serde::str")]
    pub balance_after: Decimal,
}
