//! Tamper-evident audit entries
//!
//! Every audit record carries a SHA-256 checksum over the canonical JSON
//! encoding of all its other fields. Canonical means key-sorted with
//! decimals rendered as exact strings, so re-serializing identical field
//! values always reproduces the identical checksum and any field change
//! changes it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{CustomerPhone, StoreId, TransactionId};

/// Failures while building or emitting audit entries
///
/// These never propagate into the saga outcome; the trail logs them at
/// warning level and moves on.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The canonical payload could not be serialized
    #[error("audit payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The sink rejected or failed to persist the entry
    #[error("audit sink rejected entry: {message}")]
    Sink {
        /// Description of the sink failure
        message: String,
    },
}

impl AuditError {
    /// Create a Sink error
    pub fn sink(message: impl Into<String>) -> Self {
        AuditError::Sink {
            message: message.into(),
        }
    }
}

/// Audited event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A saga operation committed a ledger transaction
    TransactionRecorded,

    /// A balance was read on behalf of a caller
    BalanceQueried,

    /// A customer's credit limit was changed
    CreditLimitChanged,

    /// A payment reminder was dispatched by the notification collaborator
    ReminderSent,

    /// A saga operation definitively failed
    OperationFailed,
}

/// Who performed the audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A human caller (store owner or staff)
    User,

    /// The engine itself or another automated collaborator
    System,
}

/// One immutable audit record
///
/// Entries are never updated or deleted by this engine; retention and
/// archival belong to the observability sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique entry id
    pub audit_id: String,

    /// When the audited action happened
    pub timestamp: DateTime<Utc>,

    /// What happened
    pub action: AuditAction,

    /// Who did it
    pub actor_id: String,

    /// What kind of actor
    pub actor_type: ActorType,

    /// Store scope
    pub store_id: StoreId,

    /// Customer scope
    pub customer_phone: CustomerPhone,

    /// Ledger transaction involved, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,

    /// Signed operation amount, rendered as an exact decimal string
    #[serde(
        with = "rust_decimal::serde::str_option",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub amount: Option<Decimal>,

    /// Balance before the operation
    #[serde(
        with = "rust_decimal::serde::str_option",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub balance_before: Option<Decimal>,

    /// Balance after the operation
    #[serde(
        with = "rust_decimal::serde::str_option",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub balance_after: Option<Decimal>,

    /// Caller IP address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    /// Caller user agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Correlation id of the inbound request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Kind-specific detail (failure reason, reminder channel, limit change)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// SHA-256 over the canonical encoding of every other field, hex encoded
    pub checksum: String,
}

impl AuditEntry {
    /// Start an entry with the scope fields; optional fields default to None
    ///
    /// The checksum is empty until [`AuditEntry::seal`] is called.
    pub fn new(
        action: AuditAction,
        actor_id: impl Into<String>,
        actor_type: ActorType,
        store_id: impl Into<StoreId>,
        customer_phone: impl Into<CustomerPhone>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        AuditEntry {
            audit_id: Uuid::new_v4().to_string(),
            timestamp,
            action,
            actor_id: actor_id.into(),
            actor_type,
            store_id: store_id.into(),
            customer_phone: customer_phone.into(),
            transaction_id: None,
            amount: None,
            balance_before: None,
            balance_after: None,
            ip_address: None,
            user_agent: None,
            request_id: None,
            detail: None,
            checksum: String::new(),
        }
    }

    /// Canonical key-sorted JSON of all fields except `checksum`
    pub fn canonical_payload(&self) -> Result<String, AuditError> {
        let mut value = serde_json::to_value(self)?;
        if let Some(object) = value.as_object_mut() {
            object.remove("checksum");
        }
        // serde_json maps are key-sorted, so Value::to_string is canonical.
        Ok(value.to_string())
    }

    /// Compute the checksum of the current field values
    pub fn compute_checksum(&self) -> Result<String, AuditError> {
        let payload = self.canonical_payload()?;
        let digest = Sha256::digest(payload.as_bytes());
        Ok(hex::encode(digest))
    }

    /// Fill in the checksum and return the sealed entry
    pub fn seal(mut self) -> Result<Self, AuditError> {
        self.checksum = self.compute_checksum()?;
        Ok(self)
    }

    /// Whether the stored checksum matches the current field values
    pub fn verify_checksum(&self) -> Result<bool, AuditError> {
        Ok(self.compute_checksum()? == self.checksum)
    }
}
