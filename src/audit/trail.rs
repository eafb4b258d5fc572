//! Audit trail emission
//!
//! `AuditTrail` builds sealed [`AuditEntry`] records, hands them to a
//! pluggable [`AuditSink`], and runs the anomaly heuristics afterwards.
//! Emission is strictly best-effort: every failure on this path is logged
//! at warning level and swallowed, because an audit outage must never fail
//! an otherwise-successful financial operation.
//!
//! The saga coordinator uses the `*_detached` variants, which dispatch the
//! work on a separate task so the caller never waits on the sink.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::config::AnomalyConfig;
use crate::core::clock::{Clock, SystemClock};
use crate::types::{RequestContext, Transaction};

use super::anomaly::AnomalyDetector;
use super::entry::{ActorType, AuditAction, AuditEntry, AuditError};

/// Destination for sealed audit entries
///
/// The engine only defines the shape and checksum of what it emits;
/// retention, querying, and compliance policy belong to the sink.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist or forward one sealed entry
    async fn emit(&self, entry: &AuditEntry) -> Result<(), AuditError>;
}

/// Default sink that emits entries as structured `tracing` events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl AuditSink for TracingSink {
    async fn emit(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        tracing::info!(
            target: "khata_engine::audit",
            audit_id = %entry.audit_id,
            action = ?entry.action,
            actor_id = %entry.actor_id,
            store_id = %entry.store_id,
            customer_phone = %entry.customer_phone,
            transaction_id = entry.transaction_id.as_deref().unwrap_or(""),
            checksum = %entry.checksum,
            "audit entry"
        );
        Ok(())
    }
}

struct TrailInner {
    sink: Arc<dyn AuditSink>,
    detector: AnomalyDetector,
    clock: Arc<dyn Clock>,
}

/// Builds, seals, and emits audit entries
///
/// Cheap to clone; clones share the sink and the anomaly detector so the
/// hourly frequency counters see every transaction in the process.
#[derive(Clone)]
pub struct AuditTrail {
    inner: Arc<TrailInner>,
}

impl AuditTrail {
    /// Create a trail over the given sink with default thresholds
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self::with_config(sink, AnomalyConfig::default())
    }

    /// Create a trail with explicit anomaly thresholds
    pub fn with_config(sink: Arc<dyn AuditSink>, config: AnomalyConfig) -> Self {
        Self::with_clock(sink, config, Arc::new(SystemClock))
    }

    /// Create a trail with an injected clock (tests)
    pub fn with_clock(
        sink: Arc<dyn AuditSink>,
        config: AnomalyConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        AuditTrail {
            inner: Arc::new(TrailInner {
                sink,
                detector: AnomalyDetector::with_clock(config, Arc::clone(&clock)),
                clock,
            }),
        }
    }

    /// Audit a committed ledger transaction and run the anomaly rules
    pub async fn log_transaction(&self, transaction: &Transaction, context: Option<&RequestContext>) {
        let mut entry = AuditEntry::new(
            AuditAction::TransactionRecorded,
            transaction.created_by.clone(),
            ActorType::User,
            transaction.store_id.clone(),
            transaction.customer_phone.clone(),
            self.inner.clock.now(),
        );
        entry.transaction_id = Some(transaction.transaction_id.clone());
        entry.amount = Some(transaction.amount);
        entry.balance_before = Some(transaction.balance_before);
        entry.balance_after = Some(transaction.balance_after);
        entry.detail = Some(transaction.transaction_type.as_str().to_string());
        Self::apply_context(&mut entry, context);

        self.emit(entry).await;

        let anomalies = self.inner.detector.check_transaction(
            &transaction.store_id,
            &transaction.customer_phone,
            transaction.amount,
            transaction.balance_before,
            transaction.balance_after,
        );
        for anomaly in anomalies {
            tracing::warn!(
                target: "khata_engine::audit",
                store_id = %transaction.store_id,
                customer_phone = %transaction.customer_phone,
                transaction_id = %transaction.transaction_id,
                %anomaly,
                "transaction anomaly detected"
            );
        }
    }

    /// Spawn `log_transaction` on a detached task
    pub fn log_transaction_detached(&self, transaction: Transaction, context: Option<RequestContext>) {
        let trail = self.clone();
        tokio::spawn(async move {
            trail.log_transaction(&transaction, context.as_ref()).await;
        });
    }

    /// Audit a balance read
    pub async fn log_balance_query(
        &self,
        store_id: &str,
        customer_phone: &str,
        actor_id: &str,
        outstanding_balance: Decimal,
        context: Option<&RequestContext>,
    ) {
        let mut entry = AuditEntry::new(
            AuditAction::BalanceQueried,
            actor_id,
            ActorType::User,
            store_id,
            customer_phone,
            self.inner.clock.now(),
        );
        entry.balance_after = Some(outstanding_balance);
        Self::apply_context(&mut entry, context);

        self.emit(entry).await;
    }

    /// Spawn `log_balance_query` on a detached task
    pub fn log_balance_query_detached(
        &self,
        store_id: String,
        customer_phone: String,
        actor_id: String,
        outstanding_balance: Decimal,
        context: Option<RequestContext>,
    ) {
        let trail = self.clone();
        tokio::spawn(async move {
            trail
                .log_balance_query(
                    &store_id,
                    &customer_phone,
                    &actor_id,
                    outstanding_balance,
                    context.as_ref(),
                )
                .await;
        });
    }

    /// Audit a credit-limit change and run the limit-increase rule
    pub async fn log_credit_limit_change(
        &self,
        store_id: &str,
        customer_phone: &str,
        actor_id: &str,
        old_limit: Decimal,
        new_limit: Decimal,
        context: Option<&RequestContext>,
    ) {
        let mut entry = AuditEntry::new(
            AuditAction::CreditLimitChanged,
            actor_id,
            ActorType::User,
            store_id,
            customer_phone,
            self.inner.clock.now(),
        );
        entry.detail = Some(format!("credit limit {old_limit} -> {new_limit}"));
        Self::apply_context(&mut entry, context);

        self.emit(entry).await;

        if let Some(anomaly) = self.inner.detector.check_limit_change(old_limit, new_limit) {
            tracing::warn!(
                target: "khata_engine::audit",
                store_id = %store_id,
                customer_phone = %customer_phone,
                %anomaly,
                "credit limit anomaly detected"
            );
        }
    }

    /// Spawn `log_credit_limit_change` on a detached task
    pub fn log_credit_limit_change_detached(
        &self,
        store_id: String,
        customer_phone: String,
        actor_id: String,
        old_limit: Decimal,
        new_limit: Decimal,
        context: Option<RequestContext>,
    ) {
        let trail = self.clone();
        tokio::spawn(async move {
            trail
                .log_credit_limit_change(
                    &store_id,
                    &customer_phone,
                    &actor_id,
                    old_limit,
                    new_limit,
                    context.as_ref(),
                )
                .await;
        });
    }

    /// Audit a payment reminder dispatched by the notification collaborator
    pub async fn log_reminder_event(
        &self,
        store_id: &str,
        customer_phone: &str,
        actor_id: &str,
        channel: &str,
        context: Option<&RequestContext>,
    ) {
        let mut entry = AuditEntry::new(
            AuditAction::ReminderSent,
            actor_id,
            ActorType::System,
            store_id,
            customer_phone,
            self.inner.clock.now(),
        );
        entry.detail = Some(format!("reminder via {channel}"));
        Self::apply_context(&mut entry, context);

        self.emit(entry).await;
    }

    /// Audit a saga operation that definitively failed
    pub async fn log_failed_operation(
        &self,
        store_id: &str,
        customer_phone: &str,
        actor_id: &str,
        operation: &str,
        reason: &str,
        context: Option<&RequestContext>,
    ) {
        let mut entry = AuditEntry::new(
            AuditAction::OperationFailed,
            actor_id,
            ActorType::User,
            store_id,
            customer_phone,
            self.inner.clock.now(),
        );
        entry.detail = Some(format!("{operation}: {reason}"));
        Self::apply_context(&mut entry, context);

        self.emit(entry).await;
    }

    /// Spawn `log_failed_operation` on a detached task
    pub fn log_failed_operation_detached(
        &self,
        store_id: String,
        customer_phone: String,
        actor_id: String,
        operation: String,
        reason: String,
        context: Option<RequestContext>,
    ) {
        let trail = self.clone();
        tokio::spawn(async move {
            trail
                .log_failed_operation(
                    &store_id,
                    &customer_phone,
                    &actor_id,
                    &operation,
                    &reason,
                    context.as_ref(),
                )
                .await;
        });
    }

    fn apply_context(entry: &mut AuditEntry, context: Option<&RequestContext>) {
        if let Some(context) = context {
            entry.ip_address = context.ip_address.clone();
            entry.user_agent = context.user_agent.clone();
            entry.request_id = context.request_id.clone();
        }
    }

    /// Seal and emit; failures are logged at warning level and swallowed
    async fn emit(&self, entry: AuditEntry) {
        let sealed = match entry.seal() {
            Ok(sealed) => sealed,
            Err(error) => {
                tracing::warn!(%error, "failed to seal audit entry, dropping");
                return;
            }
        };

        if let Err(error) = self.inner.sink.emit(&sealed).await {
            tracing::warn!(
                audit_id = %sealed.audit_id,
                %error,
                "audit sink failed, entry dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    /// Sink that records every emitted entry
    #[derive(Default)]
    struct CapturingSink {
        entries: Mutex<Vec<AuditEntry>>,
    }

    impl CapturingSink {
        fn entries(&self) -> Vec<AuditEntry> {
            self.entries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AuditSink for CapturingSink {
        async fn emit(&self, entry: &AuditEntry) -> Result<(), AuditError> {
            self.entries.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    /// Sink that always fails
    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn emit(&self, _entry: &AuditEntry) -> Result<(), AuditError> {
            Err(AuditError::sink("collector offline"))
        }
    }

    fn sample_transaction() -> Transaction {
        Transaction {
            transaction_id: "txn-1".to_string(),
            transaction_type: crate::types::TransactionType::CreditSale,
            amount: dec!(250),
            balance_before: dec!(100),
            balance_after: dec!(350),
            store_id: "store-1".to_string(),
            customer_phone: "+911111111111".to_string(),
            created_by: "owner-1".to_string(),
            idempotency_key: None,
            is_reversed: false,
            reversal_of: None,
            items: None,
            notes: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_log_transaction_emits_sealed_entry() {
        let sink = Arc::new(CapturingSink::default());
        let trail = AuditTrail::new(sink.clone());

        trail.log_transaction(&sample_transaction(), None).await;

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::TransactionRecorded);
        assert_eq!(entries[0].amount, Some(dec!(250)));
        assert!(entries[0].verify_checksum().unwrap());
    }

    #[tokio::test]
    async fn test_context_fields_are_copied_into_entry() {
        let sink = Arc::new(CapturingSink::default());
        let trail = AuditTrail::new(sink.clone());
        let context = RequestContext {
            ip_address: Some("203.0.113.9".to_string()),
            user_agent: Some("khata-app/2.1".to_string()),
            request_id: Some("req-7".to_string()),
        };

        trail
            .log_transaction(&sample_transaction(), Some(&context))
            .await;

        let entry = &sink.entries()[0];
        assert_eq!(entry.ip_address.as_deref(), Some("203.0.113.9"));
        assert_eq!(entry.request_id.as_deref(), Some("req-7"));
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        let trail = AuditTrail::new(Arc::new(FailingSink));

        // Must not panic or propagate.
        trail.log_transaction(&sample_transaction(), None).await;
        trail
            .log_balance_query("store-1", "+911111111111", "owner-1", dec!(350), None)
            .await;
    }

    #[tokio::test]
    async fn test_limit_change_entry_carries_detail() {
        let sink = Arc::new(CapturingSink::default());
        let clock = ManualClock::new(Utc::now());
        let trail =
            AuditTrail::with_clock(sink.clone(), AnomalyConfig::default(), Arc::new(clock));

        trail
            .log_credit_limit_change("store-1", "+911111111111", "owner-1", dec!(5000), dec!(12000), None)
            .await;

        let entry = &sink.entries()[0];
        assert_eq!(entry.action, AuditAction::CreditLimitChanged);
        assert_eq!(entry.detail.as_deref(), Some("credit limit 5000 -> 12000"));
    }

    #[tokio::test]
    async fn test_reminder_entry_is_system_actored() {
        let sink = Arc::new(CapturingSink::default());
        let trail = AuditTrail::new(sink.clone());

        trail
            .log_reminder_event("store-1", "+911111111111", "scheduler", "sms", None)
            .await;

        let entry = &sink.entries()[0];
        assert_eq!(entry.action, AuditAction::ReminderSent);
        assert_eq!(entry.actor_type, ActorType::System);
        assert_eq!(entry.detail.as_deref(), Some("reminder via sms"));
        assert!(entry.verify_checksum().unwrap());
    }

    #[tokio::test]
    async fn test_failed_operation_entry() {
        let sink = Arc::new(CapturingSink::default());
        let trail = AuditTrail::new(sink.clone());

        trail
            .log_failed_operation(
                "store-1",
                "+911111111111",
                "owner-1",
                "credit_sale",
                "credit limit exceeded",
                None,
            )
            .await;

        let entry = &sink.entries()[0];
        assert_eq!(entry.action, AuditAction::OperationFailed);
        assert_eq!(
            entry.detail.as_deref(),
            Some("credit_sale: credit limit exceeded")
        );
    }
}
