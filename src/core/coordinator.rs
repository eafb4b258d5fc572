//! Saga orchestration over the storage boundary
//!
//! `SagaCoordinator` implements the four balance-mutating operations as a
//! fixed-order saga against stores that only offer single-item conditional
//! writes:
//!
//! 1. Idempotency lookup; a cached result short-circuits the whole saga.
//! 2. Read the current balance (lazily created for credit sales).
//! 3. Business-rule validation against the freshly read state.
//! 4. Version-conditioned compare-and-swap of the new balance, retried from
//!    a fresh read on version conflicts within a bounded budget.
//! 5. Ledger append. If the append fails, the balance write is compensated
//!    by applying the inverse delta through another conditional write; a
//!    failed compensation is escalated as a critical, non-recoverable error.
//! 6. Idempotency commit, best-effort.
//! 7. Fire-and-forget audit emission.
//!
//! It is never safe to append the ledger record before the balance write
//! commits: `balance_after` must describe a write that actually happened.
//!
//! # Concurrency
//!
//! There is no lock per customer. Two sagas racing on one balance are
//! serialized by the version field alone: exactly one compare-and-swap wins
//! per version, the loser re-reads and retries. Version-conflict retries
//! and transient infrastructure retries are separate loops with separate
//! budgets.

use std::future::Future;
use std::sync::Arc;

use rust_decimal::Decimal;

use crate::audit::AuditTrail;
use crate::config::EngineConfig;
use crate::types::{
    CustomerBalance, KhataError, OperationRequest, OperationResult, RequestContext, StoreError,
    Transaction, TransactionId, TransactionType,
};

use super::clock::{Clock, SystemClock};
use super::retry::retry_transient;
use super::traits::{BalanceStore, CasOutcome, IdempotencyStore, TransactionLedger};

/// Orchestrates khata operations as sagas with compensation
///
/// Holds shared handles to the three stores and the audit trail; callers
/// share one coordinator behind an `Arc` and invoke operations
/// concurrently.
pub struct SagaCoordinator {
    balances: Arc<dyn BalanceStore>,
    ledger: Arc<dyn TransactionLedger>,
    idempotency: Arc<dyn IdempotencyStore>,
    audit: AuditTrail,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
}

impl SagaCoordinator {
    /// Create a coordinator on the system clock
    pub fn new(
        balances: Arc<dyn BalanceStore>,
        ledger: Arc<dyn TransactionLedger>,
        idempotency: Arc<dyn IdempotencyStore>,
        audit: AuditTrail,
        config: EngineConfig,
    ) -> Self {
        Self::with_clock(balances, ledger, idempotency, audit, config, Arc::new(SystemClock))
    }

    /// Create a coordinator with an injected clock (tests)
    pub fn with_clock(
        balances: Arc<dyn BalanceStore>,
        ledger: Arc<dyn TransactionLedger>,
        idempotency: Arc<dyn IdempotencyStore>,
        audit: AuditTrail,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        SagaCoordinator {
            balances,
            ledger,
            idempotency,
            audit,
            config,
            clock,
        }
    }

    /// Record a credit sale, increasing the outstanding balance
    ///
    /// The amount must be positive. Fails with `CreditLimitExceeded` when
    /// the sale would push the balance past the credit limit; reaching the
    /// limit exactly succeeds. An unknown customer gets a zero-balance
    /// record created as part of the same saga attempt.
    pub async fn record_credit_sale(
        &self,
        request: OperationRequest,
    ) -> Result<OperationResult, KhataError> {
        if request.amount <= Decimal::ZERO {
            let error = KhataError::invalid_amount(request.amount);
            self.audit_failure(&request, TransactionType::CreditSale, &error);
            return Err(error);
        }

        let delta = request.amount;
        let result = self
            .run_saga(TransactionType::CreditSale, &request, delta, None)
            .await;
        if let Err(error) = &result {
            self.audit_failure(&request, TransactionType::CreditSale, error);
        }
        result
    }

    /// Record a payment, decreasing the outstanding balance
    ///
    /// Fails with `CustomerNotFound` when no balance record exists and with
    /// `InvalidPaymentAmount` when the amount is non-positive or exceeds
    /// the outstanding balance; payments never produce negative balances.
    pub async fn record_payment(
        &self,
        request: OperationRequest,
    ) -> Result<OperationResult, KhataError> {
        let delta = -request.amount;
        let result = self
            .run_saga(TransactionType::Payment, &request, delta, None)
            .await;
        if let Err(error) = &result {
            self.audit_failure(&request, TransactionType::Payment, error);
        }
        result
    }

    /// Apply a signed correction or waiver directly to the balance
    ///
    /// Same version-conditioned write path as the other operations, but no
    /// credit-limit check.
    pub async fn adjust_balance(
        &self,
        request: OperationRequest,
    ) -> Result<OperationResult, KhataError> {
        let delta = request.amount;
        let result = self
            .run_saga(TransactionType::Adjustment, &request, delta, None)
            .await;
        if let Err(error) = &result {
            self.audit_failure(&request, TransactionType::Adjustment, error);
        }
        result
    }

    /// Reverse a previously committed transaction
    ///
    /// Applies the inverse amount to the balance, appends a `reversal`
    /// transaction referencing the original, and flips `is_reversed` on the
    /// original exactly once. A second reversal fails with `AlreadyReversed`.
    pub async fn reverse_transaction(
        &self,
        request: crate::types::ReversalRequest,
    ) -> Result<OperationResult, KhataError> {
        let original = self
            .load_original(&request.original_transaction_id)
            .await?;

        if original.is_reversed {
            let error = KhataError::already_reversed(&original.transaction_id);
            self.audit
                .log_failed_operation_detached(
                    original.store_id.clone(),
                    original.customer_phone.clone(),
                    request.created_by.clone(),
                    TransactionType::Reversal.as_str().to_string(),
                    error.to_string(),
                    request.context.clone(),
                );
            return Err(error);
        }

        let op_request = OperationRequest {
            store_id: original.store_id.clone(),
            customer_phone: original.customer_phone.clone(),
            amount: original.amount,
            created_by: request.created_by.clone(),
            transaction_id: None,
            idempotency_key: request.idempotency_key.clone(),
            customer_name: None,
            items: None,
            notes: request.notes.clone(),
            context: request.context.clone(),
        };
        let delta = -original.amount;

        let result = self
            .run_saga(
                TransactionType::Reversal,
                &op_request,
                delta,
                Some(original.transaction_id.clone()),
            )
            .await;
        if let Err(error) = &result {
            self.audit_failure(&op_request, TransactionType::Reversal, error);
        }
        result
    }

    /// Read the current balance record
    ///
    /// Emits a `balance_query` audit event fire-and-forget.
    pub async fn get_balance(
        &self,
        store_id: &str,
        customer_phone: &str,
        actor_id: &str,
        context: Option<RequestContext>,
    ) -> Result<CustomerBalance, KhataError> {
        let balance = retry_transient(&self.config.infra_retry, || {
            self.timed(self.balances.get_balance(store_id, customer_phone))
        })
        .await?
        .ok_or_else(|| KhataError::customer_not_found(store_id, customer_phone))?;

        self.audit.log_balance_query_detached(
            store_id.to_string(),
            customer_phone.to_string(),
            actor_id.to_string(),
            balance.outstanding_balance,
            context,
        );
        Ok(balance)
    }

    /// List a customer's transactions, newest first
    pub async fn list_transactions(
        &self,
        store_id: &str,
        customer_phone: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Transaction>, KhataError> {
        let transactions = retry_transient(&self.config.infra_retry, || {
            self.timed(self.ledger.list_transactions(store_id, customer_phone, limit))
        })
        .await?;
        Ok(transactions)
    }

    /// Change a customer's credit limit through the conditional-write path
    ///
    /// Leaves the outstanding balance untouched and creates no ledger
    /// transaction. Emits a `credit_limit_change` audit event, which raises
    /// the large-increase alert when the new limit is more than the
    /// configured factor over the old one.
    pub async fn set_credit_limit(
        &self,
        store_id: &str,
        customer_phone: &str,
        new_limit: Decimal,
        changed_by: &str,
        context: Option<RequestContext>,
    ) -> Result<CustomerBalance, KhataError> {
        if new_limit < Decimal::ZERO {
            return Err(KhataError::invalid_amount(new_limit));
        }

        let policy = self.config.cas_retry;
        let mut attempt = 1;
        loop {
            let balance = retry_transient(&self.config.infra_retry, || {
                self.timed(self.balances.get_balance(store_id, customer_phone))
            })
            .await?
            .ok_or_else(|| KhataError::customer_not_found(store_id, customer_phone))?;

            let old_limit = balance.credit_limit;
            let outcome = retry_transient(&self.config.infra_retry, || {
                self.timed(self.balances.compare_and_swap_credit_limit(
                    store_id,
                    customer_phone,
                    new_limit,
                    balance.version,
                ))
            })
            .await?;

            match outcome {
                CasOutcome::Committed(updated) => {
                    self.audit.log_credit_limit_change_detached(
                        store_id.to_string(),
                        customer_phone.to_string(),
                        changed_by.to_string(),
                        old_limit,
                        new_limit,
                        context,
                    );
                    return Ok(updated);
                }
                CasOutcome::VersionConflict if attempt < policy.max_attempts => {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                    attempt += 1;
                }
                CasOutcome::VersionConflict => {
                    return Err(KhataError::lock_exhausted(customer_phone, policy.max_attempts));
                }
            }
        }
    }

    // --- saga internals ---

    async fn run_saga(
        &self,
        kind: TransactionType,
        request: &OperationRequest,
        delta: Decimal,
        reversal_of: Option<TransactionId>,
    ) -> Result<OperationResult, KhataError> {
        // Step 1: a cached result means the side effects already happened.
        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(cached) = self.replay_idempotent(key).await {
                return Ok(cached);
            }
        }

        // Steps 2-4: read, validate, compare-and-swap.
        let (balance_before, committed) = self.apply_balance_delta(kind, request, delta).await?;

        // Step 5: ledger append, compensated on failure.
        let transaction = self.build_transaction(kind, request, delta, balance_before, &committed, reversal_of.clone());
        let append = retry_transient(&self.config.infra_retry, || {
            self.timed(self.ledger.append_transaction(transaction.clone()))
        })
        .await;
        if let Err(append_error) = append {
            return Err(self.compensate(&transaction, delta, append_error).await);
        }

        // Reversals additionally flip the original's flag; once the
        // reversal transaction is committed, a failure here leaves the
        // ledger inconsistent and is escalated, not retried later.
        if let Some(original_id) = &reversal_of {
            let flip = retry_transient(&self.config.infra_retry, || {
                self.timed(self.ledger.mark_transaction_reversed(original_id))
            })
            .await;
            if let Err(error) = flip {
                tracing::error!(
                    transaction_id = %transaction.transaction_id,
                    original_transaction_id = %original_id,
                    %error,
                    "CRITICAL: reversal committed but original could not be flagged; manual reconciliation required"
                );
                return Err(KhataError::rollback_failed(
                    transaction.transaction_id.clone(),
                    format!("reversal committed but original {original_id} could not be flagged: {error}"),
                ));
            }
        }

        let result = OperationResult {
            transaction_id: transaction.transaction_id.clone(),
            balance_before,
            balance_after: committed.outstanding_balance,
        };

        // Step 6: best-effort idempotency commit.
        if let Some(key) = request.idempotency_key.as_deref() {
            self.commit_idempotent(key, &result).await;
        }

        // Step 7: audit, detached from the saga's completion.
        self.audit
            .log_transaction_detached(transaction, request.context.clone());

        tracing::info!(
            transaction_id = %result.transaction_id,
            operation = kind.as_str(),
            store_id = %request.store_id,
            customer_phone = %request.customer_phone,
            balance_after = %result.balance_after,
            "saga committed"
        );
        Ok(result)
    }

    /// Steps 2-4: read fresh state, validate, and compare-and-swap
    ///
    /// Returns the observed balance before the write and the committed
    /// record after it. Version conflicts restart from a fresh read.
    async fn apply_balance_delta(
        &self,
        kind: TransactionType,
        request: &OperationRequest,
        delta: Decimal,
    ) -> Result<(Decimal, CustomerBalance), KhataError> {
        let policy = self.config.cas_retry;
        let mut attempt = 1;
        loop {
            let balance = self.load_balance(kind, request).await?;
            self.validate(kind, request, delta, &balance)?;

            let new_balance = balance.outstanding_balance + delta;
            let outcome = retry_transient(&self.config.infra_retry, || {
                self.timed(self.balances.compare_and_swap_balance(
                    &request.store_id,
                    &request.customer_phone,
                    new_balance,
                    balance.version,
                ))
            })
            .await?;

            match outcome {
                CasOutcome::Committed(committed) => {
                    return Ok((balance.outstanding_balance, committed));
                }
                CasOutcome::VersionConflict if attempt < policy.max_attempts => {
                    tracing::debug!(
                        customer_phone = %request.customer_phone,
                        attempt,
                        "balance version conflict, retrying from fresh read"
                    );
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                    attempt += 1;
                }
                CasOutcome::VersionConflict => {
                    return Err(KhataError::lock_exhausted(
                        &request.customer_phone,
                        policy.max_attempts,
                    ));
                }
            }
        }
    }

    /// Step 2: read the balance, lazily creating it for credit sales
    async fn load_balance(
        &self,
        kind: TransactionType,
        request: &OperationRequest,
    ) -> Result<CustomerBalance, KhataError> {
        let existing = retry_transient(&self.config.infra_retry, || {
            self.timed(
                self.balances
                    .get_balance(&request.store_id, &request.customer_phone),
            )
        })
        .await?;

        match existing {
            Some(balance) => Ok(balance),
            None if kind == TransactionType::CreditSale => {
                let initial = CustomerBalance::new(
                    &request.store_id,
                    &request.customer_phone,
                    request
                        .customer_name
                        .clone()
                        .unwrap_or_else(|| request.customer_phone.clone()),
                    self.config.default_credit_limit,
                    self.clock.now(),
                );
                let created = retry_transient(&self.config.infra_retry, || {
                    self.timed(self.balances.create_balance(initial.clone()))
                })
                .await?;
                Ok(created)
            }
            None => Err(KhataError::customer_not_found(
                &request.store_id,
                &request.customer_phone,
            )),
        }
    }

    /// Step 3: business rules against the freshly read balance
    fn validate(
        &self,
        kind: TransactionType,
        request: &OperationRequest,
        delta: Decimal,
        balance: &CustomerBalance,
    ) -> Result<(), KhataError> {
        match kind {
            TransactionType::CreditSale => {
                // Reaching the limit exactly is allowed.
                if balance.outstanding_balance + delta > balance.credit_limit {
                    return Err(KhataError::credit_limit_exceeded(
                        &request.customer_phone,
                        balance.outstanding_balance,
                        request.amount,
                        balance.credit_limit,
                    ));
                }
                Ok(())
            }
            TransactionType::Payment => {
                if request.amount <= Decimal::ZERO
                    || request.amount > balance.outstanding_balance
                {
                    return Err(KhataError::invalid_payment(
                        &request.customer_phone,
                        request.amount,
                        balance.outstanding_balance,
                    ));
                }
                Ok(())
            }
            TransactionType::Adjustment | TransactionType::Reversal => Ok(()),
        }
    }

    fn build_transaction(
        &self,
        kind: TransactionType,
        request: &OperationRequest,
        delta: Decimal,
        balance_before: Decimal,
        committed: &CustomerBalance,
        reversal_of: Option<TransactionId>,
    ) -> Transaction {
        Transaction {
            transaction_id: request
                .transaction_id
                .clone()
                .unwrap_or_else(Transaction::generate_id),
            transaction_type: kind,
            amount: delta,
            balance_before,
            balance_after: committed.outstanding_balance,
            store_id: request.store_id.clone(),
            customer_phone: request.customer_phone.clone(),
            created_by: request.created_by.clone(),
            idempotency_key: request.idempotency_key.clone(),
            is_reversed: false,
            reversal_of,
            items: request.items.clone(),
            notes: request.notes.clone(),
            created_at: self.clock.now(),
        }
    }

    /// Step 5 fallback: undo the committed balance write
    ///
    /// Applies the inverse delta against fresh state so interleaved writers
    /// are preserved. Success surfaces the original fault; any failure here
    /// is the critical, non-recoverable class.
    async fn compensate(
        &self,
        transaction: &Transaction,
        delta: Decimal,
        cause: StoreError,
    ) -> KhataError {
        tracing::warn!(
            transaction_id = %transaction.transaction_id,
            %cause,
            "ledger append failed after balance write, compensating"
        );

        let policy = self.config.cas_retry;
        let mut attempt = 1;
        loop {
            let current = match retry_transient(&self.config.infra_retry, || {
                self.timed(
                    self.balances
                        .get_balance(&transaction.store_id, &transaction.customer_phone),
                )
            })
            .await
            {
                Ok(Some(balance)) => balance,
                Ok(None) => {
                    return self.escalate_rollback(
                        transaction,
                        "balance record missing during compensation".to_string(),
                    );
                }
                Err(error) => {
                    return self.escalate_rollback(
                        transaction,
                        format!("compensating read failed: {error}"),
                    );
                }
            };

            let restored = current.outstanding_balance - delta;
            let outcome = match retry_transient(&self.config.infra_retry, || {
                self.timed(self.balances.compare_and_swap_balance(
                    &transaction.store_id,
                    &transaction.customer_phone,
                    restored,
                    current.version,
                ))
            })
            .await
            {
                Ok(outcome) => outcome,
                Err(error) => {
                    return self.escalate_rollback(
                        transaction,
                        format!("compensating write failed: {error}"),
                    );
                }
            };

            match outcome {
                CasOutcome::Committed(_) => {
                    tracing::warn!(
                        transaction_id = %transaction.transaction_id,
                        "saga compensated, balance restored"
                    );
                    return KhataError::Store(cause);
                }
                CasOutcome::VersionConflict if attempt < policy.max_attempts => {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                    attempt += 1;
                }
                CasOutcome::VersionConflict => {
                    return self.escalate_rollback(
                        transaction,
                        "compensating write conflicted past the retry budget".to_string(),
                    );
                }
            }
        }
    }

    fn escalate_rollback(&self, transaction: &Transaction, message: String) -> KhataError {
        tracing::error!(
            transaction_id = %transaction.transaction_id,
            store_id = %transaction.store_id,
            customer_phone = %transaction.customer_phone,
            message = %message,
            "CRITICAL: saga compensation failed; balance and ledger may disagree, manual reconciliation required"
        );
        KhataError::rollback_failed(transaction.transaction_id.clone(), message)
    }

    async fn replay_idempotent(&self, key: &str) -> Option<OperationResult> {
        match retry_transient(&self.config.infra_retry, || {
            self.timed(self.idempotency.get(key))
        })
        .await
        {
            Ok(Some(cached)) => {
                tracing::debug!(idempotency_key = key, "returning cached result for duplicate submission");
                Some(cached)
            }
            Ok(None) => None,
            Err(error) => {
                // A broken cache must not block the operation; the
                // duplicate-execution risk is accepted and documented.
                tracing::warn!(idempotency_key = key, %error, "idempotency lookup failed, treating as miss");
                None
            }
        }
    }

    async fn commit_idempotent(&self, key: &str, result: &OperationResult) {
        let put = retry_transient(&self.config.infra_retry, || {
            self.timed(self.idempotency.put(key, result, self.config.idempotency_ttl))
        })
        .await;
        if let Err(error) = put {
            tracing::warn!(
                idempotency_key = key,
                %error,
                "idempotency commit failed; duplicate submissions may re-execute"
            );
        }
    }

    async fn load_original(&self, transaction_id: &str) -> Result<Transaction, KhataError> {
        retry_transient(&self.config.infra_retry, || {
            self.timed(self.ledger.get_transaction(transaction_id))
        })
        .await?
        .ok_or_else(|| KhataError::transaction_not_found(transaction_id))
    }

    fn audit_failure(&self, request: &OperationRequest, kind: TransactionType, error: &KhataError) {
        self.audit.log_failed_operation_detached(
            request.store_id.clone(),
            request.customer_phone.clone(),
            request.created_by.clone(),
            kind.as_str().to_string(),
            error.to_string(),
            request.context.clone(),
        );
    }

    /// Apply the configured per-call timeout to one storage call
    async fn timed<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let budget = self.config.storage_timeout;
        match tokio::time::timeout(budget, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::timeout(budget.as_millis() as u64)),
        }
    }
}
