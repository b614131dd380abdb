//! Transfer Orchestrator
//!
//! Drives one delivered intent through the state machine:
//!
//! ```text
//! status? ──terminal──▶ return (redelivery short-circuit)
//!    ├──payload disagrees with record──▶ Err(MalformedPayload), record untouched
//!    │ pending
//!    ▼
//! read sender ──absent──▶ FAILED "sender not found"
//! read recipient ──absent──▶ FAILED "recipient not found"
//!    ▼
//! apply_transfer ──InsufficientFunds──▶ FAILED "insufficient balance"
//!    │  ├──VersionConflict──▶ re-read sender, back off, retry (bounded)
//!    │  │                       └─budget spent──▶ FAILED "contention"
//!    │  └──NotFound──▶ FAILED "... not found"
//!    ▼ Applied / AlreadyApplied
//! COMPLETED ──▶ audit event (errors swallowed)
//! ```
//!
//! Transient infrastructure errors (including per-call timeouts) are
//! returned as `Err` and never recorded as `failed`; the consumer leaves the
//! delivery unacknowledged so the broker redelivers it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, warn};

use super::audit::{AuditEvent, AuditSink, TracingAuditSink};
use super::error::TransferError;
use super::ledger::{AccountLedger, ApplyOutcome};
use super::state::TransferStatus;
use super::store::TransferRecordStore;
use super::types::{Account, AccountId, FailureReason, TransferIntent, TransferRecord};

/// Bounded retry for optimistic-concurrency conflicts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total `apply_transfer` attempts before giving up with "contention"
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given (zero-based) attempt, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }

    /// Backoff plus up to 50% random jitter so colliding workers spread out
    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter_ms = (base.as_millis() as u64) / 2;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// What `execute` did with an intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// This call moved the record to COMPLETED
    Completed,
    /// This call moved the record to FAILED with the given reason
    Failed(String),
    /// The record was already terminal; nothing changed
    AlreadyTerminal(TransferStatus),
}

impl ExecuteOutcome {
    pub fn status(&self) -> TransferStatus {
        match self {
            ExecuteOutcome::Completed => TransferStatus::Completed,
            ExecuteOutcome::Failed(_) => TransferStatus::Failed,
            ExecuteOutcome::AlreadyTerminal(status) => *status,
        }
    }
}

pub struct TransferOrchestrator {
    ledger: Arc<dyn AccountLedger>,
    store: Arc<dyn TransferRecordStore>,
    audit: Arc<dyn AuditSink>,
    retry: RetryPolicy,
    op_timeout: Duration,
}

impl TransferOrchestrator {
    pub fn new(ledger: Arc<dyn AccountLedger>, store: Arc<dyn TransferRecordStore>) -> Self {
        Self {
            ledger,
            store,
            audit: Arc::new(TracingAuditSink),
            retry: RetryPolicy::default(),
            op_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Upper bound for each ledger/store call
    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// Execute one delivered intent to a terminal status
    ///
    /// Safe to call any number of times for the same intent: at most one
    /// balance change and one terminal transition ever happen.
    pub async fn execute(
        &self,
        intent: &TransferIntent,
    ) -> Result<ExecuteOutcome, TransferError> {
        let transfer_id = intent.transfer_id;

        // 1. Idempotent short-circuit
        match self.bounded("get record", self.store.get(transfer_id)).await? {
            Some(record) if record.status.is_terminal() => {
                debug!(
                    transfer_id = %transfer_id,
                    status = %record.status,
                    "Redelivered transfer already terminal - skipping"
                );
                return Ok(ExecuteOutcome::AlreadyTerminal(record.status));
            }
            Some(record) if !record.matches(intent) => {
                warn!(
                    transfer_id = %transfer_id,
                    recorded = %record,
                    delivered = %intent,
                    "Delivered intent disagrees with transfer record"
                );
                return Err(TransferError::MalformedPayload(
                    "intent does not match transfer record".to_string(),
                ));
            }
            Some(_) => {}
            None => {
                // Intake records before publishing; a missing record means the
                // audit row was lost, so restore it before touching money.
                warn!(transfer_id = %transfer_id, "No transfer record for delivered intent - recreating");
                match self
                    .bounded("create record", self.store.create(&TransferRecord::pending(intent)))
                    .await
                {
                    Ok(()) | Err(TransferError::DuplicateTransferId(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        // 2. Sender
        let Some(mut sender) = self.read_account(intent.sender_id).await? else {
            return self.fail(intent, FailureReason::SenderNotFound).await;
        };

        // 3. Recipient
        if self.read_account(intent.recipient_id).await?.is_none() {
            return self.fail(intent, FailureReason::RecipientNotFound).await;
        }

        // 4. Atomic mutation with bounded conflict retry
        let mut attempt = 0;
        loop {
            let outcome = self
                .bounded(
                    "apply transfer",
                    self.ledger.apply_transfer(
                        transfer_id,
                        intent.sender_id,
                        intent.recipient_id,
                        intent.amount,
                        sender.version,
                    ),
                )
                .await;

            match outcome {
                Ok(ApplyOutcome::Applied) => break,
                Ok(ApplyOutcome::AlreadyApplied) => {
                    info!(
                        transfer_id = %transfer_id,
                        "Ledger already holds this transfer - finalising record"
                    );
                    break;
                }
                Ok(ApplyOutcome::InsufficientFunds) => {
                    return self.fail(intent, FailureReason::InsufficientBalance).await;
                }
                Ok(ApplyOutcome::NotFound(account)) => {
                    return self.fail(intent, self.missing_reason(intent, account)).await;
                }
                Ok(ApplyOutcome::VersionConflict) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        warn!(
                            transfer_id = %transfer_id,
                            attempts = attempt,
                            "Version conflict retry budget exhausted"
                        );
                        return self.fail(intent, FailureReason::Contention).await;
                    }

                    let delay = self.retry.backoff_with_jitter(attempt - 1);
                    debug!(
                        transfer_id = %transfer_id,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Version conflict - re-reading sender"
                    );
                    tokio::time::sleep(delay).await;

                    match self.read_account(intent.sender_id).await? {
                        Some(fresh) => sender = fresh,
                        None => return self.fail(intent, FailureReason::SenderNotFound).await,
                    }
                }
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    // Deterministic rejection (e.g. overflow): redelivery would
                    // hit it again, so it is terminal.
                    warn!(transfer_id = %transfer_id, error = %e, "Ledger rejected transfer");
                    return self.fail_with(intent, e.to_string()).await;
                }
            }
        }

        // 5. Finalise
        let transitioned = self
            .bounded("mark completed", self.store.mark_completed(transfer_id))
            .await?;
        if !transitioned {
            return self.settled_elsewhere(intent).await;
        }

        info!(
            transfer_id = %transfer_id,
            sender = %intent.sender_id,
            recipient = %intent.recipient_id,
            amount = intent.amount,
            "Transfer completed"
        );

        // 6. Audit (side effect only)
        self.emit(intent, TransferStatus::Completed, None).await;

        Ok(ExecuteOutcome::Completed)
    }

    async fn read_account(&self, id: AccountId) -> Result<Option<Account>, TransferError> {
        self.bounded("get account", self.ledger.get_account(id)).await
    }

    fn missing_reason(&self, intent: &TransferIntent, account: AccountId) -> FailureReason {
        if account == intent.sender_id {
            FailureReason::SenderNotFound
        } else {
            FailureReason::RecipientNotFound
        }
    }

    async fn fail(
        &self,
        intent: &TransferIntent,
        reason: FailureReason,
    ) -> Result<ExecuteOutcome, TransferError> {
        self.fail_with(intent, reason.as_str().to_string()).await
    }

    async fn fail_with(
        &self,
        intent: &TransferIntent,
        reason: String,
    ) -> Result<ExecuteOutcome, TransferError> {
        let transitioned = self
            .bounded(
                "mark failed",
                self.store.mark_failed(intent.transfer_id, &reason),
            )
            .await?;
        if !transitioned {
            return self.settled_elsewhere(intent).await;
        }

        info!(
            transfer_id = %intent.transfer_id,
            sender = %intent.sender_id,
            recipient = %intent.recipient_id,
            amount = intent.amount,
            reason = %reason,
            "Transfer failed"
        );
        self.emit(intent, TransferStatus::Failed, Some(reason.clone()))
            .await;

        Ok(ExecuteOutcome::Failed(reason))
    }

    /// Another worker reached a terminal status first
    async fn settled_elsewhere(
        &self,
        intent: &TransferIntent,
    ) -> Result<ExecuteOutcome, TransferError> {
        let status = self
            .bounded("get status", self.store.get_status(intent.transfer_id))
            .await?;
        debug!(
            transfer_id = %intent.transfer_id,
            status = %status,
            "Transfer settled by a concurrent delivery"
        );
        Ok(ExecuteOutcome::AlreadyTerminal(status))
    }

    async fn emit(&self, intent: &TransferIntent, outcome: TransferStatus, reason: Option<String>) {
        let event = AuditEvent {
            transfer_id: intent.transfer_id,
            sender: intent.sender_id,
            recipient: intent.recipient_id,
            amount: intent.amount,
            outcome,
            reason,
            at: Utc::now(),
        };
        if let Err(e) = self.audit.record(&event).await {
            warn!(transfer_id = %intent.transfer_id, error = %e, "Audit sink failed (ignored)");
        }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, TransferError>>,
    ) -> Result<T, TransferError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout(format!(
                "{} exceeded {}ms",
                op,
                self.op_timeout.as_millis()
            ))),
        }
    }
}
