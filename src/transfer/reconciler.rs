//! Reconciliation Worker
//!
//! Background worker that scans for transfers stuck in PENDING and drives
//! them to a terminal state.
//!
//! A record can stay PENDING for two reasons:
//! - the ledger change committed but the status write did not (crash or
//!   outage between the two); the ledger journal proves it, so the record
//!   is marked COMPLETED directly
//! - the intent never reached a consumer (publish failed at intake, or the
//!   message was dead-lettered); the intent is published again
//!
//! A record whose message is still waiting in a lagging queue is only
//! touched, so a backlog does not gain a duplicate per sweep. Re-publishing
//! is safe anyway: execution is idempotent per transfer id.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::audit::{AuditEvent, AuditSink, TracingAuditSink};
use super::error::TransferError;
use super::ledger::AccountLedger;
use super::queue::TransferQueue;
use super::state::TransferStatus;
use super::store::TransferRecordStore;
use super::types::TransferRecord;

/// Configuration for the reconciliation worker
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often to scan for stale transfers
    pub scan_interval: Duration,
    /// How long a transfer must sit in PENDING to be considered stale
    pub stale_threshold: Duration,
    /// Maximum transfers to process per scan
    pub batch_size: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

/// Result of one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scanned: usize,
    /// Ledger already applied; record marked COMPLETED
    pub completed: usize,
    /// Intent published again
    pub republished: usize,
    /// Message still queued; left for the consumers
    pub in_queue: usize,
    pub errors: usize,
}

pub struct ReconciliationWorker {
    ledger: Arc<dyn AccountLedger>,
    store: Arc<dyn TransferRecordStore>,
    queue: Arc<dyn TransferQueue>,
    audit: Arc<dyn AuditSink>,
    config: ReconcilerConfig,
}

impl ReconciliationWorker {
    pub fn new(
        ledger: Arc<dyn AccountLedger>,
        store: Arc<dyn TransferRecordStore>,
        queue: Arc<dyn TransferQueue>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            ledger,
            store,
            queue,
            audit: Arc::new(TracingAuditSink),
            config,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Run the scan loop until the shutdown flag flips to `true`
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            batch_size = self.config.batch_size,
            "Starting reconciliation worker"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.scan_and_reconcile().await {
                error!(error = %e, "Reconciliation scan failed");
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.scan_interval) => {}
            }
        }

        info!("Reconciliation worker stopped");
    }

    /// Run a single scan
    pub async fn scan_and_reconcile(&self) -> Result<ReconcileReport, TransferError> {
        let threshold = chrono::Duration::from_std(self.config.stale_threshold)
            .map_err(|e| TransferError::Config(e.to_string()))?;
        let cutoff = Utc::now() - threshold;

        let stale = self
            .store
            .find_stale(cutoff, self.config.batch_size)
            .await?;

        let mut report = ReconcileReport {
            scanned: stale.len(),
            ..Default::default()
        };

        if stale.is_empty() {
            debug!("No stale transfers found");
            return Ok(report);
        }

        info!(count = stale.len(), "Found stale transfers to reconcile");

        for record in &stale {
            let transfer_id = record.transfer_id;

            let applied = match self.ledger.is_applied(transfer_id).await {
                Ok(applied) => applied,
                Err(e) => {
                    error!(transfer_id = %transfer_id, error = %e, "Journal lookup failed");
                    report.errors += 1;
                    continue;
                }
            };

            if applied {
                match self.store.mark_completed(transfer_id).await {
                    Ok(true) => {
                        info!(
                            transfer_id = %transfer_id,
                            "Ledger already applied - record marked COMPLETED"
                        );
                        self.emit_completed(record).await;
                        report.completed += 1;
                    }
                    Ok(false) => debug!(transfer_id = %transfer_id, "Settled concurrently"),
                    Err(e) => {
                        error!(transfer_id = %transfer_id, error = %e, "Failed to complete record");
                        report.errors += 1;
                    }
                }
                continue;
            }

            let queued = match self.queue.is_enqueued(transfer_id).await {
                Ok(queued) => queued,
                Err(e) => {
                    error!(transfer_id = %transfer_id, error = %e, "Queue lookup failed");
                    report.errors += 1;
                    continue;
                }
            };

            if queued {
                debug!(transfer_id = %transfer_id, "Message still queued - not re-publishing");
                if let Err(e) = self.store.touch(transfer_id).await {
                    error!(transfer_id = %transfer_id, error = %e, "Failed to touch record");
                }
                report.in_queue += 1;
                continue;
            }

            if let Err(e) = self.queue.publish(&record.to_intent()).await {
                error!(transfer_id = %transfer_id, error = %e, "Re-publish failed");
                report.errors += 1;
                continue;
            }

            // Keep the record out of the next few scans while the message is in flight
            if let Err(e) = self.store.touch(transfer_id).await {
                error!(transfer_id = %transfer_id, error = %e, "Failed to touch record");
            }

            debug!(
                transfer_id = %transfer_id,
                age_secs = (Utc::now() - record.updated_at).num_seconds(),
                "Re-published stale transfer"
            );
            report.republished += 1;
        }

        if report.completed + report.republished > 0 {
            info!(
                completed = report.completed,
                republished = report.republished,
                in_queue = report.in_queue,
                "Reconciled transfers this scan"
            );
        }

        Ok(report)
    }

    async fn emit_completed(&self, record: &TransferRecord) {
        let event = AuditEvent {
            transfer_id: record.transfer_id,
            sender: record.sender_id,
            recipient: record.recipient_id,
            amount: record.amount,
            outcome: TransferStatus::Completed,
            reason: None,
            at: Utc::now(),
        };
        if let Err(e) = self.audit.record(&event).await {
            warn!(transfer_id = %record.transfer_id, error = %e, "Audit sink failed (ignored)");
        }
    }
}
