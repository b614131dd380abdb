//! Transfer intake
//!
//! Entry point for callers: validates a request, persists the PENDING record
//! and publishes the intent. The record is always written before the
//! publish, so a consumer never sees an intent without a record, and a
//! failed publish leaves a PENDING record for the reconciler to pick up.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::error::TransferError;
use super::queue::TransferQueue;
use super::state::TransferStatus;
use super::store::TransferRecordStore;
use super::types::{AccountId, MinorUnits, TransferId, TransferIntent, TransferRecord};

pub struct TransferService {
    store: Arc<dyn TransferRecordStore>,
    queue: Arc<dyn TransferQueue>,
}

impl TransferService {
    pub fn new(store: Arc<dyn TransferRecordStore>, queue: Arc<dyn TransferQueue>) -> Self {
        Self { store, queue }
    }

    /// Accept a transfer under a fresh id
    pub async fn submit(
        &self,
        sender: AccountId,
        recipient: AccountId,
        amount: MinorUnits,
    ) -> Result<TransferId, TransferError> {
        self.submit_with_id(TransferId::new(), sender, recipient, amount)
            .await
    }

    /// Accept a transfer under a caller-chosen id
    ///
    /// Resubmitting an id that already has a record is a no-op that returns
    /// the id, provided the parameters match; nothing is published twice.
    pub async fn submit_with_id(
        &self,
        transfer_id: TransferId,
        sender: AccountId,
        recipient: AccountId,
        amount: MinorUnits,
    ) -> Result<TransferId, TransferError> {
        let intent = match TransferIntent::with_id(transfer_id, sender, recipient, amount) {
            Ok(intent) => intent,
            Err(e) => {
                if e.is_validation() {
                    debug!(transfer_id = %transfer_id, code = e.code(), "Transfer request rejected");
                }
                return Err(e);
            }
        };
        let record = TransferRecord::pending(&intent);

        match self.store.create(&record).await {
            Ok(()) => {}
            Err(TransferError::DuplicateTransferId(_)) => {
                return match self.store.get(transfer_id).await? {
                    Some(existing) if existing.matches(&intent) => {
                        debug!(transfer_id = %transfer_id, "Duplicate submission ignored");
                        Ok(transfer_id)
                    }
                    _ => Err(TransferError::DuplicateTransferId(transfer_id.to_string())),
                };
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.queue.publish(&intent).await {
            warn!(
                transfer_id = %transfer_id,
                code = e.code(),
                error = %e,
                "Publish failed - record left PENDING for reconciliation"
            );
            return Err(e);
        }

        info!(
            transfer_id = %transfer_id,
            sender = %sender,
            recipient = %recipient,
            amount,
            "Transfer accepted"
        );
        Ok(transfer_id)
    }

    pub async fn get_status(&self, transfer_id: TransferId) -> Result<TransferStatus, TransferError> {
        self.store.get_status(transfer_id).await
    }

    pub async fn get_record(
        &self,
        transfer_id: TransferId,
    ) -> Result<Option<TransferRecord>, TransferError> {
        self.store.get(transfer_id).await
    }

    /// Every transfer touching `account`, newest first
    pub async fn history(&self, account: AccountId) -> Result<Vec<TransferRecord>, TransferError> {
        let mut records = self.store.list_by_sender(account).await?;
        records.extend(self.store.list_by_recipient(account).await?);

        let mut seen = HashSet::new();
        records.retain(|r| seen.insert(r.transfer_id));
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.transfer_id.cmp(&a.transfer_id))
        });
        Ok(records)
    }
}
