//! In-process transfer record store backed by `DashMap`

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::TransferRecordStore;
use crate::transfer::error::TransferError;
use crate::transfer::state::TransferStatus;
use crate::transfer::types::{AccountId, TransferId, TransferRecord};

#[derive(Default)]
pub struct MemoryRecordStore {
    records: DashMap<TransferId, TransferRecord>,
    unavailable: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrite `updated_at` (lets tests age a record past the stale threshold)
    pub fn backdate(&self, transfer_id: TransferId, updated_at: DateTime<Utc>) {
        if let Some(mut record) = self.records.get_mut(&transfer_id) {
            record.updated_at = updated_at;
        }
    }

    fn check_available(&self) -> Result<(), TransferError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TransferError::Database(
                "record store unavailable (simulated outage)".to_string(),
            ));
        }
        Ok(())
    }

    fn finish(
        &self,
        transfer_id: TransferId,
        status: TransferStatus,
        reason: Option<&str>,
    ) -> Result<bool, TransferError> {
        self.check_available()?;
        let Some(mut record) = self.records.get_mut(&transfer_id) else {
            return Ok(false);
        };
        if record.status != TransferStatus::Pending {
            return Ok(false);
        }
        record.status = status;
        record.failure_reason = reason.map(str::to_string);
        record.updated_at = Utc::now();
        Ok(true)
    }

    fn collect(&self, filter: impl Fn(&TransferRecord) -> bool) -> Vec<TransferRecord> {
        let mut records: Vec<TransferRecord> = self
            .records
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }
}

#[async_trait]
impl TransferRecordStore for MemoryRecordStore {
    async fn create(&self, record: &TransferRecord) -> Result<(), TransferError> {
        self.check_available()?;
        match self.records.entry(record.transfer_id) {
            Entry::Occupied(_) => Err(TransferError::DuplicateTransferId(
                record.transfer_id.to_string(),
            )),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, transfer_id: TransferId) -> Result<Option<TransferRecord>, TransferError> {
        self.check_available()?;
        Ok(self.records.get(&transfer_id).map(|r| r.value().clone()))
    }

    async fn mark_completed(&self, transfer_id: TransferId) -> Result<bool, TransferError> {
        self.finish(transfer_id, TransferStatus::Completed, None)
    }

    async fn mark_failed(
        &self,
        transfer_id: TransferId,
        reason: &str,
    ) -> Result<bool, TransferError> {
        self.finish(transfer_id, TransferStatus::Failed, Some(reason))
    }

    async fn touch(&self, transfer_id: TransferId) -> Result<bool, TransferError> {
        self.check_available()?;
        match self.records.get_mut(&transfer_id) {
            Some(mut record) if record.status == TransferStatus::Pending => {
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_sender(
        &self,
        account: AccountId,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        self.check_available()?;
        Ok(self.collect(|r| r.sender_id == account))
    }

    async fn list_by_recipient(
        &self,
        account: AccountId,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        self.check_available()?;
        Ok(self.collect(|r| r.recipient_id == account))
    }

    async fn find_stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        self.check_available()?;
        let mut stale = self.collect(|r| r.status == TransferStatus::Pending && r.updated_at < cutoff);
        stale.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        stale.truncate(limit);
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::types::TransferIntent;
    use chrono::Duration;

    fn pending(sender: i64, recipient: i64, amount: i64) -> TransferRecord {
        let intent = TransferIntent::new(AccountId(sender), AccountId(recipient), amount).unwrap();
        TransferRecord::pending(&intent)
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let store = MemoryRecordStore::new();
        let record = pending(1, 2, 100);

        store.create(&record).await.unwrap();
        let err = store.create(&record).await.unwrap_err();
        assert_eq!(
            err,
            TransferError::DuplicateTransferId(record.transfer_id.to_string())
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_transition_happens_once() {
        let store = MemoryRecordStore::new();
        let record = pending(1, 2, 100);
        store.create(&record).await.unwrap();

        assert!(store.mark_completed(record.transfer_id).await.unwrap());
        // Redelivery: silent no-op, never an error
        assert!(!store.mark_completed(record.transfer_id).await.unwrap());
        assert!(
            !store
                .mark_failed(record.transfer_id, "insufficient balance")
                .await
                .unwrap()
        );

        let stored = store.get(record.transfer_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Completed);
        assert!(stored.failure_reason.is_none());
        assert_eq!(stored.amount, 100);
    }

    #[tokio::test]
    async fn test_mark_failed_keeps_reason() {
        let store = MemoryRecordStore::new();
        let record = pending(1, 2, 100);
        store.create(&record).await.unwrap();

        assert!(
            store
                .mark_failed(record.transfer_id, "recipient not found")
                .await
                .unwrap()
        );
        let stored = store.get(record.transfer_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some("recipient not found"));
    }

    #[tokio::test]
    async fn test_get_status_not_found() {
        let store = MemoryRecordStore::new();
        let err = store.get_status(TransferId::new()).await.unwrap_err();
        assert!(matches!(err, TransferError::TransferNotFound(_)));
    }

    #[tokio::test]
    async fn test_history_projections() {
        let store = MemoryRecordStore::new();
        store.create(&pending(1, 2, 10)).await.unwrap();
        store.create(&pending(1, 3, 20)).await.unwrap();
        store.create(&pending(3, 1, 30)).await.unwrap();

        assert_eq!(store.list_by_sender(AccountId(1)).await.unwrap().len(), 2);
        assert_eq!(store.list_by_recipient(AccountId(1)).await.unwrap().len(), 1);
        assert!(store.list_by_sender(AccountId(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_stale_only_returns_old_pending() {
        let store = MemoryRecordStore::new();
        let old = pending(1, 2, 10);
        let fresh = pending(1, 2, 20);
        let done = pending(1, 2, 30);
        for r in [&old, &fresh, &done] {
            store.create(r).await.unwrap();
        }
        let long_ago = Utc::now() - Duration::minutes(10);
        store.backdate(old.transfer_id, long_ago);
        store.backdate(done.transfer_id, long_ago);
        store.mark_completed(done.transfer_id).await.unwrap();

        let cutoff = Utc::now() - Duration::minutes(1);
        let stale = store.find_stale(cutoff, 100).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].transfer_id, old.transfer_id);

        assert!(store.touch(old.transfer_id).await.unwrap());
        assert!(store.find_stale(cutoff, 100).await.unwrap().is_empty());
    }
}
