//! Transfer Record Store
//!
//! Persists transfer intents and their lifecycle status, keyed by transfer
//! id. Terminal transitions are conditional updates (`WHERE status =
//! PENDING`), so a redelivered message can never rewrite history.

pub mod memory;
pub mod postgres;

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::TransferError;
use super::state::TransferStatus;
use super::types::{AccountId, TransferId, TransferRecord};

#[async_trait]
pub trait TransferRecordStore: Send + Sync {
    /// Insert a new PENDING record
    ///
    /// Fails with `DuplicateTransferId` if the id already exists.
    async fn create(&self, record: &TransferRecord) -> Result<(), TransferError>;

    async fn get(&self, transfer_id: TransferId) -> Result<Option<TransferRecord>, TransferError>;

    /// Current status, `TransferNotFound` if no such record
    async fn get_status(&self, transfer_id: TransferId) -> Result<TransferStatus, TransferError> {
        self.get(transfer_id)
            .await?
            .map(|record| record.status)
            .ok_or_else(|| TransferError::TransferNotFound(transfer_id.to_string()))
    }

    /// PENDING → COMPLETED
    ///
    /// Returns `true` if this call made the transition, `false` if the record
    /// was already terminal (or absent). Never an error for a terminal record.
    async fn mark_completed(&self, transfer_id: TransferId) -> Result<bool, TransferError>;

    /// PENDING → FAILED with a human-readable reason; same contract as
    /// [`TransferRecordStore::mark_completed`]
    async fn mark_failed(&self, transfer_id: TransferId, reason: &str)
    -> Result<bool, TransferError>;

    /// Bump `updated_at` of a PENDING record (re-drive bookkeeping)
    async fn touch(&self, transfer_id: TransferId) -> Result<bool, TransferError>;

    /// Transfers sent by an account, newest first
    async fn list_by_sender(&self, account: AccountId)
    -> Result<Vec<TransferRecord>, TransferError>;

    /// Transfers received by an account, newest first
    async fn list_by_recipient(
        &self,
        account: AccountId,
    ) -> Result<Vec<TransferRecord>, TransferError>;

    /// PENDING records not updated since `cutoff`, oldest first
    async fn find_stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, TransferError>;
}
