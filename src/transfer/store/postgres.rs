//! PostgreSQL transfer record store (`transfers_tb`)
//!
//! All status updates are atomic CAS updates guarded by `status = PENDING`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use super::TransferRecordStore;
use crate::transfer::error::TransferError;
use crate::transfer::state::TransferStatus;
use crate::transfer::types::{AccountId, TransferId, TransferRecord};

const RECORD_COLUMNS: &str = "transfer_id, sender_id, recipient_id, amount, status, \
                              failure_reason, created_at, updated_at";

pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn finish(
        &self,
        transfer_id: TransferId,
        status: TransferStatus,
        reason: Option<&str>,
    ) -> Result<bool, TransferError> {
        let result = sqlx::query(
            r#"
            UPDATE transfers_tb
            SET status = $1, failure_reason = $2, updated_at = NOW()
            WHERE transfer_id = $3 AND status = $4
            "#,
        )
        .bind(status.id())
        .bind(reason)
        .bind(transfer_id.to_string())
        .bind(TransferStatus::Pending.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_where(
        &self,
        column: &str,
        account: AccountId,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        let sql = format!(
            "SELECT {} FROM transfers_tb WHERE {} = $1 ORDER BY created_at DESC",
            RECORD_COLUMNS, column
        );
        let rows = sqlx::query(&sql)
            .bind(account.0)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_record).collect()
    }
}

/// Convert database row to TransferRecord
fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<TransferRecord, TransferError> {
    let transfer_id_str: String = row.try_get("transfer_id")?;
    let transfer_id: TransferId = transfer_id_str.parse().map_err(|_| {
        TransferError::Database(format!("Invalid transfer_id format: {}", transfer_id_str))
    })?;

    let status_id: i16 = row.try_get("status")?;
    let status = TransferStatus::from_id(status_id)
        .ok_or_else(|| TransferError::Database(format!("Invalid status ID: {}", status_id)))?;

    Ok(TransferRecord {
        transfer_id,
        sender_id: AccountId(row.try_get("sender_id")?),
        recipient_id: AccountId(row.try_get("recipient_id")?),
        amount: row.try_get("amount")?,
        status,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl TransferRecordStore for PgRecordStore {
    async fn create(&self, record: &TransferRecord) -> Result<(), TransferError> {
        let result = sqlx::query(
            r#"
            INSERT INTO transfers_tb
                (transfer_id, sender_id, recipient_id, amount, status, failure_reason, created_at, updated_at)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (transfer_id) DO NOTHING
            "#,
        )
        .bind(record.transfer_id.to_string())
        .bind(record.sender_id.0)
        .bind(record.recipient_id.0)
        .bind(record.amount)
        .bind(record.status.id())
        .bind(&record.failure_reason)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TransferError::DuplicateTransferId(
                record.transfer_id.to_string(),
            ));
        }
        Ok(())
    }

    async fn get(&self, transfer_id: TransferId) -> Result<Option<TransferRecord>, TransferError> {
        let sql = format!(
            "SELECT {} FROM transfers_tb WHERE transfer_id = $1",
            RECORD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(transfer_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn mark_completed(&self, transfer_id: TransferId) -> Result<bool, TransferError> {
        self.finish(transfer_id, TransferStatus::Completed, None).await
    }

    async fn mark_failed(
        &self,
        transfer_id: TransferId,
        reason: &str,
    ) -> Result<bool, TransferError> {
        self.finish(transfer_id, TransferStatus::Failed, Some(reason))
            .await
    }

    async fn touch(&self, transfer_id: TransferId) -> Result<bool, TransferError> {
        let result = sqlx::query(
            "UPDATE transfers_tb SET updated_at = NOW() WHERE transfer_id = $1 AND status = $2",
        )
        .bind(transfer_id.to_string())
        .bind(TransferStatus::Pending.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_by_sender(
        &self,
        account: AccountId,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        self.list_where("sender_id", account).await
    }

    async fn list_by_recipient(
        &self,
        account: AccountId,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        self.list_where("recipient_id", account).await
    }

    async fn find_stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        let sql = format!(
            r#"
            SELECT {} FROM transfers_tb
            WHERE status = $1 AND updated_at < $2
            ORDER BY updated_at ASC
            LIMIT $3
            "#,
            RECORD_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(TransferStatus::Pending.id())
            .bind(cutoff)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_record).collect()
    }
}
