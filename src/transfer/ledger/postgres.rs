//! PostgreSQL ledger (`accounts_tb` + `ledger_journal_tb`)
//!
//! `apply_transfer` runs in one transaction: both account rows are locked
//! with `FOR UPDATE` in ascending id order (no lock-order deadlocks between
//! opposite-direction transfers), the sender version is compared, both rows
//! are updated and the journal row is inserted before COMMIT.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::{AccountLedger, ApplyOutcome};
use crate::transfer::error::TransferError;
use crate::transfer::types::{Account, AccountId, MinorUnits, TransferId};

pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new account row at version 0 (seeding and tests; account
    /// opening is owned by the account service). Existing rows are left alone.
    pub async fn open_account(
        &self,
        id: AccountId,
        balance: MinorUnits,
    ) -> Result<(), TransferError> {
        let result = sqlx::query(
            r#"
            INSERT INTO accounts_tb (account_id, balance, version)
            VALUES ($1, $2, 0)
            ON CONFLICT (account_id) DO NOTHING
            "#,
        )
        .bind(id.0)
        .bind(balance)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TransferError::AccountExists(id));
        }
        Ok(())
    }

    fn row_to_account(row: &sqlx::postgres::PgRow) -> Result<Account, TransferError> {
        Ok(Account {
            id: AccountId(row.try_get("account_id")?),
            balance: row.try_get("balance")?,
            version: row.try_get("version")?,
        })
    }
}

#[async_trait]
impl AccountLedger for PgLedger {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, TransferError> {
        let row = sqlx::query(
            "SELECT account_id, balance, version FROM accounts_tb WHERE account_id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_account).transpose()
    }

    async fn apply_transfer(
        &self,
        transfer_id: TransferId,
        sender: AccountId,
        recipient: AccountId,
        amount: MinorUnits,
        expected_sender_version: i64,
    ) -> Result<ApplyOutcome, TransferError> {
        if amount <= 0 {
            return Err(TransferError::InvalidAmount);
        }
        if sender == recipient {
            return Err(TransferError::SameAccount);
        }

        let mut tx = self.pool.begin().await?;

        let replayed = sqlx::query("SELECT 1 FROM ledger_journal_tb WHERE transfer_id = $1")
            .bind(transfer_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if replayed {
            tx.rollback().await?;
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let ids = vec![sender.0, recipient.0];
        let rows = sqlx::query(
            r#"
            SELECT account_id, balance, version FROM accounts_tb
            WHERE account_id = ANY($1)
            ORDER BY account_id
            FOR UPDATE
            "#,
        )
        .bind(&ids[..])
        .fetch_all(&mut *tx)
        .await?;

        let mut from = None;
        let mut to = None;
        for row in &rows {
            let account = Self::row_to_account(row)?;
            if account.id == sender {
                from = Some(account);
            } else if account.id == recipient {
                to = Some(account);
            }
        }

        let Some(from) = from else {
            tx.rollback().await?;
            return Ok(ApplyOutcome::NotFound(sender));
        };
        let Some(to) = to else {
            tx.rollback().await?;
            return Ok(ApplyOutcome::NotFound(recipient));
        };

        if from.version != expected_sender_version {
            tx.rollback().await?;
            return Ok(ApplyOutcome::VersionConflict);
        }
        if from.balance < amount {
            tx.rollback().await?;
            return Ok(ApplyOutcome::InsufficientFunds);
        }
        if to.balance.checked_add(amount).is_none() {
            tx.rollback().await?;
            return Err(TransferError::Overflow);
        }

        sqlx::query(
            r#"
            UPDATE accounts_tb
            SET balance = balance - $1, version = version + 1, updated_at = NOW()
            WHERE account_id = $2 AND version = $3
            "#,
        )
        .bind(amount)
        .bind(sender.0)
        .bind(expected_sender_version)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE accounts_tb
            SET balance = balance + $1, version = version + 1, updated_at = NOW()
            WHERE account_id = $2
            "#,
        )
        .bind(amount)
        .bind(recipient.0)
        .execute(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO ledger_journal_tb (transfer_id, sender_id, recipient_id, amount, applied_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (transfer_id) DO NOTHING
            "#,
        )
        .bind(transfer_id.to_string())
        .bind(sender.0)
        .bind(recipient.0)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            // A concurrent replay committed first
            tx.rollback().await?;
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        tx.commit().await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn is_applied(&self, transfer_id: TransferId) -> Result<bool, TransferError> {
        let row = sqlx::query("SELECT 1 FROM ledger_journal_tb WHERE transfer_id = $1")
            .bind(transfer_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }
}
