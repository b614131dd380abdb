//! Account Ledger
//!
//! Owns account balances. The only way to move money is
//! [`AccountLedger::apply_transfer`], which debits the sender, credits the
//! recipient, bumps both versions and writes a journal row in one atomic unit.

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

use async_trait::async_trait;

use super::error::TransferError;
use super::types::{Account, AccountId, MinorUnits, TransferId};

/// Result of an atomic transfer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Debit and credit committed together
    Applied,
    /// The journal already holds this transfer id; balances untouched
    AlreadyApplied,
    /// Sender balance < amount at validation time
    InsufficientFunds,
    /// Sender version moved since it was read; re-read and retry
    VersionConflict,
    /// The given account does not exist
    NotFound(AccountId),
}

impl ApplyOutcome {
    /// Money moved for this transfer id (now or earlier)
    #[inline]
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied | ApplyOutcome::AlreadyApplied)
    }
}

/// Account ledger operations
///
/// Implementations must make `apply_transfer` atomic across both accounts
/// and across process boundaries (version check or row locks in the backing
/// store, never an in-process mutex alone).
#[async_trait]
pub trait AccountLedger: Send + Sync {
    /// Get adapter name for logging
    fn name(&self) -> &'static str;

    /// Read one account row
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, TransferError>;

    /// Read `(balance, version)` for an account
    async fn get_balance(
        &self,
        id: AccountId,
    ) -> Result<Option<(MinorUnits, i64)>, TransferError> {
        Ok(self
            .get_account(id)
            .await?
            .map(|account| (account.balance, account.version)))
    }

    /// Atomically move `amount` from sender to recipient
    ///
    /// Checks run inside the atomic unit in this order: journal (replay),
    /// account existence, sender version, sender balance.
    async fn apply_transfer(
        &self,
        transfer_id: TransferId,
        sender: AccountId,
        recipient: AccountId,
        amount: MinorUnits,
        expected_sender_version: i64,
    ) -> Result<ApplyOutcome, TransferError>;

    /// Whether the journal holds an applied entry for this transfer
    async fn is_applied(&self, transfer_id: TransferId) -> Result<bool, TransferError>;
}
