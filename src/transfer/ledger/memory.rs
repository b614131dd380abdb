//! In-process ledger
//!
//! All mutation happens under one lock, which gives the same atomicity as a
//! database transaction for a single process. Used by tests and embedded runs.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{AccountLedger, ApplyOutcome};
use crate::transfer::error::TransferError;
use crate::transfer::types::{Account, AccountId, MinorUnits, TransferId};

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<AccountId, Account>,
    /// Ids of applied transfers, written with the balance change
    journal: HashSet<TransferId>,
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    /// Simulated outage: every call fails with a transient database error
    unavailable: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ledger pre-seeded with `(id, balance)` pairs
    pub fn with_accounts(accounts: impl IntoIterator<Item = (i64, MinorUnits)>) -> Self {
        let ledger = Self::new();
        {
            let mut state = ledger.lock();
            for (id, balance) in accounts {
                let id = AccountId(id);
                state.accounts.insert(id, Account::new(id, balance.max(0)));
            }
        }
        ledger
    }

    /// Open a new account at version 0. An existing account is never touched.
    pub fn open_account(&self, id: AccountId, balance: MinorUnits) -> Result<(), TransferError> {
        match self.lock().accounts.entry(id) {
            Entry::Occupied(_) => Err(TransferError::AccountExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(Account::new(id, balance.max(0)));
                Ok(())
            }
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Sum of all balances (conservation checks)
    pub fn total_balance(&self) -> i128 {
        self.lock()
            .accounts
            .values()
            .map(|a| a.balance as i128)
            .sum()
    }

    pub fn journal_len(&self) -> usize {
        self.lock().journal.len()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // State is only mutated after every check passed, so a poisoned
        // guard still holds consistent balances.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), TransferError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TransferError::Database(
                "ledger unavailable (simulated outage)".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountLedger for MemoryLedger {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, TransferError> {
        self.check_available()?;
        Ok(self.lock().accounts.get(&id).copied())
    }

    async fn apply_transfer(
        &self,
        transfer_id: TransferId,
        sender: AccountId,
        recipient: AccountId,
        amount: MinorUnits,
        expected_sender_version: i64,
    ) -> Result<ApplyOutcome, TransferError> {
        self.check_available()?;
        if amount <= 0 {
            return Err(TransferError::InvalidAmount);
        }
        if sender == recipient {
            return Err(TransferError::SameAccount);
        }

        let mut state = self.lock();

        if state.journal.contains(&transfer_id) {
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let Some(from) = state.accounts.get(&sender).copied() else {
            return Ok(ApplyOutcome::NotFound(sender));
        };
        let Some(to) = state.accounts.get(&recipient).copied() else {
            return Ok(ApplyOutcome::NotFound(recipient));
        };

        if from.version != expected_sender_version {
            return Ok(ApplyOutcome::VersionConflict);
        }
        if from.balance < amount {
            return Ok(ApplyOutcome::InsufficientFunds);
        }

        let credited = to.balance.checked_add(amount).ok_or(TransferError::Overflow)?;

        state.accounts.insert(
            sender,
            Account {
                balance: from.balance - amount,
                version: from.version + 1,
                ..from
            },
        );
        state.accounts.insert(
            recipient,
            Account {
                balance: credited,
                version: to.version + 1,
                ..to
            },
        );
        state.journal.insert(transfer_id);

        Ok(ApplyOutcome::Applied)
    }

    async fn is_applied(&self, transfer_id: TransferId) -> Result<bool, TransferError> {
        self.check_available()?;
        Ok(self.lock().journal.contains(&transfer_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_apply_moves_funds_and_bumps_versions() {
        let ledger = MemoryLedger::with_accounts([(1, 1000), (2, 500)]);
        let id = TransferId::new();

        let outcome = ledger
            .apply_transfer(id, AccountId(1), AccountId(2), 300, 0)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        assert_eq!(ledger.get_balance(AccountId(1)).await.unwrap(), Some((700, 1)));
        assert_eq!(ledger.get_balance(AccountId(2)).await.unwrap(), Some((800, 1)));
        assert!(ledger.is_applied(id).await.unwrap());
        assert_eq!(ledger.total_balance(), 1500);
    }

    #[tokio::test]
    async fn test_replay_is_detected_by_journal() {
        let ledger = MemoryLedger::with_accounts([(1, 1000), (2, 500)]);
        let id = TransferId::new();

        ledger
            .apply_transfer(id, AccountId(1), AccountId(2), 50, 0)
            .await
            .unwrap();
        // Even with the fresh version, the same id must not move money twice
        let outcome = ledger
            .apply_transfer(id, AccountId(1), AccountId(2), 50, 1)
            .await
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::AlreadyApplied);
        assert_eq!(ledger.get_balance(AccountId(1)).await.unwrap(), Some((950, 1)));
        assert_eq!(ledger.journal_len(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_balances() {
        let ledger = MemoryLedger::with_accounts([(1, 100), (2, 500)]);

        let outcome = ledger
            .apply_transfer(TransferId::new(), AccountId(1), AccountId(2), 300, 0)
            .await
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::InsufficientFunds);
        assert_eq!(ledger.get_balance(AccountId(1)).await.unwrap(), Some((100, 0)));
        assert_eq!(ledger.get_balance(AccountId(2)).await.unwrap(), Some((500, 0)));
        assert_eq!(ledger.journal_len(), 0);
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let ledger = MemoryLedger::with_accounts([(1, 1000), (2, 0)]);
        ledger
            .apply_transfer(TransferId::new(), AccountId(1), AccountId(2), 10, 0)
            .await
            .unwrap();

        let outcome = ledger
            .apply_transfer(TransferId::new(), AccountId(1), AccountId(2), 10, 0)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::VersionConflict);
        assert_eq!(ledger.get_balance(AccountId(1)).await.unwrap(), Some((990, 1)));
    }

    #[tokio::test]
    async fn test_missing_accounts() {
        let ledger = MemoryLedger::with_accounts([(1, 1000)]);

        let outcome = ledger
            .apply_transfer(TransferId::new(), AccountId(1), AccountId(9), 10, 0)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::NotFound(AccountId(9)));

        let outcome = ledger
            .apply_transfer(TransferId::new(), AccountId(8), AccountId(1), 10, 0)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::NotFound(AccountId(8)));
        assert_eq!(ledger.total_balance(), 1000);
    }

    #[tokio::test]
    async fn test_recipient_overflow_is_rejected_atomically() {
        let ledger = MemoryLedger::with_accounts([(1, 10), (2, i64::MAX)]);

        let result = ledger
            .apply_transfer(TransferId::new(), AccountId(1), AccountId(2), 5, 0)
            .await;
        assert_eq!(result, Err(TransferError::Overflow));
        assert_eq!(ledger.get_balance(AccountId(1)).await.unwrap(), Some((10, 0)));
    }

    #[tokio::test]
    async fn test_open_account_never_resets_existing_balance() {
        let ledger = MemoryLedger::with_accounts([(1, 1000), (2, 500)]);
        ledger
            .apply_transfer(TransferId::new(), AccountId(1), AccountId(2), 300, 0)
            .await
            .unwrap();

        let result = ledger.open_account(AccountId(2), 0);
        assert_eq!(result, Err(TransferError::AccountExists(AccountId(2))));
        assert_eq!(ledger.get_balance(AccountId(2)).await.unwrap(), Some((800, 1)));
        assert_eq!(ledger.total_balance(), 1500);

        ledger.open_account(AccountId(3), 25).unwrap();
        assert_eq!(ledger.get_balance(AccountId(3)).await.unwrap(), Some((25, 0)));
        assert_eq!(ledger.total_balance(), 1525);
    }

    #[tokio::test]
    async fn test_simulated_outage_is_transient() {
        let ledger = MemoryLedger::with_accounts([(1, 10)]);
        ledger.set_unavailable(true);

        let err = ledger.get_account(AccountId(1)).await.unwrap_err();
        assert!(err.is_transient());

        ledger.set_unavailable(false);
        assert!(ledger.get_account(AccountId(1)).await.unwrap().is_some());
    }
}
