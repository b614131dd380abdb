//! Transfer Core Types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use super::error::TransferError;
use super::state::TransferStatus;

/// Transfer ID - ULID-based idempotency key
///
/// Generated at intake, carried on the queue and used as the primary key of
/// the transfer record and the ledger journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(ulid::Ulid);

impl TransferId {
    /// Generate a new unique TransferId
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Account identity (`accounts_tb.account_id`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(pub i64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for AccountId {
    fn from(id: i64) -> Self {
        AccountId(id)
    }
}

/// Amount in minor currency units (cents)
pub type MinorUnits = i64;

/// Account row as seen by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    /// Balance in minor units, never negative
    pub balance: MinorUnits,
    /// Bumped on every mutation (optimistic concurrency)
    pub version: i64,
}

impl Account {
    pub fn new(id: AccountId, balance: MinorUnits) -> Self {
        Self {
            id,
            balance,
            version: 0,
        }
    }
}

/// Immutable description of a requested transfer (the queue payload)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferIntent {
    pub transfer_id: TransferId,
    pub sender_id: AccountId,
    pub recipient_id: AccountId,
    pub amount: MinorUnits,
    pub created_at: DateTime<Utc>,
}

impl TransferIntent {
    /// Build a validated intent with a fresh transfer id
    pub fn new(
        sender_id: AccountId,
        recipient_id: AccountId,
        amount: MinorUnits,
    ) -> Result<Self, TransferError> {
        Self::with_id(TransferId::new(), sender_id, recipient_id, amount)
    }

    /// Build a validated intent with a caller-supplied transfer id
    pub fn with_id(
        transfer_id: TransferId,
        sender_id: AccountId,
        recipient_id: AccountId,
        amount: MinorUnits,
    ) -> Result<Self, TransferError> {
        let intent = Self {
            transfer_id,
            sender_id,
            recipient_id,
            amount,
            created_at: Utc::now(),
        };
        intent.validate()?;
        Ok(intent)
    }

    /// Reject non-positive amounts and self-transfers
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.amount <= 0 {
            return Err(TransferError::InvalidAmount);
        }
        if self.sender_id == self.recipient_id {
            return Err(TransferError::SameAccount);
        }
        Ok(())
    }
}

impl fmt::Display for TransferIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Intent[{}] {} -> {} amount={}",
            self.transfer_id, self.sender_id, self.recipient_id, self.amount
        )
    }
}

/// Why a transfer ended in `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    SenderNotFound,
    RecipientNotFound,
    InsufficientBalance,
    /// Version-conflict retry budget exhausted
    Contention,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::SenderNotFound => "sender not found",
            FailureReason::RecipientNotFound => "recipient not found",
            FailureReason::InsufficientBalance => "insufficient balance",
            FailureReason::Contention => "contention",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer record stored in `transfers_tb` (the audit trail)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub transfer_id: TransferId,
    pub sender_id: AccountId,
    pub recipient_id: AccountId,
    pub amount: MinorUnits,
    pub status: TransferStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    /// Create a new record in PENDING state for an intent
    pub fn pending(intent: &TransferIntent) -> Self {
        let now = Utc::now();
        Self {
            transfer_id: intent.transfer_id,
            sender_id: intent.sender_id,
            recipient_id: intent.recipient_id,
            amount: intent.amount,
            status: TransferStatus::Pending,
            failure_reason: None,
            created_at: intent.created_at,
            updated_at: now,
        }
    }

    /// Rebuild the queue intent (used when re-driving stale records)
    pub fn to_intent(&self) -> TransferIntent {
        TransferIntent {
            transfer_id: self.transfer_id,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            amount: self.amount,
            created_at: self.created_at,
        }
    }

    /// Same parties and amount as the intent
    pub fn matches(&self, intent: &TransferIntent) -> bool {
        self.transfer_id == intent.transfer_id
            && self.sender_id == intent.sender_id
            && self.recipient_id == intent.recipient_id
            && self.amount == intent.amount
    }
}

impl fmt::Display for TransferRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transfer[{}] {} -> {} amount={} status={}",
            self.transfer_id, self.sender_id, self.recipient_id, self.amount, self.status
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_id_roundtrip() {
        let id = TransferId::new();
        let parsed: TransferId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-ulid".parse::<TransferId>().is_err());
    }

    #[test]
    fn test_intent_validation() {
        assert!(TransferIntent::new(AccountId(1), AccountId(2), 300).is_ok());
        assert_eq!(
            TransferIntent::new(AccountId(1), AccountId(2), 0),
            Err(TransferError::InvalidAmount)
        );
        assert_eq!(
            TransferIntent::new(AccountId(1), AccountId(2), -5),
            Err(TransferError::InvalidAmount)
        );
        assert_eq!(
            TransferIntent::new(AccountId(1), AccountId(1), 10),
            Err(TransferError::SameAccount)
        );
    }

    #[test]
    fn test_pending_record_from_intent() {
        let intent = TransferIntent::new(AccountId(1), AccountId(2), 300).unwrap();
        let record = TransferRecord::pending(&intent);

        assert_eq!(record.status, TransferStatus::Pending);
        assert!(record.failure_reason.is_none());
        assert!(record.matches(&intent));
        assert_eq!(record.to_intent(), intent);
    }

    #[test]
    fn test_record_mismatch() {
        let intent = TransferIntent::new(AccountId(1), AccountId(2), 300).unwrap();
        let record = TransferRecord::pending(&intent);

        let mut tampered = intent.clone();
        tampered.amount = 3000;
        assert!(!record.matches(&tampered));
    }
}
