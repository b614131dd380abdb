//! Transfer Error Types

use thiserror::Error;

use super::types::AccountId;

/// Transfer error types
///
/// Business outcomes of a ledger mutation (insufficient funds, version
/// conflict, missing account) are reported through `ApplyOutcome`; this enum
/// covers validation, lookup and infrastructure failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Sender and recipient account cannot be the same")]
    SameAccount,

    #[error("Amount would cause overflow")]
    Overflow,

    // === Lookup Errors ===
    #[error("Account already exists: {0}")]
    AccountExists(AccountId),

    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    // === Idempotency Errors ===
    #[error("Duplicate transfer id: {0}")]
    DuplicateTransferId(String),

    // === Wire Errors ===
    #[error("Malformed transfer payload: {0}")]
    MalformedPayload(String),

    // === System Errors ===
    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TransferError {
    /// Get the error code for API responses and structured logs
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::InvalidAmount => "INVALID_AMOUNT",
            TransferError::SameAccount => "SAME_ACCOUNT",
            TransferError::Overflow => "OVERFLOW",
            TransferError::AccountExists(_) => "ACCOUNT_EXISTS",
            TransferError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            TransferError::DuplicateTransferId(_) => "DUPLICATE_TRANSFER_ID",
            TransferError::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            TransferError::Database(_) => "DATABASE_ERROR",
            TransferError::Queue(_) => "QUEUE_ERROR",
            TransferError::Timeout(_) => "TIMEOUT",
            TransferError::Io(_) => "IO_ERROR",
            TransferError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Rejected at intake, never enqueued
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TransferError::InvalidAmount | TransferError::SameAccount | TransferError::Overflow
        )
    }

    /// Infrastructure failure: the delivery must stay unacknowledged so the
    /// broker redelivers it. Never recorded as a `failed` transfer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::Database(_) | TransferError::Queue(_) | TransferError::Timeout(_)
        )
    }
}

impl From<sqlx::Error> for TransferError {
    fn from(e: sqlx::Error) -> Self {
        TransferError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        TransferError::MalformedPayload(e.to_string())
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::Io(e.to_string())
    }
}
