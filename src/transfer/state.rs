//! Transfer Lifecycle States
//!
//! A transfer record moves `PENDING → COMPLETED` or `PENDING → FAILED`.
//! Both outcomes are terminal.

use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a transfer record
///
/// State IDs are stored in PostgreSQL as SMALLINT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum TransferStatus {
    /// Recorded at intake, waiting for (or undergoing) execution
    Pending = 0,

    /// Terminal: both balance changes committed
    Completed = 40,

    /// Terminal: no balance changed, `failure_reason` says why
    Failed = -10,
}

impl TransferStatus {
    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }

    /// Get the numeric state ID for PostgreSQL storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from PostgreSQL state ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TransferStatus::Pending),
            40 => Some(TransferStatus::Completed),
            -10 => Some(TransferStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(TransferStatus::Pending),
            "completed" => Ok(TransferStatus::Completed),
            "failed" => Ok(TransferStatus::Failed),
            other => Err(format!("unknown transfer status: {}", other)),
        }
    }
}

impl TryFrom<i16> for TransferStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        TransferStatus::from_id(value).ok_or(())
    }
}
