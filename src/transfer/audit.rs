//! Transfer audit events
//!
//! Emitted once per terminal outcome, by the orchestrator or by the
//! reconciler when it completes a journal-proven transfer. Sinks are side
//! effects only: callers log and swallow any sink error.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use super::error::TransferError;
use super::state::TransferStatus;
use super::types::{AccountId, MinorUnits, TransferId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub transfer_id: TransferId,
    pub sender: AccountId,
    pub recipient: AccountId,
    pub amount: MinorUnits,
    pub outcome: TransferStatus,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<(), TransferError>;
}

/// Logs every event on the `audit` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), TransferError> {
        info!(
            target: "audit",
            transfer_id = %event.transfer_id,
            sender = %event.sender,
            recipient = %event.recipient,
            amount = event.amount,
            outcome = %event.outcome,
            reason = event.reason.as_deref().unwrap_or(""),
            "TRANSFER"
        );
        Ok(())
    }
}

/// Appends events to a CSV journal
///
/// Header: `at,transfer_id,sender,recipient,amount,outcome,reason`
pub struct CsvAuditSink {
    file: Mutex<File>,
}

impl CsvAuditSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref();
        let fresh = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if fresh {
            writeln!(file, "at,transfer_id,sender,recipient,amount,outcome,reason")?;
        }
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl AuditSink for CsvAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), TransferError> {
        let reason = event.reason.as_deref().unwrap_or("").replace(',', ";");
        let mut file = self
            .file
            .lock()
            .map_err(|_| TransferError::Io("audit file lock poisoned".to_string()))?;
        writeln!(
            file,
            "{},{},{},{},{},{},{}",
            event.at.to_rfc3339(),
            event.transfer_id,
            event.sender,
            event.recipient,
            event.amount,
            event.outcome,
            reason
        )?;
        Ok(())
    }
}
