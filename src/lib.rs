//! Transfer Engine - queue-driven account-to-account transfers
//!
//! Transfers are accepted at intake, persisted as PENDING, published to a
//! durable queue and executed by consumers against an account ledger whose
//! debit+credit is one atomic unit.
//!
//! # Modules
//!
//! - [`transfer`] - Ledger, record store, queue, orchestrator and workers
//! - [`config`] - YAML application configuration
//! - [`logging`] - tracing subscriber setup
//! - [`db`] - PostgreSQL pool and schema bootstrap

pub mod config;
pub mod db;
pub mod logging;
pub mod transfer;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use transfer::{
    Account, AccountId, AccountLedger, ExecuteOutcome, MemoryLedger, MemoryQueue,
    MemoryRecordStore, TransferError, TransferId, TransferIntent, TransferOrchestrator,
    TransferQueue, TransferRecord, TransferRecordStore, TransferService, TransferStatus,
};
