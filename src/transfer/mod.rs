//! Queue-driven account transfers
//!
//! # Architecture
//!
//! ```text
//! TransferService ──create──▶ TransferRecordStore (PENDING)
//!        │
//!        └──publish──▶ TransferQueue ──▶ ConsumerWorker ──▶ TransferOrchestrator
//!                           ▲                                    │
//!                           │                         AccountLedger (atomic debit+credit)
//!               ReconciliationWorker                  TransferRecordStore (terminal)
//!               (re-drives stale PENDING)             AuditSink
//! ```
//!
//! # State Machine
//!
//! ```text
//! PENDING → COMPLETED
//!    ↓
//!  FAILED
//! ```
//!
//! Terminal states never change.
//!
//! # Safety Invariants
//!
//! 1. **Record-Before-Publish**: the PENDING record exists before the intent is on the queue
//! 2. **Atomic Apply**: debit, credit and journal entry commit together or not at all
//! 3. **Idempotency**: the ledger journal is keyed by transfer id; replays are `AlreadyApplied`
//! 4. **Ack-After-Terminal**: a delivery is acknowledged only once its record is terminal
//! 5. **Conservation**: the sum of all balances never changes; no balance goes negative

pub mod audit;
pub mod consumer;
pub mod error;
pub mod intake;
pub mod ledger;
pub mod orchestrator;
pub mod queue;
pub mod reconciler;
pub mod state;
pub mod store;
pub mod types;


// Re-exports for convenience
pub use audit::{AuditEvent, AuditSink, CsvAuditSink, TracingAuditSink};
pub use consumer::{ConsumerConfig, ConsumerStats, ConsumerWorker, Disposition};
pub use error::TransferError;
pub use intake::TransferService;
pub use ledger::{AccountLedger, ApplyOutcome, MemoryLedger, PgLedger};
pub use orchestrator::{ExecuteOutcome, RetryPolicy, TransferOrchestrator};
pub use queue::{Delivery, MemoryQueue, PgQueue, TransferQueue};
pub use reconciler::{ReconcileReport, ReconcilerConfig, ReconciliationWorker};
pub use state::TransferStatus;
pub use store::{MemoryRecordStore, PgRecordStore, TransferRecordStore};
pub use types::{Account, AccountId, FailureReason, MinorUnits, TransferId, TransferIntent, TransferRecord};
