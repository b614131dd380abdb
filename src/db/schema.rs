//! Idempotent DDL for the transfer tables
//!
//! Statements are executed in order by [`super::Database::init_schema`].

pub const CREATE_ACCOUNTS: &str = r#"
CREATE TABLE IF NOT EXISTS accounts_tb (
    account_id  BIGINT PRIMARY KEY,
    balance     BIGINT NOT NULL CHECK (balance >= 0),
    version     BIGINT NOT NULL DEFAULT 0,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// One row per applied transfer; written in the same transaction as the balances
pub const CREATE_LEDGER_JOURNAL: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_journal_tb (
    transfer_id   VARCHAR(26) PRIMARY KEY,
    sender_id     BIGINT NOT NULL,
    recipient_id  BIGINT NOT NULL,
    amount        BIGINT NOT NULL CHECK (amount > 0),
    applied_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// status: 0 = PENDING, 40 = COMPLETED, -10 = FAILED
pub const CREATE_TRANSFERS: &str = r#"
CREATE TABLE IF NOT EXISTS transfers_tb (
    transfer_id     VARCHAR(26) PRIMARY KEY,
    sender_id       BIGINT NOT NULL,
    recipient_id    BIGINT NOT NULL,
    amount          BIGINT NOT NULL CHECK (amount > 0),
    status          SMALLINT NOT NULL DEFAULT 0,
    failure_reason  TEXT,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CHECK (sender_id <> recipient_id)
)
"#;

pub const CREATE_TRANSFERS_SENDER_IDX: &str =
    "CREATE INDEX IF NOT EXISTS idx_transfers_sender ON transfers_tb (sender_id, created_at DESC)";

pub const CREATE_TRANSFERS_RECIPIENT_IDX: &str = "CREATE INDEX IF NOT EXISTS idx_transfers_recipient \
     ON transfers_tb (recipient_id, created_at DESC)";

pub const CREATE_TRANSFERS_STALE_IDX: &str =
    "CREATE INDEX IF NOT EXISTS idx_transfers_stale ON transfers_tb (status, updated_at)";

pub const CREATE_QUEUE: &str = r#"
CREATE TABLE IF NOT EXISTS transfer_queue_tb (
    message_id      BIGSERIAL PRIMARY KEY,
    queue_name      VARCHAR(64) NOT NULL,
    transfer_id     VARCHAR(26),
    payload         TEXT NOT NULL,
    delivery_count  INTEGER NOT NULL DEFAULT 0,
    visible_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    enqueued_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_QUEUE_IDX: &str =
    "CREATE INDEX IF NOT EXISTS idx_transfer_queue_visible ON transfer_queue_tb (queue_name, visible_at, message_id)";

/// Lets the reconciler see whether a transfer still has a message queued
pub const CREATE_QUEUE_TRANSFER_IDX: &str =
    "CREATE INDEX IF NOT EXISTS idx_transfer_queue_transfer ON transfer_queue_tb (queue_name, transfer_id)";

pub const CREATE_DEAD_LETTERS: &str = r#"
CREATE TABLE IF NOT EXISTS transfer_dead_letters_tb (
    message_id      BIGINT PRIMARY KEY,
    queue_name      VARCHAR(64) NOT NULL,
    payload         TEXT NOT NULL,
    delivery_count  INTEGER NOT NULL,
    reason          TEXT NOT NULL,
    dead_at         TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const ALL: &[&str] = &[
    CREATE_ACCOUNTS,
    CREATE_LEDGER_JOURNAL,
    CREATE_TRANSFERS,
    CREATE_TRANSFERS_SENDER_IDX,
    CREATE_TRANSFERS_RECIPIENT_IDX,
    CREATE_TRANSFERS_STALE_IDX,
    CREATE_QUEUE,
    CREATE_QUEUE_IDX,
    CREATE_QUEUE_TRANSFER_IDX,
    CREATE_DEAD_LETTERS,
];
