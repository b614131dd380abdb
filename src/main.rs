//! Transfer Engine - queue-driven account transfers
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌────────────┐    ┌──────────────┐
//! │  Intake  │───▶│  Queue   │───▶│ Consumers  │───▶│ Ledger/Store │
//! │ (submit) │    │ (Pg/mem) │    │ (N tasks)  │    │ (PostgreSQL) │
//! └──────────┘    └──────────┘    └────────────┘    └──────────────┘
//!                      ▲                                   │
//!                      └────────── Reconciler ◀────────────┘
//! ```
//!
//! Usage:
//!   transfer_engine [--env dev]                          run consumers + reconciler
//!   transfer_engine --submit <sender> <recipient> <amount>
//!   transfer_engine --status <transfer_id>
//!   transfer_engine --history <account_id>
//!   transfer_engine --open-account <account_id> <balance>

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::watch;

use transfer_engine::config::AppConfig;
use transfer_engine::db::Database;
use transfer_engine::transfer::{
    AccountId, AccountLedger, AuditSink, ConsumerStats, ConsumerWorker, CsvAuditSink, PgLedger,
    PgQueue, PgRecordStore, ReconciliationWorker, TracingAuditSink, TransferId,
    TransferOrchestrator, TransferService,
};

// ============================================================
// ARGUMENTS
// ============================================================

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Values following `flag`, if the flag is present with enough arguments
fn get_flag_values(flag: &str, count: usize) -> Option<Vec<String>> {
    let args: Vec<String> = std::env::args().collect();
    let pos = args.iter().position(|a| a == flag)?;
    let values = args.get(pos + 1..pos + 1 + count)?;
    Some(values.to_vec())
}

fn parse_i64(value: &str, what: &str) -> Result<i64> {
    value
        .parse()
        .with_context(|| format!("invalid {}: {}", what, value))
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = transfer_engine::logging::init_logging(&config);

    tracing::info!(
        env = %env,
        git_hash = env!("TRANSFER_ENGINE_GIT_HASH"),
        "Starting transfer engine"
    );

    let Some(url) = config.postgres_url.clone() else {
        bail!("postgres_url is not configured (set it in config/{}.yaml or DATABASE_URL)", env);
    };
    let db = Database::connect(&url, config.max_connections)
        .await
        .context("connecting to PostgreSQL")?;
    db.health_check().await?;
    db.init_schema().await?;

    let pool = db.pool().clone();
    let ledger = Arc::new(PgLedger::new(pool.clone()));
    let store = Arc::new(PgRecordStore::new(pool.clone()));
    let queue = Arc::new(PgQueue::new(
        pool,
        config.queue.name.clone(),
        config.visibility_timeout(),
        config.poll_interval(),
    ));

    if let Some(values) = get_flag_values("--open-account", 2) {
        let id = AccountId(parse_i64(&values[0], "account id")?);
        let balance = parse_i64(&values[1], "balance")?;
        ledger.open_account(id, balance).await?;
        let account = ledger
            .get_account(id)
            .await?
            .with_context(|| format!("account {} vanished after open", id))?;
        println!("{} balance={} version={}", account.id, account.balance, account.version);
        return Ok(());
    }

    let service = TransferService::new(store.clone(), queue.clone());

    if let Some(values) = get_flag_values("--submit", 3) {
        let sender = AccountId(parse_i64(&values[0], "sender")?);
        let recipient = AccountId(parse_i64(&values[1], "recipient")?);
        let amount = parse_i64(&values[2], "amount")?;
        let transfer_id = service.submit(sender, recipient, amount).await?;
        println!("{}", transfer_id);
        return Ok(());
    }

    if let Some(values) = get_flag_values("--status", 1) {
        let transfer_id: TransferId = values[0]
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid transfer id {}: {}", values[0], e))?;
        match service.get_record(transfer_id).await? {
            Some(record) => {
                let reason = record.failure_reason.as_deref().unwrap_or("-");
                println!("{} reason={}", record, reason);
            }
            None => bail!("transfer {} not found", transfer_id),
        }
        return Ok(());
    }

    if let Some(values) = get_flag_values("--history", 1) {
        let account = AccountId(parse_i64(&values[0], "account id")?);
        for record in service.history(account).await? {
            println!("{} {}", record.created_at.to_rfc3339(), record);
        }
        return Ok(());
    }

    run_workers(&config, ledger, store, queue).await
}

async fn run_workers(
    config: &AppConfig,
    ledger: Arc<PgLedger>,
    store: Arc<PgRecordStore>,
    queue: Arc<PgQueue>,
) -> Result<()> {
    let audit: Arc<dyn AuditSink> = match &config.audit_file {
        Some(path) => Arc::new(
            CsvAuditSink::open(path).with_context(|| format!("opening audit file {}", path))?,
        ),
        None => Arc::new(TracingAuditSink),
    };

    let orchestrator = Arc::new(
        TransferOrchestrator::new(ledger.clone(), store.clone())
            .with_audit(audit.clone())
            .with_retry_policy(config.retry_policy())
            .with_op_timeout(config.op_timeout()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stats = Arc::new(ConsumerStats::default());
    let mut handles = Vec::new();

    for id in 0..config.worker.consumers.max(1) {
        let worker = ConsumerWorker::new(
            id,
            queue.clone(),
            orchestrator.clone(),
            config.consumer_config(),
            stats.clone(),
        );
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { worker.run(rx).await }));
    }

    if config.reconciler.enabled {
        let reconciler =
            ReconciliationWorker::new(ledger, store, queue, config.reconciler_settings())
                .with_audit(audit);
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { reconciler.run(rx).await }));
    }

    tracing::info!(consumers = config.worker.consumers.max(1), "Workers running; Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown requested");
    shutdown_tx.send(true)?;

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }

    let snapshot = stats.snapshot();
    tracing::info!(
        completed = snapshot.completed,
        failed = snapshot.failed,
        duplicates = snapshot.duplicates,
        requeued = snapshot.requeued,
        dead_lettered = snapshot.dead_lettered,
        "Transfer engine stopped"
    );
    Ok(())
}
