//! Scenario tests through the public API: submit, drain with consumers, inspect.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use transfer_engine::transfer::{
    AccountId, AccountLedger, ConsumerConfig, ConsumerStats, ConsumerWorker, MemoryLedger,
    MemoryQueue, MemoryRecordStore, RetryPolicy, TransferId, TransferOrchestrator, TransferQueue,
    TransferService, TransferStatus,
};

struct Engine {
    ledger: Arc<MemoryLedger>,
    queue: MemoryQueue,
    service: TransferService,
    orchestrator: Arc<TransferOrchestrator>,
}

impl Engine {
    fn with_accounts(accounts: &[(i64, i64)]) -> Self {
        let ledger = Arc::new(MemoryLedger::with_accounts(accounts.iter().copied()));
        let store = Arc::new(MemoryRecordStore::new());
        let queue = MemoryQueue::new();
        let service = TransferService::new(store.clone(), Arc::new(queue.clone()));
        let orchestrator = Arc::new(
            TransferOrchestrator::new(ledger.clone(), store).with_retry_policy(RetryPolicy {
                max_attempts: 3,
                backoff_base: Duration::from_millis(1),
                backoff_cap: Duration::from_millis(4),
            }),
        );
        Self {
            ledger,
            queue,
            service,
            orchestrator,
        }
    }

    async fn drain(&self, consumers: usize) {
        self.queue.close();
        let (_tx, rx) = watch::channel(false);
        let stats = Arc::new(ConsumerStats::default());
        let mut handles = Vec::new();
        for id in 0..consumers {
            let worker = ConsumerWorker::new(
                id,
                Arc::new(self.queue.clone()),
                self.orchestrator.clone(),
                ConsumerConfig::default(),
                stats.clone(),
            );
            let rx = rx.clone();
            handles.push(tokio::spawn(async move { worker.run(rx).await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    async fn balance(&self, id: i64) -> i64 {
        self.ledger
            .get_balance(AccountId(id))
            .await
            .unwrap()
            .map(|(balance, _)| balance)
            .unwrap()
    }

    async fn status(&self, id: TransferId) -> TransferStatus {
        self.service.get_status(id).await.unwrap()
    }
}

#[tokio::test]
async fn scenario_transfer_300_from_1000_to_500() {
    let engine = Engine::with_accounts(&[(1, 1000), (2, 500)]);
    let id = engine
        .service
        .submit(AccountId(1), AccountId(2), 300)
        .await
        .unwrap();

    engine.drain(1).await;

    assert_eq!(engine.balance(1).await, 700);
    assert_eq!(engine.balance(2).await, 800);
    assert_eq!(engine.status(id).await, TransferStatus::Completed);
}

#[tokio::test]
async fn scenario_overdraft_is_refused() {
    let engine = Engine::with_accounts(&[(1, 100), (2, 500)]);
    let id = engine
        .service
        .submit(AccountId(1), AccountId(2), 300)
        .await
        .unwrap();

    engine.drain(1).await;

    assert_eq!(engine.balance(1).await, 100);
    assert_eq!(engine.balance(2).await, 500);
    assert_eq!(engine.status(id).await, TransferStatus::Failed);
    let record = engine.service.get_record(id).await.unwrap().unwrap();
    assert!(record.failure_reason.unwrap().contains("insufficient"));
}

#[tokio::test]
async fn scenario_same_id_delivered_twice() {
    let engine = Engine::with_accounts(&[(1, 1000), (2, 500)]);
    let id = TransferId::new();
    engine
        .service
        .submit_with_id(id, AccountId(1), AccountId(2), 50)
        .await
        .unwrap();
    // Client retry with the same id is absorbed at intake
    engine
        .service
        .submit_with_id(id, AccountId(1), AccountId(2), 50)
        .await
        .unwrap();
    // ...and a broker-level duplicate is absorbed at execution
    let intent = engine.service.get_record(id).await.unwrap().unwrap().to_intent();
    engine.queue.publish(&intent).await.unwrap();

    engine.drain(1).await;

    assert_eq!(engine.balance(1).await, 950);
    assert_eq!(engine.balance(2).await, 550);
    assert_eq!(engine.status(id).await, TransferStatus::Completed);
}

#[tokio::test]
async fn scenario_unknown_recipient() {
    let engine = Engine::with_accounts(&[(1, 1000)]);
    let id = engine
        .service
        .submit(AccountId(1), AccountId(77), 10)
        .await
        .unwrap();

    engine.drain(1).await;

    assert_eq!(engine.status(id).await, TransferStatus::Failed);
    assert_eq!(engine.balance(1).await, 1000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_concurrent_debits_of_80_from_100() {
    for _ in 0..20 {
        let engine = Engine::with_accounts(&[(1, 100), (2, 0), (3, 0)]);
        let first = engine
            .service
            .submit(AccountId(1), AccountId(2), 80)
            .await
            .unwrap();
        let second = engine
            .service
            .submit(AccountId(1), AccountId(3), 80)
            .await
            .unwrap();

        engine.drain(2).await;

        let outcomes = [engine.status(first).await, engine.status(second).await];
        assert_eq!(
            outcomes
                .iter()
                .filter(|s| **s == TransferStatus::Completed)
                .count(),
            1
        );
        assert!(outcomes.contains(&TransferStatus::Failed));
        assert_eq!(engine.balance(1).await, 20);
        assert_eq!(engine.ledger.total_balance(), 100);
    }
}

#[tokio::test]
async fn scenario_history_lists_both_directions_newest_first() {
    let engine = Engine::with_accounts(&[(1, 1000), (2, 500)]);
    let first = engine
        .service
        .submit(AccountId(1), AccountId(2), 10)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    let second = engine
        .service
        .submit(AccountId(2), AccountId(1), 20)
        .await
        .unwrap();

    engine.drain(1).await;

    let history = engine.service.history(AccountId(1)).await.unwrap();
    let ids: Vec<TransferId> = history.iter().map(|r| r.transfer_id).collect();
    assert_eq!(ids, vec![second, first]);
    assert!(history.iter().all(|r| r.status == TransferStatus::Completed));
}
