//! Consumer Worker
//!
//! Drains the transfer queue and runs the orchestrator for each delivery.
//!
//! | result of handling            | settlement     |
//! |-------------------------------|----------------|
//! | terminal outcome              | ack            |
//! | transient error / timeout     | nack (requeue) |
//! | malformed payload             | dead letter    |
//! | payload disagrees with record | dead letter    |
//! | delivery limit exceeded       | dead letter    |
//! | shutdown while in flight      | nack (requeue) |

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::orchestrator::{ExecuteOutcome, TransferOrchestrator};
use super::queue::{AckHandle, Delivery, TransferQueue, decode_intent, delivery_stream};

/// Counters shared by all workers (lock-free)
#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub duplicates: AtomicU64,
    pub requeued: AtomicU64,
    pub dead_lettered: AtomicU64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStatsSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

/// How a single delivery was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Acked(ExecuteOutcome),
    Requeued(String),
    DeadLettered(String),
    /// Shutdown interrupted execution; the delivery was nacked
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Deliveries beyond this count are dead-lettered instead of executed
    pub max_deliveries: u32,
    /// Pause after a failed consume before polling again
    pub error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_deliveries: 10,
            error_backoff: Duration::from_millis(500),
        }
    }
}

pub struct ConsumerWorker {
    id: usize,
    queue: Arc<dyn TransferQueue>,
    orchestrator: Arc<TransferOrchestrator>,
    config: ConsumerConfig,
    stats: Arc<ConsumerStats>,
}

impl ConsumerWorker {
    pub fn new(
        id: usize,
        queue: Arc<dyn TransferQueue>,
        orchestrator: Arc<TransferOrchestrator>,
        config: ConsumerConfig,
        stats: Arc<ConsumerStats>,
    ) -> Self {
        Self {
            id,
            queue,
            orchestrator,
            config,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<ConsumerStats> {
        &self.stats
    }

    /// Run until the shutdown flag flips to `true` or the queue closes
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker = self.id,
            queue = self.queue.name(),
            max_deliveries = self.config.max_deliveries,
            "Starting transfer consumer"
        );

        let mut deliveries = delivery_stream(self.queue.clone());

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                Ok(()) = shutdown.changed() => continue,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    if let Disposition::Interrupted = self.process(delivery, &mut shutdown).await {
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!(worker = self.id, error = %e, "Consume failed - backing off");
                    tokio::select! {
                        Ok(()) = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
                None => {
                    info!(worker = self.id, "Queue closed");
                    break;
                }
            }
        }

        info!(worker = self.id, "Transfer consumer stopped");
    }

    /// Handle one delivery without shutdown supervision
    pub async fn handle(&self, delivery: Delivery) -> Disposition {
        let (_tx, mut never) = watch::channel(false);
        self.process(delivery, &mut never).await
    }

    async fn process(
        &self,
        delivery: Delivery,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Disposition {
        let Delivery {
            payload,
            delivery_count,
            handle,
        } = delivery;

        if delivery_count > self.config.max_deliveries {
            let reason = format!("delivery limit exceeded ({} attempts)", delivery_count);
            warn!(worker = self.id, delivery_count, "Dead-lettering over-delivered message");
            return self.dead_letter(handle, reason).await;
        }

        let intent = match decode_intent(&payload) {
            Ok(intent) => intent,
            Err(e) => {
                warn!(worker = self.id, code = e.code(), error = %e, "Malformed transfer payload");
                return self.dead_letter(handle, e.to_string()).await;
            }
        };

        if delivery_count > 1 {
            debug!(
                worker = self.id,
                transfer_id = %intent.transfer_id,
                delivery_count,
                "Redelivered transfer"
            );
        }

        let result = tokio::select! {
            Ok(()) = shutdown.changed() => None,
            result = self.orchestrator.execute(&intent) => Some(result),
        };

        match result {
            None => {
                info!(
                    worker = self.id,
                    transfer_id = %intent.transfer_id,
                    "Shutdown during execution - returning message to queue"
                );
                if let Err(e) = handle.nack().await {
                    error!(worker = self.id, error = %e, "Nack on shutdown failed");
                }
                self.stats.requeued.fetch_add(1, Ordering::Relaxed);
                Disposition::Interrupted
            }
            Some(Ok(outcome)) => {
                match &outcome {
                    ExecuteOutcome::Completed => &self.stats.completed,
                    ExecuteOutcome::Failed(_) => &self.stats.failed,
                    ExecuteOutcome::AlreadyTerminal(_) => &self.stats.duplicates,
                }
                .fetch_add(1, Ordering::Relaxed);

                if let Err(e) = handle.ack().await {
                    // Redelivery is harmless: the record is already terminal
                    error!(
                        worker = self.id,
                        transfer_id = %intent.transfer_id,
                        error = %e,
                        "Ack failed"
                    );
                }
                Disposition::Acked(outcome)
            }
            Some(Err(e)) if e.is_transient() => {
                warn!(
                    worker = self.id,
                    transfer_id = %intent.transfer_id,
                    code = e.code(),
                    error = %e,
                    "Transient failure - requeueing"
                );
                if let Err(nack_err) = handle.nack().await {
                    error!(worker = self.id, error = %nack_err, "Nack failed");
                }
                self.stats.requeued.fetch_add(1, Ordering::Relaxed);
                Disposition::Requeued(e.to_string())
            }
            Some(Err(e)) => {
                error!(
                    worker = self.id,
                    transfer_id = %intent.transfer_id,
                    code = e.code(),
                    error = %e,
                    "Execution rejected - dead-lettering"
                );
                self.dead_letter(handle, e.to_string()).await
            }
        }
    }

    async fn dead_letter(
        &self,
        handle: Box<dyn AckHandle>,
        reason: String,
    ) -> Disposition {
        if let Err(e) = handle.dead_letter(&reason).await {
            error!(worker = self.id, error = %e, "Dead-lettering failed");
        }
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        Disposition::DeadLettered(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::ledger::{AccountLedger, MemoryLedger};
    use crate::transfer::state::TransferStatus;
    use crate::transfer::queue::MemoryQueue;
    use crate::transfer::store::{MemoryRecordStore, TransferRecordStore};
    use crate::transfer::types::{AccountId, TransferIntent, TransferRecord};

    struct Harness {
        ledger: Arc<MemoryLedger>,
        store: Arc<MemoryRecordStore>,
        queue: MemoryQueue,
        worker: ConsumerWorker,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(MemoryLedger::with_accounts([(1, 1000), (2, 500)]));
        let store = Arc::new(MemoryRecordStore::new());
        let queue = MemoryQueue::new();
        let orchestrator = Arc::new(TransferOrchestrator::new(ledger.clone(), store.clone()));
        let worker = ConsumerWorker::new(
            0,
            Arc::new(queue.clone()),
            orchestrator,
            ConsumerConfig {
                max_deliveries: 3,
                error_backoff: Duration::from_millis(5),
            },
            Arc::new(ConsumerStats::default()),
        );
        Harness {
            ledger,
            store,
            queue,
            worker,
        }
    }

    async fn enqueue(h: &Harness, amount: i64) -> TransferIntent {
        let intent = TransferIntent::new(AccountId(1), AccountId(2), amount).unwrap();
        h.store.create(&TransferRecord::pending(&intent)).await.unwrap();
        h.queue.publish(&intent).await.unwrap();
        intent
    }

    #[tokio::test]
    async fn test_terminal_outcome_is_acked() {
        let h = harness();
        enqueue(&h, 300).await;

        let delivery = h.queue.consume().await.unwrap().unwrap();
        let disposition = h.worker.handle(delivery).await;

        assert_eq!(disposition, Disposition::Acked(ExecuteOutcome::Completed));
        assert_eq!(h.queue.acked(), 1);
        assert_eq!(h.queue.in_flight(), 0);
        assert_eq!(h.worker.stats().snapshot().completed, 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dead_lettered() {
        let h = harness();
        h.queue.publish_raw(br#"{"version":9}"#.to_vec());

        let delivery = h.queue.consume().await.unwrap().unwrap();
        let disposition = h.worker.handle(delivery).await;

        assert!(matches!(disposition, Disposition::DeadLettered(_)));
        assert_eq!(h.queue.dead_letters().len(), 1);
        assert_eq!(h.queue.ready_len(), 0);
    }

    #[tokio::test]
    async fn test_payload_disagreeing_with_record_is_dead_lettered() {
        let h = harness();
        let intent = TransferIntent::new(AccountId(1), AccountId(2), 50).unwrap();
        h.store.create(&TransferRecord::pending(&intent)).await.unwrap();
        let mut corrupt = intent.clone();
        corrupt.amount = 51;
        h.queue.publish(&corrupt).await.unwrap();
        h.queue.publish(&intent).await.unwrap();

        let delivery = h.queue.consume().await.unwrap().unwrap();
        let disposition = h.worker.handle(delivery).await;
        assert!(matches!(disposition, Disposition::DeadLettered(_)));
        assert_eq!(h.queue.dead_letters().len(), 1);
        assert_eq!(
            h.store.get_status(intent.transfer_id).await.unwrap(),
            TransferStatus::Pending
        );

        let delivery = h.queue.consume().await.unwrap().unwrap();
        assert_eq!(
            h.worker.handle(delivery).await,
            Disposition::Acked(ExecuteOutcome::Completed)
        );
        assert_eq!(h.ledger.get_balance(AccountId(1)).await.unwrap(), Some((950, 1)));
    }

    #[tokio::test]
    async fn test_transient_failure_is_requeued() {
        let h = harness();
        let intent = enqueue(&h, 300).await;
        h.ledger.set_unavailable(true);

        let delivery = h.queue.consume().await.unwrap().unwrap();
        let disposition = h.worker.handle(delivery).await;

        assert!(matches!(disposition, Disposition::Requeued(_)));
        assert_eq!(h.queue.ready_len(), 1);
        assert_eq!(
            h.store.get_status(intent.transfer_id).await.unwrap(),
            TransferStatus::Pending
        );

        h.ledger.set_unavailable(false);
        let redelivery = h.queue.consume().await.unwrap().unwrap();
        assert_eq!(redelivery.delivery_count, 2);
        assert_eq!(
            h.worker.handle(redelivery).await,
            Disposition::Acked(ExecuteOutcome::Completed)
        );
    }

    #[tokio::test]
    async fn test_poison_message_hits_delivery_limit() {
        let h = harness();
        enqueue(&h, 300).await;
        h.ledger.set_unavailable(true);

        for _ in 0..3 {
            let delivery = h.queue.consume().await.unwrap().unwrap();
            assert!(matches!(
                h.worker.handle(delivery).await,
                Disposition::Requeued(_)
            ));
        }
        let delivery = h.queue.consume().await.unwrap().unwrap();
        assert!(matches!(
            h.worker.handle(delivery).await,
            Disposition::DeadLettered(_)
        ));
        assert_eq!(h.worker.stats().snapshot().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_closed() {
        let h = harness();
        let first = enqueue(&h, 100).await;
        let second = enqueue(&h, 5000).await;
        h.queue.close();

        let (_tx, rx) = watch::channel(false);
        h.worker.run(rx).await;

        assert_eq!(
            h.store.get_status(first.transfer_id).await.unwrap(),
            TransferStatus::Completed
        );
        assert_eq!(
            h.store.get_status(second.transfer_id).await.unwrap(),
            TransferStatus::Failed
        );
        let stats = h.worker.stats().snapshot();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(h.ledger.total_balance(), 1500);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness();
        let (tx, rx) = watch::channel(false);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
        });

        tokio::time::timeout(Duration::from_secs(2), h.worker.run(rx))
            .await
            .expect("worker should stop on shutdown");
        stopper.await.unwrap();
        assert_eq!(h.queue.in_flight(), 0);
    }
}
