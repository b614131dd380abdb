//! In-process broker with broker-like delivery semantics
//!
//! FIFO ready list, explicit settlement, redelivery on nack or when an
//! unsettled handle is dropped (consumer crash), and a dead-letter list.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::codec::encode_intent;
use super::{AckHandle, Delivery, TransferQueue};
use crate::transfer::error::TransferError;
use crate::transfer::types::{TransferId, TransferIntent};

#[derive(Debug, Clone)]
struct Message {
    /// `None` for raw payloads published around the codec
    transfer_id: Option<TransferId>,
    payload: Vec<u8>,
    delivery_count: u32,
}

/// A message parked on the dead-letter list
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub payload: Vec<u8>,
    pub reason: String,
    pub delivery_count: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    in_flight: usize,
    /// Unsettled deliveries per transfer id
    in_flight_ids: HashMap<TransferId, usize>,
    acked: u64,
    dead_letters: Vec<DeadLetter>,
    closed: bool,
}

#[derive(Default)]
struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    unavailable: AtomicBool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enqueue(&self, message: Message) {
        self.lock().ready.push_back(message);
        self.notify.notify_one();
    }
}

#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue raw bytes, bypassing the codec
    pub fn publish_raw(&self, payload: Vec<u8>) {
        self.inner.enqueue(Message {
            transfer_id: None,
            payload,
            delivery_count: 0,
        });
    }

    /// Stop accepting publishes; consumers get `None` once the ready list drains
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.inner.notify.notify_waiters();
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn ready_len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    pub fn acked(&self) -> u64 {
        self.inner.lock().acked
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().dead_letters.clone()
    }
}

#[async_trait]
impl TransferQueue for MemoryQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, intent: &TransferIntent) -> Result<(), TransferError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(TransferError::Queue(
                "broker unavailable (simulated outage)".to_string(),
            ));
        }
        if self.inner.lock().closed {
            return Err(TransferError::Queue("queue closed".to_string()));
        }

        let payload = encode_intent(intent)?;
        self.inner.enqueue(Message {
            transfer_id: Some(intent.transfer_id),
            payload,
            delivery_count: 0,
        });
        Ok(())
    }

    async fn consume(&self) -> Result<Option<Delivery>, TransferError> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a close() in between is not missed
            notified.as_mut().enable();

            {
                let mut state = self.inner.lock();
                if let Some(mut message) = state.ready.pop_front() {
                    message.delivery_count += 1;
                    state.in_flight += 1;
                    if let Some(id) = message.transfer_id {
                        *state.in_flight_ids.entry(id).or_default() += 1;
                    }
                    return Ok(Some(Delivery {
                        payload: message.payload.clone(),
                        delivery_count: message.delivery_count,
                        handle: Box::new(MemoryAck {
                            inner: self.inner.clone(),
                            message: Some(message),
                        }),
                    }));
                }
                if state.closed {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }

    async fn is_enqueued(&self, transfer_id: TransferId) -> Result<bool, TransferError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(TransferError::Queue(
                "broker unavailable (simulated outage)".to_string(),
            ));
        }
        let state = self.inner.lock();
        Ok(state.in_flight_ids.contains_key(&transfer_id)
            || state
                .ready
                .iter()
                .any(|m| m.transfer_id == Some(transfer_id)))
    }
}

struct MemoryAck {
    inner: Arc<Inner>,
    message: Option<Message>,
}

impl MemoryAck {
    fn settle(&mut self, apply: impl FnOnce(&mut QueueState, Message)) -> bool {
        let Some(message) = self.message.take() else {
            return false;
        };
        let mut state = self.inner.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if let Some(id) = message.transfer_id {
            if let Some(count) = state.in_flight_ids.get_mut(&id) {
                *count -= 1;
                if *count == 0 {
                    state.in_flight_ids.remove(&id);
                }
            }
        }
        apply(&mut state, message);
        true
    }

    fn requeue(&mut self) {
        if self.settle(|state, message| state.ready.push_back(message)) {
            self.inner.notify.notify_one();
        }
    }
}

#[async_trait]
impl AckHandle for MemoryAck {
    async fn ack(mut self: Box<Self>) -> Result<(), TransferError> {
        self.settle(|state, _| state.acked += 1);
        Ok(())
    }

    async fn nack(mut self: Box<Self>) -> Result<(), TransferError> {
        self.requeue();
        Ok(())
    }

    async fn dead_letter(mut self: Box<Self>, reason: &str) -> Result<(), TransferError> {
        self.settle(|state, message| {
            state.dead_letters.push(DeadLetter {
                payload: message.payload,
                reason: reason.to_string(),
                delivery_count: message.delivery_count,
            })
        });
        Ok(())
    }
}

impl Drop for MemoryAck {
    fn drop(&mut self) {
        self.requeue();
    }
}
