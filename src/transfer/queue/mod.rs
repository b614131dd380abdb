//! Transfer Queue
//!
//! Durable, at-least-once channel carrying serialized intents from intake to
//! the consumer workers. A delivery is settled exactly once through its
//! [`AckHandle`]: `ack` removes it, `nack` requeues it for redelivery,
//! `dead_letter` parks it. A handle dropped unsettled is redelivered.

pub mod codec;
pub mod memory;
pub mod postgres;

pub use codec::{WIRE_VERSION, decode_intent, encode_intent};
pub use memory::MemoryQueue;
pub use postgres::PgQueue;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};

use super::error::TransferError;
use super::types::{TransferId, TransferIntent};

/// Settlement handle for one delivery
#[async_trait]
pub trait AckHandle: Send {
    /// Processing finished (terminal outcome recorded); drop the message
    async fn ack(self: Box<Self>) -> Result<(), TransferError>;

    /// Transient failure or shutdown; make the message visible again
    async fn nack(self: Box<Self>) -> Result<(), TransferError>;

    /// Unprocessable payload; move it off the queue with a reason
    async fn dead_letter(self: Box<Self>, reason: &str) -> Result<(), TransferError>;
}

/// A message handed to a consumer
pub struct Delivery {
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery
    pub delivery_count: u32,
    pub handle: Box<dyn AckHandle>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

#[async_trait]
pub trait TransferQueue: Send + Sync {
    fn name(&self) -> &'static str;

    /// Durably enqueue an intent
    async fn publish(&self, intent: &TransferIntent) -> Result<(), TransferError>;

    /// Wait for the next delivery; `None` once the queue is closed
    async fn consume(&self) -> Result<Option<Delivery>, TransferError>;

    /// Whether a message for this transfer is still waiting or in flight.
    /// Dead-lettered and acknowledged messages do not count.
    async fn is_enqueued(&self, transfer_id: TransferId) -> Result<bool, TransferError>;
}

/// Adapt [`TransferQueue::consume`] into a stream of deliveries
///
/// The stream ends when the queue closes; consume errors are yielded as
/// items so the caller decides whether to back off.
pub fn delivery_stream(
    queue: Arc<dyn TransferQueue>,
) -> BoxStream<'static, Result<Delivery, TransferError>> {
    Box::pin(stream::unfold(queue, |queue| async move {
        let next = queue.consume().await;
        match next {
            Ok(Some(delivery)) => Some((Ok(delivery), queue)),
            Ok(None) => None,
            Err(e) => Some((Err(e), queue)),
        }
    }))
}
