//! PostgreSQL-backed durable queue (`transfer_queue_tb`)
//!
//! Consumers claim the oldest visible message with `FOR UPDATE SKIP LOCKED`
//! and push its `visible_at` forward by the visibility timeout. `ack`
//! deletes the row, `nack` makes it visible immediately, and a consumer that
//! dies without settling simply lets the timeout lapse, after which the
//! message is redelivered.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::warn;

use super::codec::encode_intent;
use super::{AckHandle, Delivery, TransferQueue};
use crate::transfer::error::TransferError;
use crate::transfer::types::{TransferId, TransferIntent};

pub struct PgQueue {
    pool: PgPool,
    queue_name: String,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl PgQueue {
    pub fn new(
        pool: PgPool,
        queue_name: impl Into<String>,
        visibility_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
            visibility_timeout,
            poll_interval,
        }
    }

    /// Claim one visible message, if any
    async fn claim(&self) -> Result<Option<Delivery>, TransferError> {
        let row = sqlx::query(
            r#"
            UPDATE transfer_queue_tb
            SET visible_at = NOW() + INTERVAL '1 millisecond' * $2,
                delivery_count = delivery_count + 1
            WHERE message_id = (
                SELECT message_id FROM transfer_queue_tb
                WHERE queue_name = $1 AND visible_at <= NOW()
                ORDER BY message_id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING message_id, payload, delivery_count
            "#,
        )
        .bind(&self.queue_name)
        .bind(self.visibility_timeout.as_millis() as i64)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let message_id: i64 = row.try_get("message_id")?;
        let payload: String = row.try_get("payload")?;
        let delivery_count: i32 = row.try_get("delivery_count")?;

        Ok(Some(Delivery {
            payload: payload.into_bytes(),
            delivery_count: delivery_count.max(0) as u32,
            handle: Box::new(PgAck {
                pool: self.pool.clone(),
                message_id,
            }),
        }))
    }
}

#[async_trait]
impl TransferQueue for PgQueue {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn publish(&self, intent: &TransferIntent) -> Result<(), TransferError> {
        let payload = encode_intent(intent)?;
        let payload = String::from_utf8(payload)
            .map_err(|e| TransferError::MalformedPayload(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO transfer_queue_tb (queue_name, transfer_id, payload, delivery_count, visible_at, enqueued_at)
            VALUES ($1, $2, $3, 0, NOW(), NOW())
            "#,
        )
        .bind(&self.queue_name)
        .bind(intent.transfer_id.to_string())
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| TransferError::Queue(e.to_string()))?;

        Ok(())
    }

    async fn consume(&self) -> Result<Option<Delivery>, TransferError> {
        loop {
            match self.claim().await {
                Ok(Some(delivery)) => return Ok(Some(delivery)),
                Ok(None) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => return Err(TransferError::Queue(e.to_string())),
            }
        }
    }

    async fn is_enqueued(&self, transfer_id: TransferId) -> Result<bool, TransferError> {
        let row = sqlx::query(
            "SELECT 1 FROM transfer_queue_tb WHERE queue_name = $1 AND transfer_id = $2 LIMIT 1",
        )
        .bind(&self.queue_name)
        .bind(transfer_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TransferError::Queue(e.to_string()))?;

        Ok(row.is_some())
    }
}

struct PgAck {
    pool: PgPool,
    message_id: i64,
}

#[async_trait]
impl AckHandle for PgAck {
    async fn ack(self: Box<Self>) -> Result<(), TransferError> {
        sqlx::query("DELETE FROM transfer_queue_tb WHERE message_id = $1")
            .bind(self.message_id)
            .execute(&self.pool)
            .await
            .map_err(|e| TransferError::Queue(e.to_string()))?;
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), TransferError> {
        sqlx::query("UPDATE transfer_queue_tb SET visible_at = NOW() WHERE message_id = $1")
            .bind(self.message_id)
            .execute(&self.pool)
            .await
            .map_err(|e| TransferError::Queue(e.to_string()))?;
        Ok(())
    }

    async fn dead_letter(self: Box<Self>, reason: &str) -> Result<(), TransferError> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r#"
            INSERT INTO transfer_dead_letters_tb (message_id, queue_name, payload, delivery_count, reason, dead_at)
            SELECT message_id, queue_name, payload, delivery_count, $2, NOW()
            FROM transfer_queue_tb WHERE message_id = $1
            "#,
        )
        .bind(self.message_id)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() == 0 {
            warn!(
                message_id = self.message_id,
                "Dead-letter target vanished (settled by another consumer?)"
            );
        }

        sqlx::query("DELETE FROM transfer_queue_tb WHERE message_id = $1")
            .bind(self.message_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
