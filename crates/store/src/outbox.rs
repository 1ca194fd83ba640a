use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{NewOrder, Order, Result};

/// A message waiting to be relayed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

/// A persisted outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    pub id: i64,
    pub message: OutboxMessage,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Builds the outbox message for an order once its ID is known.
pub type OutboxMessageBuilder = Box<dyn FnOnce(&Order) -> Result<OutboxMessage> + Send>;

/// Transactional outbox stored next to the orders.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Inserts the order and its outbox message atomically.
    ///
    /// If building the message fails, neither row is written.
    async fn insert_with_outbox(
        &self,
        order: NewOrder,
        message: OutboxMessageBuilder,
    ) -> Result<Order>;

    /// Returns up to `limit` unpublished records in insertion order.
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    async fn mark_outbox_published(&self, id: i64) -> Result<()>;

    /// Records a failed relay attempt; the record stays pending.
    async fn record_outbox_failure(&self, id: i64, error: &str) -> Result<()>;
}
