//! Synchronous order creation: validate, persist, announce.

use std::sync::Arc;

use broker::MessageBroker;
use common::{GoodsId, UserId};
use store::{NewOrder, Order, OrderStore, Outbox, OutboxMessage};

use crate::error::{Result, SagaError};
use crate::events::{Envelope, OrderCreated, SagaEvent};
use crate::metrics::SagaMetrics;
use crate::topics::Topics;

/// How `OrderCreated` reaches the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishMode {
    /// Insert the order, then publish. A failed publish leaves an orphaned
    /// order and surfaces [`SagaError::OrderOrphaned`].
    #[default]
    Direct,
    /// Insert the order and an outbox row in one transaction; the relay
    /// publishes later.
    Outbox,
}

impl std::str::FromStr for PublishMode {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(PublishMode::Direct),
            "outbox" => Ok(PublishMode::Outbox),
            other => Err(SagaError::Configuration(format!(
                "unknown publish mode '{other}', expected 'direct' or 'outbox'"
            ))),
        }
    }
}

/// A validated order request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOrder {
    pub user_id: UserId,
    pub goods_ids: Vec<GoodsId>,
}

impl CreateOrder {
    /// Validates a raw request. `goods_ids` must not be empty; duplicates are
    /// kept in order.
    pub fn new(user_id: UserId, goods_ids: Vec<GoodsId>) -> Result<Self> {
        if goods_ids.is_empty() {
            return Err(SagaError::Validation(
                "goods_ids must contain at least one item".to_string(),
            ));
        }
        Ok(Self { user_id, goods_ids })
    }
}

/// Store capabilities the creation path needs.
pub trait OrderRepository: OrderStore + Outbox {}

impl<T: OrderStore + Outbox> OrderRepository for T {}

/// Creates orders and starts their saga.
pub struct OrderCreationHandler {
    store: Arc<dyn OrderRepository>,
    broker: Arc<dyn MessageBroker>,
    topics: Topics,
    mode: PublishMode,
    metrics: Arc<dyn SagaMetrics>,
}

impl OrderCreationHandler {
    pub fn new(
        store: Arc<dyn OrderRepository>,
        broker: Arc<dyn MessageBroker>,
        topics: Topics,
        mode: PublishMode,
        metrics: Arc<dyn SagaMetrics>,
    ) -> Self {
        Self {
            store,
            broker,
            topics,
            mode,
            metrics,
        }
    }

    pub fn mode(&self) -> PublishMode {
        self.mode
    }

    /// Persists the order and publishes (or enqueues) its `OrderCreated`
    /// event. Returns as soon as that is done; the saga outcome arrives later.
    #[tracing::instrument(skip(self, request), fields(user_id = %request.user_id, mode = ?self.mode))]
    pub async fn create(&self, request: CreateOrder) -> Result<Order> {
        let new_order = NewOrder::new(request.user_id, request.goods_ids);

        match self.mode {
            PublishMode::Direct => self.create_direct(new_order).await,
            PublishMode::Outbox => self.create_with_outbox(new_order).await,
        }
    }

    async fn create_direct(&self, new_order: NewOrder) -> Result<Order> {
        let order = self.store.insert(new_order).await.map_err(|e| {
            tracing::error!(error = %e, "failed to insert order");
            SagaError::Store(e)
        })?;

        let payload = order_created(&order).encode()?;
        let key = order.id.message_key();

        match self
            .broker
            .publish(&self.topics.order_created, &key, &payload)
            .await
        {
            Ok(receipt) => {
                tracing::info!(
                    order_id = %order.id,
                    partition = receipt.partition,
                    offset = receipt.offset,
                    "order created"
                );
                Ok(order)
            }
            Err(source) => {
                tracing::error!(
                    order_id = %order.id,
                    error = %source,
                    indeterminate = source.is_indeterminate(),
                    "order persisted but OrderCreated was not published"
                );
                self.metrics.order_orphaned();
                Err(SagaError::OrderOrphaned {
                    order_id: order.id,
                    source,
                })
            }
        }
    }

    async fn create_with_outbox(&self, new_order: NewOrder) -> Result<Order> {
        let topic = self.topics.order_created.clone();

        let order = self
            .store
            .insert_with_outbox(
                new_order,
                Box::new(move |order: &Order| -> store::Result<OutboxMessage> {
                    let payload = serde_json::to_vec(&Envelope {
                        data: OrderCreated {
                            id: order.id,
                            goods_ids: order.goods_ids.clone(),
                        },
                    })?;
                    Ok(OutboxMessage {
                        topic,
                        key: order.id.message_key(),
                        payload,
                    })
                }),
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to insert order with outbox message");
                SagaError::Store(e)
            })?;

        tracing::info!(order_id = %order.id, "order created, OrderCreated queued in outbox");
        Ok(order)
    }
}

fn order_created(order: &Order) -> SagaEvent {
    SagaEvent::OrderCreated(OrderCreated {
        id: order.id,
        goods_ids: order.goods_ids.clone(),
    })
}
