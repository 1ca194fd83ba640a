//! Goods-side reaction to `OrderCreated`.

use std::sync::Arc;

use async_trait::async_trait;
use broker::{Delivery, MessageBroker};
use store::{GoodsInventory, Reservation, ReservationDecision};

use crate::dispatch::SagaHandler;
use crate::error::{Result, SagaError};
use crate::events::{EventType, GoodsCreated, GoodsRejected, OrderCreated, SagaEvent};
use crate::metrics::SagaMetrics;
use crate::topics::Topics;

/// Reserves goods for new orders and replies with the outcome.
///
/// The decision is recorded in the inventory ledger before the reply is
/// published. A redelivered `OrderCreated` replays the recorded decision and
/// publishes it again; stock is never reserved twice for one order.
pub struct GoodsReservationHandler {
    inventory: Arc<dyn GoodsInventory>,
    broker: Arc<dyn MessageBroker>,
    topics: Topics,
    metrics: Arc<dyn SagaMetrics>,
}

impl GoodsReservationHandler {
    pub fn new(
        inventory: Arc<dyn GoodsInventory>,
        broker: Arc<dyn MessageBroker>,
        topics: Topics,
        metrics: Arc<dyn SagaMetrics>,
    ) -> Self {
        Self {
            inventory,
            broker,
            topics,
            metrics,
        }
    }

    /// Decides (or replays) the reservation for an order and publishes it.
    #[tracing::instrument(skip(self, event), fields(order_id = %event.id))]
    pub async fn reserve(&self, event: &OrderCreated) -> Result<Reservation> {
        let reservation = self
            .inventory
            .reserve_for_order(event.id, &event.goods_ids)
            .await?;

        self.metrics
            .reservation_decided(&reservation.decision, reservation.replayed);

        let reply = outcome_event(&reservation);
        let event_type = reply.event_type();
        let payload = reply.encode()?;

        let receipt = self
            .broker
            .publish(
                self.topics.topic_for(event_type),
                &event.id.message_key(),
                &payload,
            )
            .await?;

        tracing::info!(
            decision = reservation.decision.as_str(),
            replayed = reservation.replayed,
            reply = %event_type,
            partition = receipt.partition,
            offset = receipt.offset,
            "reservation outcome published"
        );
        Ok(reservation)
    }
}

fn outcome_event(reservation: &Reservation) -> SagaEvent {
    match &reservation.decision {
        ReservationDecision::Reserved { goods_ids } => SagaEvent::GoodsCreated(GoodsCreated {
            order_id: reservation.order_id,
            goods_ids: goods_ids.clone(),
        }),
        ReservationDecision::Rejected {
            unavailable_goods_ids,
        } => SagaEvent::GoodsRejected(GoodsRejected {
            order_id: reservation.order_id,
            unavailable_goods_ids: unavailable_goods_ids.clone(),
        }),
    }
}

#[async_trait]
impl SagaHandler for GoodsReservationHandler {
    async fn handle(&self, event: SagaEvent, _delivery: &Delivery) -> Result<()> {
        match event {
            SagaEvent::OrderCreated(created) => self.reserve(&created).await.map(|_| ()),
            other => Err(SagaError::Configuration(format!(
                "goods reservation cannot handle {}",
                other.event_type()
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "goods-reservation"
    }

    fn handles(&self) -> &'static [EventType] {
        &[EventType::OrderCreated]
    }
}
