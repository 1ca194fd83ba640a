//! Order-side reaction to goods outcomes.

use std::sync::Arc;

use async_trait::async_trait;
use broker::Delivery;
use common::OrderId;
use store::{OrderStatus, OrderStore, TransitionOutcome};

use crate::dispatch::SagaHandler;
use crate::error::{Result, SagaError};
use crate::events::{EventType, SagaEvent};
use crate::metrics::{IgnoreReason, SagaMetrics};
use crate::state::{Outcome, Transition, next_status};

/// What happened to an order when an outcome event was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeResult {
    /// The order moved to this terminal status.
    Applied(OrderStatus),
    /// The order was already terminal; nothing changed.
    AlreadyTerminal(OrderStatus),
    /// No such order; the event was dropped.
    OrderNotFound,
}

/// Moves orders to their terminal status as goods outcomes arrive.
///
/// Duplicate and late events are harmless: a terminal order is never touched
/// again, and the store's conditional update settles races between
/// conflicting outcomes.
pub struct OrderOutcomeHandler {
    store: Arc<dyn OrderStore>,
    metrics: Arc<dyn SagaMetrics>,
}

impl OrderOutcomeHandler {
    pub fn new(store: Arc<dyn OrderStore>, metrics: Arc<dyn SagaMetrics>) -> Self {
        Self { store, metrics }
    }

    #[tracing::instrument(skip(self, outcome), fields(outcome = outcome.as_str()))]
    pub async fn apply(&self, order_id: OrderId, outcome: Outcome) -> Result<OutcomeResult> {
        let Some(order) = self.store.get(order_id).await? else {
            tracing::warn!("outcome for unknown order dropped");
            self.metrics.outcome_ignored(IgnoreReason::OrderNotFound);
            return Ok(OutcomeResult::OrderNotFound);
        };

        let target = match next_status(order.status, outcome) {
            Transition::Apply(target) => target,
            Transition::Ignore => {
                tracing::debug!(status = %order.status, "order already terminal, outcome ignored");
                self.metrics.outcome_ignored(IgnoreReason::AlreadyTerminal);
                return Ok(OutcomeResult::AlreadyTerminal(order.status));
            }
        };

        match self.store.transition_from_created(order_id, target).await? {
            TransitionOutcome::Applied(order) => {
                tracing::info!(status = %order.status, "order status updated");
                self.metrics.outcome_applied(order.status);
                Ok(OutcomeResult::Applied(order.status))
            }
            TransitionOutcome::AlreadyTerminal(status) => {
                tracing::debug!(%status, "lost race to a concurrent outcome");
                self.metrics.outcome_ignored(IgnoreReason::AlreadyTerminal);
                Ok(OutcomeResult::AlreadyTerminal(status))
            }
            TransitionOutcome::NotFound => {
                tracing::warn!("order disappeared before its outcome was applied");
                self.metrics.outcome_ignored(IgnoreReason::OrderNotFound);
                Ok(OutcomeResult::OrderNotFound)
            }
        }
    }
}

#[async_trait]
impl SagaHandler for OrderOutcomeHandler {
    async fn handle(&self, event: SagaEvent, delivery: &Delivery) -> Result<()> {
        let event_type = event.event_type();
        let outcome = Outcome::from_event_type(event_type).ok_or_else(|| {
            SagaError::Configuration(format!("order outcome cannot handle {event_type}"))
        })?;

        let order_id = event.order_id();
        if let Some(key) = delivery.key.as_deref()
            && OrderId::from_message_key(key) != Some(order_id)
        {
            tracing::warn!(%order_id, key, "message key does not match order ID");
        }

        self.apply(order_id, outcome).await.map(|_| ())
    }

    fn name(&self) -> &'static str {
        "order-outcome"
    }

    fn handles(&self) -> &'static [EventType] {
        &[EventType::GoodsCreated, EventType::GoodsRejected]
    }
}
