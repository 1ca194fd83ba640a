use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::OrderId;

use crate::{NewOrder, Order, OrderStatus, Result};

/// Result of a conditional `Created -> terminal` transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The order was `Created` and now carries the target status.
    Applied(Order),
    /// The order had already left `Created`; nothing changed.
    AlreadyTerminal(OrderStatus),
    /// No order with that ID exists.
    NotFound,
}

/// Persistent record of orders and their status.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts a new order in status `Created` and returns it with its ID.
    async fn insert(&self, order: NewOrder) -> Result<Order>;

    async fn get(&self, id: OrderId) -> Result<Option<Order>>;

    /// Moves an order to `target` only if it is still `Created`.
    ///
    /// The check and the write happen atomically, so of two concurrent calls
    /// for the same order exactly one observes [`TransitionOutcome::Applied`].
    /// `target` must be terminal.
    async fn transition_from_created(
        &self,
        id: OrderId,
        target: OrderStatus,
    ) -> Result<TransitionOutcome>;

    /// Lists orders still `Created` whose `created_at` is at or before
    /// `older_than`, oldest first.
    async fn find_stale_created(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Order>>;
}

pub(crate) fn ensure_terminal_target(target: OrderStatus) -> Result<()> {
    if OrderStatus::Created.can_transition_to(target) {
        Ok(())
    } else {
        Err(crate::StoreError::InvalidTransition {
            from: OrderStatus::Created,
            to: target,
        })
    }
}
