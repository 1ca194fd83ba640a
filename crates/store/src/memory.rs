use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::OrderId;
use tokio::sync::RwLock;

use crate::orders::ensure_terminal_target;
use crate::{
    NewOrder, Order, OrderStatus, OrderStore, Outbox, OutboxMessageBuilder, OutboxRecord, Result,
    StoreError, TransitionOutcome,
};

#[derive(Default)]
struct State {
    orders: BTreeMap<OrderId, Order>,
    next_order_id: i64,
    outbox: Vec<OutboxRecord>,
    published: Vec<i64>,
    next_outbox_id: i64,
}

impl State {
    fn insert(&mut self, new: NewOrder) -> Order {
        self.next_order_id += 1;
        let order = Order::created(OrderId::new(self.next_order_id), new, Utc::now());
        self.orders.insert(order.id, order.clone());
        order
    }
}

/// In-memory order store and outbox.
///
/// Used by tests and by the single-process binary. `set_unavailable` makes
/// every call fail with [`StoreError::Unavailable`].
#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    state: Arc<RwLock<State>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the store being unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }

    /// Returns every order, lowest ID first.
    pub async fn orders(&self) -> Vec<Order> {
        self.state.read().await.orders.values().cloned().collect()
    }

    /// Overrides an order's creation time.
    pub async fn backdate(&self, id: OrderId, created_at: DateTime<Utc>) {
        if let Some(order) = self.state.write().await.orders.get_mut(&id) {
            order.created_at = created_at;
            order.updated_at = created_at;
        }
    }

    /// Returns the IDs of relayed outbox records in the order they were marked.
    pub async fn published_outbox_ids(&self) -> Vec<i64> {
        self.state.read().await.published.clone()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert(&self, order: NewOrder) -> Result<Order> {
        self.check_available()?;
        Ok(self.state.write().await.insert(order))
    }

    async fn get(&self, id: OrderId) -> Result<Option<Order>> {
        self.check_available()?;
        Ok(self.state.read().await.orders.get(&id).cloned())
    }

    async fn transition_from_created(
        &self,
        id: OrderId,
        target: OrderStatus,
    ) -> Result<TransitionOutcome> {
        ensure_terminal_target(target)?;
        self.check_available()?;

        let mut state = self.state.write().await;
        let Some(order) = state.orders.get_mut(&id) else {
            return Ok(TransitionOutcome::NotFound);
        };

        if order.status.is_terminal() {
            return Ok(TransitionOutcome::AlreadyTerminal(order.status));
        }

        order.status = target;
        order.updated_at = Utc::now();
        Ok(TransitionOutcome::Applied(order.clone()))
    }

    async fn find_stale_created(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Order>> {
        self.check_available()?;

        let state = self.state.read().await;
        let mut stale: Vec<Order> = state
            .orders
            .values()
            .filter(|o| !o.status.is_terminal() && o.created_at <= older_than)
            .cloned()
            .collect();
        stale.sort_by_key(|o| (o.created_at, o.id));
        stale.truncate(limit);
        Ok(stale)
    }
}

#[async_trait]
impl Outbox for InMemoryOrderStore {
    async fn insert_with_outbox(
        &self,
        order: NewOrder,
        message: OutboxMessageBuilder,
    ) -> Result<Order> {
        self.check_available()?;

        let mut state = self.state.write().await;
        // Build against a provisional order so a failing builder leaves no trace.
        let provisional = Order::created(
            OrderId::new(state.next_order_id + 1),
            order.clone(),
            Utc::now(),
        );
        let message = message(&provisional)?;

        let order = state.insert(order);
        state.next_outbox_id += 1;
        let record = OutboxRecord {
            id: state.next_outbox_id,
            message,
            created_at: order.created_at,
            attempts: 0,
            last_error: None,
        };
        state.outbox.push(record);
        Ok(order)
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .await
            .outbox
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_outbox_published(&self, id: i64) -> Result<()> {
        self.check_available()?;

        let mut state = self.state.write().await;
        let position = state
            .outbox
            .iter()
            .position(|r| r.id == id)
            .ok_or(StoreError::OutboxRecordNotFound(id))?;
        state.outbox.remove(position);
        state.published.push(id);
        Ok(())
    }

    async fn record_outbox_failure(&self, id: i64, error: &str) -> Result<()> {
        self.check_available()?;

        let mut state = self.state.write().await;
        let record = state
            .outbox
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::OutboxRecordNotFound(id))?;
        record.attempts += 1;
        record.last_error = Some(error.to_string());
        Ok(())
    }
}
