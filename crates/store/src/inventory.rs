use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::{GoodsId, OrderId};

use crate::goods::{decide, requested_quantities};
use crate::{GoodsInventory, Reservation, ReservationDecision, Result, StoreError};

#[derive(Debug, Default)]
struct InventoryState {
    stock: HashMap<GoodsId, i64>,
    ledger: HashMap<OrderId, ReservationDecision>,
    fail_on_reserve: bool,
}

/// In-memory goods stock and reservation ledger.
///
/// Stock check, decrement and ledger write happen under one lock, so a
/// decision is recorded together with the stock it consumed.
#[derive(Debug, Clone, Default)]
pub struct InMemoryGoodsInventory {
    state: Arc<RwLock<InventoryState>>,
}

impl InMemoryGoodsInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an inventory holding the given stock levels.
    pub fn with_stock(stock: impl IntoIterator<Item = (GoodsId, i64)>) -> Self {
        let inventory = Self::new();
        for (id, quantity) in stock {
            inventory.set_stock(id, quantity);
        }
        inventory
    }

    pub fn set_stock(&self, id: GoodsId, quantity: i64) {
        self.write().stock.insert(id, quantity);
    }

    /// Returns the units left for a goods item (zero if unknown).
    pub fn stock_of(&self, id: GoodsId) -> i64 {
        self.read().stock.get(&id).copied().unwrap_or(0)
    }

    /// Configures every following reserve call to fail.
    pub fn set_fail_on_reserve(&self, fail: bool) {
        self.write().fail_on_reserve = fail;
    }

    /// Returns the number of orders with a recorded decision.
    pub fn reservation_count(&self) -> usize {
        self.read().ledger.len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InventoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InventoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl GoodsInventory for InMemoryGoodsInventory {
    async fn reserve_for_order(
        &self,
        order_id: OrderId,
        goods_ids: &[GoodsId],
    ) -> Result<Reservation> {
        let mut state = self.write();

        if state.fail_on_reserve {
            return Err(StoreError::Unavailable(
                "inventory ledger is offline".to_string(),
            ));
        }

        if let Some(decision) = state.ledger.get(&order_id) {
            return Ok(Reservation {
                order_id,
                decision: decision.clone(),
                replayed: true,
            });
        }

        let decision = decide(goods_ids, |id| state.stock.get(&id).copied().unwrap_or(0));
        if decision.is_reserved() {
            for (id, quantity) in requested_quantities(goods_ids) {
                *state.stock.entry(id).or_insert(0) -= quantity;
            }
        }
        state.ledger.insert(order_id, decision.clone());

        Ok(Reservation {
            order_id,
            decision,
            replayed: false,
        })
    }

    async fn decision_for(&self, order_id: OrderId) -> Result<Option<ReservationDecision>> {
        Ok(self.read().ledger.get(&order_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[i64]) -> Vec<GoodsId> {
        raw.iter().copied().map(GoodsId::new).collect()
    }

    #[tokio::test]
    async fn reservation_consumes_stock() {
        let inventory =
            InMemoryGoodsInventory::with_stock([(GoodsId::new(1), 2), (GoodsId::new(2), 1)]);

        let reservation = inventory
            .reserve_for_order(OrderId::new(10), &ids(&[1, 2, 1]))
            .await
            .unwrap();

        assert!(reservation.decision.is_reserved());
        assert!(!reservation.replayed);
        assert_eq!(inventory.stock_of(GoodsId::new(1)), 0);
        assert_eq!(inventory.stock_of(GoodsId::new(2)), 0);
    }

    #[tokio::test]
    async fn rejection_leaves_stock_untouched() {
        let inventory = InMemoryGoodsInventory::with_stock([(GoodsId::new(1), 5)]);

        let reservation = inventory
            .reserve_for_order(OrderId::new(11), &ids(&[1, 3]))
            .await
            .unwrap();

        assert_eq!(
            reservation.decision,
            ReservationDecision::Rejected {
                unavailable_goods_ids: ids(&[3])
            }
        );
        assert_eq!(inventory.stock_of(GoodsId::new(1)), 5);
    }

    #[tokio::test]
    async fn repeated_reservation_replays_decision() {
        let inventory = InMemoryGoodsInventory::with_stock([(GoodsId::new(1), 1)]);

        let first = inventory
            .reserve_for_order(OrderId::new(12), &ids(&[1]))
            .await
            .unwrap();
        let second = inventory
            .reserve_for_order(OrderId::new(12), &ids(&[1]))
            .await
            .unwrap();

        assert_eq!(first.decision, second.decision);
        assert!(second.replayed);
        assert_eq!(inventory.stock_of(GoodsId::new(1)), 0);
        assert_eq!(inventory.reservation_count(), 1);
    }

    #[tokio::test]
    async fn replay_survives_stock_changes() {
        let inventory = InMemoryGoodsInventory::new();

        let first = inventory
            .reserve_for_order(OrderId::new(13), &ids(&[4]))
            .await
            .unwrap();
        inventory.set_stock(GoodsId::new(4), 100);
        let second = inventory
            .reserve_for_order(OrderId::new(13), &ids(&[4]))
            .await
            .unwrap();

        assert!(!first.decision.is_reserved());
        assert_eq!(first.decision, second.decision);
        assert_eq!(
            inventory.decision_for(OrderId::new(13)).await.unwrap(),
            Some(first.decision)
        );
    }

    #[tokio::test]
    async fn failing_ledger_records_nothing() {
        let inventory = InMemoryGoodsInventory::with_stock([(GoodsId::new(1), 1)]);
        inventory.set_fail_on_reserve(true);

        let result = inventory
            .reserve_for_order(OrderId::new(14), &ids(&[1]))
            .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(inventory.stock_of(GoodsId::new(1)), 1);
        assert_eq!(inventory.decision_for(OrderId::new(14)).await.unwrap(), None);
    }
}
