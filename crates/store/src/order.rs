use chrono::{DateTime, Utc};
use common::{GoodsId, OrderId, UserId};
use serde::{Deserialize, Serialize};

use crate::OrderStatus;

/// Input for creating an order. The store assigns the ID and timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    pub user_id: UserId,
    pub goods_ids: Vec<GoodsId>,
}

impl NewOrder {
    pub fn new(user_id: UserId, goods_ids: Vec<GoodsId>) -> Self {
        Self { user_id, goods_ids }
    }
}

/// A persisted order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub goods_ids: Vec<GoodsId>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    /// Advances only when a status transition is applied.
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub(crate) fn created(id: OrderId, new: NewOrder, now: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id: new.user_id,
            goods_ids: new.goods_ids,
            status: OrderStatus::Created,
            created_at: now,
            updated_at: now,
        }
    }
}
