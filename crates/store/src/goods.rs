use std::collections::HashMap;

use async_trait::async_trait;
use common::{GoodsId, OrderId};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Outcome of a reservation attempt for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationDecision {
    /// Every requested item was available and is now held for the order.
    Reserved { goods_ids: Vec<GoodsId> },
    /// At least one item was short; nothing was held.
    Rejected { unavailable_goods_ids: Vec<GoodsId> },
}

impl ReservationDecision {
    pub fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved { .. } => "reserved",
            Self::Rejected { .. } => "rejected",
        }
    }

    /// Goods IDs recorded with the decision.
    pub fn goods_ids(&self) -> &[GoodsId] {
        match self {
            Self::Reserved { goods_ids } => goods_ids,
            Self::Rejected {
                unavailable_goods_ids,
            } => unavailable_goods_ids,
        }
    }
}

/// A decision for an order, and whether it came from the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub order_id: OrderId,
    pub decision: ReservationDecision,
    /// True when the decision was recorded by an earlier call.
    pub replayed: bool,
}

/// Goods stock plus a per-order reservation ledger.
///
/// The ledger makes reservation idempotent: once a decision is recorded for an
/// order, later calls return it unchanged and never touch stock again.
#[async_trait]
pub trait GoodsInventory: Send + Sync {
    /// Decides and records a reservation for `order_id`, or replays the
    /// recorded one.
    ///
    /// A goods ID listed N times needs N units in stock.
    async fn reserve_for_order(
        &self,
        order_id: OrderId,
        goods_ids: &[GoodsId],
    ) -> Result<Reservation>;

    async fn decision_for(&self, order_id: OrderId) -> Result<Option<ReservationDecision>>;
}

/// Counts how many units of each goods ID are requested, in first-seen order.
pub(crate) fn requested_quantities(goods_ids: &[GoodsId]) -> Vec<(GoodsId, i64)> {
    let mut order: Vec<GoodsId> = Vec::new();
    let mut counts: HashMap<GoodsId, i64> = HashMap::new();
    for id in goods_ids {
        let count = counts.entry(*id).or_insert(0);
        if *count == 0 {
            order.push(*id);
        }
        *count += 1;
    }
    order.into_iter().map(|id| (id, counts[&id])).collect()
}

/// Decides a reservation against the current stock levels.
///
/// Unknown goods count as zero stock.
pub(crate) fn decide(
    goods_ids: &[GoodsId],
    stock: impl Fn(GoodsId) -> i64,
) -> ReservationDecision {
    let unavailable: Vec<GoodsId> = requested_quantities(goods_ids)
        .into_iter()
        .filter(|(id, wanted)| stock(*id) < *wanted)
        .map(|(id, _)| id)
        .collect();

    if unavailable.is_empty() {
        ReservationDecision::Reserved {
            goods_ids: goods_ids.to_vec(),
        }
    } else {
        ReservationDecision::Rejected {
            unavailable_goods_ids: unavailable,
        }
    }
}
