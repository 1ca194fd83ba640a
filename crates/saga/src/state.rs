//! Order state machine driven by goods outcomes.

use store::OrderStatus;

use crate::events::EventType;

/// A goods-side outcome for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    GoodsCreated,
    GoodsRejected,
}

impl Outcome {
    /// Status an order in `Created` moves to on this outcome.
    pub fn target_status(&self) -> OrderStatus {
        match self {
            Outcome::GoodsCreated => OrderStatus::Confirmed,
            Outcome::GoodsRejected => OrderStatus::Rejected,
        }
    }

    pub fn from_event_type(event_type: EventType) -> Option<Self> {
        match event_type {
            EventType::GoodsCreated => Some(Outcome::GoodsCreated),
            EventType::GoodsRejected => Some(Outcome::GoodsRejected),
            EventType::OrderCreated => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::GoodsCreated => "GoodsCreated",
            Outcome::GoodsRejected => "GoodsRejected",
        }
    }
}

/// What applying an outcome to an order should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move the order to this status.
    Apply(OrderStatus),
    /// The order is terminal; leave it alone.
    Ignore,
}

/// The order state machine.
///
/// ```text
/// Created --(GoodsCreated)--> Confirmed   [terminal]
/// Created --(GoodsRejected)--> Rejected   [terminal]
/// Confirmed --(any)--> Confirmed
/// Rejected  --(any)--> Rejected
/// ```
pub fn next_status(current: OrderStatus, outcome: Outcome) -> Transition {
    if current.is_terminal() {
        Transition::Ignore
    } else {
        Transition::Apply(outcome.target_status())
    }
}
