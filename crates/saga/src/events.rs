//! Saga events and their wire format.
//!
//! Every event travels as `{"data": {...}}` keyed by the order ID. The event
//! type is not carried in the payload; it is implied by the topic.

use common::{GoodsId, OrderId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};

/// The closed set of event types exchanged by the saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    OrderCreated,
    GoodsCreated,
    GoodsRejected,
}

impl EventType {
    pub const ALL: [EventType; 3] = [
        EventType::OrderCreated,
        EventType::GoodsCreated,
        EventType::GoodsRejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OrderCreated => "OrderCreated",
            EventType::GoodsCreated => "GoodsCreated",
            EventType::GoodsRejected => "GoodsRejected",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Wire envelope shared by all saga events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

/// Published by the order service after an order is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub id: OrderId,
    pub goods_ids: Vec<GoodsId>,
}

/// Published by the goods service when every item was reserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoodsCreated {
    pub order_id: OrderId,
    pub goods_ids: Vec<GoodsId>,
}

/// Published by the goods service when some items were unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoodsRejected {
    pub order_id: OrderId,
    pub unavailable_goods_ids: Vec<GoodsId>,
}

/// A decoded saga event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaEvent {
    OrderCreated(OrderCreated),
    GoodsCreated(GoodsCreated),
    GoodsRejected(GoodsRejected),
}

impl SagaEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            SagaEvent::OrderCreated(_) => EventType::OrderCreated,
            SagaEvent::GoodsCreated(_) => EventType::GoodsCreated,
            SagaEvent::GoodsRejected(_) => EventType::GoodsRejected,
        }
    }

    /// The correlation key: the order this event belongs to.
    pub fn order_id(&self) -> OrderId {
        match self {
            SagaEvent::OrderCreated(e) => e.id,
            SagaEvent::GoodsCreated(e) => e.order_id,
            SagaEvent::GoodsRejected(e) => e.order_id,
        }
    }

    /// Serializes the event into its `{"data": ...}` wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            SagaEvent::OrderCreated(data) => serde_json::to_vec(&Envelope { data })?,
            SagaEvent::GoodsCreated(data) => serde_json::to_vec(&Envelope { data })?,
            SagaEvent::GoodsRejected(data) => serde_json::to_vec(&Envelope { data })?,
        };
        Ok(bytes)
    }

    /// Decodes a payload received on the topic of `event_type`.
    pub fn decode(event_type: EventType, topic: &str, payload: &[u8]) -> Result<Self> {
        match event_type {
            EventType::OrderCreated => decode_data(topic, payload).map(SagaEvent::OrderCreated),
            EventType::GoodsCreated => decode_data(topic, payload).map(SagaEvent::GoodsCreated),
            EventType::GoodsRejected => decode_data(topic, payload).map(SagaEvent::GoodsRejected),
        }
    }
}

fn decode_data<T: DeserializeOwned>(topic: &str, payload: &[u8]) -> Result<T> {
    serde_json::from_slice::<Envelope<T>>(payload)
        .map(|envelope| envelope.data)
        .map_err(|e| SagaError::MalformedEvent {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
}
