//! Saga error types.

use broker::BrokerError;
use common::OrderId;
use store::StoreError;
use thiserror::Error;

/// Errors that can occur while driving the order saga.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The order request failed validation. Nothing was persisted.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The order store or goods ledger failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The order row exists but its `OrderCreated` event was not published.
    #[error("Order {order_id} was persisted but OrderCreated was not published: {source}")]
    OrderOrphaned {
        order_id: OrderId,
        #[source]
        source: BrokerError,
    },

    /// Publishing an event failed.
    #[error("Publish error: {0}")]
    Publish(#[from] BrokerError),

    /// Joining a consumer group failed.
    #[error("Subscribe to '{topic}' failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BrokerError,
    },

    /// A delivered message could not be decoded.
    #[error("Malformed event on topic '{topic}': {reason}")]
    MalformedEvent { topic: String, reason: String },

    /// Encoding an event failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The saga wiring is incomplete or inconsistent.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl SagaError {
    /// Returns true if a consumer should ask for redelivery.
    pub fn is_transient(&self) -> bool {
        matches!(self, SagaError::Store(_) | SagaError::Publish(_))
    }

    /// Returns true if the publish outcome behind this error is unknown.
    pub fn is_indeterminate(&self) -> bool {
        match self {
            SagaError::Publish(e) | SagaError::OrderOrphaned { source: e, .. } => {
                e.is_indeterminate()
            }
            _ => false,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
