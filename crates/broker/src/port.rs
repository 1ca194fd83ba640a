use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::message::{Ack, Delivery, PublishReceipt, encode_json};
use crate::Result;

/// Capability a subscriber provides to the broker.
///
/// Invoked once per delivered message. Returning [`Ack::Commit`] advances the
/// group past the message; [`Ack::Retry`] makes the broker deliver it again.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, delivery: &Delivery) -> Ack;
}

/// Publish/subscribe over named topics with consumer-group semantics.
///
/// Delivery is at-least-once. Messages published to the same topic with the
/// same key reach that topic's consumers in publish order; messages with
/// different keys carry no relative ordering.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publishes a message and waits for the broker's acknowledgment.
    ///
    /// A [`crate::BrokerError::Timeout`] means the outcome is unknown.
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<PublishReceipt>;

    /// Registers `handler` as a member of `group_id` on `topic`.
    ///
    /// Each message is delivered to exactly one live member of the group.
    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()>;
}

#[async_trait]
impl<B: MessageBroker + ?Sized> MessageBroker for Arc<B> {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<PublishReceipt> {
        (**self).publish(topic, key, payload).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        (**self).subscribe(topic, group_id, handler).await
    }
}

/// Convenience methods available on every broker.
#[async_trait]
pub trait BrokerExt: MessageBroker {
    /// Serializes `value` as JSON and publishes it.
    async fn publish_json<T: Serialize + Sync>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<PublishReceipt> {
        let payload = encode_json(value)?;
        self.publish(topic, key, &payload).await
    }
}

impl<B: MessageBroker + ?Sized> BrokerExt for B {}
