//! Dead-letter routing for messages that can never be processed.

use std::sync::Arc;

use broker::{BrokerExt, Delivery, MessageBroker};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SagaError};
use crate::metrics::SagaMetrics;

/// Envelope published to the dead-letter topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub source_topic: String,
    pub key: Option<String>,
    /// The original payload bytes, base64-encoded on the wire.
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    pub error: String,
    pub attempt: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_delivery(delivery: &Delivery, error: &SagaError) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_topic: delivery.topic.clone(),
            key: delivery.key.clone(),
            payload: delivery.payload.clone(),
            error: error.to_string(),
            attempt: delivery.attempt,
            failed_at: Utc::now(),
        }
    }

    /// Key the dead letter is published under: the original key, or the
    /// source position when the message had none.
    pub fn routing_key(&self, delivery: &Delivery) -> String {
        self.key.clone().unwrap_or_else(|| {
            format!(
                "{}-{}-{}",
                delivery.topic, delivery.partition, delivery.offset
            )
        })
    }
}

mod payload_base64 {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(payload).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Publishes dead letters.
pub struct DeadLetterPublisher {
    broker: Arc<dyn MessageBroker>,
    topic: String,
    metrics: Arc<dyn SagaMetrics>,
}

impl DeadLetterPublisher {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        topic: impl Into<String>,
        metrics: Arc<dyn SagaMetrics>,
    ) -> Self {
        Self {
            broker,
            topic: topic.into(),
            metrics,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Routes `delivery` to the dead-letter topic.
    ///
    /// An error means the message was not parked and must not be committed.
    pub async fn publish(&self, delivery: &Delivery, error: &SagaError) -> Result<()> {
        let letter = DeadLetter::from_delivery(delivery, error);
        let key = letter.routing_key(delivery);

        self.broker
            .publish_json(&self.topic, &key, &letter)
            .await
            .map_err(SagaError::Publish)?;

        tracing::warn!(
            source_topic = %delivery.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            dead_letter_id = %letter.id,
            error = %error,
            "message routed to dead-letter topic"
        );
        self.metrics.dead_lettered(&delivery.topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use broker::InMemoryBroker;

    use super::*;
    use crate::metrics::{MetricEvent, RecordingMetrics};

    fn delivery(key: Option<&str>) -> Delivery {
        Delivery {
            topic: "order.created".to_string(),
            partition: 2,
            offset: 17,
            key: key.map(String::from),
            payload: b"{not json".to_vec(),
            attempt: 1,
        }
    }

    fn malformed() -> SagaError {
        SagaError::MalformedEvent {
            topic: "order.created".to_string(),
            reason: "expected value".to_string(),
        }
    }

    #[tokio::test]
    async fn test_dead_letter_keeps_original_key_and_payload() {
        let broker = InMemoryBroker::new();
        let metrics = Arc::new(RecordingMetrics::new());
        let publisher =
            DeadLetterPublisher::new(Arc::new(broker.clone()), "saga.dead-letter", metrics.clone());

        publisher
            .publish(&delivery(Some("42")), &malformed())
            .await
            .unwrap();

        let messages = broker.messages("saga.dead-letter").await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].key, "42");

        let letter: DeadLetter = messages[0].json().unwrap();
        assert_eq!(letter.source_topic, "order.created");
        assert_eq!(letter.payload, b"{not json");
        assert_eq!(letter.attempt, 1);
        assert!(letter.error.contains("Malformed event"));
        assert_eq!(
            metrics.count(|e| *e == MetricEvent::DeadLettered("order.created".to_string())),
            1
        );
    }

    #[tokio::test]
    async fn test_binary_payload_survives_dead_lettering() {
        let broker = InMemoryBroker::new();
        let publisher = DeadLetterPublisher::new(
            Arc::new(broker.clone()),
            "saga.dead-letter",
            Arc::new(RecordingMetrics::new()),
        );
        let mut binary = delivery(Some("5"));
        binary.payload = vec![0xFF, 0xFE];

        publisher.publish(&binary, &malformed()).await.unwrap();

        let messages = broker.messages("saga.dead-letter").await;
        let raw: serde_json::Value = messages[0].json().unwrap();
        assert_eq!(raw["payload"], "//4=");

        let letter: DeadLetter = messages[0].json().unwrap();
        assert_eq!(letter.payload, vec![0xFF, 0xFE]);
    }

    #[tokio::test]
    async fn test_keyless_message_uses_source_position() {
        let broker = InMemoryBroker::new();
        let publisher = DeadLetterPublisher::new(
            Arc::new(broker.clone()),
            "saga.dead-letter",
            Arc::new(RecordingMetrics::new()),
        );

        publisher.publish(&delivery(None), &malformed()).await.unwrap();

        let messages = broker.messages("saga.dead-letter").await;
        assert_eq!(messages[0].key, "order.created-2-17");
    }

    #[tokio::test]
    async fn test_failed_dead_letter_publish_is_reported() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(1).await;
        let metrics = Arc::new(RecordingMetrics::new());
        let publisher =
            DeadLetterPublisher::new(Arc::new(broker.clone()), "saga.dead-letter", metrics.clone());

        let result = publisher.publish(&delivery(Some("1")), &malformed()).await;

        assert!(matches!(result, Err(SagaError::Publish(_))));
        assert_eq!(metrics.events(), vec![]);
    }
}
