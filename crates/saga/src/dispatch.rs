//! Routes broker deliveries to saga handlers by event type.
//!
//! A [`Dispatcher`] is assembled with a [`DispatcherBuilder`] that knows which
//! event types the service must handle. `build` fails unless each of them has
//! exactly one handler, so a missing subscription is a startup error rather
//! than silently ignored traffic.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use broker::{Ack, Delivery, MessageBroker, MessageHandler};

use crate::dead_letter::DeadLetterPublisher;
use crate::error::{Result, SagaError};
use crate::events::{EventType, SagaEvent};
use crate::metrics::SagaMetrics;
use crate::topics::Topics;

/// Business logic for one or more saga event types.
#[async_trait]
pub trait SagaHandler: Send + Sync {
    /// Processes a decoded event.
    ///
    /// Transient errors ([`SagaError::is_transient`]) lead to redelivery; any
    /// other error sends the message to the dead-letter topic.
    async fn handle(&self, event: SagaEvent, delivery: &Delivery) -> Result<()>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// The event types this handler accepts.
    fn handles(&self) -> &'static [EventType];
}

/// Collects handlers and validates the wiring.
pub struct DispatcherBuilder {
    topics: Topics,
    expected: Vec<EventType>,
    handlers: BTreeMap<EventType, Arc<dyn SagaHandler>>,
    duplicates: Vec<EventType>,
    dead_letters: Option<DeadLetterPublisher>,
    metrics: Arc<dyn SagaMetrics>,
}

impl DispatcherBuilder {
    pub fn new(topics: Topics, metrics: Arc<dyn SagaMetrics>) -> Self {
        Self {
            topics,
            expected: Vec::new(),
            handlers: BTreeMap::new(),
            duplicates: Vec::new(),
            dead_letters: None,
            metrics,
        }
    }

    /// Declares the event types this service must consume.
    pub fn expect(mut self, event_types: &[EventType]) -> Self {
        self.expected.extend_from_slice(event_types);
        self
    }

    /// Registers `handler` for every event type it declares.
    pub fn register(mut self, handler: Arc<dyn SagaHandler>) -> Self {
        for event_type in handler.handles() {
            if self.handlers.insert(*event_type, handler.clone()).is_some() {
                self.duplicates.push(*event_type);
            }
        }
        self
    }

    /// Routes undecodable and permanently failing messages to the
    /// dead-letter topic through `broker`.
    pub fn dead_letters(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.dead_letters = Some(DeadLetterPublisher::new(
            broker,
            self.topics.dead_letter.clone(),
            self.metrics.clone(),
        ));
        self
    }

    pub fn build(self) -> Result<Dispatcher> {
        self.topics
            .validate()
            .map_err(|clash| SagaError::Configuration(clash.to_string()))?;

        if let Some(event_type) = self.duplicates.first() {
            return Err(SagaError::Configuration(format!(
                "more than one handler registered for {event_type}"
            )));
        }

        let missing: Vec<String> = self
            .expected
            .iter()
            .filter(|t| !self.handlers.contains_key(t))
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(SagaError::Configuration(format!(
                "no handler registered for {}",
                missing.join(", ")
            )));
        }

        if let Some(unexpected) = self
            .handlers
            .keys()
            .find(|t| !self.expected.contains(t))
        {
            return Err(SagaError::Configuration(format!(
                "handler registered for {unexpected}, which this service does not consume"
            )));
        }

        let dead_letters = self.dead_letters.ok_or_else(|| {
            SagaError::Configuration("dead-letter publisher not configured".to_string())
        })?;

        Ok(Dispatcher {
            topics: self.topics,
            handlers: self.handlers,
            dead_letters,
            metrics: self.metrics,
        })
    }
}

/// A validated set of handlers, usable as a broker [`MessageHandler`].
pub struct Dispatcher {
    topics: Topics,
    handlers: BTreeMap<EventType, Arc<dyn SagaHandler>>,
    dead_letters: DeadLetterPublisher,
    metrics: Arc<dyn SagaMetrics>,
}

impl Dispatcher {
    /// Event types this dispatcher consumes.
    pub fn event_types(&self) -> impl Iterator<Item = EventType> + '_ {
        self.handlers.keys().copied()
    }

    /// Subscribes to every handled topic as a member of `group_id`.
    pub async fn subscribe(
        self: Arc<Self>,
        broker: &dyn MessageBroker,
        group_id: &str,
    ) -> Result<()> {
        for event_type in self.event_types() {
            let topic = self.topics.topic_for(event_type);
            broker
                .subscribe(topic, group_id, self.clone())
                .await
                .map_err(|source| SagaError::Subscribe {
                    topic: topic.to_string(),
                    source,
                })?;
            tracing::info!(%topic, group_id, %event_type, "saga consumer subscribed");
        }
        Ok(())
    }

    async fn dispatch(&self, delivery: &Delivery) -> Result<()> {
        let event_type = self
            .topics
            .event_type_for(&delivery.topic)
            .filter(|t| self.handlers.contains_key(t))
            .ok_or_else(|| SagaError::MalformedEvent {
                topic: delivery.topic.clone(),
                reason: "no handler for topic".to_string(),
            })?;

        let event = SagaEvent::decode(event_type, &delivery.topic, &delivery.payload)?;

        match self.handlers.get(&event_type) {
            Some(handler) => {
                tracing::debug!(handler = handler.name(), %event_type, "dispatching event");
                handler.handle(event, delivery).await
            }
            None => Err(SagaError::Configuration(format!(
                "no handler registered for {event_type}"
            ))),
        }
    }

    async fn park(&self, delivery: &Delivery, error: &SagaError) -> Ack {
        match self.dead_letters.publish(delivery, error).await {
            Ok(()) => Ack::Commit,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    topic = %delivery.topic,
                    offset = delivery.offset,
                    "dead-letter publish failed, message will be redelivered"
                );
                self.metrics.message_retried(&delivery.topic);
                Ack::Retry
            }
        }
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    #[tracing::instrument(
        skip(self, delivery),
        fields(
            topic = %delivery.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            attempt = delivery.attempt
        )
    )]
    async fn on_message(&self, delivery: &Delivery) -> Ack {
        match self.dispatch(delivery).await {
            Ok(()) => Ack::Commit,
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "transient failure, requesting redelivery");
                self.metrics.message_retried(&delivery.topic);
                Ack::Retry
            }
            Err(e) => self.park(delivery, &e).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use broker::{BrokerError, InMemoryBroker};
    use common::OrderId;

    use super::*;
    use crate::dead_letter::DeadLetter;
    use crate::metrics::{MetricEvent, RecordingMetrics};

    enum Behaviour {
        Succeed,
        Transient,
        Permanent,
    }

    struct StubHandler {
        types: &'static [EventType],
        behaviour: Behaviour,
        seen: Mutex<Vec<OrderId>>,
    }

    impl StubHandler {
        fn new(types: &'static [EventType], behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                types,
                behaviour,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SagaHandler for StubHandler {
        async fn handle(&self, event: SagaEvent, _delivery: &Delivery) -> Result<()> {
            self.seen.lock().unwrap().push(event.order_id());
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Transient => Err(SagaError::Publish(BrokerError::Publish(
                    "broker unavailable".to_string(),
                ))),
                Behaviour::Permanent => Err(SagaError::Validation("poison".to_string())),
            }
        }

        fn name(&self) -> &'static str {
            "stub"
        }

        fn handles(&self) -> &'static [EventType] {
            self.types
        }
    }

    const OUTCOMES: &[EventType] = &[EventType::GoodsCreated, EventType::GoodsRejected];

    fn builder(broker: &InMemoryBroker, metrics: Arc<RecordingMetrics>) -> DispatcherBuilder {
        DispatcherBuilder::new(Topics::default(), metrics)
            .expect(OUTCOMES)
            .dead_letters(Arc::new(broker.clone()))
    }

    fn delivery(topic: &str, payload: &[u8]) -> Delivery {
        Delivery {
            topic: topic.to_string(),
            partition: 0,
            offset: 3,
            key: Some("8".to_string()),
            payload: payload.to_vec(),
            attempt: 1,
        }
    }

    const GOODS_CREATED: &[u8] = br#"{"data":{"order_id":8,"goods_ids":[1]}}"#;

    #[test]
    fn test_missing_handler_fails_build() {
        let broker = InMemoryBroker::new();
        let result = builder(&broker, Arc::new(RecordingMetrics::new()))
            .register(StubHandler::new(&[EventType::GoodsCreated], Behaviour::Succeed))
            .build();

        match result {
            Err(SagaError::Configuration(msg)) => assert!(msg.contains("GoodsRejected")),
            other => panic!("expected configuration error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_duplicate_handler_fails_build() {
        let broker = InMemoryBroker::new();
        let result = builder(&broker, Arc::new(RecordingMetrics::new()))
            .register(StubHandler::new(OUTCOMES, Behaviour::Succeed))
            .register(StubHandler::new(&[EventType::GoodsRejected], Behaviour::Succeed))
            .build();

        assert!(matches!(result, Err(SagaError::Configuration(_))));
    }

    #[test]
    fn test_unexpected_handler_fails_build() {
        let broker = InMemoryBroker::new();
        let result = builder(&broker, Arc::new(RecordingMetrics::new()))
            .register(StubHandler::new(OUTCOMES, Behaviour::Succeed))
            .register(StubHandler::new(&[EventType::OrderCreated], Behaviour::Succeed))
            .build();

        assert!(matches!(result, Err(SagaError::Configuration(_))));
    }

    #[test]
    fn test_dead_letter_publisher_is_required() {
        let result = DispatcherBuilder::new(Topics::default(), Arc::new(RecordingMetrics::new()))
            .expect(OUTCOMES)
            .register(StubHandler::new(OUTCOMES, Behaviour::Succeed))
            .build();

        assert!(matches!(result, Err(SagaError::Configuration(_))));
    }

    #[test]
    fn test_shared_topic_fails_build() {
        let broker = InMemoryBroker::new();
        let topics = Topics::from_lookup(|name| match name {
            "GOODS_REJECTED_TOPIC" => Some("goods.created".to_string()),
            _ => None,
        });
        let result = DispatcherBuilder::new(topics, Arc::new(RecordingMetrics::new()))
            .expect(OUTCOMES)
            .register(StubHandler::new(OUTCOMES, Behaviour::Succeed))
            .dead_letters(Arc::new(broker))
            .build();

        match result {
            Err(SagaError::Configuration(msg)) => assert!(msg.contains("goods.created")),
            other => panic!("expected configuration error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_reported_as_subscribe() {
        let broker = InMemoryBroker::new();
        let dispatcher = builder(&broker, Arc::new(RecordingMetrics::new()))
            .register(StubHandler::new(OUTCOMES, Behaviour::Succeed))
            .build()
            .unwrap();
        broker.shutdown();

        let result = Arc::new(dispatcher).subscribe(&broker, "order-service").await;

        match result {
            Err(SagaError::Subscribe { topic, source }) => {
                assert_eq!(topic, "goods.created");
                assert!(matches!(source, BrokerError::Closed));
            }
            other => panic!("expected subscribe error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_success_commits() {
        let broker = InMemoryBroker::new();
        let handler = StubHandler::new(OUTCOMES, Behaviour::Succeed);
        let dispatcher = builder(&broker, Arc::new(RecordingMetrics::new()))
            .register(handler.clone())
            .build()
            .unwrap();

        let ack = dispatcher
            .on_message(&delivery("goods.created", GOODS_CREATED))
            .await;

        assert_eq!(ack, Ack::Commit);
        assert_eq!(*handler.seen.lock().unwrap(), vec![OrderId::new(8)]);
    }

    #[tokio::test]
    async fn test_transient_failure_retries() {
        let broker = InMemoryBroker::new();
        let metrics = Arc::new(RecordingMetrics::new());
        let dispatcher = builder(&broker, metrics.clone())
            .register(StubHandler::new(OUTCOMES, Behaviour::Transient))
            .build()
            .unwrap();

        let ack = dispatcher
            .on_message(&delivery("goods.created", GOODS_CREATED))
            .await;

        assert_eq!(ack, Ack::Retry);
        assert!(broker.messages("saga.dead-letter").await.is_empty());
        assert_eq!(
            metrics.count(|e| matches!(e, MetricEvent::MessageRetried(_))),
            1
        );
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dead_lettered() {
        let broker = InMemoryBroker::new();
        let handler = StubHandler::new(OUTCOMES, Behaviour::Succeed);
        let dispatcher = builder(&broker, Arc::new(RecordingMetrics::new()))
            .register(handler.clone())
            .build()
            .unwrap();

        let ack = dispatcher
            .on_message(&delivery("goods.rejected", b"{\"data\":"))
            .await;

        assert_eq!(ack, Ack::Commit);
        assert!(handler.seen.lock().unwrap().is_empty());

        let parked = broker.messages("saga.dead-letter").await;
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].key, "8");
        let letter: DeadLetter = parked[0].json().unwrap();
        assert_eq!(letter.source_topic, "goods.rejected");
        assert_eq!(letter.payload, b"{\"data\":");
    }

    #[tokio::test]
    async fn test_permanent_failure_is_dead_lettered() {
        let broker = InMemoryBroker::new();
        let dispatcher = builder(&broker, Arc::new(RecordingMetrics::new()))
            .register(StubHandler::new(OUTCOMES, Behaviour::Permanent))
            .build()
            .unwrap();

        let ack = dispatcher
            .on_message(&delivery("goods.created", GOODS_CREATED))
            .await;

        assert_eq!(ack, Ack::Commit);
        assert_eq!(broker.messages("saga.dead-letter").await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_dead_letter_publish_retries() {
        let broker = InMemoryBroker::new();
        let dispatcher = builder(&broker, Arc::new(RecordingMetrics::new()))
            .register(StubHandler::new(OUTCOMES, Behaviour::Succeed))
            .build()
            .unwrap();
        broker.fail_next_publishes(1).await;

        let ack = dispatcher
            .on_message(&delivery("goods.created", b"garbage"))
            .await;

        assert_eq!(ack, Ack::Retry);
        assert!(broker.messages("saga.dead-letter").await.is_empty());
    }

    #[tokio::test]
    async fn test_unhandled_topic_is_dead_lettered() {
        let broker = InMemoryBroker::new();
        let dispatcher = builder(&broker, Arc::new(RecordingMetrics::new()))
            .register(StubHandler::new(OUTCOMES, Behaviour::Succeed))
            .build()
            .unwrap();

        let ack = dispatcher
            .on_message(&delivery("order.created", br#"{"data":{"id":8,"goods_ids":[]}}"#))
            .await;

        assert_eq!(ack, Ack::Commit);
        assert_eq!(broker.messages("saga.dead-letter").await.len(), 1);
    }
}
