//! Kafka adapter for the broker port.
//!
//! Records are keyed by the caller's key so the default partitioner keeps a
//! key's messages on one partition. Each subscription gets its own
//! `StreamConsumer` in the requested group with auto-commit disabled; offsets
//! are committed only after the handler acks [`Ack::Commit`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use rdkafka::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::watch;

use crate::message::{Ack, Delivery, PublishReceipt};
use crate::port::{MessageBroker, MessageHandler};
use crate::{BrokerError, Result};

/// Connection settings for [`KafkaBroker`].
#[derive(Debug, Clone)]
pub struct KafkaBrokerConfig {
    /// Comma-separated bootstrap servers.
    pub bootstrap_servers: String,
    /// Where a brand-new consumer group starts reading.
    pub auto_offset_reset: String,
    /// How long the producer may spend delivering one message.
    pub publish_timeout: Duration,
    /// Pause before a message acked with [`Ack::Retry`] is handled again.
    pub redelivery_delay: Duration,
    /// Extra librdkafka properties (security, client id, ...).
    pub extra: Vec<(String, String)>,
}

impl KafkaBrokerConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            auto_offset_reset: "earliest".to_string(),
            publish_timeout: Duration::from_secs(5),
            redelivery_delay: Duration::from_millis(500),
            extra: Vec::new(),
        }
    }

    /// Adds a raw librdkafka property.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    fn producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set(
                "message.timeout.ms",
                self.publish_timeout.as_millis().to_string(),
            )
            .set("acks", "all")
            .set("enable.idempotence", "true");
        self.apply_extra(&mut config);
        config
    }

    fn consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset);
        self.apply_extra(&mut config);
        config
    }

    fn apply_extra(&self, config: &mut ClientConfig) {
        for (key, value) in &self.extra {
            config.set(key, value);
        }
    }
}

/// Broker port backed by Apache Kafka.
pub struct KafkaBroker {
    producer: FutureProducer,
    config: KafkaBrokerConfig,
    shutdown: watch::Sender<bool>,
}

impl KafkaBroker {
    pub fn new(config: KafkaBrokerConfig) -> Result<Self> {
        let producer: FutureProducer = config
            .producer_config()
            .create()
            .map_err(|e| BrokerError::Connection(format!("failed to create producer: {e}")))?;

        tracing::info!(bootstrap_servers = %config.bootstrap_servers, "kafka producer ready");

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            producer,
            config,
            shutdown,
        })
    }

    /// Stops every consumer loop started by this broker.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

fn map_publish_error(topic: &str, timeout: Duration, err: KafkaError) -> BrokerError {
    match err {
        KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut) => BrokerError::Timeout {
            topic: topic.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        },
        other => BrokerError::Publish(other.to_string()),
    }
}

#[async_trait]
impl MessageBroker for KafkaBroker {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<PublishReceipt> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        let (partition, offset) = self
            .producer
            .send(record, self.config.publish_timeout)
            .await
            .map_err(|(e, _)| map_publish_error(topic, self.config.publish_timeout, e))?;

        tracing::debug!(topic, key, partition, offset, "message published");
        Ok(PublishReceipt { partition, offset })
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let consumer: StreamConsumer = self
            .config
            .consumer_config(group_id)
            .create()
            .map_err(|e| BrokerError::Connection(format!("failed to create consumer: {e}")))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| BrokerError::Subscribe(format!("failed to subscribe to '{topic}': {e}")))?;

        tracing::info!(topic, group_id, "kafka consumer subscribed");

        tokio::spawn(consume(
            consumer,
            handler,
            self.config.redelivery_delay,
            self.shutdown.subscribe(),
        ));
        Ok(())
    }
}

async fn consume(
    consumer: StreamConsumer,
    handler: Arc<dyn MessageHandler>,
    redelivery_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut stream = consumer.stream();

    loop {
        let received = tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            received = stream.next() => received,
        };

        let Some(received) = received else {
            tracing::warn!("kafka message stream ended");
            break;
        };

        let mut delivery = match received {
            Ok(message) => Delivery {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message
                    .key()
                    .and_then(|k| std::str::from_utf8(k).ok())
                    .map(String::from),
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                attempt: 1,
            },
            Err(e) => {
                tracing::error!(error = %e, "kafka consumer error");
                continue;
            }
        };

        // The offset stays uncommitted until the handler commits, so a crash
        // here hands the message to another group member after rebalance.
        loop {
            match handler.on_message(&delivery).await {
                Ack::Commit => {
                    if let Err(e) = commit(&consumer, &delivery) {
                        tracing::error!(
                            error = %e,
                            topic = %delivery.topic,
                            partition = delivery.partition,
                            offset = delivery.offset,
                            "failed to commit offset"
                        );
                    }
                    break;
                }
                Ack::Retry => {
                    tracing::warn!(
                        topic = %delivery.topic,
                        partition = delivery.partition,
                        offset = delivery.offset,
                        attempt = delivery.attempt,
                        "handler requested redelivery"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                        _ = tokio::time::sleep(redelivery_delay) => {}
                    }
                    delivery.attempt += 1;
                }
            }
        }
    }

    tracing::info!("kafka consumer loop stopped");
}

fn commit(consumer: &StreamConsumer, delivery: &Delivery) -> std::result::Result<(), KafkaError> {
    let mut offsets = TopicPartitionList::new();
    offsets.add_partition_offset(
        &delivery.topic,
        delivery.partition,
        Offset::Offset(delivery.offset + 1),
    )?;
    consumer.commit(&offsets, CommitMode::Sync)
}
