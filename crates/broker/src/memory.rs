use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, watch};

use crate::message::{Ack, Delivery, PublishReceipt};
use crate::port::{MessageBroker, MessageHandler};
use crate::{BrokerError, Result};

/// Number of partitions per topic unless configured otherwise.
pub const DEFAULT_PARTITIONS: usize = 4;

/// Pause before a message acked with [`Ack::Retry`] is delivered again.
pub const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct StoredMessage {
    sequence: u64,
    key: String,
    payload: Vec<u8>,
}

struct TopicLog {
    partitions: Vec<Vec<StoredMessage>>,
    appended: watch::Sender<u64>,
}

impl TopicLog {
    fn new(partitions: usize) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            partitions: vec![Vec::new(); partitions],
            appended,
        }
    }
}

struct GroupState {
    members: Vec<Arc<dyn MessageHandler>>,
    /// Next offset to deliver, per partition.
    committed: Vec<i64>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
    groups: HashMap<(String, String), GroupState>,
    next_sequence: u64,
    fail_next_publishes: usize,
}

impl BrokerState {
    fn topic_mut(&mut self, topic: &str, partitions: usize) -> &mut TopicLog {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog::new(partitions))
    }

    fn next_delivery(
        &self,
        topic: &str,
        group_id: &str,
        partition: usize,
    ) -> Option<(Arc<dyn MessageHandler>, i64, StoredMessage)> {
        let group = self.groups.get(&(topic.to_string(), group_id.to_string()))?;
        if group.members.is_empty() {
            return None;
        }
        let offset = group.committed[partition];
        let message = self.topics.get(topic)?.partitions[partition].get(offset as usize)?;
        let member = group.members[partition % group.members.len()].clone();
        Some((member, offset, message.clone()))
    }

    fn commit(&mut self, topic: &str, group_id: &str, partition: usize, offset: i64) {
        if let Some(group) = self
            .groups
            .get_mut(&(topic.to_string(), group_id.to_string()))
            && group.committed[partition] == offset
        {
            group.committed[partition] = offset + 1;
        }
    }

    fn is_idle(&self) -> bool {
        self.groups.iter().all(|((topic, _), group)| {
            let Some(log) = self.topics.get(topic) else {
                return true;
            };
            log.partitions
                .iter()
                .zip(&group.committed)
                .all(|(messages, committed)| *committed as usize >= messages.len())
        })
    }
}

struct Inner {
    state: RwLock<BrokerState>,
    partitions: usize,
    redelivery_delay: Duration,
    shutdown: watch::Sender<bool>,
}

/// A message as it sits in the in-memory log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub key: String,
    pub payload: Vec<u8>,
    pub partition: i32,
    pub offset: i64,
}

impl PublishedMessage {
    /// Deserializes the JSON payload.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// In-process broker with partitioned topics and consumer groups.
///
/// Keys are hashed onto a fixed number of partitions. Each (topic, group,
/// partition) is drained by its own task, so a key's messages are handled one
/// at a time in publish order while different partitions run in parallel.
/// New groups start from the earliest offset.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Creates a broker with [`DEFAULT_PARTITIONS`] partitions per topic.
    pub fn new() -> Self {
        Self::with_config(DEFAULT_PARTITIONS, DEFAULT_REDELIVERY_DELAY)
    }

    /// Creates a broker with an explicit partition count and redelivery delay.
    pub fn with_config(partitions: usize, redelivery_delay: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(BrokerState::default()),
                partitions: partitions.max(1),
                redelivery_delay,
                shutdown,
            }),
        }
    }

    /// Returns the partition a key is routed to.
    pub fn partition_for_key(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.inner.partitions as u64) as usize
    }

    /// Makes the next `count` publishes fail without writing anything.
    pub async fn fail_next_publishes(&self, count: usize) {
        self.inner.state.write().await.fail_next_publishes = count;
    }

    /// Returns every message on `topic` in publish order.
    pub async fn messages(&self, topic: &str) -> Vec<PublishedMessage> {
        let state = self.inner.state.read().await;
        let Some(log) = state.topics.get(topic) else {
            return Vec::new();
        };

        let mut messages: Vec<(u64, PublishedMessage)> = log
            .partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, messages)| {
                messages.iter().enumerate().map(move |(offset, m)| {
                    (
                        m.sequence,
                        PublishedMessage {
                            key: m.key.clone(),
                            payload: m.payload.clone(),
                            partition: partition as i32,
                            offset: offset as i64,
                        },
                    )
                })
            })
            .collect();
        messages.sort_by_key(|(sequence, _)| *sequence);
        messages.into_iter().map(|(_, m)| m).collect()
    }

    /// Returns the next offset `group_id` will receive on a partition.
    pub async fn committed_offset(&self, topic: &str, group_id: &str, partition: usize) -> i64 {
        self.inner
            .state
            .read()
            .await
            .groups
            .get(&(topic.to_string(), group_id.to_string()))
            .and_then(|g| g.committed.get(partition).copied())
            .unwrap_or(0)
    }

    /// Waits until every group has committed every message, or `timeout` elapses.
    ///
    /// Returns false on timeout.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.inner.state.read().await.is_idle() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stops all dispatch tasks. Further publishes and subscribes fail.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<PublishReceipt> {
        if self.is_shut_down() {
            return Err(BrokerError::Closed);
        }

        let partition = self.partition_for_key(key);
        let mut state = self.inner.state.write().await;

        if state.fail_next_publishes > 0 {
            state.fail_next_publishes -= 1;
            return Err(BrokerError::Publish(format!(
                "injected failure publishing to '{topic}'"
            )));
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let log = state.topic_mut(topic, self.inner.partitions);
        let messages = &mut log.partitions[partition];
        let offset = messages.len() as i64;
        messages.push(StoredMessage {
            sequence,
            key: key.to_string(),
            payload: payload.to_vec(),
        });
        log.appended.send_modify(|count| *count += 1);

        tracing::debug!(topic, key, partition, offset, "message published");
        Ok(PublishReceipt {
            partition: partition as i32,
            offset,
        })
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        if self.is_shut_down() {
            return Err(BrokerError::Closed);
        }

        let mut state = self.inner.state.write().await;
        let log = state.topic_mut(topic, self.inner.partitions);
        let receivers: Vec<watch::Receiver<u64>> = (0..self.inner.partitions)
            .map(|_| log.appended.subscribe())
            .collect();

        let group_key = (topic.to_string(), group_id.to_string());
        if let Some(group) = state.groups.get_mut(&group_key) {
            group.members.push(handler);
            tracing::info!(
                topic,
                group_id,
                members = group.members.len(),
                "member joined consumer group"
            );
            return Ok(());
        }

        state.groups.insert(
            group_key,
            GroupState {
                members: vec![handler],
                committed: vec![0; self.inner.partitions],
            },
        );
        drop(state);

        for (partition, appended) in receivers.into_iter().enumerate() {
            tokio::spawn(dispatch_partition(
                self.inner.clone(),
                topic.to_string(),
                group_id.to_string(),
                partition,
                appended,
            ));
        }

        tracing::info!(
            topic,
            group_id,
            partitions = self.inner.partitions,
            "consumer group started"
        );
        Ok(())
    }
}

async fn dispatch_partition(
    inner: Arc<Inner>,
    topic: String,
    group_id: String,
    partition: usize,
    mut appended: watch::Receiver<u64>,
) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut attempt = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }
        appended.borrow_and_update();

        let next = inner
            .state
            .read()
            .await
            .next_delivery(&topic, &group_id, partition);

        let Some((handler, offset, message)) = next else {
            tokio::select! {
                _ = shutdown.changed() => {}
                changed = appended.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        };

        attempt += 1;
        let delivery = Delivery {
            topic: topic.clone(),
            partition: partition as i32,
            offset,
            key: Some(message.key),
            payload: message.payload,
            attempt,
        };

        match handler.on_message(&delivery).await {
            Ack::Commit => {
                inner
                    .state
                    .write()
                    .await
                    .commit(&topic, &group_id, partition, offset);
                attempt = 0;
            }
            Ack::Retry => {
                tracing::warn!(
                    topic = %topic,
                    group_id = %group_id,
                    partition,
                    offset,
                    attempt,
                    "handler requested redelivery"
                );
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(inner.redelivery_delay) => {}
                }
            }
        }
    }

    tracing::debug!(topic = %topic, group_id = %group_id, partition, "partition dispatcher stopped");
}
