use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::message::PublishReceipt;
use crate::port::{MessageBroker, MessageHandler};
use crate::{BrokerError, Result};

/// Default deadline for a publish acknowledgment.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Decorator that bounds every publish with a deadline.
///
/// An expired deadline is reported as [`BrokerError::Timeout`]; the wrapped
/// publish may still complete on the broker side.
#[derive(Clone)]
pub struct TimeoutBroker<B> {
    inner: B,
    timeout: Duration,
}

impl<B: MessageBroker> TimeoutBroker<B> {
    pub fn new(inner: B, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl<B: MessageBroker> MessageBroker for TimeoutBroker<B> {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<PublishReceipt> {
        match tokio::time::timeout(self.timeout, self.inner.publish(topic, key, payload)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(topic, key, timeout_ms = self.timeout.as_millis() as u64, "publish timed out");
                Err(BrokerError::Timeout {
                    topic: topic.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        self.inner.subscribe(topic, group_id, handler).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowBroker {
        delay: Duration,
    }

    #[async_trait]
    impl MessageBroker for SlowBroker {
        async fn publish(&self, _topic: &str, _key: &str, _payload: &[u8]) -> Result<PublishReceipt> {
            tokio::time::sleep(self.delay).await;
            Ok(PublishReceipt {
                partition: 0,
                offset: 0,
            })
        }

        async fn subscribe(
            &self,
            _topic: &str,
            _group_id: &str,
            _handler: Arc<dyn MessageHandler>,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_publish_becomes_indeterminate_timeout() {
        let broker = TimeoutBroker::new(
            SlowBroker {
                delay: Duration::from_secs(10),
            },
            Duration::from_millis(100),
        );

        let err = broker.publish("order.created", "1", b"{}").await.unwrap_err();
        assert!(err.is_indeterminate());
        assert!(matches!(err, BrokerError::Timeout { timeout_ms: 100, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn fast_publish_passes_through() {
        let broker = TimeoutBroker::new(
            SlowBroker {
                delay: Duration::from_millis(10),
            },
            DEFAULT_PUBLISH_TIMEOUT,
        );

        let receipt = broker.publish("order.created", "1", b"{}").await.unwrap();
        assert_eq!(receipt, PublishReceipt { partition: 0, offset: 0 });
    }
}
