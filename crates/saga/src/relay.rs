//! Outbox relay: publishes queued `OrderCreated` events.

use std::sync::Arc;
use std::time::Duration;

use broker::MessageBroker;
use store::Outbox;
use tokio::sync::watch;

use crate::error::Result;
use crate::metrics::SagaMetrics;

/// Default number of records published per pass.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default pause between passes when the outbox is drained.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Drains the order outbox into the broker.
///
/// Records are published in insertion order. A pass stops at the first failed
/// publish so that a later message for the same key never overtakes an
/// earlier one; the failed record is retried on the next pass. Delivery is
/// at-least-once: a crash between publish and mark republishes the record.
pub struct OutboxRelay {
    outbox: Arc<dyn Outbox>,
    broker: Arc<dyn MessageBroker>,
    metrics: Arc<dyn SagaMetrics>,
    batch_size: usize,
    poll_interval: Duration,
}

impl OutboxRelay {
    pub fn new(
        outbox: Arc<dyn Outbox>,
        broker: Arc<dyn MessageBroker>,
        metrics: Arc<dyn SagaMetrics>,
    ) -> Self {
        Self {
            outbox,
            broker,
            metrics,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Publishes one batch of pending records and returns how many went out.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> Result<usize> {
        let pending = self.outbox.pending_outbox(self.batch_size).await?;
        let mut published = 0;

        for record in pending {
            let message = &record.message;
            match self
                .broker
                .publish(&message.topic, &message.key, &message.payload)
                .await
            {
                Ok(receipt) => {
                    self.outbox.mark_outbox_published(record.id).await?;
                    tracing::debug!(
                        outbox_id = record.id,
                        topic = %message.topic,
                        key = %message.key,
                        partition = receipt.partition,
                        offset = receipt.offset,
                        "outbox record published"
                    );
                    published += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        outbox_id = record.id,
                        attempts = record.attempts + 1,
                        error = %e,
                        "outbox publish failed, will retry"
                    );
                    self.metrics.outbox_relay_failed();
                    self.outbox
                        .record_outbox_failure(record.id, &e.to_string())
                        .await?;
                    break;
                }
            }
        }

        if published > 0 {
            self.metrics.outbox_relayed(published);
        }
        Ok(published)
    }

    /// Runs passes until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            batch_size = self.batch_size,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "outbox relay started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let drained = match self.run_once().await {
                Ok(count) => count < self.batch_size,
                Err(e) => {
                    tracing::error!(error = %e, "outbox relay pass failed");
                    true
                }
            };

            if drained {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("outbox relay stopped");
    }
}
