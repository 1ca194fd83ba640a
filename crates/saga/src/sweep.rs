//! Periodic detection of orders stuck in `Created`.

use std::sync::Arc;
use std::time::Duration;

use broker::MessageBroker;
use chrono::Utc;
use common::OrderId;
use store::{Order, OrderStore};
use tokio::sync::watch;

use crate::error::{Result, SagaError};
use crate::events::{OrderCreated, SagaEvent};
use crate::metrics::SagaMetrics;
use crate::topics::Topics;

pub const DEFAULT_SWEEP_BATCH: usize = 100;

/// Finds orders that have sat in `Created` longer than a threshold.
///
/// Such orders usually mean the `OrderCreated` event was never published
/// (an orphan from a failed direct publish). The sweep always reports them;
/// with a broker attached it also republishes `OrderCreated`, which the goods
/// side handles idempotently.
pub struct StuckOrderSweep {
    store: Arc<dyn OrderStore>,
    republish: Option<Arc<dyn MessageBroker>>,
    topics: Topics,
    threshold: Duration,
    batch_size: usize,
    metrics: Arc<dyn SagaMetrics>,
}

impl StuckOrderSweep {
    pub fn new(
        store: Arc<dyn OrderStore>,
        topics: Topics,
        threshold: Duration,
        metrics: Arc<dyn SagaMetrics>,
    ) -> Self {
        Self {
            store,
            republish: None,
            topics,
            threshold,
            batch_size: DEFAULT_SWEEP_BATCH,
            metrics,
        }
    }

    /// Republishes `OrderCreated` for every stuck order found.
    pub fn republish_with(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.republish = Some(broker);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Runs one sweep and returns the IDs of the stuck orders it found.
    #[tracing::instrument(skip(self), fields(threshold_secs = self.threshold.as_secs()))]
    pub async fn run_once(&self) -> Result<Vec<OrderId>> {
        let threshold = chrono::Duration::from_std(self.threshold)
            .map_err(|e| SagaError::Configuration(format!("invalid stuck-order threshold: {e}")))?;
        let cutoff = Utc::now() - threshold;

        let stuck = self
            .store
            .find_stale_created(cutoff, self.batch_size)
            .await?;
        self.metrics.stuck_orders_found(stuck.len());

        for order in &stuck {
            tracing::warn!(
                order_id = %order.id,
                created_at = %order.created_at,
                "order stuck in Created"
            );
            if let Some(broker) = &self.republish {
                self.republish_order(&**broker, order).await?;
            }
        }

        Ok(stuck.iter().map(|o| o.id).collect())
    }

    async fn republish_order(&self, broker: &dyn MessageBroker, order: &Order) -> Result<()> {
        let payload = SagaEvent::OrderCreated(OrderCreated {
            id: order.id,
            goods_ids: order.goods_ids.clone(),
        })
        .encode()?;

        broker
            .publish(&self.topics.order_created, &order.id.message_key(), &payload)
            .await?;
        tracing::info!(order_id = %order.id, "OrderCreated republished for stuck order");
        Ok(())
    }

    /// Sweeps every `interval` until `shutdown` flips to true.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = interval.as_secs(),
            republish = self.republish.is_some(),
            "stuck-order sweep started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.run_once().await {
                tracing::error!(error = %e, "stuck-order sweep failed");
            }
        }

        tracing::info!("stuck-order sweep stopped");
    }
}
