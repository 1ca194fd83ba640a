//! Infrastructure wiring shared by the service binaries.
//!
//! Everything here picks an implementation from [`Config`]: Postgres when
//! `DATABASE_URL` is set, otherwise in-memory stores; Kafka when
//! `KAFKA_BROKERS` is set (and the `kafka` feature is on), otherwise the
//! in-memory broker.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use broker::{BrokerError, InMemoryBroker, MessageBroker, TimeoutBroker};
use common::GoodsId;
use metrics_exporter_prometheus::{BuildError, PrometheusHandle};
use saga::{
    DispatcherBuilder, EventType, GoodsReservationHandler, OrderCreationHandler,
    OrderOutcomeHandler, OrderRepository, OutboxRelay, PublishMode, SagaError, SagaMetrics,
    StuckOrderSweep,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use store::{
    GoodsInventory, InMemoryGoodsInventory, InMemoryOrderStore, OrderStore, Outbox,
    PostgresGoodsInventory, PostgresOrderStore, StoreError,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{Config, ConfigError};
use crate::routes::orders::AppState;

pub const ORDER_SERVICE_GROUP: &str = "order-service";
pub const GOODS_SERVICE_GROUP: &str = "goods-service";

/// Errors that stop a service from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Saga wiring error: {0}")]
    Saga(#[from] SagaError),

    #[error("Metrics recorder error: {0}")]
    Metrics(#[from] BuildError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("KAFKA_BROKERS is set but this binary was built without the `kafka` feature")]
    KafkaDisabled,
}

/// Installs the global Prometheus recorder.
pub fn install_metrics() -> Result<PrometheusHandle, StartupError> {
    Ok(saga::metrics::prometheus_builder()?.install_recorder()?)
}

/// The broker a process talks to, kept concrete so it can be shut down.
pub enum BrokerHandle {
    Memory(InMemoryBroker),
    #[cfg(feature = "kafka")]
    Kafka(Arc<broker::KafkaBroker>),
}

impl BrokerHandle {
    /// Connects to Kafka when configured, otherwise starts an in-memory broker.
    pub fn connect(config: &Config) -> Result<Self, StartupError> {
        match &config.kafka_brokers {
            None => Ok(Self::in_memory(config)),
            #[cfg(feature = "kafka")]
            Some(servers) => {
                let kafka_config = broker::KafkaBrokerConfig {
                    publish_timeout: config.publish_timeout,
                    redelivery_delay: config.redelivery_delay,
                    ..broker::KafkaBrokerConfig::new(servers.clone())
                };
                Ok(BrokerHandle::Kafka(Arc::new(broker::KafkaBroker::new(
                    kafka_config,
                )?)))
            }
            #[cfg(not(feature = "kafka"))]
            Some(_) => Err(StartupError::KafkaDisabled),
        }
    }

    pub fn in_memory(config: &Config) -> Self {
        tracing::info!("using in-memory broker");
        BrokerHandle::Memory(InMemoryBroker::with_config(
            broker::memory::DEFAULT_PARTITIONS,
            config.redelivery_delay,
        ))
    }

    /// The broker port, with every publish bounded by the configured timeout.
    pub fn port(&self, config: &Config) -> Arc<dyn MessageBroker> {
        match self {
            BrokerHandle::Memory(b) => {
                Arc::new(TimeoutBroker::new(b.clone(), config.publish_timeout))
            }
            #[cfg(feature = "kafka")]
            BrokerHandle::Kafka(b) => {
                Arc::new(TimeoutBroker::new(b.clone(), config.publish_timeout))
            }
        }
    }

    pub fn shutdown(&self) {
        match self {
            BrokerHandle::Memory(b) => b.shutdown(),
            #[cfg(feature = "kafka")]
            BrokerHandle::Kafka(b) => b.shutdown(),
        }
    }
}

/// Opens the Postgres pool and applies migrations, if a database is configured.
pub async fn connect_database(config: &Config) -> Result<Option<PgPool>, StartupError> {
    let Some(url) = &config.database_url else {
        tracing::info!("DATABASE_URL not set, using in-memory stores");
        return Ok(None);
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(url)
        .await?;
    store::run_migrations(&pool).await?;
    tracing::info!(max_connections = config.database_max_connections, "database ready");
    Ok(Some(pool))
}

/// One order store viewed through each port that needs it.
#[derive(Clone)]
pub struct OrderStores {
    pub repository: Arc<dyn OrderRepository>,
    pub orders: Arc<dyn OrderStore>,
    pub outbox: Arc<dyn Outbox>,
}

impl OrderStores {
    pub fn new<S: OrderStore + Outbox + 'static>(store: S) -> Self {
        let store = Arc::new(store);
        Self {
            repository: store.clone(),
            orders: store.clone(),
            outbox: store,
        }
    }

    pub fn connect(pool: Option<&PgPool>) -> Self {
        match pool {
            Some(pool) => Self::new(PostgresOrderStore::new(pool.clone())),
            None => Self::new(InMemoryOrderStore::new()),
        }
    }
}

/// Builds the goods inventory and applies the configured seed stock.
pub async fn goods_inventory(
    pool: Option<&PgPool>,
    seed: &[(GoodsId, i64)],
) -> Result<Arc<dyn GoodsInventory>, StartupError> {
    match pool {
        Some(pool) => {
            let inventory = PostgresGoodsInventory::new(pool.clone());
            if !seed.is_empty() {
                inventory.set_stock(seed).await?;
            }
            Ok(Arc::new(inventory))
        }
        None => Ok(Arc::new(InMemoryGoodsInventory::with_stock(
            seed.iter().copied(),
        ))),
    }
}

/// Builds the order routes' state.
pub fn order_app_state(
    config: &Config,
    stores: &OrderStores,
    broker: Arc<dyn MessageBroker>,
    metrics: Arc<dyn SagaMetrics>,
) -> Arc<AppState> {
    let orders = OrderCreationHandler::new(
        stores.repository.clone(),
        broker,
        config.topics.clone(),
        config.publish_mode,
        metrics.clone(),
    );
    Arc::new(AppState { orders, metrics })
}

/// Subscribes the order service to goods outcomes.
pub async fn start_order_consumer(
    config: &Config,
    stores: &OrderStores,
    broker: Arc<dyn MessageBroker>,
    metrics: Arc<dyn SagaMetrics>,
) -> Result<(), StartupError> {
    let dispatcher = DispatcherBuilder::new(config.topics.clone(), metrics.clone())
        .expect(&[EventType::GoodsCreated, EventType::GoodsRejected])
        .register(Arc::new(OrderOutcomeHandler::new(
            stores.orders.clone(),
            metrics,
        )))
        .dead_letters(broker.clone())
        .build()?;

    Arc::new(dispatcher)
        .subscribe(&*broker, &config.consumer_group_or(ORDER_SERVICE_GROUP))
        .await?;
    Ok(())
}

/// Subscribes the goods service to new orders.
pub async fn start_goods_consumer(
    config: &Config,
    inventory: Arc<dyn GoodsInventory>,
    broker: Arc<dyn MessageBroker>,
    metrics: Arc<dyn SagaMetrics>,
) -> Result<(), StartupError> {
    let dispatcher = DispatcherBuilder::new(config.topics.clone(), metrics.clone())
        .expect(&[EventType::OrderCreated])
        .register(Arc::new(GoodsReservationHandler::new(
            inventory,
            broker.clone(),
            config.topics.clone(),
            metrics,
        )))
        .dead_letters(broker.clone())
        .build()?;

    Arc::new(dispatcher)
        .subscribe(&*broker, &config.consumer_group_or(GOODS_SERVICE_GROUP))
        .await?;
    Ok(())
}

/// Spawns the order service's background loops: the outbox relay (outbox
/// mode only) and the stuck-order sweep.
pub fn spawn_order_workers(
    config: &Config,
    stores: &OrderStores,
    broker: Arc<dyn MessageBroker>,
    metrics: Arc<dyn SagaMetrics>,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    if config.publish_mode == PublishMode::Outbox {
        let relay = OutboxRelay::new(stores.outbox.clone(), broker.clone(), metrics.clone())
            .with_poll_interval(config.outbox_poll_interval);
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move { relay.run(shutdown).await }));
    }

    let mut sweep = StuckOrderSweep::new(
        stores.orders.clone(),
        config.topics.clone(),
        config.stuck_order_threshold,
        metrics,
    );
    if config.stuck_order_republish {
        sweep = sweep.republish_with(broker);
    }
    let interval = config.stuck_order_sweep_interval;
    let shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move { sweep.run(interval, shutdown).await }));

    tasks
}

/// Serves `app` on `addr` until `shutdown` resolves.
pub async fn serve(
    addr: &str,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), StartupError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Resolves once `shutdown` flips to true or its sender is dropped.
pub async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
