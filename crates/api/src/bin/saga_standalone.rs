//! Both services in one process, connected by the in-memory broker.
//!
//! Handy for local runs: `GOODS_SEED=1:10,2:3 cargo run --bin saga-standalone`
//! and then `POST /v1/orders`.

use std::sync::Arc;

use api::bootstrap::{self, BrokerHandle, OrderStores, StartupError};
use api::config::Config;
use api::telemetry;
use saga::{PrometheusMetrics, SagaMetrics};
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!(error = %e, "standalone saga failed");
        eprintln!("standalone saga failed: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let config = Config::from_env()?;
    telemetry::init_tracing(config.log_format);
    if config.kafka_brokers.is_some() {
        tracing::warn!("KAFKA_BROKERS is ignored by the standalone binary");
    }

    let metrics_handle = bootstrap::install_metrics()?;
    let metrics: Arc<dyn SagaMetrics> = Arc::new(PrometheusMetrics::new());

    let pool = bootstrap::connect_database(&config).await?;
    let stores = OrderStores::connect(pool.as_ref());
    let inventory = bootstrap::goods_inventory(pool.as_ref(), &config.goods_seed).await?;

    let broker_handle = BrokerHandle::in_memory(&config);
    let broker = broker_handle.port(&config);

    bootstrap::start_goods_consumer(&config, inventory, broker.clone(), metrics.clone()).await?;
    bootstrap::start_order_consumer(&config, &stores, broker.clone(), metrics.clone()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = bootstrap::spawn_order_workers(
        &config,
        &stores,
        broker.clone(),
        metrics.clone(),
        &shutdown_rx,
    );

    let state = bootstrap::order_app_state(&config, &stores, broker, metrics);
    let app = api::create_app(state, metrics_handle);

    tracing::info!(addr = %config.addr(), "starting standalone saga");
    let served = bootstrap::serve(&config.addr(), app, telemetry::shutdown_signal()).await;

    shutdown_tx.send_replace(true);
    for worker in workers {
        let _ = worker.await;
    }
    broker_handle.shutdown();

    tracing::info!("standalone saga shut down gracefully");
    served
}
