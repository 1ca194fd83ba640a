//! Goods service: reserves stock for new orders.

use std::sync::Arc;

use api::bootstrap::{self, BrokerHandle, StartupError};
use api::config::Config;
use api::telemetry;
use saga::{PrometheusMetrics, SagaMetrics};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!(error = %e, "goods service failed");
        eprintln!("goods service failed: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let config = Config::from_env()?;
    telemetry::init_tracing(config.log_format);

    let metrics_handle = bootstrap::install_metrics()?;
    let metrics: Arc<dyn SagaMetrics> = Arc::new(PrometheusMetrics::new());

    let pool = bootstrap::connect_database(&config).await?;
    let inventory = bootstrap::goods_inventory(pool.as_ref(), &config.goods_seed).await?;
    let broker_handle = BrokerHandle::connect(&config)?;
    let broker = broker_handle.port(&config);

    bootstrap::start_goods_consumer(&config, inventory, broker, metrics).await?;

    tracing::info!(
        addr = %config.addr(),
        seeded_goods = config.goods_seed.len(),
        "starting goods service"
    );
    let served = bootstrap::serve(
        &config.addr(),
        api::ops_app(metrics_handle),
        telemetry::shutdown_signal(),
    )
    .await;

    broker_handle.shutdown();
    tracing::info!("goods service shut down gracefully");
    served
}
