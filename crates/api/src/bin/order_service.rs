//! Order service: HTTP ingress, outcome consumer, outbox relay and sweep.

use std::sync::Arc;

use api::bootstrap::{self, BrokerHandle, OrderStores, StartupError};
use api::config::Config;
use api::telemetry;
use saga::{PrometheusMetrics, SagaMetrics};
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!(error = %e, "order service failed");
        eprintln!("order service failed: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let config = Config::from_env()?;
    telemetry::init_tracing(config.log_format);

    let metrics_handle = bootstrap::install_metrics()?;
    let metrics: Arc<dyn SagaMetrics> = Arc::new(PrometheusMetrics::new());

    let pool = bootstrap::connect_database(&config).await?;
    let stores = OrderStores::connect(pool.as_ref());
    let broker_handle = BrokerHandle::connect(&config)?;
    let broker = broker_handle.port(&config);

    bootstrap::start_order_consumer(&config, &stores, broker.clone(), metrics.clone()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = bootstrap::spawn_order_workers(
        &config,
        &stores,
        broker.clone(),
        metrics.clone(),
        &shutdown_rx,
    );

    let metrics_server = config.metrics_addr().map(|addr| {
        let app = api::ops_app(metrics_handle.clone());
        let shutdown = bootstrap::wait_for_shutdown(shutdown_rx.clone());
        tokio::spawn(async move { bootstrap::serve(&addr, app, shutdown).await })
    });

    let state = bootstrap::order_app_state(&config, &stores, broker, metrics);
    let app = api::create_app(state, metrics_handle);

    tracing::info!(
        addr = %config.addr(),
        publish_mode = ?config.publish_mode,
        "starting order service"
    );
    let served = bootstrap::serve(&config.addr(), app, telemetry::shutdown_signal()).await;

    shutdown_tx.send_replace(true);
    for worker in workers {
        let _ = worker.await;
    }
    if let Some(server) = metrics_server
        && let Ok(Err(e)) = server.await
    {
        tracing::warn!(error = %e, "metrics listener failed");
    }
    broker_handle.shutdown();

    tracing::info!("order service shut down gracefully");
    served
}
