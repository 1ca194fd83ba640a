//! HTTP ingress and service wiring for the order saga.
//!
//! The order service accepts `POST /v1/orders`, persists the order and starts
//! its saga; the goods service only exposes health and metrics. Both log
//! through `tracing` and expose Prometheus metrics.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod routes;
pub mod telemetry;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use routes::orders::AppState;

/// Creates the order service router.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/health", get(routes::health::check))
        .route("/v1/orders", post(routes::orders::create))
        .with_state(state)
        .merge(routes::metrics::router(metrics_handle))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates a router with only `/health` and `/metrics`, for services
/// without HTTP ingress.
pub fn ops_app(metrics_handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/health", get(routes::health::check))
        .merge(routes::metrics::router(metrics_handle))
        .layer(TraceLayer::new_for_http())
}
