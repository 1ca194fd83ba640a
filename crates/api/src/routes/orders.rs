//! Order creation endpoint.

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::{GoodsId, OrderId, UserId};
use saga::{CreateOrder, OrderCreationHandler, RequestOutcome, SagaMetrics};
use serde::{Deserialize, Serialize};
use store::OrderStatus;

use crate::error::ApiError;

/// Shared state for the order routes.
pub struct AppState {
    pub orders: OrderCreationHandler,
    pub metrics: Arc<dyn SagaMetrics>,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub user_id: i64,
    pub goods_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct OrderCreatedResponse {
    pub id: OrderId,
    pub status: OrderStatus,
}

/// Operation label on the request latency histogram.
pub const CREATE_ORDER_OPERATION: &str = "CreateOrderV1";

/// Status recorded when the client goes away before a response is produced.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Tracks one creation request in the in-flight gauge.
///
/// Dropping the guard without [`RequestGuard::finish`] (the handler future
/// was cancelled) still closes the request, as a server-side failure with
/// status 499.
struct RequestGuard {
    metrics: Arc<dyn SagaMetrics>,
    started: Instant,
    finished: bool,
}

impl RequestGuard {
    fn start(metrics: Arc<dyn SagaMetrics>) -> Self {
        metrics.request_started();
        Self {
            metrics,
            started: Instant::now(),
            finished: false,
        }
    }

    fn finish(mut self, outcome: RequestOutcome, status: StatusCode) {
        self.record(outcome, status.as_u16());
    }

    fn record(&mut self, outcome: RequestOutcome, status: u16) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.metrics.request_finished(
            outcome,
            CREATE_ORDER_OPERATION,
            status,
            self.started.elapsed(),
        );
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!("order request abandoned before completion");
            self.record(RequestOutcome::FailedServer, CLIENT_CLOSED_REQUEST);
        }
    }
}

/// `POST /v1/orders`: persists an order and starts its saga.
///
/// Responds as soon as the order is stored and `OrderCreated` is published
/// (or queued); the saga outcome is not part of the response.
pub async fn create(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> Response {
    let guard = RequestGuard::start(state.metrics.clone());

    let result = create_order(&state, body).await;
    let (outcome, response) = match result {
        Ok(created) => (
            RequestOutcome::Success,
            (StatusCode::CREATED, Json(created)).into_response(),
        ),
        Err(e) => {
            let outcome = if e.status().is_client_error() {
                RequestOutcome::FailedBadRequest
            } else {
                RequestOutcome::FailedServer
            };
            (outcome, e.into_response())
        }
    };

    guard.finish(outcome, response.status());
    response
}

async fn create_order(
    state: &AppState,
    body: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> Result<OrderCreatedResponse, ApiError> {
    let Json(request) = body.map_err(|rejection| {
        tracing::debug!(error = %rejection.body_text(), "rejected order request body");
        ApiError::BadRequest(rejection.body_text())
    })?;

    let command = CreateOrder::new(
        UserId::new(request.user_id),
        request.goods_ids.into_iter().map(GoodsId::new).collect(),
    )?;

    let order = state.orders.create(command).await?;
    Ok(OrderCreatedResponse {
        id: order.id,
        status: order.status,
    })
}
