//! Measurement port for the saga.
//!
//! Components report through an explicit [`SagaMetrics`] handle instead of a
//! process-wide registry. [`PrometheusMetrics`] forwards to the `metrics`
//! facade; [`RecordingMetrics`] keeps an in-memory log for tests.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use store::{OrderStatus, ReservationDecision};

pub const REQUEST_SEND: &str = "request_send";
pub const REQUEST_PROCESSING_TIME: &str = "request_processing_time_seconds";
pub const REQUEST_PROCESSING_TIME_SUMMARY: &str = "request_processing_time_summary_seconds";
pub const WORK_ORDER_CREATE: &str = "work_order_create";

pub const REQUEST_PROCESSING_BUCKETS: [f64; 5] = [0.1, 0.15, 0.2, 0.25, 0.3];
pub const SUMMARY_QUANTILES: [f64; 3] = [0.5, 0.9, 0.99];

/// How an order-creation request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestOutcome {
    Success,
    FailedBadRequest,
    FailedServer,
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestOutcome::Success => "success",
            RequestOutcome::FailedBadRequest => "failed_bad_request",
            RequestOutcome::FailedServer => "failed_server",
        }
    }
}

/// Why an outcome event did not change an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IgnoreReason {
    AlreadyTerminal,
    OrderNotFound,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::AlreadyTerminal => "already_terminal",
            IgnoreReason::OrderNotFound => "order_not_found",
        }
    }
}

/// Sink for everything the saga measures.
pub trait SagaMetrics: Send + Sync {
    /// An order-creation request entered processing.
    fn request_started(&self);

    /// An order-creation request left processing.
    ///
    /// `operation` labels the latency histogram; the summary only tracks
    /// successful requests.
    fn request_finished(
        &self,
        outcome: RequestOutcome,
        operation: &str,
        status: u16,
        elapsed: Duration,
    );

    /// An order was persisted but its creation event was not published.
    fn order_orphaned(&self);

    fn outcome_applied(&self, status: OrderStatus);

    fn outcome_ignored(&self, reason: IgnoreReason);

    /// A consumer asked for redelivery after a transient failure.
    fn message_retried(&self, topic: &str);

    fn dead_lettered(&self, topic: &str);

    fn reservation_decided(&self, decision: &ReservationDecision, replayed: bool);

    fn stuck_orders_found(&self, count: usize);

    fn outbox_relayed(&self, count: usize);

    fn outbox_relay_failed(&self);
}

/// Builds a Prometheus exporter with the buckets and quantiles the saga's
/// latency metrics expect.
pub fn prometheus_builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(REQUEST_PROCESSING_TIME.to_string()),
            &REQUEST_PROCESSING_BUCKETS,
        )?
        .set_quantiles(&SUMMARY_QUANTILES)
}

/// Reports into the global `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetrics;

impl PrometheusMetrics {
    pub fn new() -> Self {
        Self
    }
}

impl SagaMetrics for PrometheusMetrics {
    fn request_started(&self) {
        metrics::gauge!(WORK_ORDER_CREATE).increment(1.0);
    }

    fn request_finished(
        &self,
        outcome: RequestOutcome,
        operation: &str,
        status: u16,
        elapsed: Duration,
    ) {
        let seconds = elapsed.as_secs_f64();
        metrics::counter!(REQUEST_SEND, "type" => outcome.as_str()).increment(1);
        metrics::histogram!(
            REQUEST_PROCESSING_TIME,
            "method" => operation.to_string(),
            "status" => status.to_string()
        )
        .record(seconds);
        if outcome == RequestOutcome::Success {
            metrics::histogram!(REQUEST_PROCESSING_TIME_SUMMARY).record(seconds);
        }
        metrics::gauge!(WORK_ORDER_CREATE).decrement(1.0);
    }

    fn order_orphaned(&self) {
        metrics::counter!("saga_orders_orphaned_total").increment(1);
    }

    fn outcome_applied(&self, status: OrderStatus) {
        metrics::counter!("saga_outcomes_applied_total", "status" => status.as_str()).increment(1);
    }

    fn outcome_ignored(&self, reason: IgnoreReason) {
        metrics::counter!("saga_outcomes_ignored_total", "reason" => reason.as_str()).increment(1);
    }

    fn message_retried(&self, topic: &str) {
        metrics::counter!("saga_messages_retried_total", "topic" => topic.to_string()).increment(1);
    }

    fn dead_lettered(&self, topic: &str) {
        metrics::counter!("saga_dead_letters_total", "topic" => topic.to_string()).increment(1);
    }

    fn reservation_decided(&self, decision: &ReservationDecision, replayed: bool) {
        metrics::counter!(
            "saga_reservations_total",
            "decision" => decision.as_str(),
            "replayed" => if replayed { "true" } else { "false" }
        )
        .increment(1);
    }

    fn stuck_orders_found(&self, count: usize) {
        metrics::gauge!("saga_stuck_orders").set(count as f64);
        metrics::counter!("saga_stuck_orders_found_total").increment(count as u64);
    }

    fn outbox_relayed(&self, count: usize) {
        metrics::counter!("saga_outbox_relayed_total").increment(count as u64);
    }

    fn outbox_relay_failed(&self) {
        metrics::counter!("saga_outbox_relay_failures_total").increment(1);
    }
}

/// A single measurement captured by [`RecordingMetrics`].
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    RequestStarted,
    RequestFinished {
        outcome: RequestOutcome,
        operation: String,
        status: u16,
    },
    OrderOrphaned,
    OutcomeApplied(OrderStatus),
    OutcomeIgnored(IgnoreReason),
    MessageRetried(String),
    DeadLettered(String),
    ReservationDecided { reserved: bool, replayed: bool },
    StuckOrdersFound(usize),
    OutboxRelayed(usize),
    OutboxRelayFailed,
}

/// Keeps every measurement in memory.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Counts recorded events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&MetricEvent) -> bool) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| predicate(e))
            .count()
    }

    /// Counts finished requests with the given outcome.
    pub fn requests(&self, outcome: RequestOutcome) -> usize {
        self.count(|e| matches!(e, MetricEvent::RequestFinished { outcome: o, .. } if *o == outcome))
    }

    /// Returns the number of requests started but not yet finished.
    pub fn in_flight(&self) -> i64 {
        let started = self.count(|e| matches!(e, MetricEvent::RequestStarted)) as i64;
        let finished = self.count(|e| matches!(e, MetricEvent::RequestFinished { .. })) as i64;
        started - finished
    }

    fn push(&self, event: MetricEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl SagaMetrics for RecordingMetrics {
    fn request_started(&self) {
        self.push(MetricEvent::RequestStarted);
    }

    fn request_finished(
        &self,
        outcome: RequestOutcome,
        operation: &str,
        status: u16,
        _elapsed: Duration,
    ) {
        self.push(MetricEvent::RequestFinished {
            outcome,
            operation: operation.to_string(),
            status,
        });
    }

    fn order_orphaned(&self) {
        self.push(MetricEvent::OrderOrphaned);
    }

    fn outcome_applied(&self, status: OrderStatus) {
        self.push(MetricEvent::OutcomeApplied(status));
    }

    fn outcome_ignored(&self, reason: IgnoreReason) {
        self.push(MetricEvent::OutcomeIgnored(reason));
    }

    fn message_retried(&self, topic: &str) {
        self.push(MetricEvent::MessageRetried(topic.to_string()));
    }

    fn dead_lettered(&self, topic: &str) {
        self.push(MetricEvent::DeadLettered(topic.to_string()));
    }

    fn reservation_decided(&self, decision: &ReservationDecision, replayed: bool) {
        self.push(MetricEvent::ReservationDecided {
            reserved: decision.is_reserved(),
            replayed,
        });
    }

    fn stuck_orders_found(&self, count: usize) {
        self.push(MetricEvent::StuckOrdersFound(count));
    }

    fn outbox_relayed(&self, count: usize) {
        self.push(MetricEvent::OutboxRelayed(count));
    }

    fn outbox_relay_failed(&self) {
        self.push(MetricEvent::OutboxRelayFailed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(RequestOutcome::Success.as_str(), "success");
        assert_eq!(
            RequestOutcome::FailedBadRequest.as_str(),
            "failed_bad_request"
        );
        assert_eq!(RequestOutcome::FailedServer.as_str(), "failed_server");
    }

    #[test]
    fn test_recording_tracks_in_flight_requests() {
        let metrics = RecordingMetrics::new();
        metrics.request_started();
        metrics.request_started();
        metrics.request_finished(
            RequestOutcome::FailedBadRequest,
            "CreateOrderV1",
            400,
            Duration::from_millis(3),
        );

        assert_eq!(metrics.in_flight(), 1);
        assert_eq!(metrics.requests(RequestOutcome::FailedBadRequest), 1);
        assert_eq!(metrics.requests(RequestOutcome::Success), 0);
    }

    #[test]
    fn test_prometheus_renders_latency_buckets_and_summary() {
        let recorder = prometheus_builder().unwrap().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            let sink = PrometheusMetrics::new();
            sink.request_started();
            sink.request_finished(
                RequestOutcome::Success,
                "CreateOrderV1",
                201,
                Duration::from_millis(120),
            );
        });

        let rendered = handle.render();
        assert!(rendered.contains(r#"request_send{type="success"} 1"#));
        assert!(rendered.contains("request_processing_time_seconds_bucket"));
        assert!(rendered.contains(r#"le="0.15""#));
        assert!(rendered.contains(r#"request_processing_time_summary_seconds{quantile="0.99"}"#));
        assert!(rendered.contains("work_order_create 0"));
    }

    #[test]
    fn test_summary_tracks_successful_requests_only() {
        let recorder = prometheus_builder().unwrap().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            let sink = PrometheusMetrics::new();
            sink.request_started();
            sink.request_finished(
                RequestOutcome::FailedServer,
                "CreateOrderV1",
                500,
                Duration::from_millis(80),
            );
        });

        let rendered = handle.render();
        assert!(rendered.contains(r#"request_send{type="failed_server"} 1"#));
        assert!(rendered.contains(r#"method="CreateOrderV1""#));
        assert!(!rendered.contains("request_processing_time_summary_seconds"));
    }
}
