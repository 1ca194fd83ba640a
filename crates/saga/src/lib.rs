//! Choreographed order saga between the order and goods services.
//!
//! No coordinator drives the saga. Each service reacts to the other's events:
//!
//! 1. The order service persists an order in `Created` and publishes
//!    `OrderCreated` ([`OrderCreationHandler`]).
//! 2. The goods service reserves stock and replies with `GoodsCreated` or
//!    `GoodsRejected` ([`GoodsReservationHandler`]).
//! 3. The order service moves the order to `Confirmed` or `Rejected`
//!    ([`OrderOutcomeHandler`]).
//!
//! Delivery is at-least-once, so both reactions are idempotent. Consumers are
//! wired through a [`Dispatcher`], which decodes messages, routes them by
//! [`EventType`] and parks anything it cannot process on the dead-letter
//! topic. [`OutboxRelay`] and [`StuckOrderSweep`] cover the gap between
//! persisting an order and publishing its event.

pub mod creation;
pub mod dead_letter;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod metrics;
pub mod outcome;
pub mod relay;
pub mod reservation;
pub mod state;
pub mod sweep;
pub mod topics;

pub use creation::{CreateOrder, OrderCreationHandler, OrderRepository, PublishMode};
pub use dead_letter::{DeadLetter, DeadLetterPublisher};
pub use dispatch::{Dispatcher, DispatcherBuilder, SagaHandler};
pub use error::{Result, SagaError};
pub use events::{Envelope, EventType, GoodsCreated, GoodsRejected, OrderCreated, SagaEvent};
pub use metrics::{
    IgnoreReason, MetricEvent, PrometheusMetrics, RecordingMetrics, RequestOutcome, SagaMetrics,
};
pub use outcome::{OrderOutcomeHandler, OutcomeResult};
pub use relay::OutboxRelay;
pub use reservation::GoodsReservationHandler;
pub use state::{Outcome, Transition, next_status};
pub use sweep::StuckOrderSweep;
pub use topics::{TopicClash, Topics};
