//! Persistence for the order saga.
//!
//! Orders and their outbox live behind [`OrderStore`] and [`Outbox`]; the
//! goods side keeps stock and a per-order reservation ledger behind
//! [`GoodsInventory`]. Each port has an in-memory and a PostgreSQL
//! implementation.

pub mod error;
pub mod goods;
pub mod inventory;
pub mod memory;
pub mod order;
pub mod orders;
pub mod outbox;
pub mod postgres;
pub mod status;

pub use error::{Result, StoreError};
pub use goods::{GoodsInventory, Reservation, ReservationDecision};
pub use inventory::InMemoryGoodsInventory;
pub use memory::InMemoryOrderStore;
pub use order::{NewOrder, Order};
pub use orders::{OrderStore, TransitionOutcome};
pub use outbox::{Outbox, OutboxMessage, OutboxMessageBuilder, OutboxRecord};
pub use postgres::{PostgresGoodsInventory, PostgresOrderStore, run_migrations};
pub use status::OrderStatus;
