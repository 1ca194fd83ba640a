use thiserror::Error;

use crate::OrderStatus;

/// Errors that can occur when reading or writing saga state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A transition was requested into a status that cannot follow `Created`.
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    /// A persisted status code does not map to any known status.
    #[error("Unknown order status code: {0}")]
    UnknownStatus(i16),

    /// A persisted reservation decision could not be interpreted.
    #[error("Unknown reservation decision: {0}")]
    UnknownDecision(String),

    /// The outbox record does not exist.
    #[error("Outbox record not found: {0}")]
    OutboxRecordNotFound(i64),

    /// The backing store cannot serve requests right now.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Building an outbox payload failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
