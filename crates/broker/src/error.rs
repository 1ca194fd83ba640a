use thiserror::Error;

/// Errors returned by broker adapters.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The publish deadline expired before the broker acknowledged the message.
    ///
    /// The message may or may not have been written.
    #[error("Publish to topic '{topic}' timed out after {timeout_ms}ms (outcome unknown)")]
    Timeout { topic: String, timeout_ms: u64 },

    /// The broker rejected or failed to write the message.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Registering a subscription failed.
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// The broker client could not be created or lost its connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker has been shut down.
    #[error("Broker is shut down")]
    Closed,

    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// Returns true when the publish outcome is unknown rather than failed.
    ///
    /// Callers must not assume the message was lost.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, BrokerError::Timeout { .. })
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_are_indeterminate() {
        let timeout = BrokerError::Timeout {
            topic: "order.created".to_string(),
            timeout_ms: 5000,
        };
        assert!(timeout.is_indeterminate());
        assert!(!BrokerError::Publish("boom".to_string()).is_indeterminate());
        assert!(!BrokerError::Closed.is_indeterminate());
    }

    #[test]
    fn timeout_message_mentions_unknown_outcome() {
        let err = BrokerError::Timeout {
            topic: "goods.created".to_string(),
            timeout_ms: 250,
        };
        let msg = err.to_string();
        assert!(msg.contains("goods.created"));
        assert!(msg.contains("outcome unknown"));
    }
}
