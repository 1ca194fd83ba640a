pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod message;
pub mod port;
pub mod timeout;

pub use error::{BrokerError, Result};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBroker, KafkaBrokerConfig};
pub use memory::{InMemoryBroker, PublishedMessage};
pub use message::{Ack, Delivery, PublishReceipt, encode_json};
pub use port::{BrokerExt, MessageBroker, MessageHandler};
pub use timeout::{DEFAULT_PUBLISH_TIMEOUT, TimeoutBroker};
