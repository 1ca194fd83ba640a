use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Result;

/// Where an acknowledged message landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub partition: i32,
    pub offset: i64,
}

/// A message handed to a subscriber.
///
/// Owns its data so it can be held across await points.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery of the same offset.
    pub attempt: u32,
}

impl Delivery {
    /// Returns the payload as UTF-8 text.
    pub fn payload_str(&self) -> std::result::Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.payload)
    }

    /// Deserializes a JSON payload.
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Returns true if this message has been delivered before.
    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}

/// A handler's verdict on a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The effect is durable; advance past this message.
    Commit,
    /// The effect did not complete; deliver this message again.
    Retry,
}

/// Serializes a value into a JSON payload.
pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}
