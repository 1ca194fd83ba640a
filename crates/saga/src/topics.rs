//! Topic names for each saga event type.

use thiserror::Error;

use crate::events::EventType;

pub const DEFAULT_ORDER_CREATED_TOPIC: &str = "order.created";
pub const DEFAULT_GOODS_CREATED_TOPIC: &str = "goods.created";
pub const DEFAULT_GOODS_REJECTED_TOPIC: &str = "goods.rejected";
pub const DEFAULT_DEAD_LETTER_TOPIC: &str = "saga.dead-letter";

/// Two settings name the same topic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{first} and {second} both name topic '{topic}'")]
pub struct TopicClash {
    pub first: &'static str,
    pub second: &'static str,
    pub topic: String,
}

/// Topic names used by both services.
///
/// Reads from environment variables:
/// - `ORDER_CREATED_TOPIC` (default: `"order.created"`)
/// - `GOODS_CREATED_TOPIC` (default: `"goods.created"`)
/// - `GOODS_REJECTED_TOPIC` (default: `"goods.rejected"`)
/// - `DEAD_LETTER_TOPIC` (default: `"saga.dead-letter"`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub order_created: String,
    pub goods_created: String,
    pub goods_rejected: String,
    pub dead_letter: String,
}

impl Topics {
    /// Loads topic names from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads topic names through `lookup`; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str, default: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            order_created: var("ORDER_CREATED_TOPIC", DEFAULT_ORDER_CREATED_TOPIC),
            goods_created: var("GOODS_CREATED_TOPIC", DEFAULT_GOODS_CREATED_TOPIC),
            goods_rejected: var("GOODS_REJECTED_TOPIC", DEFAULT_GOODS_REJECTED_TOPIC),
            dead_letter: var("DEAD_LETTER_TOPIC", DEFAULT_DEAD_LETTER_TOPIC),
        }
    }

    /// Checks that every event type and the dead-letter topic have a topic
    /// of their own.
    pub fn validate(&self) -> Result<(), TopicClash> {
        let named = [
            ("ORDER_CREATED_TOPIC", &self.order_created),
            ("GOODS_CREATED_TOPIC", &self.goods_created),
            ("GOODS_REJECTED_TOPIC", &self.goods_rejected),
            ("DEAD_LETTER_TOPIC", &self.dead_letter),
        ];
        for (i, &(first, topic)) in named.iter().enumerate() {
            if let Some(&(second, _)) = named[i + 1..].iter().find(|(_, t)| *t == topic) {
                return Err(TopicClash {
                    first,
                    second,
                    topic: topic.clone(),
                });
            }
        }
        Ok(())
    }

    /// Returns the topic an event type is published on.
    pub fn topic_for(&self, event_type: EventType) -> &str {
        match event_type {
            EventType::OrderCreated => &self.order_created,
            EventType::GoodsCreated => &self.goods_created,
            EventType::GoodsRejected => &self.goods_rejected,
        }
    }

    /// Returns the event type carried by a topic, if any.
    pub fn event_type_for(&self, topic: &str) -> Option<EventType> {
        EventType::ALL
            .into_iter()
            .find(|t| self.topic_for(*t) == topic)
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            order_created: DEFAULT_ORDER_CREATED_TOPIC.to_string(),
            goods_created: DEFAULT_GOODS_CREATED_TOPIC.to_string(),
            goods_rejected: DEFAULT_GOODS_REJECTED_TOPIC.to_string(),
            dead_letter: DEFAULT_DEAD_LETTER_TOPIC.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_topics() {
        let topics = Topics::default();
        assert_eq!(topics.order_created, "order.created");
        assert_eq!(topics.goods_created, "goods.created");
        assert_eq!(topics.goods_rejected, "goods.rejected");
        assert_eq!(topics.dead_letter, "saga.dead-letter");
    }

    #[test]
    fn test_topic_lookup_round_trips() {
        let topics = Topics::default();
        for event_type in EventType::ALL {
            let topic = topics.topic_for(event_type);
            assert_eq!(topics.event_type_for(topic), Some(event_type));
        }
        assert_eq!(topics.event_type_for("saga.dead-letter"), None);
    }

    #[test]
    fn test_lookup_overrides_and_ignores_blanks() {
        let topics = Topics::from_lookup(|name| match name {
            "GOODS_CREATED_TOPIC" => Some("stock.reserved".to_string()),
            "DEAD_LETTER_TOPIC" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(topics.goods_created, "stock.reserved");
        assert_eq!(topics.dead_letter, "saga.dead-letter");
        assert_eq!(topics.order_created, "order.created");
    }

    #[test]
    fn test_default_topics_are_distinct() {
        assert_eq!(Topics::default().validate(), Ok(()));
    }

    #[test]
    fn test_shared_topic_is_rejected() {
        let topics = Topics::from_lookup(|name| match name {
            "GOODS_REJECTED_TOPIC" => Some("goods.created".to_string()),
            _ => None,
        });

        let clash = topics.validate().unwrap_err();
        assert_eq!(clash.first, "GOODS_CREATED_TOPIC");
        assert_eq!(clash.second, "GOODS_REJECTED_TOPIC");
        assert_eq!(clash.topic, "goods.created");
    }

    #[test]
    fn test_dead_letter_topic_must_differ() {
        let topics = Topics {
            dead_letter: "order.created".to_string(),
            ..Topics::default()
        };
        assert!(topics.validate().is_err());
    }
}
