use serde::{Deserialize, Serialize};

macro_rules! int_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw identifier.
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            /// Returns the raw identifier.
            pub const fn as_i64(&self) -> i64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

int_id! {
    /// Identifier of an order, assigned by the order store on insert.
    ///
    /// Doubles as the broker partition key and the idempotency key for every
    /// event in the order's saga.
    OrderId
}

int_id! {
    /// Identifier of the user who owns an order.
    UserId
}

int_id! {
    /// Identifier of a goods item that can be reserved.
    GoodsId
}

impl OrderId {
    /// Returns the broker message key for this order.
    pub fn message_key(&self) -> String {
        self.0.to_string()
    }

    /// Parses a broker message key back into an order ID.
    pub fn from_message_key(key: &str) -> Option<Self> {
        key.parse().ok().map(Self)
    }
}
