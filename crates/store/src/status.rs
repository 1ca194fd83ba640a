use serde::{Deserialize, Serialize};

use crate::{Result, StoreError};

/// Status of an order in the saga.
///
/// `Created` is the only non-terminal status. Once an order is `Confirmed` or
/// `Rejected` it never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Created,
    Confirmed,
    Rejected,
}

impl OrderStatus {
    /// Returns the code persisted in the `status_id` column.
    pub const fn code(&self) -> i16 {
        match self {
            Self::Created => 1,
            Self::Confirmed => 2,
            Self::Rejected => 3,
        }
    }

    /// Maps a persisted status code back to a status.
    pub fn from_code(code: i16) -> Result<Self> {
        match code {
            1 => Ok(Self::Created),
            2 => Ok(Self::Confirmed),
            3 => Ok(Self::Rejected),
            other => Err(StoreError::UnknownStatus(other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Rejected)
    }

    /// Returns true if an order in this status may move to `target`.
    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        matches!(self, Self::Created) && target.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Confirmed => "Confirmed",
            Self::Rejected => "Rejected",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
