//! Identifier types shared by the order and goods services.

pub mod types;

pub use types::{GoodsId, OrderId, UserId};
