//! # Domain Models
//!
//! Request-side and payload types shared by every gateway component.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Symbol`] | Validated ticker symbol |
//! | [`DataType`] | Requested data kind (`price`, `real-time`, ...) |
//! | [`Priority`] | Admission tier (high, medium, low) |
//! | [`WorkItem`] | One admitted request and its lifecycle state |
//! | [`Caller`] | Authenticated identity and [`Role`] |
//! | [`OhlcvBar`] | Normalized OHLCV observation |
//! | [`MarketPayload`] | Provider response as cached and returned |
//!
//! Constructors validate their inputs and return [`crate::ValidationError`]
//! on bad data, so a bar with `high < low` never reaches the cache.

mod data_type;
mod models;
mod symbol;
mod work_item;

pub use data_type::DataType;
pub use models::{MarketPayload, OhlcvBar};
pub use symbol::Symbol;
pub use work_item::{Caller, Priority, Role, WorkId, WorkItem, WorkState, DEFAULT_REGION};
