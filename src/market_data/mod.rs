pub mod consumer;
pub mod events;
pub mod tick;
pub mod underlying;

// Re-export the hot-path types for convenient access
// (e.g. `use crate::market_data::OptionTick`).
pub use events::{SubscriptionEvent, SubscriptionEventType};
pub use tick::{DepthLevel, DepthSnapshot, OptionTick, UnderlyingBar};
pub use underlying::UnderlyingTracker;
