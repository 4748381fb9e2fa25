//! Driftbox Client
//!
//! Consumer-side subscription machinery for the driftbox event stream:
//! a reconnecting WebSocket subscription with linear capped backoff,
//! catch-up merge on (re)connect, and bounded duplicate suppression.

pub mod backoff;
pub mod dedup;
pub mod subscription;

pub use backoff::delay_for_attempt;
pub use dedup::RecentIds;
pub use subscription::{
    SubscriptionConfig, SubscriptionEvent, SubscriptionManager, SubscriptionStatus,
};
