//! Topic subscriptions shared by independent consumers

pub mod registry;

pub use registry::{MessageCallback, MessageListenerHandle, SubscriptionRegistry};
