//! # Broadcast Hub
//!
//! The `data_receiver` side of the relay: a topic registry with non-blocking fan-out
//! (`dispatcher`) and the two-surface WebSocket server around it (`server`).

/// Subscriber registry and per-topic fan-out.
pub mod dispatcher;
/// Public and ingress WebSocket surfaces.
pub mod server;

pub use dispatcher::{
    DispatcherStatsSnapshot, PublishReport, SlowSubscriberPolicy, SubscriberId, Subscription,
    TopicDispatcher, DEFAULT_SUBSCRIBER_BUFFER, DEFAULT_TOPIC,
};
pub use server::{BoundHub, BroadcastHub, HubSettings, HubStatsProbe, HubStatsSnapshot, HEALTH_PATH};
