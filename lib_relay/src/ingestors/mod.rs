//! # Relay Pipelines
//!
//! The two halves of the `trade_listener` process. They share nothing but a
//! `HandoffChannel<String>`:
//!
//! - **`binance_wss`**: the `IngestionPipeline`. A receiving stream client on the exchange
//!   trade feed whose handler parses each frame, runs it through the significance filter
//!   and pushes the resulting payload into the handoff channel.
//! - **`forwarder`**: the `ForwardingPipeline`. Drains the handoff channel into a
//!   send-only stream client connected to the data receiver's ingress surface.
//!
//! Delivery from exchange to data receiver is at-most-once: moves produced while the
//! forward connection is down are popped and dropped, never retransmitted.

/// Exchange trade ingestion.
pub mod binance_wss;
/// Forwarding of queued moves to the broadcast tier.
pub mod forwarder;

pub use binance_wss::{
    IngestStats, IngestStatsSnapshot, IngestionPipeline, IngestionSettings, TradeIngestor,
};
pub use forwarder::{ForwardingPipeline, ForwardingSettings};
