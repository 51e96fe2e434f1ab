//! # Core Relay Components
//!
//! Everything the two relay processes share. Nothing in here knows about the exchange or
//! the subscribers; it only moves text frames around reliably.
//!
//! ## Core Components:
//!
//! - **`handoff`**: the FIFO between the ingestion context and the forwarding context.
//!   Pushing never blocks, popping waits until an item arrives or the channel closes.
//!
//! - **`filter`**: the per-symbol significance filter that turns a tick stream into a
//!   sparse stream of significant moves.
//!
//! - **`model`**: parsing of upstream trade frames and the outbound `{"type":"S","p":..}`
//!   payload.
//!
//! - **`stream_client`**: a WebSocket client that connects, reads (or only sends), and
//!   reconnects after a fixed delay for as long as it is not cancelled.
//!
//! - **`connector`** and **`endpoint`**: how the client opens its socket and where to.

/// Error type shared by every relay component.
pub mod error;
/// Target address of a WebSocket connection.
pub mod endpoint;
/// Socket establishment, abstracted so tests can run over in-memory pipes.
pub mod connector;
/// The single-consumer FIFO between ingestion and forwarding.
pub mod handoff;
/// Significant-move detection.
pub mod filter;
/// Upstream and outbound wire formats.
pub mod model;
/// Connect, read, reconnect.
pub mod stream_client;

// --- Public API Re-exports ---
pub use connector::{Connector, WsConnector};
pub use endpoint::Endpoint;
pub use error::RelayError;
pub use filter::{FilterState, SignificanceFilter, SignificantMove};
pub use handoff::{HandoffChannel, OverflowPolicy, PushOutcome};
pub use model::{parse_trade, OutboundEvent, Trade, TradeParseError};
pub use stream_client::{
    ClientHandle, ClientStatsSnapshot, ConnectionState, MessageHandler, ResilientStreamClient,
    SendOnly,
};
