//! # lib_relay
//!
//! Building blocks of the trade relay. One process (`trade_listener`) reads the exchange
//! trade stream, keeps only significant price moves and forwards them; a second process
//! (`data_receiver`) fans the forwarded moves out to every connected subscriber.
//!
//! ## Modules
//!
//! - **`core`**: handoff channel, significance filter, wire model and the resilient
//!   WebSocket client used on both sides of the listener.
//! - **`ingestors`**: the upstream ingestion pipeline and the downstream forwarding pipeline.
//! - **`hub`**: the topic dispatcher and the two-surface broadcast server.
//!
//! Each folder is gated by a cargo feature of the same name; `full` enables all of them.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "core")]
pub mod core;

#[cfg(feature = "ingestors")]
pub mod ingestors;

#[cfg(feature = "hub")]
pub mod hub;
