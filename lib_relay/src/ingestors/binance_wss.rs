//! # Exchange Trade Ingestor
//!
//! Receiving side of the listener. The stream client owns the connection; the
//! `TradeIngestor` is its message handler and owns the `SignificanceFilter`, so the filter
//! state is only ever touched from the read loop.
//!
//! Per frame: parse, skip anything that is not a trade, compare the price against the last
//! reported one, and on a significant move push `{"type":"S","p":"<price>"}` into the
//! handoff channel. Garbage from the feed is counted and logged, never fatal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::connector::{Connector, WsConnector};
use crate::core::endpoint::Endpoint;
use crate::core::filter::SignificanceFilter;
use crate::core::handoff::{HandoffChannel, PushOutcome};
use crate::core::model::{parse_trade, OutboundEvent};
use crate::core::stream_client::{
    ClientHandle, MessageHandler, ResilientStreamClient, DEFAULT_RECONNECT_DELAY,
};

/// Futures trade stream of BTCUSDT.
pub const DEFAULT_UPSTREAM_URL: &str = "wss://fstream.binance.com:443/ws/btcusdt@trade";
pub const DEFAULT_MIN_TICK_SIZE: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct IngestionSettings {
    pub upstream: Endpoint,
    pub min_tick_size: f64,
    pub reconnect_delay: Duration,
}

impl IngestionSettings {
    pub fn new(upstream: Endpoint) -> Self {
        Self {
            upstream,
            min_tick_size: DEFAULT_MIN_TICK_SIZE,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Counters of the ingestion handler.
#[derive(Debug, Default)]
pub struct IngestStats {
    trades: AtomicU64,
    ignored: AtomicU64,
    parse_errors: AtomicU64,
    moves: AtomicU64,
    displaced: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    pub trades: u64,
    pub ignored: u64,
    pub parse_errors: u64,
    pub moves: u64,
    pub displaced: u64,
    pub rejected: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            trades: self.trades.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            moves: self.moves.load(Ordering::Relaxed),
            displaced: self.displaced.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Message handler of the upstream client.
pub struct TradeIngestor {
    filter: SignificanceFilter,
    handoff: HandoffChannel<String>,
    stats: Arc<IngestStats>,
}

impl TradeIngestor {
    pub fn new(min_tick_size: f64, handoff: HandoffChannel<String>) -> Self {
        Self {
            filter: SignificanceFilter::new(min_tick_size),
            handoff,
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn filter(&self) -> &SignificanceFilter {
        &self.filter
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    fn enqueue(&self, payload: String) {
        match self.handoff.push(payload) {
            PushOutcome::Queued => {
                self.stats.moves.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::DisplacedOldest => {
                self.stats.moves.fetch_add(1, Ordering::Relaxed);
                self.stats.displaced.fetch_add(1, Ordering::Relaxed);
                log::warn!("Handoff queue full, oldest move discarded.");
            }
            PushOutcome::Rejected => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("Handoff queue full, move rejected.");
            }
            PushOutcome::Closed => {
                log::debug!("Handoff channel closed, move discarded.");
            }
        }
    }
}

impl MessageHandler for TradeIngestor {
    fn handle(&mut self, message: &str) {
        let trade = match parse_trade(message) {
            Ok(Some(trade)) => trade,
            Ok(None) => {
                self.stats.ignored.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("Skipping upstream frame: {}", e);
                return;
            }
        };

        self.stats.trades.fetch_add(1, Ordering::Relaxed);
        let Some(mv) = self.filter.observe(trade.price) else {
            return;
        };

        match OutboundEvent::significant_move(trade.price_text.as_ref()).to_json() {
            Ok(payload) => {
                log::debug!("Significant move {:+} -> {}", mv.delta, payload);
                self.enqueue(payload);
            }
            Err(e) => log::error!("Failed to serialize move: {}", e),
        }
    }
}

/// Upstream client + trade handler, ready to run as one task.
pub struct IngestionPipeline<C = WsConnector> {
    client: ResilientStreamClient<TradeIngestor, C>,
    stats: Arc<IngestStats>,
}

impl<C: Connector> IngestionPipeline<C> {
    pub fn new(
        settings: IngestionSettings,
        connector: C,
        handoff: HandoffChannel<String>,
        shutdown: &CancellationToken,
    ) -> Self {
        let ingestor = TradeIngestor::new(settings.min_tick_size, handoff);
        let stats = ingestor.stats();
        let client = ResilientStreamClient::receiver(settings.upstream, connector, ingestor, shutdown)
            .with_reconnect_delay(settings.reconnect_delay);

        Self { client, stats }
    }

    pub fn client_handle(&self) -> ClientHandle {
        self.client.handle()
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Reads the trade stream until shutdown.
    pub async fn run(mut self) {
        log::info!("Ingesting trades from {}", self.client.endpoint().url());
        self.client.run().await;
        log::info!("Ingestion stopped: {:?}", self.stats.snapshot());
    }
}
