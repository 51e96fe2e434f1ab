//! # Trade Listener
//!
//! Reads the exchange trade stream, keeps the significant moves and forwards them to the
//! data receiver's ingress surface. Ingestion and forwarding run as separate tasks joined
//! by the handoff channel, so a slow or reconnecting downstream never stalls the upstream
//! read loop.

use anyhow::Result;
use lib_relay::core::{HandoffChannel, WsConnector};
use lib_relay::ingestors::{ForwardingPipeline, IngestionPipeline};
use tokio_util::sync::CancellationToken;

mod listener_logic;
mod relay_common;
use listener_logic::config;
use relay_common::{logger, shutdown};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let settings = config::load_config()?.resolve()?;
    logger::setup_logging("trade_listener", &settings.log_dir, &settings.log_level)?;
    log::info!(
        "Starting trade listener: {} -> {} (min tick {})",
        settings.ingestion.upstream,
        settings.forwarding.downstream,
        settings.ingestion.min_tick_size
    );

    let shutdown_token = CancellationToken::new();
    let signal_task = shutdown::cancel_on_signal(shutdown_token.clone());

    let handoff = HandoffChannel::with_capacity(settings.handoff_capacity, settings.overflow_policy);
    let connector = WsConnector::new().with_connect_timeout(settings.connect_timeout);

    let ingestion = IngestionPipeline::new(
        settings.ingestion.clone(),
        connector.clone(),
        handoff.clone(),
        &shutdown_token,
    );
    let ingest_stats = ingestion.stats();
    let forwarding = ForwardingPipeline::new(
        settings.forwarding.clone(),
        connector,
        handoff.clone(),
        &shutdown_token,
    );

    let ingestion_handle = tokio::spawn(ingestion.run());
    let forwarding_handle = tokio::spawn(forwarding.run());

    shutdown_token.cancelled().await;
    handoff.close();

    // Wait for components to shut down
    let (ingestion_exit, forwarding_exit) = tokio::join!(ingestion_handle, forwarding_handle);
    shutdown::report_exit("Ingestion", ingestion_exit);
    shutdown::report_exit("Forwarding", forwarding_exit);
    let _ = signal_task.await;

    log::info!(
        "Shutdown complete. Significant moves: {}, left in queue: {}",
        ingest_stats.snapshot().moves,
        handoff.len()
    );
    Ok(())
}
