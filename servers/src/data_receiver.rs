//! # Data Receiver
//!
//! Accepts the listener's forwarded moves on the ingress surface and fans each frame out,
//! verbatim, to every subscriber of the public surface. All subscriber I/O is multiplexed
//! on a single-threaded runtime.

use anyhow::Result;
use lib_relay::hub::BroadcastHub;
use tokio_util::sync::CancellationToken;

mod receiver_logic;
mod relay_common;
use receiver_logic::config;
use relay_common::{logger, shutdown};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let settings = config::load_config()?.resolve()?;
    logger::setup_logging("data_receiver", &settings.log_dir, &settings.log_level)?;

    let shutdown_token = CancellationToken::new();
    let signal_task = shutdown::cancel_on_signal(shutdown_token.clone());

    let hub = BroadcastHub::new(settings.hub, &shutdown_token).bind().await?;
    log::info!(
        "Data receiver listening: public {}, ingress {}",
        hub.public_addr(),
        hub.ingress_addr()
    );

    let stats = hub.serve().await?;
    let _ = signal_task.await;

    log::info!(
        "Shutdown complete. Subscribers served: {}, frames published: {}, dropped: {}",
        stats.subscribers_accepted,
        stats.dispatcher.published,
        stats.dispatcher.dropped
    );
    Ok(())
}
