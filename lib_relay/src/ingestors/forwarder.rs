//! # Forwarding Pipeline
//!
//! Two tasks: the send-only stream client keeping its connection to the ingress surface,
//! and the drain loop popping the handoff channel and calling `send` for every payload.
//! A payload popped while the client is disconnected is dropped (counted in the client's
//! `sends_dropped`).

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::connector::{Connector, WsConnector};
use crate::core::endpoint::Endpoint;
use crate::core::handoff::HandoffChannel;
use crate::core::stream_client::{ClientHandle, ResilientStreamClient, SendOnly, DEFAULT_RECONNECT_DELAY};

pub const DEFAULT_DOWNSTREAM_URL: &str = "ws://127.0.0.1:8082/internal";

#[derive(Debug, Clone)]
pub struct ForwardingSettings {
    pub downstream: Endpoint,
    pub reconnect_delay: Duration,
}

impl ForwardingSettings {
    pub fn new(downstream: Endpoint) -> Self {
        Self {
            downstream,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

pub struct ForwardingPipeline<C = WsConnector> {
    client: ResilientStreamClient<SendOnly, C>,
    handoff: HandoffChannel<String>,
    shutdown: CancellationToken,
}

impl<C: Connector> ForwardingPipeline<C> {
    pub fn new(
        settings: ForwardingSettings,
        connector: C,
        handoff: HandoffChannel<String>,
        shutdown: &CancellationToken,
    ) -> Self {
        let client = ResilientStreamClient::send_only(settings.downstream, connector, shutdown)
            .with_reconnect_delay(settings.reconnect_delay);

        Self {
            client,
            handoff,
            shutdown: shutdown.child_token(),
        }
    }

    pub fn client_handle(&self) -> ClientHandle {
        self.client.handle()
    }

    /// Drains the handoff channel until shutdown or until the channel is closed and empty,
    /// then stops the client and waits for its task.
    pub async fn run(self) {
        let Self {
            mut client,
            handoff,
            shutdown,
        } = self;

        let handle = client.handle();
        log::info!("Forwarding moves to {}", client.endpoint().url());
        let client_task = tokio::spawn(async move { client.run().await });

        loop {
            let payload = tokio::select! {
                _ = shutdown.cancelled() => break,
                payload = handoff.pop() => payload,
            };

            match payload {
                Some(payload) => {
                    if !handle.send(payload) {
                        log::debug!("{} Move dropped while disconnected.", handle.label());
                    }
                }
                None => {
                    log::info!("Handoff channel closed.");
                    break;
                }
            }
        }

        handle.stop();
        if let Err(e) = client_task.await {
            log::error!("Forwarding client task failed: {}", e);
        }
        log::info!("Forwarding stopped: {:?}", handle.stats());
    }
}
