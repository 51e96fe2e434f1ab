//! # Socket Establishment
//!
//! The `ResilientStreamClient` never opens sockets itself. It asks a `Connector` for a
//! ready-to-use WebSocket stream (resolve, TCP connect, optional TLS, upgrade handshake),
//! which keeps the reconnect state machine independent of the transport. Production code
//! uses `WsConnector`; tests hand the client in-memory duplex pipes instead.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::core::endpoint::Endpoint;
use crate::core::error::RelayError;

/// Upper bound on resolve + connect + handshake before the attempt counts as failed.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens a duplex WebSocket stream to an endpoint.
pub trait Connector: Send + Sync + 'static {
    /// The byte stream underneath the WebSocket framing.
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(
        &self,
        endpoint: &Endpoint,
    ) -> impl Future<Output = Result<WebSocketStream<Self::Io>, RelayError>> + Send;
}

/// TCP (+ TLS for `wss://`) connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for WsConnector {
    type Io = MaybeTlsStream<TcpStream>;

    async fn connect(
        &self,
        endpoint: &Endpoint,
    ) -> Result<WebSocketStream<Self::Io>, RelayError> {
        let url = endpoint.url();
        log::debug!("Connecting to {}", url);

        match tokio::time::timeout(self.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws_stream, _response))) => Ok(ws_stream),
            Ok(Err(source)) => Err(RelayError::Connect {
                endpoint: endpoint.to_string(),
                source,
            }),
            Err(_) => Err(RelayError::ConnectTimeout(endpoint.to_string())),
        }
    }
}
