//! # Resilient Stream Client
//!
//! A WebSocket client that must stay connected to an unreliable peer indefinitely. It is
//! used twice by the listener: once as a receiver toward the exchange feed and once as a
//! send-only client toward the data receiver's ingress surface.
//!
//! ## State Machine
//!
//! `Disconnected -> Connecting -> Connected -> (Closing | Disconnected)`, looping until the
//! client's cancellation token fires.
//!
//! - **Connect**: resolve, connect and handshake through the injected `Connector`.
//! - **Connected**: every inbound text frame is handed synchronously to the
//!   `MessageHandler`. A send-only client still polls the socket so control frames and
//!   remote closes are noticed, but it has no handler to feed.
//! - **Failure**: a failed connect, a read error or a polite close by the remote all lead
//!   to the same path: cleanup, a fixed reconnect delay, and another attempt. A polite
//!   close is logged at `info`, a genuine error at `error`. There is no backoff growth and
//!   no retry limit.
//!
//! ## Sending
//!
//! `ClientHandle::send` is fire-and-forget. While the client is not connected the payload
//! is dropped on the spot; nothing is kept for the next connection. Callers that need to
//! survive outages queue upstream of the client.
//!
//! ## Shutdown
//!
//! `ClientHandle::stop` (or cancelling the parent token) sends a close frame on the active
//! connection and makes `run` return. The reconnect delay is interruptible.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::core::connector::{Connector, WsConnector};
use crate::core::endpoint::Endpoint;
use crate::core::error::RelayError;

/// Delay between the end of one connection attempt and the start of the next.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// How long a close handshake may take during shutdown before the socket is dropped.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Receives every inbound frame of a receiving client.
pub trait MessageHandler: Send {
    fn handle(&mut self, message: &str);
}

impl<F> MessageHandler for F
where
    F: FnMut(&str) + Send,
{
    fn handle(&mut self, message: &str) {
        self(message)
    }
}

/// Handler type of send-only clients. It is never invoked.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOnly;

impl MessageHandler for SendOnly {
    fn handle(&mut self, _message: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

#[derive(Debug, Default)]
struct ClientStats {
    connect_attempts: AtomicU64,
    connects: AtomicU64,
    reconnect_delays: AtomicU64,
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    sends_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientStatsSnapshot {
    pub connect_attempts: u64,
    pub connects: u64,
    pub reconnect_delays: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub sends_dropped: u64,
}

impl ClientStats {
    fn snapshot(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            reconnect_delays: self.reconnect_delays.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            sends_dropped: self.sends_dropped.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the connection loop and its handles.
struct Shared {
    label: String,
    state: watch::Sender<ConnectionState>,
    // Writer side of the live connection. `None` whenever there is no connection.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    stats: ClientStats,
    stop: CancellationToken,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn install_writer(&self, writer: Option<mpsc::UnboundedSender<String>>) {
        *self.outbound.lock().expect("Client writer lock poisoned") = writer;
    }
}

/// Cheap, cloneable access to a running client: send, stop, observe.
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<Shared>,
}

impl ClientHandle {
    /// Hands `payload` to the live connection. Returns `false`, and drops the payload,
    /// when the client is not connected.
    pub fn send(&self, payload: impl Into<String>) -> bool {
        let delivered = {
            let writer = self.shared.outbound.lock().expect("Client writer lock poisoned");
            match writer.as_ref() {
                Some(tx) if *self.shared.state.borrow() == ConnectionState::Connected => {
                    tx.send(payload.into()).is_ok()
                }
                _ => false,
            }
        };

        if !delivered {
            self.shared.stats.sends_dropped.fetch_add(1, Ordering::Relaxed);
            log::trace!("{} Not connected, dropping outbound frame.", self.shared.label);
        }
        delivered
    }

    /// Requests a graceful close and ends the reconnect loop.
    pub fn stop(&self) {
        self.shared.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_cancelled()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Resolves once the client reaches `wanted`.
    pub async fn wait_for(&self, wanted: ConnectionState) {
        let mut rx = self.shared.state.subscribe();
        // The sender lives in `Shared`, which this handle keeps alive.
        let _ = rx.wait_for(|state| *state == wanted).await;
    }

    pub fn stats(&self) -> ClientStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }
}

/// Connect, read or send, reconnect. See the module documentation.
pub struct ResilientStreamClient<H = SendOnly, C = WsConnector> {
    endpoint: Endpoint,
    connector: C,
    handler: Option<H>,
    reconnect_delay: Duration,
    shared: Arc<Shared>,
}

impl<C: Connector> ResilientStreamClient<SendOnly, C> {
    /// A client that only writes; inbound data frames are discarded.
    pub fn send_only(endpoint: Endpoint, connector: C, shutdown: &CancellationToken) -> Self {
        Self::build(endpoint, connector, None, shutdown)
    }
}

impl<H: MessageHandler, C: Connector> ResilientStreamClient<H, C> {
    /// A client that passes every inbound frame to `handler`.
    pub fn receiver(
        endpoint: Endpoint,
        connector: C,
        handler: H,
        shutdown: &CancellationToken,
    ) -> Self {
        Self::build(endpoint, connector, Some(handler), shutdown)
    }

    fn build(
        endpoint: Endpoint,
        connector: C,
        handler: Option<H>,
        shutdown: &CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            label: format!("[Client:{}]", endpoint.host),
            state,
            outbound: Mutex::new(None),
            stats: ClientStats::default(),
            stop: shutdown.child_token(),
        });

        Self {
            endpoint,
            connector,
            handler,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            shared,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn handler(&self) -> Option<&H> {
        self.handler.as_ref()
    }

    /// Runs the connect/read/reconnect loop until the client is stopped.
    pub async fn run(&mut self) {
        let stop = self.shared.stop.clone();
        let label = self.shared.label.clone();

        while !stop.is_cancelled() {
            self.shared.set_state(ConnectionState::Connecting);
            self.shared.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);

            let attempt = tokio::select! {
                _ = stop.cancelled() => break,
                attempt = self.connector.connect(&self.endpoint) => attempt,
            };

            match attempt {
                Ok(ws_stream) => {
                    self.shared.stats.connects.fetch_add(1, Ordering::Relaxed);
                    log::info!("{} Connected.", label);
                    if let Err(e) = self.session(ws_stream, &stop).await {
                        if e.is_graceful_close() {
                            log::info!("{} Connection closed.", label);
                        } else {
                            log::error!("{} Error: {}", label, e);
                        }
                    }
                }
                Err(e) => log::error!("{} Error: {}", label, e),
            }

            self.shared.set_state(ConnectionState::Disconnected);
            if stop.is_cancelled() {
                break;
            }

            self.shared.stats.reconnect_delays.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
            log::warn!("{} Reconnecting...", label);
        }

        self.shared.set_state(ConnectionState::Disconnected);
        log::info!("{} Stopped.", label);
    }

    /// Drives one established connection until it ends. `Ok` means a polite end.
    async fn session<S>(
        &mut self,
        ws_stream: WebSocketStream<S>,
        stop: &CancellationToken,
    ) -> Result<(), RelayError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let label = self.shared.label.clone();
        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.shared.install_writer(Some(tx));
        self.shared.set_state(ConnectionState::Connected);

        let result = loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    self.shared.set_state(ConnectionState::Closing);
                    self.shared.install_writer(None);
                    let _ = tokio::time::timeout(CLOSE_GRACE, write.close()).await;
                    break Ok(());
                }
                Some(payload) = rx.recv() => {
                    if let Err(e) = write.send(Message::Text(payload.into())).await {
                        log::error!("{} Send Error: {}", label, e);
                        break Err(e.into());
                    }
                    self.shared.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.shared.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                        if let Some(handler) = self.handler.as_mut() {
                            handler.handle(text.as_str());
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        self.shared.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                        if let (Some(handler), Ok(text)) =
                            (self.handler.as_mut(), std::str::from_utf8(&data))
                        {
                            handler.handle(text);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("{} Closed by remote: {:?}", label, frame);
                        // tungstenite queued the close reply; push it out before dropping.
                        self.shared.set_state(ConnectionState::Closing);
                        let _ = tokio::time::timeout(CLOSE_GRACE, write.flush()).await;
                        break Ok(());
                    }
                    // Ping/Pong are answered by tungstenite itself.
                    Some(Ok(_)) => {}
                    Some(Err(tungstenite::Error::ConnectionClosed)) | None => break Ok(()),
                    Some(Err(e)) => break Err(e.into()),
                },
            }
        };

        self.shared.install_writer(None);
        rx.close();
        let mut unsent = 0;
        while rx.try_recv().is_ok() {
            unsent += 1;
        }
        if unsent > 0 {
            self.shared.stats.sends_dropped.fetch_add(unsent, Ordering::Relaxed);
            log::warn!("{} Dropped {} queued frames with the connection.", label, unsent);
        }

        if result.is_ok() && !stop.is_cancelled() {
            log::info!("{} Remote closed the connection.", label);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// Fails a scripted number of times, then connects over an in-memory pipe and hands the
    /// server half to the test.
    struct ScriptedConnector {
        failures_left: AtomicUsize,
        servers: mpsc::UnboundedSender<WebSocketStream<DuplexStream>>,
    }

    impl ScriptedConnector {
        fn new(failures: usize) -> (Self, mpsc::UnboundedReceiver<WebSocketStream<DuplexStream>>) {
            let (servers, accepted) = mpsc::unbounded_channel();
            (
                Self {
                    failures_left: AtomicUsize::new(failures),
                    servers,
                },
                accepted,
            )
        }
    }

    impl Connector for ScriptedConnector {
        type Io = DuplexStream;

        async fn connect(
            &self,
            _endpoint: &Endpoint,
        ) -> Result<WebSocketStream<DuplexStream>, RelayError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(RelayError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "scripted failure",
                )));
            }

            let (client_io, server_io) = tokio::io::duplex(64 * 1024);
            let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
            let _ = self.servers.send(server);
            Ok(WebSocketStream::from_raw_socket(client_io, Role::Client, None).await)
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("feed.test", 443, "/ws", true)
    }

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn reaches_connected_after_scripted_failures() {
        let shutdown = CancellationToken::new();
        let (connector, mut accepted) = ScriptedConnector::new(3);
        let mut client = ResilientStreamClient::send_only(endpoint(), connector, &shutdown)
            .with_reconnect_delay(Duration::from_millis(10));
        let handle = client.handle();
        let task = tokio::spawn(async move { client.run().await });

        timeout(WAIT, handle.wait_for(ConnectionState::Connected)).await.unwrap();
        let stats = handle.stats();
        assert_eq!(stats.reconnect_delays, 3);
        assert_eq!(stats.connect_attempts, 4);
        assert_eq!(stats.connects, 1);
        assert!(accepted.recv().await.is_some());

        handle.stop();
        timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn delivers_inbound_frames_to_handler_in_order() {
        let shutdown = CancellationToken::new();
        let (connector, mut accepted) = ScriptedConnector::new(0);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
        let handler = move |msg: &str| {
            let _ = seen_tx.send(msg.to_string());
        };
        let mut client = ResilientStreamClient::receiver(endpoint(), connector, handler, &shutdown);
        let handle = client.handle();
        let task = tokio::spawn(async move { client.run().await });

        let mut server = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
        for msg in ["one", "two", "three"] {
            server.send(Message::Text(msg.into())).await.unwrap();
        }
        for expected in ["one", "two", "three"] {
            let got = timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
            assert_eq!(got, expected);
        }
        assert_eq!(handle.stats().frames_received, 3);

        shutdown.cancel();
        timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn send_reaches_peer_only_while_connected() {
        let shutdown = CancellationToken::new();
        let (connector, mut accepted) = ScriptedConnector::new(0);
        let mut client = ResilientStreamClient::send_only(endpoint(), connector, &shutdown);
        let handle = client.handle();

        assert!(!handle.send("before connect"));
        assert_eq!(handle.stats().sends_dropped, 1);

        let task = tokio::spawn(async move { client.run().await });
        timeout(WAIT, handle.wait_for(ConnectionState::Connected)).await.unwrap();
        let mut server = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();

        assert!(handle.send(r#"{"type":"S","p":"1.5"}"#));
        let frame = timeout(WAIT, server.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(frame, Message::Text(r#"{"type":"S","p":"1.5"}"#.into()));

        handle.stop();
        timeout(WAIT, task).await.unwrap().unwrap();
        assert!(!handle.send("after stop"));
        assert_eq!(handle.stats().sends_dropped, 2);
    }

    #[tokio::test]
    async fn polite_remote_close_triggers_reconnect() {
        let shutdown = CancellationToken::new();
        let (connector, mut accepted) = ScriptedConnector::new(0);
        let mut client = ResilientStreamClient::send_only(endpoint(), connector, &shutdown)
            .with_reconnect_delay(Duration::from_millis(10));
        let handle = client.handle();
        let task = tokio::spawn(async move { client.run().await });

        let mut first = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
        first.send(Message::Close(None)).await.unwrap();

        let _second = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
        timeout(WAIT, handle.wait_for(ConnectionState::Connected)).await.unwrap();
        let stats = handle.stats();
        assert_eq!(stats.connects, 2);
        assert_eq!(stats.reconnect_delays, 1);

        handle.stop();
        timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn remote_close_is_answered_before_reconnecting() {
        let shutdown = CancellationToken::new();
        let (connector, mut accepted) = ScriptedConnector::new(0);
        let mut client = ResilientStreamClient::send_only(endpoint(), connector, &shutdown)
            .with_reconnect_delay(Duration::from_secs(60));
        let handle = client.handle();
        let task = tokio::spawn(async move { client.run().await });

        let mut server = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
        server.close(None).await.unwrap();
        let reply = timeout(WAIT, server.next()).await.unwrap();
        assert!(matches!(reply, Some(Ok(Message::Close(_)))), "{:?}", reply);

        handle.stop();
        timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn every_accepted_send_is_written_or_counted_dropped() {
        let shutdown = CancellationToken::new();
        let (connector, mut accepted) = ScriptedConnector::new(0);
        let mut client = ResilientStreamClient::send_only(endpoint(), connector, &shutdown);
        let handle = client.handle();
        let task = tokio::spawn(async move { client.run().await });

        timeout(WAIT, handle.wait_for(ConnectionState::Connected)).await.unwrap();
        let _server = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();

        // Queued and stopped without yielding, so the session races the two.
        for i in 0..5 {
            assert!(handle.send(format!("m{}", i)));
        }
        handle.stop();
        timeout(WAIT, task).await.unwrap().unwrap();

        let stats = handle.stats();
        assert_eq!(stats.frames_sent + stats.sends_dropped, 5, "{:?}", stats);
    }

    #[tokio::test]
    async fn shutdown_interrupts_reconnect_delay() {
        let shutdown = CancellationToken::new();
        let (connector, _accepted) = ScriptedConnector::new(usize::MAX);
        let mut client = ResilientStreamClient::send_only(endpoint(), connector, &shutdown)
            .with_reconnect_delay(Duration::from_secs(60));
        let handle = client.handle();
        let task = tokio::spawn(async move { client.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.stats().reconnect_delays, 1);

        shutdown.cancel();
        timeout(Duration::from_millis(500), task).await.unwrap().unwrap();
        assert!(handle.is_stopped());
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }
}
