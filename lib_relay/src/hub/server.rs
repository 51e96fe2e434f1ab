//! # Broadcast Hub Server
//!
//! Two listening surfaces served by `axum`:
//!
//! - **public**: many subscribers, one WebSocket each. Every subscriber is registered on
//!   the configured topic, pinged every half idle timeout and closed when it stays silent
//!   for longer than the idle timeout. Anything it sends is ignored apart from refreshing
//!   its liveness. `GET /health` answers `OK`.
//! - **ingress**: the trusted publisher. Every text or binary frame it sends is published
//!   verbatim on the topic. Only one publisher is active; a new ingress connection
//!   replaces (and closes) the previous one.
//!
//! Payload caps are applied at the protocol layer through the upgrade's message and frame
//! size limits, so oversized frames never reach this code.

use std::future::IntoFuture;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::error::RelayError;
use crate::hub::dispatcher::{
    DispatcherStatsSnapshot, SlowSubscriberPolicy, TopicDispatcher, DEFAULT_SUBSCRIBER_BUFFER,
    DEFAULT_TOPIC,
};

pub const HEALTH_PATH: &str = "/health";

/// How long a close frame may take to reach a peer before the socket is dropped.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub bind_ip: IpAddr,
    pub public_port: u16,
    pub public_path: String,
    pub ingress_port: u16,
    pub ingress_path: String,
    pub topic: String,
    pub idle_timeout: Duration,
    /// Largest message accepted from a subscriber.
    pub public_max_payload: usize,
    /// Largest message accepted from the publisher.
    pub ingress_max_payload: usize,
    pub subscriber_buffer: usize,
    pub slow_subscriber_policy: SlowSubscriberPolicy,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            public_port: 8081,
            public_path: "/public".to_string(),
            ingress_port: 8082,
            ingress_path: "/internal".to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            idle_timeout: Duration::from_secs(20),
            public_max_payload: 512,
            ingress_max_payload: 1024,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            slow_subscriber_policy: SlowSubscriberPolicy::default(),
        }
    }
}

impl HubSettings {
    pub fn validate(&self) -> Result<(), RelayError> {
        for (name, path) in [("public_path", &self.public_path), ("ingress_path", &self.ingress_path)] {
            if !path.starts_with('/') {
                return Err(RelayError::invalid_setting(name, format!("'{}' must start with '/'", path)));
            }
        }
        if self.public_path == HEALTH_PATH {
            return Err(RelayError::invalid_setting("public_path", "collides with the health route"));
        }
        if self.topic.is_empty() {
            return Err(RelayError::invalid_setting("topic", "must not be empty"));
        }
        if self.idle_timeout < Duration::from_millis(2) {
            return Err(RelayError::invalid_setting("idle_timeout", "must be at least 2ms"));
        }
        if self.public_max_payload == 0 || self.ingress_max_payload == 0 {
            return Err(RelayError::invalid_setting("max_payload", "must be positive"));
        }
        if self.subscriber_buffer == 0 {
            return Err(RelayError::invalid_setting("subscriber_buffer", "must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStatsSnapshot {
    pub subscribers_accepted: u64,
    pub publishers_accepted: u64,
    pub idle_closures: u64,
    pub dispatcher: DispatcherStatsSnapshot,
}

#[derive(Default)]
struct HubStats {
    subscribers_accepted: AtomicU64,
    publishers_accepted: AtomicU64,
    idle_closures: AtomicU64,
}

struct ActivePublisher {
    id: u64,
    replaced: CancellationToken,
}

#[derive(Clone)]
struct HubState {
    settings: Arc<HubSettings>,
    dispatcher: Arc<TopicDispatcher<Message>>,
    publisher: Arc<Mutex<Option<ActivePublisher>>>,
    stats: Arc<HubStats>,
    shutdown: CancellationToken,
}

impl HubState {
    /// Makes a new ingress connection the active publisher, closing the previous one.
    fn claim_publisher(&self) -> (u64, CancellationToken) {
        let id = self.stats.publishers_accepted.fetch_add(1, Ordering::Relaxed) + 1;
        let replaced = CancellationToken::new();
        let previous = self
            .publisher
            .lock()
            .expect("Publisher slot lock poisoned")
            .replace(ActivePublisher {
                id,
                replaced: replaced.clone(),
            });
        if let Some(previous) = previous {
            log::warn!("[Hub] Publisher {} replaced by publisher {}", previous.id, id);
            previous.replaced.cancel();
        }
        (id, replaced)
    }

    fn release_publisher(&self, id: u64) {
        let mut slot = self.publisher.lock().expect("Publisher slot lock poisoned");
        if slot.as_ref().is_some_and(|active| active.id == id) {
            *slot = None;
        }
    }

    fn snapshot(&self) -> HubStatsSnapshot {
        HubStatsSnapshot {
            subscribers_accepted: self.stats.subscribers_accepted.load(Ordering::Relaxed),
            publishers_accepted: self.stats.publishers_accepted.load(Ordering::Relaxed),
            idle_closures: self.stats.idle_closures.load(Ordering::Relaxed),
            dispatcher: self.dispatcher.stats(),
        }
    }
}

/// Topic fan-out server. `bind` opens both sockets; `BoundHub::serve` runs until shutdown.
pub struct BroadcastHub {
    state: HubState,
}

impl BroadcastHub {
    pub fn new(settings: HubSettings, shutdown: &CancellationToken) -> Self {
        let dispatcher = Arc::new(TopicDispatcher::new(
            settings.subscriber_buffer,
            settings.slow_subscriber_policy,
        ));
        Self {
            state: HubState {
                settings: Arc::new(settings),
                dispatcher,
                publisher: Arc::new(Mutex::new(None)),
                stats: Arc::new(HubStats::default()),
                shutdown: shutdown.child_token(),
            },
        }
    }

    pub fn dispatcher(&self) -> Arc<TopicDispatcher<Message>> {
        Arc::clone(&self.state.dispatcher)
    }

    pub async fn bind(self) -> Result<BoundHub, RelayError> {
        let settings = &self.state.settings;
        settings.validate()?;

        let public = bind_surface("public", SocketAddr::new(settings.bind_ip, settings.public_port)).await?;
        let ingress = bind_surface("ingress", SocketAddr::new(settings.bind_ip, settings.ingress_port)).await?;

        Ok(BoundHub {
            public_addr: public.local_addr()?,
            ingress_addr: ingress.local_addr()?,
            public,
            ingress,
            state: self.state,
        })
    }
}

async fn bind_surface(surface: &'static str, addr: SocketAddr) -> Result<TcpListener, RelayError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| RelayError::Bind { surface, addr, source })
}

pub struct BoundHub {
    public: TcpListener,
    ingress: TcpListener,
    public_addr: SocketAddr,
    ingress_addr: SocketAddr,
    state: HubState,
}

impl BoundHub {
    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    pub fn ingress_addr(&self) -> SocketAddr {
        self.ingress_addr
    }

    pub fn dispatcher(&self) -> Arc<TopicDispatcher<Message>> {
        Arc::clone(&self.state.dispatcher)
    }

    /// A handle to read the hub counters while `serve` runs.
    pub fn stats_probe(&self) -> HubStatsProbe {
        HubStatsProbe {
            state: self.state.clone(),
        }
    }

    /// Serves both surfaces until the shutdown token fires.
    pub async fn serve(self) -> Result<HubStatsSnapshot, RelayError> {
        let settings = Arc::clone(&self.state.settings);

        let public_app = Router::new()
            .route(&settings.public_path, get(public_handler))
            .route(HEALTH_PATH, get(health_handler))
            .with_state(self.state.clone());
        let ingress_app = Router::new()
            .route(&settings.ingress_path, get(ingress_handler))
            .with_state(self.state.clone());

        log::info!(
            "[Hub] Public surface on ws://{}{}, ingress on ws://{}{} (topic '{}')",
            self.public_addr,
            settings.public_path,
            self.ingress_addr,
            settings.ingress_path,
            settings.topic
        );

        let public_stop = self.state.shutdown.clone();
        let ingress_stop = self.state.shutdown.clone();
        let public = axum::serve(self.public, public_app)
            .with_graceful_shutdown(async move { public_stop.cancelled().await })
            .into_future();
        let ingress = axum::serve(self.ingress, ingress_app)
            .with_graceful_shutdown(async move { ingress_stop.cancelled().await })
            .into_future();

        let (public_result, ingress_result) = tokio::join!(public, ingress);
        public_result?;
        ingress_result?;

        let stats = self.state.snapshot();
        log::info!("[Hub] Stopped: {:?}", stats);
        Ok(stats)
    }
}

#[derive(Clone)]
pub struct HubStatsProbe {
    state: HubState,
}

impl HubStatsProbe {
    pub fn snapshot(&self) -> HubStatsSnapshot {
        self.state.snapshot()
    }
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn public_handler(ws: WebSocketUpgrade, State(state): State<HubState>) -> impl IntoResponse {
    let cap = state.settings.public_max_payload;
    ws.max_message_size(cap)
        .max_frame_size(cap)
        .on_upgrade(move |socket| subscriber_session(socket, state))
}

async fn ingress_handler(ws: WebSocketUpgrade, State(state): State<HubState>) -> impl IntoResponse {
    let cap = state.settings.ingress_max_payload;
    ws.max_message_size(cap)
        .max_frame_size(cap)
        .on_upgrade(move |socket| publisher_session(socket, state))
}

async fn subscriber_session(socket: WebSocket, state: HubState) {
    let dispatcher = &state.dispatcher;
    let mut subscription = dispatcher.connect();
    let id = subscription.id;
    dispatcher.subscribe(id, &state.settings.topic);
    state.stats.subscribers_accepted.fetch_add(1, Ordering::Relaxed);
    log::info!("[Hub] Subscriber {} connected", id);

    let evicted = subscription.evicted();
    let idle_timeout = state.settings.idle_timeout;
    let mut keepalive = tokio::time::interval_at(Instant::now() + idle_timeout / 2, idle_timeout / 2);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    let (mut sink, mut stream) = socket.split();
    loop {
        // Writes are bounded; a peer that stops draining its socket counts as silent.
        let written = tokio::select! {
            _ = state.shutdown.cancelled() => {
                write_within(&mut sink, close(close_code::AWAY, "server shutting down"), CLOSE_GRACE).await;
                break;
            }
            _ = evicted.cancelled() => {
                write_within(&mut sink, close(close_code::POLICY, "too slow"), CLOSE_GRACE).await;
                break;
            }
            frame = subscription.recv() => match frame {
                Some(frame) => write_within(&mut sink, frame, idle_timeout).await,
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    last_seen = Instant::now();
                    continue;
                }
                Some(Err(e)) => {
                    log::debug!("[Hub] Subscriber {} read failed: {}", id, e);
                    break;
                }
            },
            _ = keepalive.tick() => {
                if last_seen.elapsed() > idle_timeout {
                    log::info!("[Hub] Subscriber {} idle for {:?}, closing", id, idle_timeout);
                    state.stats.idle_closures.fetch_add(1, Ordering::Relaxed);
                    write_within(&mut sink, close(close_code::AWAY, "idle timeout"), CLOSE_GRACE).await;
                    break;
                }
                write_within(&mut sink, Message::Ping(Bytes::new()), idle_timeout).await
            }
        };

        match written {
            Write::Done => {}
            Write::Failed(e) => {
                log::debug!("[Hub] Subscriber {} write failed: {}", id, e);
                break;
            }
            Write::Stalled => {
                log::info!("[Hub] Subscriber {} stopped reading for {:?}, closing", id, idle_timeout);
                state.stats.idle_closures.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    dispatcher.disconnect(id);
    log::info!("[Hub] Subscriber {} disconnected", id);
}

enum Write {
    Done,
    Failed(axum::Error),
    Stalled,
}

async fn write_within(sink: &mut SplitSink<WebSocket, Message>, message: Message, deadline: Duration) -> Write {
    match tokio::time::timeout(deadline, sink.send(message)).await {
        Ok(Ok(())) => Write::Done,
        Ok(Err(e)) => Write::Failed(e),
        Err(_) => Write::Stalled,
    }
}

async fn publisher_session(mut socket: WebSocket, state: HubState) {
    let (id, replaced) = state.claim_publisher();
    let topic = state.settings.topic.as_str();
    log::info!("[Hub] Publisher {} connected", id);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = tokio::time::timeout(CLOSE_GRACE, socket.send(close(close_code::AWAY, "server shutting down"))).await;
                break;
            }
            _ = replaced.cancelled() => {
                let _ = tokio::time::timeout(CLOSE_GRACE, socket.send(close(close_code::NORMAL, "replaced"))).await;
                break;
            }
            inbound = socket.recv() => match inbound {
                Some(Ok(frame @ (Message::Text(_) | Message::Binary(_)))) => {
                    let report = state.dispatcher.publish(topic, frame);
                    log::trace!("[Hub] Published to {} subscribers ({} dropped)", report.delivered, report.dropped);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("[Hub] Publisher {} read failed: {}", id, e);
                    break;
                }
            },
        }
    }

    state.release_publisher(id);
    log::info!("[Hub] Publisher {} disconnected", id);
}

fn close(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}
