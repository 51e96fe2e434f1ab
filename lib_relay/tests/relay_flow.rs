//! Exchange feed -> ingestion -> handoff -> forwarding -> hub -> subscriber, over real
//! loopback sockets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lib_relay::core::{ConnectionState, Endpoint, HandoffChannel, WsConnector};
use lib_relay::hub::{BroadcastHub, HubSettings};
use lib_relay::ingestors::{
    ForwardingPipeline, ForwardingSettings, IngestionPipeline, IngestionSettings,
};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn trade(price: &str) -> String {
    format!(
        r#"{{"e":"trade","E":1718000000123,"T":1718000000120,"s":"BTCUSDT","t":42,"p":"{}","q":"0.002","X":"MARKET","m":true}}"#,
        price
    )
}

/// A fake exchange. Each accepted connection is served the next script's frames, then
/// either held open until `shutdown` or closed right away.
async fn fake_exchange(
    scripts: Vec<(Vec<String>, bool)>,
    shutdown: CancellationToken,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        for (frames, hold_open) in scripts {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            for frame in frames {
                ws.send(Message::Text(frame.into())).await.unwrap();
            }
            if hold_open {
                let stop = shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = stop.cancelled() => {}
                        _ = async { while let Some(Ok(_)) = ws.next().await {} } => {}
                    }
                });
            } else {
                let _ = ws.close(None).await;
            }
        }
    });

    addr
}

struct Relay {
    shutdown: CancellationToken,
    subscriber: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Starts hub + forwarder + one subscriber, then ingestion against `upstream`.
async fn start_relay(upstream: SocketAddr, shutdown: CancellationToken) -> Relay {
    let settings = HubSettings {
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        public_port: 0,
        ingress_port: 0,
        ..Default::default()
    };
    let hub = BroadcastHub::new(settings, &shutdown).bind().await.unwrap();
    let (public, ingress) = (hub.public_addr(), hub.ingress_addr());
    let dispatcher = hub.dispatcher();
    let mut tasks = vec![tokio::spawn(async move {
        hub.serve().await.unwrap();
    })];

    let handoff = HandoffChannel::unbounded();
    let mut forwarding = ForwardingSettings::new(Endpoint::new("127.0.0.1", ingress.port(), "/internal", false));
    forwarding.reconnect_delay = Duration::from_millis(50);
    let forwarder = ForwardingPipeline::new(forwarding, WsConnector::new(), handoff.clone(), &shutdown);
    let forward_client = forwarder.client_handle();
    tasks.push(tokio::spawn(forwarder.run()));
    timeout(WAIT, forward_client.wait_for(ConnectionState::Connected)).await.unwrap();

    let (subscriber, _) = connect_async(format!("ws://{}/public", public)).await.unwrap();
    timeout(WAIT, async {
        while dispatcher.topic_subscriber_count("trades") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let mut ingestion = IngestionSettings::new(Endpoint::new("127.0.0.1", upstream.port(), "/ws/btcusdt@trade", false));
    ingestion.min_tick_size = 0.2;
    ingestion.reconnect_delay = Duration::from_millis(50);
    let pipeline = IngestionPipeline::new(ingestion, WsConnector::new(), handoff, &shutdown);
    tasks.push(tokio::spawn(pipeline.run()));

    Relay {
        shutdown,
        subscriber,
        tasks,
    }
}

async fn next_text(relay: &mut Relay) -> String {
    loop {
        match timeout(WAIT, relay.subscriber.next()).await.unwrap().unwrap().unwrap() {
            Message::Text(text) => return text.to_string(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {:?}", other),
        }
    }
}

async fn finish(relay: Relay) {
    relay.shutdown.cancel();
    for task in relay.tasks {
        timeout(WAIT, task).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn only_significant_moves_reach_subscribers() {
    let shutdown = CancellationToken::new();
    let frames = vec![
        trade("100.0"),
        r#"{"result":null,"id":1}"#.to_string(),
        trade("100.1"),
        "definitely not json".to_string(),
        trade("100.3"),
        r#"{"e":"24hrTicker","c":"250.0"}"#.to_string(),
        trade("100.35"),
        trade("99.9"),
    ];
    let upstream = fake_exchange(vec![(frames, true)], shutdown.clone()).await;
    let mut relay = start_relay(upstream, shutdown).await;

    assert_eq!(next_text(&mut relay).await, r#"{"type":"S","p":"100.3"}"#);
    assert_eq!(next_text(&mut relay).await, r#"{"type":"S","p":"99.9"}"#);
    let extra = timeout(Duration::from_millis(200), relay.subscriber.next()).await;
    assert!(extra.is_err(), "unexpected extra frame: {:?}", extra);

    finish(relay).await;
}

#[tokio::test]
async fn filter_baseline_survives_upstream_reconnect() {
    let shutdown = CancellationToken::new();
    let scripts = vec![
        (vec![trade("100.0"), trade("100.3")], false),
        (vec![trade("100.4"), trade("100.6")], true),
    ];
    let upstream = fake_exchange(scripts, shutdown.clone()).await;
    let mut relay = start_relay(upstream, shutdown).await;

    assert_eq!(next_text(&mut relay).await, r#"{"type":"S","p":"100.3"}"#);
    // 100.4 is within the tick of 100.3; the reconnect must not reset the baseline.
    assert_eq!(next_text(&mut relay).await, r#"{"type":"S","p":"100.6"}"#);

    finish(relay).await;
}
