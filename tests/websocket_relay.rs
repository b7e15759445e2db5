//! End-to-end tests over real WebSocket connections

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use trawl_relay::server::{AuthResult, DefaultHandler, RelayHandler};
use trawl_relay::session::SessionContext;
use trawl_relay::{Relay, RelayConfig, RelayServer, ServerConfig};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    relay: Arc<Relay>,
    _shutdown: oneshot::Sender<()>,
}

async fn start<H: RelayHandler>(config: ServerConfig, handler: H) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::new(config, handler);
    let relay = Arc::clone(server.relay());
    let (tx, rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        server
            .serve(listener, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });

    TestServer {
        addr,
        relay,
        _shutdown: tx,
    }
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
    ws
}

/// Connect and consume the welcome frame
async fn connect_open(addr: SocketAddr) -> (Client, u64) {
    let mut ws = connect(addr).await;
    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["type"], "welcome");
    let id = welcome["connection_id"].as_u64().unwrap();
    (ws, id)
}

async fn send(ws: &mut Client, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

async fn next_json(ws: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn subscribe(ws: &mut Client, topic: &str) -> Value {
    send(ws, json!({"op": "subscribe", "topic": topic})).await;
    let reply = next_json(ws).await;
    assert_eq!(reply["type"], "subscribed", "unexpected reply: {}", reply);
    reply
}

#[tokio::test]
async fn test_publish_reaches_subscriber() {
    let server = start(ServerConfig::default(), DefaultHandler).await;
    let (mut subscriber, _) = connect_open(server.addr).await;
    let (mut publisher, _) = connect_open(server.addr).await;

    subscribe(&mut subscriber, "depth").await;

    send(
        &mut publisher,
        json!({"op": "publish", "id": 1, "topic": "depth", "payload": {"sensor1_depth": 121.5}}),
    )
    .await;
    let ack = next_json(&mut publisher).await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["id"], 1);
    assert_eq!(ack["sequence"], 1);
    assert_eq!(ack["delivered"], 1);

    let frame = next_json(&mut subscriber).await;
    let keys: Vec<&str> = frame.as_object().unwrap().keys().map(String::as_str).collect();
    assert_eq!(keys.len(), 4, "unexpected frame: {}", frame);
    assert_eq!(frame["topic"], "depth");
    assert_eq!(frame["sequence"], 1);
    assert!(frame["timestamp"].as_u64().unwrap() > 0);
    assert_eq!(frame["payload"]["sensor1_depth"], 121.5);
}

#[tokio::test]
async fn test_snapshot_precedes_live_frames() {
    let server = start(ServerConfig::default(), DefaultHandler).await;
    for i in 1..=3 {
        server
            .relay
            .publish("winch", json!({"n": i}).to_string().as_bytes())
            .unwrap();
    }

    let (mut ws, _) = connect_open(server.addr).await;
    send(&mut ws, json!({"op": "subscribe", "topic": "winch", "max_snapshot": 2})).await;

    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "subscribed");
    assert_eq!(reply["snapshot"], 2);
    assert_eq!(reply["last_sequence"], 3);

    server.relay.publish("winch", br#"{"n":4}"#).unwrap();

    let sequences: Vec<u64> = [
        next_json(&mut ws).await,
        next_json(&mut ws).await,
        next_json(&mut ws).await,
    ]
    .iter()
    .map(|frame| frame["sequence"].as_u64().unwrap())
    .collect();
    assert_eq!(sequences, vec![2, 3, 4]);
}

#[tokio::test]
async fn test_subscribe_without_snapshot() {
    let server = start(ServerConfig::default(), DefaultHandler).await;
    server.relay.publish("boat", b"1").unwrap();

    let (mut ws, _) = connect_open(server.addr).await;
    send(&mut ws, json!({"op": "subscribe", "topic": "boat", "snapshot": false})).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["snapshot"], 0);

    server.relay.publish("boat", b"2").unwrap();
    let frame = next_json(&mut ws).await;
    assert_eq!(frame["sequence"], 2);
}

#[tokio::test]
async fn test_payload_too_large() {
    let config = ServerConfig::default().relay(RelayConfig::default().payload_max_bytes(16));
    let server = start(config, DefaultHandler).await;
    let (mut ws, _) = connect_open(server.addr).await;

    send(
        &mut ws,
        json!({"op": "publish", "id": 7, "topic": "depth", "payload": {"padding": "xxxxxxxxxxxxxxxxxxxx"}}),
    )
    .await;

    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["id"], 7);
    assert_eq!(reply["code"], "payload_too_large");
    assert_eq!(server.relay.history().len("depth"), 0);
}

#[tokio::test]
async fn test_payload_limit_above_default_frame_size() {
    const MIB: usize = 1024 * 1024;
    let config =
        ServerConfig::default().relay(RelayConfig::default().payload_max_bytes(4 * MIB));
    let server = start(config, DefaultHandler).await;
    let (mut ws, _) = connect_open(server.addr).await;

    // Larger than the default 1 MiB frame cap but within the payload limit
    let payload = "x".repeat(2 * MIB);
    send(&mut ws, json!({"op": "publish", "id": 1, "topic": "depth", "payload": payload})).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "ack", "unexpected reply: {}", reply["code"]);
    assert_eq!(reply["sequence"], 1);

    // Over the payload limit: rejected by the relay, not by the transport
    let payload = "x".repeat(5 * MIB);
    send(&mut ws, json!({"op": "publish", "id": 2, "topic": "depth", "payload": payload})).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["id"], 2);
    assert_eq!(reply["code"], "payload_too_large");

    send(&mut ws, json!({"op": "stats", "id": 3})).await;
    assert_eq!(next_json(&mut ws).await["type"], "stats");
    assert_eq!(server.relay.history().len("depth"), 1);
}

#[tokio::test]
async fn test_bad_requests_keep_connection_open() {
    let server = start(ServerConfig::default(), DefaultHandler).await;
    let (mut ws, _) = connect_open(server.addr).await;

    ws.send(Message::text("not json")).await.unwrap();
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["code"], "bad_request");

    send(&mut ws, json!({"op": "subscribe", "id": 3, "topic": ""})).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["id"], 3);
    assert_eq!(reply["code"], "invalid_topic");

    send(&mut ws, json!({"op": "stats", "id": 4})).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "stats");
    assert_eq!(reply["stats"]["connections"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unsubscribe() {
    let server = start(ServerConfig::default(), DefaultHandler).await;
    let (mut ws, id) = connect_open(server.addr).await;
    subscribe(&mut ws, "depth").await;

    send(&mut ws, json!({"op": "unsubscribe", "topic": "depth"})).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "unsubscribed");
    assert_eq!(reply["was_subscribed"], true);

    assert!(!server.relay.router().resolve("depth").contains(&id));
    let receipt = server.relay.publish("depth", b"1").unwrap();
    assert_eq!(receipt.delivered, 0);
}

#[tokio::test]
async fn test_disconnect_releases_subscriptions() {
    let server = start(ServerConfig::default(), DefaultHandler).await;
    let (mut ws, _) = connect_open(server.addr).await;
    subscribe(&mut ws, "depth").await;
    ws.close(None).await.unwrap();

    tokio::time::timeout(WAIT, async {
        while server.relay.registry().connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let receipt = server.relay.publish("depth", b"1").unwrap();
    assert_eq!(receipt.delivered, 0);
    server.relay.registry().verify_index_consistency().unwrap();
}

struct Gatekeeper;

impl RelayHandler for Gatekeeper {
    async fn on_connection(&self, ctx: &SessionContext) -> bool {
        ctx.peer_addr.ip().is_loopback()
    }

    async fn on_publish(&self, _ctx: &SessionContext, topic: &str) -> AuthResult {
        if topic == "depth" {
            AuthResult::Reject("depth is published by the simulator only".into())
        } else {
            AuthResult::Accept
        }
    }

    async fn on_subscribe(&self, _ctx: &SessionContext, topic: &str) -> AuthResult {
        if topic.starts_with("winch/") {
            AuthResult::Reject("command topics are write-only".into())
        } else {
            AuthResult::Accept
        }
    }
}

#[tokio::test]
async fn test_authorization_hooks() {
    let server = start(ServerConfig::default(), Gatekeeper).await;
    let (mut ws, _) = connect_open(server.addr).await;

    send(&mut ws, json!({"op": "subscribe", "id": 1, "topic": "winch/command"})).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["code"], "unauthorized");
    assert_eq!(server.relay.router().subscriber_count("winch/command"), 0);

    send(&mut ws, json!({"op": "publish", "id": 2, "topic": "depth", "payload": 1})).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["code"], "unauthorized");

    send(&mut ws, json!({"op": "publish", "id": 3, "topic": "winch/command", "payload": {"status": "idle"}})).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "ack");
}

struct RejectAll;

impl RelayHandler for RejectAll {
    async fn on_connection(&self, _ctx: &SessionContext) -> bool {
        false
    }
}

#[tokio::test]
async fn test_rejected_connection_is_closed() {
    let server = start(ServerConfig::default(), RejectAll).await;
    let mut ws = connect(server.addr).await;

    let reply = next_json(&mut ws).await;
    assert_eq!(reply["code"], "unauthorized");

    let end = tokio::time::timeout(WAIT, ws.next()).await.unwrap();
    assert!(matches!(end, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
}

struct SlowSubscribe;

impl RelayHandler for SlowSubscribe {
    async fn on_subscribe(&self, _ctx: &SessionContext, _topic: &str) -> AuthResult {
        tokio::time::sleep(Duration::from_millis(500)).await;
        AuthResult::Accept
    }
}

#[tokio::test]
async fn test_subscribe_timeout() {
    let config = ServerConfig::default().subscribe_timeout(Duration::from_millis(50));
    let server = start(config, SlowSubscribe).await;
    let (mut ws, _) = connect_open(server.addr).await;

    send(&mut ws, json!({"op": "subscribe", "id": 5, "topic": "depth"})).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "timeout");
    assert_eq!(server.relay.router().subscriber_count("depth"), 0);

    // Still usable after the timeout
    send(&mut ws, json!({"op": "stats", "id": 6})).await;
    assert_eq!(next_json(&mut ws).await["type"], "stats");
}
