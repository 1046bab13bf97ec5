//! End-to-end tests using a real WebSocket client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use switchboard_core::{Broadcast, BroadcastTarget, UserId, WebSocketEvent};
use switchboard_hub::{Hub, HubConfig};
use switchboard_rpc::{ActionRegistry, InMemorySessionStore, RequestRouter, RpcError, Session, SessionStore};
use switchboard_server::actions::register_builtin_actions;
use switchboard_server::{ServerConfig, SwitchboardServer};
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn session(id: &str, user: &str, token: &str) -> Session {
    Session {
        id: id.into(),
        user_id: user.into(),
        token: token.into(),
        expires_at: None,
    }
}

fn builtin_registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    register_builtin_actions(&mut registry);
    registry
}

/// Boot a server on an ephemeral port.
async fn boot_server(config: ServerConfig) -> (SocketAddr, Arc<SwitchboardServer>) {
    boot_with_registry(config, builtin_registry()).await
}

async fn boot_with_registry(
    config: ServerConfig,
    registry: ActionRegistry,
) -> (SocketAddr, Arc<SwitchboardServer>) {
    let hub = Hub::start(
        HubConfig {
            shard_count: 4,
            ..HubConfig::default()
        },
        "node-test",
        None,
    );
    let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::with_sessions([
        session("s1", "u1", "tok-1"),
        session("s1b", "u1", "tok-1b"),
        session("s2", "u2", "tok-2"),
    ]));
    let router = RequestRouter::new(Arc::new(registry), Arc::clone(&sessions), Arc::clone(&hub));

    let server = Arc::new(SwitchboardServer::new(
        config,
        hub,
        router,
        sessions,
        switchboard_server::metrics::detached_handle(),
    ));
    let (addr, _handle) = server.listen().await.unwrap();
    (addr, server)
}

async fn boot() -> (SocketAddr, Arc<SwitchboardServer>) {
    boot_server(ServerConfig::default()).await
}

/// Connect and consume the hello event.
async fn connect(addr: SocketAddr, token: &str) -> (WsStream, Value) {
    let (mut ws, _resp) = connect_async(format!("ws://{addr}/ws?token={token}"))
        .await
        .unwrap();
    let hello = next_json(&mut ws).await;
    assert_eq!(hello["event"], "hello");
    (ws, hello)
}

async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Send a ping request and return its response. Every frame queued for
/// the connection before the request comes out first, in `before`.
async fn ping_roundtrip(ws: &mut WsStream, seq: i64) -> (Vec<Value>, Value) {
    send_json(ws, json!({ "action": "ping", "seq": seq })).await;
    let mut before = Vec::new();
    loop {
        let frame = next_json(ws).await;
        if frame.get("status").is_some() && frame["seq"] == seq {
            return (before, frame);
        }
        before.push(frame);
    }
}

async fn wait_closed(ws: &mut WsStream) -> Option<tungstenite::protocol::CloseFrame> {
    loop {
        match timeout(TIMEOUT, ws.next()).await.expect("socket stayed open") {
            Some(Ok(Message::Close(frame))) => return frame,
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return None,
        }
    }
}

#[tokio::test]
async fn hello_is_first_event_with_seq_zero() {
    let (addr, _server) = boot().await;
    let (_ws, hello) = connect(addr, "tok-1").await;
    assert_eq!(hello["seq"], 0);
    assert_eq!(hello["data"]["node_id"], "node-test");
    assert!(hello["data"]["connection_id"].is_string());
    assert_eq!(hello["broadcast"]["kind"], "connection");
    assert_eq!(hello["broadcast"]["user_id"], "u1");
}

#[tokio::test]
async fn ping_gets_pong_with_same_seq() {
    let (addr, _server) = boot().await;
    let (mut ws, _) = connect(addr, "tok-1").await;
    let (before, resp) = ping_roundtrip(&mut ws, 42).await;
    assert!(before.is_empty());
    assert_eq!(resp["status"], "OK");
    assert_eq!(resp["data"]["text"], "pong");
    assert_eq!(resp["data"]["node_id"], "node-test");
}

#[tokio::test]
async fn bearer_header_also_authenticates() {
    let (addr, _server) = boot().await;
    let request = tungstenite::http::Request::builder()
        .uri(format!("ws://{addr}/ws"))
        .header("Host", addr.to_string())
        .header("Authorization", "Bearer tok-2")
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", tungstenite::handshake::client::generate_key())
        .body(())
        .unwrap();
    let (mut ws, _) = connect_async(request).await.unwrap();
    let hello = next_json(&mut ws).await;
    assert_eq!(hello["broadcast"]["user_id"], "u2");
}

#[tokio::test]
async fn bad_token_is_rejected_with_401() {
    let (addr, _server) = boot().await;
    let err = connect_async(format!("ws://{addr}/ws?token=bogus")).await.unwrap_err();
    match err {
        tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 401),
        other => panic!("expected http error, got {other:?}"),
    }
}

#[tokio::test]
async fn connection_limit_is_enforced() {
    let (addr, server) = boot_server(ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    })
    .await;
    let (_first, _) = connect(addr, "tok-1").await;
    assert_eq!(server.active_connections(), 1);

    let err = connect_async(format!("ws://{addr}/ws?token=tok-2")).await.unwrap_err();
    match err {
        tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 503),
        other => panic!("expected http error, got {other:?}"),
    }
}

#[tokio::test]
async fn user_broadcast_reaches_every_connection_of_that_user_only() {
    let (addr, server) = boot().await;
    let (mut phone, _) = connect(addr, "tok-1").await;
    let (mut laptop, _) = connect(addr, "tok-1b").await;
    let (mut other, _) = connect(addr, "tok-2").await;

    server
        .hub()
        .broadcast(Broadcast::new(
            WebSocketEvent::new("posted").with("message", "hi"),
            BroadcastTarget::User {
                user_id: UserId::from("u1"),
            },
        ))
        .await;

    for ws in [&mut phone, &mut laptop] {
        let event = next_json(ws).await;
        assert_eq!(event["event"], "posted");
        assert_eq!(event["data"]["message"], "hi");
        assert_eq!(event["seq"], 1);
    }
    let (before, _) = ping_roundtrip(&mut other, 1).await;
    assert!(before.is_empty(), "u2 received {before:?}");
}

#[tokio::test]
async fn typing_is_relayed_to_others_in_the_channel() {
    let (addr, _server) = boot().await;
    let (mut typist, _) = connect(addr, "tok-1").await;
    let (mut reader, _) = connect(addr, "tok-2").await;

    send_json(
        &mut typist,
        json!({ "action": "user_typing", "seq": 5, "data": { "channel_id": "town-square" } }),
    )
    .await;
    let resp = next_json(&mut typist).await;
    assert_eq!(resp["seq"], 5);
    assert_eq!(resp["status"], "OK");

    let event = next_json(&mut reader).await;
    assert_eq!(event["event"], "typing");
    assert_eq!(event["data"]["user_id"], "u1");
    assert_eq!(event["broadcast"]["kind"], "channel");
    assert_eq!(event["broadcast"]["channel_id"], "town-square");

    let (before, _) = ping_roundtrip(&mut typist, 6).await;
    assert!(before.is_empty(), "typist received {before:?}");
}

#[tokio::test]
async fn malformed_frames_and_unknown_actions_get_errors() {
    let (addr, _server) = boot().await;
    let (mut ws, _) = connect(addr, "tok-1").await;

    ws.send(Message::Text("{not json".into())).await.unwrap();
    let resp = next_json(&mut ws).await;
    assert_eq!(resp["seq"], 0);
    assert_eq!(resp["status"], "FAIL");
    assert_eq!(resp["error"]["status_code"], 400);

    send_json(&mut ws, json!({ "action": "launch_rockets", "seq": 9 })).await;
    let resp = next_json(&mut ws).await;
    assert_eq!(resp["seq"], 9);
    assert_eq!(resp["error"]["id"], "websocket.unknown_action");
    assert_eq!(resp["error"]["status_code"], 501);
}

#[tokio::test]
async fn evicted_session_is_disconnected() {
    let (addr, server) = boot().await;
    let (mut evicted, _) = connect(addr, "tok-1").await;
    let (mut kept, _) = connect(addr, "tok-1b").await;

    let closed = server.hub().evict_session(&"u1".into(), &"s1".into()).await;
    assert_eq!(closed, 1);

    let frame = wait_closed(&mut evicted).await;
    if let Some(frame) = frame {
        assert_eq!(frame.reason.as_str(), "session_revoked");
    }
    let (_, resp) = ping_roundtrip(&mut kept, 3).await;
    assert_eq!(resp["status"], "OK");
}

#[tokio::test]
async fn health_counts_connections() {
    let (addr, server) = boot().await;
    let (_ws, _) = connect(addr, "tok-1").await;
    assert_eq!(server.hub().connection_count().await, 1);

    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 1);
    assert_eq!(body["shards"], 4);
}

#[tokio::test]
async fn hub_shutdown_closes_clients() {
    let (addr, server) = boot().await;
    let (mut ws, _) = connect(addr, "tok-1").await;

    server.shutdown().shutdown();
    server.hub().shutdown().await;

    let frame = wait_closed(&mut ws).await;
    if let Some(frame) = frame {
        assert_eq!(frame.reason.as_str(), "server_shutdown");
    }
}

#[tokio::test]
async fn requests_beyond_inflight_limit_get_server_busy() {
    let release = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = builtin_registry();
    {
        let (release, calls) = (Arc::clone(&release), Arc::clone(&calls));
        registry.register_fn("slow", move |_req, _ctx| {
            let (release, calls) = (Arc::clone(&release), Arc::clone(&calls));
            async move {
                let _ = calls.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
                Ok::<_, RpcError>(json!({ "done": true }))
            }
        });
    }
    let (addr, _server) = boot_with_registry(
        ServerConfig {
            max_inflight_requests: 1,
            ..ServerConfig::default()
        },
        registry,
    )
    .await;
    let (mut ws, _) = connect(addr, "tok-1").await;

    send_json(&mut ws, json!({ "action": "slow", "seq": 1 })).await;
    send_json(&mut ws, json!({ "action": "slow", "seq": 2 })).await;

    let busy = next_json(&mut ws).await;
    assert_eq!(busy["seq"], 2);
    assert_eq!(busy["status"], "FAIL");
    assert_eq!(busy["error"]["status_code"], 503);
    assert_eq!(busy["error"]["id"], "websocket.server_busy");

    release.notify_one();
    let done = next_json(&mut ws).await;
    assert_eq!(done["seq"], 1);
    assert_eq!(done["status"], "OK");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // the permit is back once the first request finishes
    let (_, resp) = ping_roundtrip(&mut ws, 3).await;
    assert_eq!(resp["status"], "OK");
}

#[tokio::test]
async fn zero_heartbeat_interval_still_serves() {
    let (addr, _server) = boot_server(ServerConfig {
        heartbeat_interval: Duration::ZERO,
        heartbeat_timeout: Duration::from_secs(60),
        ..ServerConfig::default()
    })
    .await;
    let (mut ws, hello) = connect(addr, "tok-1").await;
    assert_eq!(hello["seq"], 0);
    let (_, resp) = ping_roundtrip(&mut ws, 7).await;
    assert_eq!(resp["data"]["text"], "pong");
}
