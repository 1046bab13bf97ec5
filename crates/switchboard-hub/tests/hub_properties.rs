//! Delivery guarantees of the hub, exercised through its public API.

use std::sync::Arc;
use std::time::Duration;

use switchboard_core::{Broadcast, BroadcastTarget, ResponseEnvelope, SessionId, WebSocketEvent};
use switchboard_hub::{
    CloseReason, ClusterForwarder, ConnIdentity, Hub, HubConfig, MemoryCluster, Outbound,
    SlowConsumerPolicy, WebConn,
};
use tokio::sync::mpsc;

fn identity(user: &str, session: &str) -> ConnIdentity {
    ConnIdentity {
        user_id: user.into(),
        session_id: session.into(),
        session_token: format!("token-{session}"),
        locale: "en".into(),
    }
}

fn config(shards: usize) -> HubConfig {
    HubConfig {
        shard_count: shards,
        ..HubConfig::default()
    }
}

fn event(name: &str, target: BroadcastTarget) -> Broadcast {
    Broadcast::new(WebSocketEvent::new(name), target)
}

fn to_user(user: &str) -> BroadcastTarget {
    BroadcastTarget::User {
        user_id: user.into(),
    }
}

async fn connect(hub: &Hub, user: &str) -> (Arc<WebConn>, mpsc::Receiver<Outbound>) {
    let (conn, rx) = hub.new_connection(identity(user, &format!("s-{user}")));
    let _ = hub.register(conn.clone()).await.unwrap();
    (conn, rx)
}

/// Collect event names already queued; a round trip through the shard
/// guarantees earlier commands were processed.
async fn queued_events(hub: &Hub, conn: &WebConn, rx: &mut mpsc::Receiver<Outbound>) -> Vec<String> {
    let _ = hub.connections_for_user(&conn.user_id).await;
    let mut names = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if let Outbound::Event(b) = msg {
            names.push(b.payload.event.clone());
        }
    }
    names
}

#[tokio::test]
async fn user_broadcast_delivers_exactly_once() {
    let hub = Hub::start(config(4), "node-a", None);
    let (conn, mut rx) = connect(&hub, "u1").await;

    hub.broadcast(event("ping", to_user("u1"))).await;

    assert_eq!(queued_events(&hub, &conn, &mut rx).await, vec!["ping"]);
    hub.shutdown().await;
}

#[tokio::test]
async fn broadcasts_arrive_in_submission_order() {
    let hub = Hub::start(config(4), "node-a", None);
    let (conn, mut rx) = connect(&hub, "u1").await;

    let names: Vec<String> = (0..50).map(|i| format!("e{i}")).collect();
    for (i, name) in names.iter().enumerate() {
        // mix targeted and fan-out broadcasts; both routes share the shard inbox
        let target = if i % 2 == 0 {
            to_user("u1")
        } else {
            BroadcastTarget::All
        };
        hub.broadcast(event(name, target)).await;
    }

    assert_eq!(queued_events(&hub, &conn, &mut rx).await, names);
    hub.shutdown().await;
}

#[tokio::test]
async fn nothing_delivered_after_unregister_returns() {
    let hub = Hub::start(config(4), "node-a", None);
    let (conn, mut rx) = connect(&hub, "u1").await;

    hub.broadcast(event("before", to_user("u1"))).await;
    assert!(hub.unregister(&conn).await);
    hub.broadcast(event("after", to_user("u1"))).await;
    hub.broadcast(event("after-all", BroadcastTarget::All)).await;

    assert_eq!(queued_events(&hub, &conn, &mut rx).await, vec!["before"]);
    hub.shutdown().await;
}

#[tokio::test]
async fn connections_for_user_tracks_register_and_unregister() {
    let hub = Hub::start(config(4), "node-a", None);
    let user = "u1".into();
    assert!(hub.connections_for_user(&user).await.is_empty());

    let (a, _ra) = connect(&hub, "u1").await;
    let (b, _rb) = connect(&hub, "u1").await;
    let (_c, _rc) = connect(&hub, "u2").await;

    let mut ids: Vec<_> = hub
        .connections_for_user(&user)
        .await
        .iter()
        .map(|c| c.id.clone())
        .collect();
    ids.sort();
    let mut expected = vec![a.id.clone(), b.id.clone()];
    expected.sort();
    assert_eq!(ids, expected);

    assert!(hub.unregister(&a).await);
    let remaining = hub.connections_for_user(&user).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, b.id);
    hub.shutdown().await;
}

#[tokio::test]
async fn response_goes_to_issuing_connection_only() {
    let hub = Hub::start(config(2), "node-a", None);
    let (a, mut ra) = connect(&hub, "u1").await;
    let (_b, mut rb) = connect(&hub, "u1").await;

    hub.send(&a, ResponseEnvelope::ok(42, serde_json::Value::Null)).await;
    let _ = hub.connection_count().await;

    match ra.try_recv() {
        Ok(Outbound::Response(resp)) => {
            assert_eq!(resp.seq, 42);
            assert!(resp.is_ok());
        }
        other => panic!("expected response, got {other:?}"),
    }
    assert!(rb.try_recv().is_err());
    hub.shutdown().await;
}

#[tokio::test]
async fn slow_consumer_is_force_unregistered() {
    let hub = Hub::start(
        HubConfig {
            shard_count: 2,
            outbound_queue_capacity: 2,
            slow_consumer: SlowConsumerPolicy {
                max_consecutive_full: 1,
                max_backlog_age: Duration::from_secs(60),
            },
            ..HubConfig::default()
        },
        "node-a",
        None,
    );
    let (conn, _rx) = connect(&hub, "u1").await;

    for name in ["one", "two", "three"] {
        hub.broadcast(event(name, to_user("u1"))).await;
    }

    assert!(hub.connections_for_user(&conn.user_id).await.is_empty());
    assert!(!conn.is_active());
    assert_eq!(conn.close_reason(), Some(CloseReason::SlowConsumer));
    assert!(!hub.unregister(&conn).await);
    hub.shutdown().await;
}

#[tokio::test]
async fn all_broadcast_reaches_every_shard() {
    let hub = Hub::start(config(4), "node-a", None);

    // one connection per shard
    let mut per_shard: Vec<Option<(Arc<WebConn>, mpsc::Receiver<Outbound>)>> =
        (0..4).map(|_| None).collect();
    let mut n = 0;
    while per_shard.iter().any(Option::is_none) {
        let user = format!("user-{n}");
        n += 1;
        let index = hub.shard_index(&user.as_str().into());
        if per_shard[index].is_none() {
            per_shard[index] = Some(connect(&hub, &user).await);
        }
    }

    hub.broadcast(event("announce", BroadcastTarget::All)).await;

    for slot in &mut per_shard {
        let (conn, rx) = slot.as_mut().unwrap();
        assert_eq!(queued_events(&hub, conn, rx).await, vec!["announce"]);
    }
    hub.shutdown().await;
}

#[tokio::test]
async fn channel_and_team_targets_fan_out_to_all() {
    let hub = Hub::start(config(4), "node-a", None);
    let (a, mut ra) = connect(&hub, "u1").await;
    let (b, mut rb) = connect(&hub, "u2").await;

    hub.broadcast(event(
        "posted",
        BroadcastTarget::Channel {
            channel_id: "c1".into(),
        },
    ))
    .await;
    hub.broadcast(event(
        "team_updated",
        BroadcastTarget::Team {
            team_id: "t1".into(),
        },
    ))
    .await;

    assert_eq!(queued_events(&hub, &a, &mut ra).await, vec!["posted", "team_updated"]);
    assert_eq!(queued_events(&hub, &b, &mut rb).await, vec!["posted", "team_updated"]);
    hub.shutdown().await;
}

#[tokio::test]
async fn omit_filters_exclude_the_right_connections() {
    let hub = Hub::start(config(4), "node-a", None);
    let (a1, mut ra1) = connect(&hub, "u1").await;
    let (a2, mut ra2) = connect(&hub, "u1").await;
    let (b, mut rb) = connect(&hub, "u2").await;
    let (c, mut rc) = connect(&hub, "u3").await;

    hub.broadcast(
        event("typing", BroadcastTarget::All)
            .omit_connection(a1.id.clone())
            .omit_user("u3".into()),
    )
    .await;

    assert!(queued_events(&hub, &a1, &mut ra1).await.is_empty());
    assert_eq!(queued_events(&hub, &a2, &mut ra2).await, vec!["typing"]);
    assert_eq!(queued_events(&hub, &b, &mut rb).await, vec!["typing"]);
    assert!(queued_events(&hub, &c, &mut rc).await.is_empty());
    hub.shutdown().await;
}

#[tokio::test]
async fn evict_session_closes_only_matching_connections() {
    let hub = Hub::start(config(4), "node-a", None);
    let (web, _r1) = hub.new_connection(identity("u1", "web"));
    let (phone, _r2) = hub.new_connection(identity("u1", "phone"));
    let _ = hub.register(web.clone()).await.unwrap();
    let _ = hub.register(phone.clone()).await.unwrap();

    let closed = hub
        .evict_session(&"u1".into(), &SessionId::from("web"))
        .await;

    assert_eq!(closed, 1);
    assert_eq!(web.close_reason(), Some(CloseReason::SessionRevoked));
    assert!(!phone.is_closed());
    assert_eq!(hub.connections_for_user(&"u1".into()).await.len(), 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_connections() {
    let hub = Hub::start(config(2), "node-a", None);
    let (a, _ra) = connect(&hub, "u1").await;
    let (b, _rb) = connect(&hub, "u2").await;

    hub.shutdown().await;

    assert_eq!(a.close_reason(), Some(CloseReason::ServerShutdown));
    assert_eq!(b.close_reason(), Some(CloseReason::ServerShutdown));
}

// ── Cluster ─────────────────────────────────────────────────────────────────

struct Node {
    hub: Arc<Hub>,
}

fn start_node(cluster: &Arc<MemoryCluster>, id: &str) -> Node {
    let (forwarder, _task) = ClusterForwarder::spawn(cluster.transport(id), 64);
    let hub = Hub::start(config(2), id, Some(forwarder));
    cluster.join(&hub);
    Node { hub }
}

async fn wait_for_events(
    hub: &Hub,
    conn: &WebConn,
    rx: &mut mpsc::Receiver<Outbound>,
    want: usize,
) -> Vec<Arc<Broadcast>> {
    let mut got = Vec::new();
    for _ in 0..200 {
        let _ = hub.connections_for_user(&conn.user_id).await;
        while let Ok(msg) = rx.try_recv() {
            if let Outbound::Event(b) = msg {
                got.push(b);
            }
        }
        if got.len() >= want {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    got
}

#[tokio::test]
async fn broadcast_is_forwarded_with_origin_node() {
    let cluster = MemoryCluster::new();
    let a = start_node(&cluster, "node-a");
    let b = start_node(&cluster, "node-b");
    let (remote, mut remote_rx) = connect(&b.hub, "u1").await;

    a.hub.broadcast(event("posted", to_user("u1"))).await;

    let got = wait_for_events(&b.hub, &remote, &mut remote_rx, 1).await;
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload.event, "posted");
    assert_eq!(got[0].origin_node.as_deref(), Some("node-a"));
    assert!(got[0].forwarded);

    a.hub.shutdown().await;
    b.hub.shutdown().await;
}

#[tokio::test]
async fn forwarded_broadcast_is_not_forwarded_again() {
    let cluster = MemoryCluster::new();
    let a = start_node(&cluster, "node-a");
    let b = start_node(&cluster, "node-b");
    let c = start_node(&cluster, "node-c");
    let (on_a, mut rx_a) = connect(&a.hub, "u1").await;
    let (on_c, mut rx_c) = connect(&c.hub, "u3").await;

    // b receives a message forwarded from a; it must deliver locally only
    let mut msg = event("posted", BroadcastTarget::All);
    msg.origin_node = Some("node-a".into());
    assert!(b.hub.accept_forwarded(msg).await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(wait_for_events(&a.hub, &on_a, &mut rx_a, 0).await.is_empty());
    assert!(wait_for_events(&c.hub, &on_c, &mut rx_c, 0).await.is_empty());

    a.hub.shutdown().await;
    b.hub.shutdown().await;
    c.hub.shutdown().await;
}

#[tokio::test]
async fn connection_target_is_never_forwarded() {
    let cluster = MemoryCluster::new();
    let a = start_node(&cluster, "node-a");
    let b = start_node(&cluster, "node-b");
    let (on_b, mut rx_b) = connect(&b.hub, "u1").await;

    a.hub
        .broadcast(event(
            "hello",
            BroadcastTarget::Connection {
                user_id: "u1".into(),
                connection_id: on_b.id.clone(),
            },
        ))
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(wait_for_events(&b.hub, &on_b, &mut rx_b, 0).await.is_empty());

    a.hub.shutdown().await;
    b.hub.shutdown().await;
}

#[tokio::test]
async fn unreachable_peer_does_not_affect_local_delivery() {
    let cluster = MemoryCluster::new();
    cluster.reserve("node-down");
    let a = start_node(&cluster, "node-a");
    let (local, mut rx) = connect(&a.hub, "u1").await;

    a.hub.broadcast(event("posted", BroadcastTarget::All)).await;

    let got = wait_for_events(&a.hub, &local, &mut rx, 1).await;
    assert_eq!(got.len(), 1);
    assert!(!got[0].forwarded);
    a.hub.shutdown().await;
}
