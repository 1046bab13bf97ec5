//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use switchboard_core::events::names;
use switchboard_core::{Broadcast, BroadcastTarget, RequestEnvelope, WebSocketEvent};
use switchboard_hub::{CloseReason, Hub, Outbound, WebConn};
use switchboard_rpc::router::recover_seq;
use switchboard_rpc::{RequestRouter, RpcError};
use tokio::sync::{Semaphore, mpsc};
use tokio::time;
use tracing::{debug, error, info, instrument, warn};

use super::heartbeat::{HeartbeatResult, run_heartbeat, tick_period};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

/// Everything a session needs besides its socket.
#[derive(Clone)]
pub struct SessionDeps {
    /// The hub the connection registers with.
    pub hub: Arc<Hub>,
    /// Request pipeline for inbound frames.
    pub router: RequestRouter,
    /// Interval between Ping frames.
    pub heartbeat_interval: Duration,
    /// Silence after which the client is considered dead.
    pub heartbeat_timeout: Duration,
    /// Requests this connection may have in progress.
    pub max_inflight: usize,
}

/// Run a WebSocket session for an authenticated client.
///
/// 1. Queues the `hello` event, then registers the connection with the hub
/// 2. Spawns the writer (outbound queue and pings) and the heartbeat watcher
/// 3. Routes inbound text frames as requests until the connection closes
/// 4. Unregisters and waits for the writer to finish
#[instrument(skip_all, fields(conn_id = %conn.id, user_id = %conn.user_id))]
pub async fn run_ws_session(
    socket: WebSocket,
    conn: Arc<WebConn>,
    outbound: mpsc::Receiver<Outbound>,
    deps: SessionDeps,
) {
    // queued before registering, so nothing from the shard can precede it
    let hello = Outbound::Event(Arc::new(hello_event(&conn, deps.hub.node_id())));
    let _ = conn.try_push(hello, &deps.hub.config().slow_consumer);

    let (mut sink, mut stream) = socket.split();
    if let Err(e) = deps.hub.register(Arc::clone(&conn)).await {
        warn!(error = %e, "hub refused connection");
        let _ = sink.send(close_frame(CloseReason::ServerShutdown)).await;
        return;
    }

    info!(session_id = %conn.session_id, locale = %conn.locale, "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        Arc::clone(&conn),
        deps.heartbeat_interval,
    ));
    let heartbeat = {
        let conn = Arc::clone(&conn);
        let (interval, timeout) = (deps.heartbeat_interval, deps.heartbeat_timeout);
        tokio::spawn(async move {
            let cancel = conn.close_token().clone();
            if run_heartbeat(Arc::clone(&conn), interval, timeout, cancel).await
                == HeartbeatResult::TimedOut
            {
                warn!(conn_id = %conn.id, silent_for = ?conn.last_pong_elapsed(), "client unresponsive");
                conn.close(CloseReason::HeartbeatTimeout);
            }
        })
    };

    read_loop(&mut stream, &conn, &deps).await;

    let reason = conn.close_reason().unwrap_or(CloseReason::TransportClosed);
    let _ = deps.hub.unregister(&conn).await;
    if let Err(e) = writer.await {
        error!(error = %e, "writer task failed");
    }
    heartbeat.abort();

    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(conn.age().as_secs_f64());
    info!(
        reason = reason.as_str(),
        dropped = conn.drop_count(),
        duration_secs = conn.age().as_secs(),
        "client disconnected"
    );
}

/// First event on every connection.
pub(crate) fn hello_event(conn: &WebConn, node_id: &str) -> Broadcast {
    let payload = WebSocketEvent::new(names::HELLO)
        .with("connection_id", conn.id.as_str())
        .with("server_version", env!("CARGO_PKG_VERSION"))
        .with("node_id", node_id);
    Broadcast::new(
        payload,
        BroadcastTarget::Connection {
            user_id: conn.user_id.clone(),
            connection_id: conn.id.clone(),
        },
    )
}

/// Close frame sent to the client for a server-side close.
pub(crate) fn close_frame(reason: CloseReason) -> Message {
    let code = match reason {
        CloseReason::ServerShutdown | CloseReason::HeartbeatTimeout => close_code::AWAY,
        CloseReason::SlowConsumer | CloseReason::SessionRevoked => close_code::POLICY,
        CloseReason::TransportClosed | CloseReason::TransportError => close_code::NORMAL,
    };
    Message::Close(Some(CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason.as_str()),
    }))
}

/// Drain the outbound queue onto the socket and send periodic pings.
///
/// Event `seq` numbers are assigned here, in write order.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    conn: Arc<WebConn>,
    ping_every: Duration,
) {
    let closed = conn.close_token().clone();
    let ping_every = tick_period(ping_every);
    let mut ping = time::interval_at(time::Instant::now() + ping_every, ping_every);
    let mut next_seq: i64 = 0;

    loop {
        tokio::select! {
            biased;
            () = closed.cancelled() => break,
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                let text = match msg.encode(&mut next_seq) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(error = %e, "failed to encode outbound message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!(error = %e, "write failed");
                    conn.close(CloseReason::TransportError);
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    debug!(error = %e, "ping failed");
                    conn.close(CloseReason::TransportError);
                    break;
                }
            }
        }
    }

    match conn.close_reason() {
        Some(CloseReason::TransportClosed | CloseReason::TransportError) | None => {}
        Some(reason) => {
            let _ = sink.send(close_frame(reason)).await;
        }
    }
    let _ = sink.close().await;
}

/// Read frames until the client goes away or the connection is closed.
/// Always leaves the connection closed.
async fn read_loop(stream: &mut SplitStream<WebSocket>, conn: &Arc<WebConn>, deps: &SessionDeps) {
    let closed = conn.close_token().clone();
    let inflight = Arc::new(Semaphore::new(deps.max_inflight.max(1)));

    loop {
        let frame = tokio::select! {
            () = closed.cancelled() => return,
            frame = stream.next() => frame,
        };
        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!(error = %e, "read failed");
                conn.close(CloseReason::TransportError);
                return;
            }
            None => {
                conn.close(CloseReason::TransportClosed);
                return;
            }
        };
        conn.mark_alive();

        match msg {
            Message::Text(text) => dispatch(text.as_str(), conn, deps, &inflight).await,
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => dispatch(text, conn, deps, &inflight).await,
                Err(_) => debug!(len = data.len(), "ignoring non-UTF-8 binary frame"),
            },
            Message::Close(_) => {
                conn.close(CloseReason::TransportClosed);
                return;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

/// Route one request frame, or refuse it when the connection is at its
/// in-flight limit.
async fn dispatch(text: &str, conn: &Arc<WebConn>, deps: &SessionDeps, inflight: &Arc<Semaphore>) {
    if let Ok(permit) = Arc::clone(inflight).try_acquire_owned() {
        let router = deps.router.clone();
        let conn = Arc::clone(conn);
        let text = text.to_owned();
        let _ = tokio::spawn(async move {
            let _permit = permit;
            let _ = router.handle_frame(&conn, &text).await;
        });
        return;
    }

    let action = serde_json::from_str::<RequestEnvelope>(text)
        .map(|req| req.action)
        .unwrap_or_default();
    warn!(action = %action, limit = deps.max_inflight, "too many requests in flight");
    let _ = deps
        .router
        .reject(conn, recover_seq(text), &RpcError::ServerBusy { action })
        .await;
}
