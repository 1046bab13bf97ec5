//! `SwitchboardServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::Router;
use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::header::{ACCEPT_LANGUAGE, AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use switchboard_core::Broadcast;
use switchboard_hub::{ConnIdentity, Hub};
use switchboard_rpc::{RequestRouter, RpcError, SessionStore};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::cluster::{CLUSTER_BROADCAST_PATH, CLUSTER_SECRET_HEADER, constant_time_eq};
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_UPGRADES_REJECTED_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::{SessionDeps, run_ws_session};

/// Locale used when the client sends none.
const DEFAULT_LOCALE: &str = "en";

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection hub.
    pub hub: Arc<Hub>,
    /// Request pipeline.
    pub router: RequestRouter,
    /// Session store used to authenticate upgrades.
    pub sessions: Arc<dyn SessionStore>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Renders `/metrics`.
    pub metrics: PrometheusHandle,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    active: Arc<AtomicUsize>,
}

impl AppState {
    fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            hub: Arc::clone(&self.hub),
            router: self.router.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
            heartbeat_timeout: self.config.heartbeat_timeout,
            max_inflight: self.config.max_inflight_requests,
        }
    }
}

/// The Switchboard server.
pub struct SwitchboardServer {
    state: AppState,
}

impl SwitchboardServer {
    /// Create a server around an already started hub.
    pub fn new(
        config: ServerConfig,
        hub: Arc<Hub>,
        router: RequestRouter,
        sessions: Arc<dyn SessionStore>,
        metrics: PrometheusHandle,
    ) -> Self {
        Self {
            state: AppState {
                hub,
                router,
                sessions,
                config: Arc::new(config),
                metrics,
                shutdown: Arc::new(ShutdownCoordinator::new()),
                start_time: Instant::now(),
                active: Arc::new(AtomicUsize::new(0)),
            },
        }
    }

    /// Build the Axum router. The peer endpoint is mounted only when
    /// clustering is enabled.
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler));
        if self.state.config.cluster_enabled {
            router = router.route(CLUSTER_BROADCAST_PATH, post(cluster_broadcast_handler));
        }
        router
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve until the shutdown token is cancelled.
    ///
    /// Returns the bound address (useful with port 0) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.state.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.state.shutdown.token();

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server stopped with error");
            }
        });
        info!(%addr, node_id = %self.state.hub.node_id(), "switchboard listening");
        Ok((addr, handle))
    }

    /// The hub.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.state.hub
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Open WebSocket sessions on this server.
    pub fn active_connections(&self) -> usize {
        self.state.active.load(Ordering::Acquire)
    }
}

/// Query parameters accepted on `/ws`.
#[derive(Debug, Default, Deserialize)]
struct WsParams {
    token: Option<String>,
    locale: Option<String>,
}

/// One of `max_connections` slots, released on drop.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        if active.fetch_add(1, Ordering::AcqRel) >= max {
            let _ = active.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Self(Arc::clone(active)))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// GET /ws
///
/// Authenticates before looking at the upgrade so that refusals are plain
/// HTTP responses.
async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<WsParams>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.shutdown.is_shutting_down() || state.hub.is_stopped() {
        return refuse(
            &RpcError::ServerBusy {
                action: "connect".into(),
            },
            "shutting_down",
        );
    }

    let Some(token) = bearer_token(&headers)
        .or(params.token.as_deref())
        .filter(|t| !t.is_empty())
    else {
        return refuse(
            &RpcError::Session {
                message: "missing session token".into(),
            },
            "unauthenticated",
        );
    };
    let session = match state.sessions.validate_session(token).await {
        Ok(session) => session,
        Err(e) => {
            debug!(error = %e, "upgrade with invalid session");
            return refuse(&RpcError::from(e), "unauthenticated");
        }
    };

    let Some(slot) = ConnectionSlot::acquire(&state.active, state.config.max_connections) else {
        warn!(max = state.config.max_connections, "connection limit reached");
        return refuse(
            &RpcError::ServerBusy {
                action: "connect".into(),
            },
            "connection_limit",
        );
    };

    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let locale = params
        .locale
        .filter(|l| !l.is_empty())
        .or_else(|| accept_language(&headers))
        .unwrap_or_else(|| DEFAULT_LOCALE.to_owned());
    let (conn, outbound) = state.hub.new_connection(ConnIdentity {
        user_id: session.user_id,
        session_id: session.id,
        session_token: session.token,
        locale,
    });
    let deps = state.session_deps();

    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            let _slot = slot;
            run_ws_session(socket, conn, outbound, deps).await;
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.hub.connection_count().await;
    Json(health::health_check(
        state.start_time,
        state.hub.node_id(),
        connections,
        state.hub.shard_count(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// POST /cluster/broadcast
///
/// Refuses everything unless a secret is configured and presented.
async fn cluster_broadcast_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(expected) = state.config.cluster_secret.as_deref().filter(|s| !s.is_empty()) else {
        warn!("cluster broadcast refused, no cluster secret configured");
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let presented = headers
        .get(CLUSTER_SECRET_HEADER)
        .map(|v| v.as_bytes())
        .unwrap_or_default();
    if !constant_time_eq(presented, expected.as_bytes()) {
        warn!("cluster broadcast with bad secret");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let msg: Broadcast = match serde_json::from_slice(&body) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(error = %e, "malformed cluster broadcast");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    let accepted = state.hub.accept_forwarded(msg).await;
    (StatusCode::ACCEPTED, Json(json!({ "accepted": accepted }))).into_response()
}

fn refuse(err: &RpcError, reason: &'static str) -> Response {
    counter!(WS_UPGRADES_REJECTED_TOTAL, "reason" => reason).increment(1);
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.to_error_body())).into_response()
}

/// Token from `Authorization: Bearer <token>` (or `Token <token>`).
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") || scheme.eq_ignore_ascii_case("token") {
        Some(token.trim())
    } else {
        None
    }
}

/// Primary language subtag of the first `Accept-Language` entry.
fn accept_language(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(ACCEPT_LANGUAGE)?.to_str().ok()?;
    let tag = value.split(',').next()?.split(';').next()?.trim();
    let primary = tag.split('-').next()?.trim();
    if primary.is_empty() || primary == "*" {
        return None;
    }
    Some(primary.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use switchboard_core::{BroadcastTarget, WebSocketEvent};
    use switchboard_hub::HubConfig;
    use switchboard_rpc::{ActionRegistry, InMemorySessionStore, Session};
    use tower::ServiceExt;

    fn make_server(config: ServerConfig) -> SwitchboardServer {
        let hub = Hub::start(
            HubConfig {
                shard_count: 2,
                ..HubConfig::default()
            },
            "node-a",
            None,
        );
        let sessions: Arc<dyn SessionStore> =
            Arc::new(InMemorySessionStore::with_sessions([Session {
                id: "s1".into(),
                user_id: "u1".into(),
                token: "good".into(),
                expires_at: None,
            }]));
        let router = RequestRouter::new(
            Arc::new(ActionRegistry::new()),
            Arc::clone(&sessions),
            Arc::clone(&hub),
        );
        SwitchboardServer::new(
            config,
            hub,
            router,
            sessions,
            crate::metrics::detached_handle(),
        )
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server(ServerConfig::default());
        let resp = server
            .router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["node_id"], "node-a");
        assert_eq!(parsed["shards"], 2);
        assert_eq!(parsed["connections"], 0);
    }

    #[tokio::test]
    async fn metrics_endpoint_is_plain_text() {
        let server = make_server(ServerConfig::default());
        let resp = server
            .router()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            resp.headers()[CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
    }

    #[tokio::test]
    async fn ws_without_token_is_unauthorized() {
        let server = make_server(ServerConfig::default());
        let resp = server
            .router()
            .oneshot(Request::get("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["id"], "websocket.session_invalid");
    }

    #[tokio::test]
    async fn ws_with_bad_token_is_unauthorized() {
        let server = make_server(ServerConfig::default());
        let req = Request::get("/ws")
            .header(AUTHORIZATION, "Bearer nope")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn ws_at_connection_limit_is_unavailable() {
        let server = make_server(ServerConfig {
            max_connections: 0,
            ..ServerConfig::default()
        });
        let resp = server
            .router()
            .oneshot(Request::get("/ws?token=good").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(server.active_connections(), 0);
    }

    #[tokio::test]
    async fn ws_refused_while_shutting_down() {
        let server = make_server(ServerConfig::default());
        server.shutdown().shutdown();
        let resp = server
            .router()
            .oneshot(Request::get("/ws?token=good").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn ws_authenticated_but_not_upgradable() {
        let server = make_server(ServerConfig::default());
        let resp = server
            .router()
            .oneshot(Request::get("/ws?token=good").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
        assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(server.active_connections(), 0);
    }

    fn clustered(secret: Option<&str>) -> ServerConfig {
        ServerConfig {
            cluster_enabled: true,
            cluster_secret: secret.map(str::to_owned),
            ..ServerConfig::default()
        }
    }

    fn forwarded_body(origin: &str) -> Body {
        let mut msg = Broadcast::new(WebSocketEvent::new("posted"), BroadcastTarget::All);
        msg.origin_node = Some(origin.into());
        Body::from(serde_json::to_vec(&msg).unwrap())
    }

    #[tokio::test]
    async fn cluster_broadcast_checks_secret() {
        let server = make_server(clustered(Some("s3cret")));
        let missing = Request::post(CLUSTER_BROADCAST_PATH)
            .body(forwarded_body("node-b"))
            .unwrap();
        let resp = server.router().oneshot(missing).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let denied = Request::post(CLUSTER_BROADCAST_PATH)
            .header(CLUSTER_SECRET_HEADER, "wrong")
            .body(forwarded_body("node-b"))
            .unwrap();
        let resp = server.router().oneshot(denied).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let allowed = Request::post(CLUSTER_BROADCAST_PATH)
            .header(CLUSTER_SECRET_HEADER, "s3cret")
            .body(forwarded_body("node-b"))
            .unwrap();
        let resp = server.router().oneshot(allowed).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(resp).await["accepted"], true);
    }

    #[tokio::test]
    async fn cluster_endpoint_not_mounted_on_single_node() {
        let server = make_server(ServerConfig::default());
        let (conn, mut rx) = server.hub().new_connection(ConnIdentity {
            user_id: "u1".into(),
            session_id: "s1".into(),
            session_token: "good".into(),
            locale: "en".into(),
        });
        let _ = server.hub().register(conn).await.unwrap();

        let mut msg = Broadcast::new(
            WebSocketEvent::new("posted"),
            BroadcastTarget::User { user_id: "u1".into() },
        );
        msg.origin_node = Some("node-b".into());
        let req = Request::post(CLUSTER_BROADCAST_PATH)
            .body(Body::from(serde_json::to_vec(&msg).unwrap()))
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        // flush the shard before checking the queue
        assert_eq!(server.hub().connection_count().await, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cluster_endpoint_without_secret_refuses_everything() {
        let server = make_server(clustered(None));
        let req = Request::post(CLUSTER_BROADCAST_PATH)
            .body(forwarded_body("node-b"))
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = Request::post(CLUSTER_BROADCAST_PATH)
            .header(CLUSTER_SECRET_HEADER, "")
            .body(forwarded_body("node-b"))
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn cluster_broadcast_ignores_own_origin() {
        let server = make_server(clustered(Some("s3cret")));
        let req = Request::post(CLUSTER_BROADCAST_PATH)
            .header(CLUSTER_SECRET_HEADER, "s3cret")
            .body(forwarded_body("node-a"))
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(resp).await["accepted"], false);
    }

    #[tokio::test]
    async fn cluster_broadcast_rejects_garbage() {
        let server = make_server(clustered(Some("s3cret")));
        let req = Request::post(CLUSTER_BROADCAST_PATH)
            .header(CLUSTER_SECRET_HEADER, "s3cret")
            .body(Body::from("not json"))
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn bearer_token_schemes() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        let _ = headers.insert(AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc"));
        let _ = headers.insert(AUTHORIZATION, "token xyz".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("xyz"));
        let _ = headers.insert(AUTHORIZATION, "Basic Zm9vOmJhcg==".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn accept_language_primary_subtag() {
        let mut headers = HeaderMap::new();
        assert_eq!(accept_language(&headers), None);
        let _ = headers.insert(ACCEPT_LANGUAGE, "fr-CA,fr;q=0.9,en;q=0.8".parse().unwrap());
        assert_eq!(accept_language(&headers).as_deref(), Some("fr"));
        let _ = headers.insert(ACCEPT_LANGUAGE, "*".parse().unwrap());
        assert_eq!(accept_language(&headers), None);
    }

    #[test]
    fn connection_slots_are_released() {
        let active = Arc::new(AtomicUsize::new(0));
        let first = ConnectionSlot::acquire(&active, 1).unwrap();
        assert!(ConnectionSlot::acquire(&active, 1).is_none());
        drop(first);
        assert!(ConnectionSlot::acquire(&active, 1).is_some());
        assert_eq!(active.load(Ordering::Acquire), 0);
    }
}
