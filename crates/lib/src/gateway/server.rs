//! Hub HTTP + WebSocket server (single port).

use crate::channels::{Role, WsChannel};
use crate::config::{self, Config};
use crate::error::HubError;
use crate::gateway::protocol::{
    payload_from_body, AuthQuery, ErrorBody, ProxyQuery, PROTOCOL_VERSION,
};
use crate::hub::Hub;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;

/// When auth mode is token and a token is configured, returns it for request validation.
fn require_token(config: &Config) -> Option<String> {
    if config.hub.auth.mode == config::HubAuthMode::Token {
        config::resolve_hub_token(config)
    } else {
        None
    }
}

/// Shared state for the server (config and the hub itself).
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub hub: Arc<Hub>,
    /// When Some, every route but `GET /` must present this token.
    pub required_token: Option<String>,
}

impl GatewayState {
    pub fn new(config: Config) -> Self {
        let required_token = require_token(&config);
        let hub = Arc::new(Hub::new(config.relay.clone()));
        Self {
            config: Arc::new(config),
            hub,
            required_token,
        }
    }

    /// Token from `?token=` or `Authorization: Bearer`.
    fn authorize(&self, headers: &HeaderMap, query_token: Option<&str>) -> Result<(), Response> {
        let Some(ref required) = self.required_token else {
            return Ok(());
        };
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let provided = query_token.or(bearer).unwrap_or("").trim();
        if provided.is_empty() {
            return Err(unauthorized("hub token missing (set JUNCTION_HUB_TOKEN or hub.auth.token)"));
        }
        if provided != required {
            return Err(unauthorized("hub token mismatch"));
        }
        Ok(())
    }
}

fn unauthorized(msg: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody::new("unauthorized", msg)),
    )
        .into_response()
}

/// HTTP status for a failed proxy request.
fn status_for(err: &HubError) -> StatusCode {
    match err {
        HubError::TargetNotFound(_) => StatusCode::SERVICE_UNAVAILABLE,
        HubError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        HubError::ConnectionLost(_) => StatusCode::BAD_GATEWAY,
        HubError::MalformedMessage(_) => StatusCode::BAD_REQUEST,
        HubError::StaleResponse(_) => StatusCode::CONFLICT,
        HubError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// All routes, bound to `state`.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/status", get(status_http))
        .route("/ws/:role", get(ws_anonymous_handler))
        .route("/ws/:role/:id", get(ws_handler))
        .route("/offer", post(post_default_offer).get(get_default_offer))
        .route("/answer", post(post_default_answer).get(get_default_answer))
        .route("/offer/:device_id", post(post_offer).get(get_offer))
        .route("/answer/:device_id", post(post_answer).get(get_answer))
        .route("/proxy/:device_id", post(post_proxy))
        .with_state(state)
}

pub async fn run_hub(config: Config) -> Result<()> {
    let bind = config.hub.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        let token = config::resolve_hub_token(&config);
        if token.is_none() || config.hub.auth.mode != config::HubAuthMode::Token {
            anyhow::bail!(
                "refusing to bind hub to {} without auth (set hub.auth.mode to \"token\" and hub.auth.token or JUNCTION_HUB_TOKEN)",
                bind
            );
        }
    }

    let bind_addr = format!("{}:{}", bind, config.hub.port);
    let state = GatewayState::new(config);
    let hub = state.hub.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("hub listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await
        .context("hub server exited")?;
    log::info!("hub stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Sends a shutdown event to every connected endpoint and closes their channels so sockets drain.
async fn shutdown_signal(hub: Arc<Hub>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, notifying endpoints and draining connections");
    hub.shutdown().await;
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.hub.port,
    }))
}

async fn status_http(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Query(q): Query<AuthQuery>,
) -> Response {
    if let Err(r) = state.authorize(&headers, q.token.as_deref()) {
        return r;
    }
    Json(state.hub.status().await).into_response()
}

/// GET /ws/{role}/{id} upgrades to WebSocket and registers the endpoint under `id`.
async fn ws_handler(
    State(state): State<GatewayState>,
    Path((role, id)): Path<(String, String)>,
    Query(q): Query<AuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, &role, id, q, headers, ws)
}

/// GET /ws/{role} registers the endpoint under a generated id (e.g. `viewer-<uuid>`).
async fn ws_anonymous_handler(
    State(state): State<GatewayState>,
    Path(role): Path<String>,
    Query(q): Query<AuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let id = format!("{}-{}", role.trim().to_lowercase(), uuid::Uuid::new_v4());
    upgrade(state, &role, id, q, headers, ws)
}

fn upgrade(
    state: GatewayState,
    role: &str,
    id: String,
    q: AuthQuery,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(r) = state.authorize(&headers, q.token.as_deref()) {
        return r;
    }
    let role: Role = match role.parse() {
        Ok(r) => r,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };
    let id = id.trim().to_string();
    if id.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty connection id").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, role, id))
}

/// Per-connection task: a writer drains the channel's outbound queue into the socket while this
/// loop feeds inbound frames to the hub. Either side closing ends both; the hub cleanup runs once.
async fn handle_socket(socket: WebSocket, state: GatewayState, role: Role, id: String) {
    let (mut sink, mut stream) = socket.split();
    let (channel, mut outbound) = WsChannel::new(state.config.relay.outbound_buffer);
    let mut closed = channel.closed_signal();
    let mut writer_closed = channel.closed_signal();
    let conn = state.hub.connect(id, role, Arc::new(channel)).await;

    let writer_conn = conn.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                msg = outbound.recv() => {
                    let Some(msg) = msg else { break };
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                _ = writer_closed.wait() => {
                    // Flush what was queued before the close (e.g. the shutdown event).
                    while let Ok(msg) = outbound.try_recv() {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        writer_conn.close();
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            biased;

            _ = closed.wait() => break,
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => state.hub.dispatch(&conn, &text).await,
                    Some(Ok(Message::Binary(_))) => {
                        let e = HubError::MalformedMessage("binary frames are not supported".to_string());
                        state.hub.router().report_error(conn.id(), &e, None, None, None).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.hub.disconnect(&conn).await;
    let _ = writer.await;
}

async fn store_offer(state: &GatewayState, device_id: &str, body: &[u8]) -> Response {
    state.hub.publish_offer(device_id, payload_from_body(body)).await;
    log::debug!("offer received for {}", device_id);
    (StatusCode::OK, "Offer received").into_response()
}

async fn store_answer(state: &GatewayState, device_id: &str, body: &[u8]) -> Response {
    let pushed = state.hub.publish_answer(device_id, payload_from_body(body)).await;
    log::debug!("answer received for {} (pushed to device: {})", device_id, pushed);
    (StatusCode::OK, "Answer received").into_response()
}

async fn load_offer(state: &GatewayState, device_id: &str) -> Response {
    match state.hub.handshakes().get_offer(device_id).await {
        Some(sdp) => Json(sdp).into_response(),
        None => (StatusCode::NOT_FOUND, "No offer yet").into_response(),
    }
}

async fn load_answer(state: &GatewayState, device_id: &str) -> Response {
    match state.hub.handshakes().get_answer(device_id).await {
        Some(sdp) => Json(sdp).into_response(),
        None => (StatusCode::NOT_FOUND, "No answer yet").into_response(),
    }
}

/// POST /offer/{deviceId}: body is the offer SDP (JSON or raw text).
async fn post_offer(
    State(state): State<GatewayState>,
    Path(device_id): Path<String>,
    Query(q): Query<AuthQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(r) = state.authorize(&headers, q.token.as_deref()) {
        return r;
    }
    store_offer(&state, &device_id, &body).await
}

async fn get_offer(
    State(state): State<GatewayState>,
    Path(device_id): Path<String>,
    Query(q): Query<AuthQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(r) = state.authorize(&headers, q.token.as_deref()) {
        return r;
    }
    load_offer(&state, &device_id).await
}

async fn post_answer(
    State(state): State<GatewayState>,
    Path(device_id): Path<String>,
    Query(q): Query<AuthQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(r) = state.authorize(&headers, q.token.as_deref()) {
        return r;
    }
    store_answer(&state, &device_id, &body).await
}

async fn get_answer(
    State(state): State<GatewayState>,
    Path(device_id): Path<String>,
    Query(q): Query<AuthQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(r) = state.authorize(&headers, q.token.as_deref()) {
        return r;
    }
    load_answer(&state, &device_id).await
}

/// POST /offer acts on `handshake.defaultDevice`.
async fn post_default_offer(
    State(state): State<GatewayState>,
    Query(q): Query<AuthQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(r) = state.authorize(&headers, q.token.as_deref()) {
        return r;
    }
    let device_id = state.config.handshake.default_device.clone();
    store_offer(&state, &device_id, &body).await
}

async fn get_default_offer(
    State(state): State<GatewayState>,
    Query(q): Query<AuthQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(r) = state.authorize(&headers, q.token.as_deref()) {
        return r;
    }
    let device_id = state.config.handshake.default_device.clone();
    load_offer(&state, &device_id).await
}

async fn post_default_answer(
    State(state): State<GatewayState>,
    Query(q): Query<AuthQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(r) = state.authorize(&headers, q.token.as_deref()) {
        return r;
    }
    let device_id = state.config.handshake.default_device.clone();
    store_answer(&state, &device_id, &body).await
}

async fn get_default_answer(
    State(state): State<GatewayState>,
    Query(q): Query<AuthQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(r) = state.authorize(&headers, q.token.as_deref()) {
        return r;
    }
    let device_id = state.config.handshake.default_device.clone();
    load_answer(&state, &device_id).await
}

/// POST /proxy/{deviceId}: forwards the body as a `proxy_request` and waits for the device's
/// `proxy_response` payload.
async fn post_proxy(
    State(state): State<GatewayState>,
    Path(device_id): Path<String>,
    Query(q): Query<ProxyQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(r) = state.authorize(&headers, q.token.as_deref()) {
        return r;
    }
    match state
        .hub
        .proxy(&device_id, payload_from_body(&body), q.timeout())
        .await
    {
        Ok(payload) => Json(payload).into_response(),
        Err(e) => {
            log::debug!("proxy to {} failed: {}", device_id, e);
            (status_for(&e), Json(ErrorBody::from(&e))).into_response()
        }
    }
}
