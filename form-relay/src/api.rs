use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{net::TcpListener, sync::broadcast};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ErrorKind, RelayError},
    gateway::{Gateway, GatewayStats},
    hub::{socket::serve_node, NodeSnapshot},
    link::{attach_websocket, DuplexLink},
    message::ProxyRequest,
    relay::{Relay, RelayStats},
    score::ScoreView,
    store::SessionBinding,
};

#[derive(Clone)]
pub struct ApiState {
    pub relay: Arc<Relay>,
    pub gateway: Arc<Gateway>,
}

pub fn build_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/:id", get(get_node))
        .route("/api/node-scores", get(node_scores))
        .route("/api/proxy", post(proxy_request))
        .route("/api/sessions/:id", get(get_session).delete(rotate_session))
        .route("/ws", get(node_socket))
        .route("/api/tunnel/ws", get(direct_tunnel))
        .route("/api/tunnel/standby", get(standby_tunnel))
        .with_state(state)
}

pub async fn serve(state: ApiState, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<(), RelayError> {
    info!("api listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        build_routes(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.recv().await;
    })
    .await?;
    Ok(())
}

struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match (&self.0, self.0.kind()) {
            (RelayError::NodeNotConnected(_), _) | (RelayError::NoNodes, _) => StatusCode::SERVICE_UNAVAILABLE,
            (_, ErrorKind::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            (_, ErrorKind::Protocol) => StatusCode::BAD_REQUEST,
            (_, ErrorKind::Auth) => StatusCode::UNAUTHORIZED,
            (_, ErrorKind::Capacity) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn health_check(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "nodes": state.relay.hub.count(),
        "time": chrono::Utc::now(),
    }))
}

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    relay: RelayStats,
    gateway: GatewayStats,
}

async fn stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        relay: state.relay.stats().await,
        gateway: state.gateway.stats(),
    })
}

#[derive(Serialize)]
struct NodeView {
    #[serde(flatten)]
    node: NodeSnapshot,
    score: Option<ScoreView>,
}

#[derive(Deserialize)]
struct NodeFilter {
    country: Option<String>,
}

async fn list_nodes(State(state): State<ApiState>, Query(filter): Query<NodeFilter>) -> Json<serde_json::Value> {
    let country = filter.country.map(|c| c.to_uppercase());
    let mut nodes: Vec<NodeView> = state
        .relay
        .hub
        .all_connections()
        .iter()
        .filter(|c| country.as_deref().map_or(true, |want| c.country() == want))
        .map(|c| NodeView {
            node: c.snapshot(),
            score: state.relay.scores.view(c.node_id()),
        })
        .collect();
    nodes.sort_by(|a, b| a.node.info.node_id.cmp(&b.node.info.node_id));
    Json(json!({ "count": nodes.len(), "nodes": nodes }))
}

async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> Result<Json<NodeView>, ApiError> {
    let conn = state
        .relay
        .hub
        .get_by_node_id(&id)
        .ok_or(RelayError::NodeNotConnected(id))?;
    Ok(Json(NodeView {
        node: conn.snapshot(),
        score: state.relay.scores.view(conn.node_id()),
    }))
}

async fn node_scores(State(state): State<ApiState>) -> Json<Vec<ScoreView>> {
    Json(state.relay.scores.snapshot())
}

#[derive(Deserialize)]
struct ProxyApiRequest {
    node_id: Option<String>,
    country: Option<String>,
    #[serde(flatten)]
    request: ProxyRequest,
}

/// One request through one node. Without a node id the best candidate in
/// `country` is used.
async fn proxy_request(State(state): State<ApiState>, Json(body): Json<ProxyApiRequest>) -> Result<Response, ApiError> {
    let relay = &state.relay;
    let node_id = match body.node_id.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => {
            let country = body.country.unwrap_or_default().to_uppercase();
            relay
                .selector
                .top_nodes(&country, 1, &Default::default())
                .await
                .first()
                .map(|c| c.node_id().to_string())
                .ok_or(RelayError::NoNodes)?
        }
    };

    let started = tokio::time::Instant::now();
    let cancel = CancellationToken::new();
    let result = relay.proxies.send_proxy_request(&node_id, body.request, &cancel).await;
    relay
        .selector
        .record_result(&node_id, matches!(&result, Ok(r) if r.success), started.elapsed());
    let response = result?;
    let status = if response.success { StatusCode::OK } else { StatusCode::BAD_GATEWAY };
    Ok((status, Json(json!({ "node_id": node_id, "response": response }))).into_response())
}

async fn get_session(State(state): State<ApiState>, Path(id): Path<String>) -> Result<Json<SessionBinding>, StatusCode> {
    state.relay.sessions.get(&id).await.map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn rotate_session(State(state): State<ApiState>, Path(id): Path<String>) -> Json<serde_json::Value> {
    let rotated = state.relay.sessions.rotate(&id).await;
    Json(json!({ "session_id": id, "rotated": rotated }))
}

/// Prefers the proxy-supplied client address over the socket peer.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| peer.ip().to_string())
}

async fn node_socket(
    State(state): State<ApiState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let ip = client_ip(&headers, peer);
    let capacity = state.relay.config.hub.send_queue;
    ws.on_upgrade(move |socket| async move {
        debug!("node socket from {ip}");
        serve_node(state.relay, attach_websocket(socket, capacity), ip).await;
    })
}

#[derive(Deserialize)]
struct DirectQuery {
    node_id: String,
    host: String,
    port: u16,
}

async fn direct_tunnel(
    State(state): State<ApiState>,
    Query(query): Query<DirectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let link: DuplexLink = attach_websocket(socket, crate::pool::LINK_CAPACITY);
        state
            .relay
            .standby
            .serve_direct(query.node_id, query.host, query.port, link)
            .await;
    })
}

#[derive(Deserialize)]
struct StandbyQuery {
    node_id: String,
}

async fn standby_tunnel(
    State(state): State<ApiState>,
    Query(query): Query<StandbyQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let link = attach_websocket(socket, crate::pool::LINK_CAPACITY);
        state.relay.standby.serve_standby(query.node_id, link).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let peer: SocketAddr = "10.0.0.1:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, peer), "10.0.0.1");

        headers.insert("x-real-ip", "203.0.113.9".parse().unwrap());
        assert_eq!(client_ip(&headers, peer), "203.0.113.9");

        headers.insert("x-forwarded-for", "198.51.100.4, 10.1.1.1".parse().unwrap());
        assert_eq!(client_ip(&headers, peer), "198.51.100.4");
    }

    #[test]
    fn errors_map_to_statuses() {
        let status = |e| ApiError(e).into_response().status();
        assert_eq!(status(RelayError::NoNodes), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status(RelayError::timeout("proxy response")), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status(RelayError::InvalidRequest("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(RelayError::ProxyFailed("x".into())), StatusCode::BAD_GATEWAY);
    }
}
