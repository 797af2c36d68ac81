//! Client-facing proxy entrypoint.
//!
//! `CONNECT host:port` opens a circuit through a node and relays raw bytes.
//! Absolute-URI requests (`GET http://...`) are sent to a node as a single
//! `proxy_request` and the response is written back.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::http::StatusCode;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    sync::broadcast,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    auth::{parse_proxy_authorization, Credentials, RouteParams},
    collab::UsageRecord,
    error::RelayError,
    events::RelayEvent,
    hub::NodeConnection,
    link::{DuplexLink, WireMessage},
    message::ProxyRequest,
    pool::parse_target_or,
    relay::Relay,
    select::is_routable,
    tunnel::{short, Tunnel},
};

/// Request headers that only concern the hop between client and relay.
const HOP_HEADERS: [&str; 9] = [
    "proxy-authorization",
    "proxy-connection",
    "proxy-authenticate",
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn parse(raw: &[u8]) -> Result<Self, RelayError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| RelayError::InvalidRequest("request head is not utf-8".to_string()))?;
        let mut lines = text.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(RelayError::InvalidRequest(format!("bad request line {request_line:?}")));
        };

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| RelayError::InvalidRequest(format!("bad header line {line:?}")))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_ascii_uppercase(),
            target: target.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Reads up to and including the blank line ending the request head.
/// Returns the head and whatever the client already sent after it.
pub async fn read_head<R: AsyncRead + Unpin>(reader: &mut R, max_bytes: usize) -> Result<(RequestHead, Bytes), RelayError> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(end) = find_subslice(&buf, b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            let head = RequestHead::parse(&buf[..end])?;
            return Ok((head, rest.freeze()));
        }
        if buf.len() >= max_bytes {
            return Err(RelayError::InvalidRequest("request head too large".to_string()));
        }
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(RelayError::ConnectionClosed);
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Splits `http://host[:port]/path` into host, port and the full url.
pub fn parse_absolute_uri(target: &str) -> Result<(String, u16), RelayError> {
    let rest = target
        .strip_prefix("http://")
        .ok_or_else(|| RelayError::InvalidRequest(format!("not an absolute http uri: {target}")))?;
    let authority = rest.split(['/', '?']).next().unwrap_or_default();
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    parse_target_or(authority, 80)
}

fn failure_status(e: &RelayError) -> StatusCode {
    match e {
        RelayError::NodeNotConnected(_) | RelayError::NoNodes => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::Unauthorized(_) => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        RelayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

async fn write_status<W: AsyncWrite + Unpin>(writer: &mut W, status: StatusCode, message: &str) -> Result<(), RelayError> {
    let mut response = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default()
    );
    if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        response.push_str("Proxy-Authenticate: Basic realm=\"proxy\"\r\n");
    }
    response.push_str(&format!(
        "Content-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{message}",
        message.len()
    ));
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// How a circuit was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Direct,
    Session,
    Standby,
    Race,
}

/// A relayed byte path to a target, either a tunnel owned by this relay
/// or a link handed out by the standby pool.
pub enum Circuit {
    Tunnel(Arc<Tunnel>),
    Link(DuplexLink),
}

pub struct OpenedCircuit {
    pub circuit: Circuit,
    pub node_id: String,
    pub route: Route,
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicU64,
    http_requests: AtomicU64,
    failures: AtomicU64,
    dead_egress: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GatewayStats {
    pub connects: u64,
    pub http_requests: u64,
    pub failures: u64,
    pub dead_egress: u64,
}

pub struct Gateway {
    relay: Arc<Relay>,
    counters: Counters,
}

impl Gateway {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self {
            relay,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            connects: self.counters.connects.load(Ordering::Relaxed),
            http_requests: self.counters.http_requests.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            dead_egress: self.counters.dead_egress.load(Ordering::Relaxed),
        }
    }

    /// Serves one client connection: one request head, then either a
    /// relayed CONNECT circuit or a single proxied HTTP exchange.
    pub async fn handle_client<S>(&self, mut stream: S) -> Result<(), RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let config = &self.relay.config.gateway;
        let (head, leftover) = match tokio::time::timeout(config.head_timeout, read_head(&mut stream, config.max_head_bytes)).await {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(RelayError::ConnectionClosed)) => return Ok(()),
            Ok(Err(e)) => {
                let _ = write_status(&mut stream, failure_status(&e), &e.to_string()).await;
                return Err(e);
            }
            Err(_) => return Err(RelayError::timeout("request head")),
        };

        let credentials = match self.admit(&head).await {
            Ok(credentials) => credentials,
            Err(e) => {
                debug!("refused {} {}: {e}", head.method, head.target);
                write_status(&mut stream, failure_status(&e), "proxy authentication required").await?;
                return Ok(());
            }
        };

        if head.method == "CONNECT" {
            self.handle_connect(stream, &head, leftover, credentials).await
        } else {
            self.handle_http(stream, &head, leftover, credentials).await
        }
    }

    async fn admit(&self, head: &RequestHead) -> Result<Credentials, RelayError> {
        let credentials = parse_proxy_authorization(head.header("proxy-authorization"))?;
        self.relay.authorizer.authorize(&credentials).await?;
        Ok(credentials)
    }

    async fn handle_connect<S>(&self, mut stream: S, head: &RequestHead, leftover: Bytes, credentials: Credentials) -> Result<(), RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.counters.connects.fetch_add(1, Ordering::Relaxed);
        let (host, port) = match parse_target_or(&head.target, 443) {
            Ok(target) => target,
            Err(e) => {
                write_status(&mut stream, StatusCode::BAD_REQUEST, &e.to_string()).await?;
                return Ok(());
            }
        };

        let opened = match self.open_circuit(&credentials.params, &host, port).await {
            Ok(opened) => opened,
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!("CONNECT {host}:{port} for {} failed: {e}", credentials.account);
                write_status(&mut stream, failure_status(&e), &e.to_string()).await?;
                return Ok(());
            }
        };
        let OpenedCircuit { circuit, node_id, route } = opened;
        let tunnel = match &circuit {
            Circuit::Tunnel(tunnel) => Some(tunnel.clone()),
            Circuit::Link(_) => None,
        };

        if let Err(e) = stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await {
            if let Some(tunnel) = &tunnel {
                self.relay.tunnels.close_tunnel(tunnel.id()).await;
            }
            return Err(e.into());
        }

        let started = Instant::now();
        let (sent, received) = self.pump(stream, circuit, leftover).await;
        if let Some(tunnel) = &tunnel {
            self.relay.tunnels.close_tunnel(tunnel.id()).await;
        }
        let elapsed = started.elapsed();
        info!(
            "CONNECT {host}:{port} via {node_id} ({route:?}) done sent={sent} recv={received} in {:?}",
            elapsed
        );

        self.settle(&credentials, &node_id, &format!("{host}:{port}"), sent, received, elapsed);
        Ok(())
    }

    /// Usage accounting and the dead-egress penalty for a finished session.
    fn settle(&self, credentials: &Credentials, node_id: &str, target: &str, sent: u64, received: u64, elapsed: Duration) {
        let threshold = self.relay.config.gateway.dead_egress_bytes;
        if sent > threshold && received < threshold {
            self.counters.dead_egress.fetch_add(1, Ordering::Relaxed);
            warn!("node {node_id} took {sent} bytes for {target} and returned {received}");
            self.relay.selector.record_result(node_id, false, elapsed);
        }
        self.relay.events.publish(RelayEvent::Usage(UsageRecord {
            account: credentials.account.clone(),
            node_id: node_id.to_string(),
            target: target.to_string(),
            bytes_in: received,
            bytes_out: sent,
            duration_ms: elapsed.as_millis() as u64,
            at: Utc::now(),
        }));
    }

    /// Picks a circuit in order: explicit node, sticky session, standby
    /// pool, then a race across selected candidates.
    pub async fn open_circuit(&self, params: &RouteParams, host: &str, port: u16) -> Result<OpenedCircuit, RelayError> {
        let relay = &self.relay;

        if params.is_targeted() {
            let conn = self
                .targeted_node(params)
                .ok_or_else(|| RelayError::NodeNotConnected(params.node.clone().or(params.ip.clone()).unwrap_or_default()))?;
            let connected = relay.connector.connect_node(conn.node_id(), host, port).await?;
            return Ok(OpenedCircuit {
                circuit: Circuit::Tunnel(connected.tunnel),
                node_id: connected.node_id,
                route: Route::Direct,
            });
        }

        let mut tried = HashSet::new();
        let session_id = params.sticky_session();
        if let Some(session_id) = session_id {
            if let Some((conn, _)) = relay.sessions.resolve(session_id).await {
                match relay.connector.connect_node(conn.node_id(), host, port).await {
                    Ok(connected) => {
                        return Ok(OpenedCircuit {
                            circuit: Circuit::Tunnel(connected.tunnel),
                            node_id: connected.node_id,
                            route: Route::Session,
                        })
                    }
                    Err(e) => {
                        debug!("session {session_id} node {} failed: {e}", conn.node_id());
                        tried.insert(conn.node_id().to_string());
                    }
                }
            }
        }

        if relay.config.pool.enabled {
            if let Some(opened) = self.from_pool(params, host, port).await {
                if let Some(session_id) = session_id {
                    self.bind_session(session_id, &opened.node_id, params).await;
                }
                return Ok(opened);
            }
        }

        let connected = relay
            .connector
            .connect_excluding(params.country(), host, port, tried)
            .await?;
        if let Some(session_id) = session_id {
            self.bind_session(session_id, &connected.node_id, params).await;
        }
        Ok(OpenedCircuit {
            circuit: Circuit::Tunnel(connected.tunnel),
            node_id: connected.node_id,
            route: Route::Race,
        })
    }

    fn targeted_node(&self, params: &RouteParams) -> Option<Arc<NodeConnection>> {
        let hub = &self.relay.hub;
        params
            .node
            .as_deref()
            .and_then(|id| hub.get_by_node_id(id))
            .or_else(|| params.ip.as_deref().and_then(|ip| hub.get_by_address(ip)))
            .filter(|c| is_routable(c))
    }

    async fn from_pool(&self, params: &RouteParams, host: &str, port: u16) -> Option<OpenedCircuit> {
        let pool = &self.relay.pool;
        let standby = if params.country().is_empty() {
            pool.get_tunnel("")
        } else {
            pool.get_country_tunnel(params.country())
        }?;
        let node_id = standby.node_id.clone();
        let started = Instant::now();
        let result = pool.activate_tunnel(standby, host, port).await;
        self.relay
            .selector
            .record_result(&node_id, result.is_ok(), started.elapsed());
        match result {
            Ok(link) => Some(OpenedCircuit {
                circuit: Circuit::Link(link),
                node_id,
                route: Route::Standby,
            }),
            Err(e) => {
                debug!("standby via {node_id} to {host}:{port} failed: {e}");
                None
            }
        }
    }

    async fn bind_session(&self, session_id: &str, node_id: &str, params: &RouteParams) {
        if let Some(conn) = self.relay.hub.get_by_node_id(node_id) {
            self.relay.sessions.bind(session_id, &conn, params).await;
        }
    }

    /// Copies bytes both ways until the node side ends or goes idle.
    /// Returns (client -> node, node -> client) byte counts.
    async fn pump<S>(&self, stream: S, circuit: Circuit, leftover: Bytes) -> (u64, u64)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let config = &self.relay.config.gateway;
        let idle = config.idle_timeout;
        let buffer_size = config.buffer_size.max(1024);
        let (mut reader, mut writer) = tokio::io::split(stream);
        let sent = AtomicU64::new(0);
        let received = AtomicU64::new(0);

        match circuit {
            Circuit::Tunnel(tunnel) => {
                let upstream = async {
                    if !leftover.is_empty() {
                        sent.fetch_add(leftover.len() as u64, Ordering::Relaxed);
                        if tunnel.write(leftover).await.is_err() {
                            return;
                        }
                    }
                    let mut buf = vec![0u8; buffer_size];
                    loop {
                        let n = match reader.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        sent.fetch_add(n as u64, Ordering::Relaxed);
                        if let Err(e) = tunnel.write(Bytes::copy_from_slice(&buf[..n])).await {
                            debug!("tunnel {} write: {e}", short(tunnel.id()));
                            break;
                        }
                    }
                };
                let downstream = async {
                    while let Ok(data) = tunnel.read_timeout(idle).await {
                        if writer.write_all(&data).await.is_err() {
                            break;
                        }
                        received.fetch_add(data.len() as u64, Ordering::Relaxed);
                    }
                    let _ = writer.shutdown().await;
                };
                relay_both(upstream, downstream).await;
            }
            Circuit::Link(link) => {
                let (tx, mut rx) = link.split();
                let upstream = async {
                    if !leftover.is_empty() {
                        sent.fetch_add(leftover.len() as u64, Ordering::Relaxed);
                        if tx.send(WireMessage::Binary(leftover)).await.is_err() {
                            return;
                        }
                    }
                    let mut buf = vec![0u8; buffer_size];
                    loop {
                        let n = match reader.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        sent.fetch_add(n as u64, Ordering::Relaxed);
                        if tx.send(WireMessage::Binary(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                            break;
                        }
                    }
                };
                let downstream = async {
                    while let Ok(Some(msg)) = tokio::time::timeout(idle, rx.recv()).await {
                        let data = match msg {
                            WireMessage::Binary(data) => data,
                            WireMessage::Close => break,
                            _ => continue,
                        };
                        if writer.write_all(&data).await.is_err() {
                            break;
                        }
                        received.fetch_add(data.len() as u64, Ordering::Relaxed);
                    }
                    let _ = writer.shutdown().await;
                };
                relay_both(upstream, downstream).await;
                let _ = tx.send(WireMessage::Close).await;
            }
        }

        (sent.into_inner(), received.into_inner())
    }

    async fn handle_http<S>(&self, mut stream: S, head: &RequestHead, leftover: Bytes, credentials: Credentials) -> Result<(), RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.counters.http_requests.fetch_add(1, Ordering::Relaxed);
        let (host, port) = match parse_absolute_uri(&head.target) {
            Ok(target) => target,
            Err(e) => {
                write_status(&mut stream, StatusCode::BAD_REQUEST, &e.to_string()).await?;
                return Ok(());
            }
        };
        let body = match self.read_body(&mut stream, head, leftover).await {
            Ok(body) => body,
            Err(status) => {
                write_status(&mut stream, status, "").await?;
                return Ok(());
            }
        };

        let mut headers: HashMap<String, String> = HashMap::new();
        for (name, value) in &head.headers {
            if HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            headers
                .entry(name.clone())
                .and_modify(|v| {
                    v.push_str(", ");
                    v.push_str(value);
                })
                .or_insert_with(|| value.clone());
        }
        let request = ProxyRequest {
            request_id: String::new(),
            host: host.clone(),
            port: port.to_string(),
            method: Some(head.method.clone()),
            url: Some(head.target.clone()),
            headers: Some(headers),
            body: (!body.is_empty()).then(|| STANDARD.encode(&body)),
            timeout_ms: 0,
        };

        let candidates = self.http_candidates(&credentials.params).await;
        if candidates.is_empty() {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            let e = if credentials.params.is_targeted() {
                RelayError::NodeNotConnected(credentials.params.node.clone().unwrap_or_default())
            } else {
                RelayError::NoNodes
            };
            write_status(&mut stream, failure_status(&e), &e.to_string()).await?;
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let target = format!("{host}:{port}");
        let mut last_error = RelayError::NoNodes;
        for node_id in candidates {
            let started = Instant::now();
            let outcome = self
                .relay
                .proxies
                .send_proxy_request(&node_id, request.clone(), &cancel)
                .await;
            let elapsed = started.elapsed();
            let response = match outcome {
                Ok(response) if response.success => response,
                Ok(response) => {
                    self.relay.selector.record_result(&node_id, false, elapsed);
                    last_error = RelayError::ProxyFailed(response.error.unwrap_or_else(|| "node refused".to_string()));
                    debug!("{} {} via {node_id}: {last_error}", head.method, head.target);
                    continue;
                }
                Err(e) => {
                    self.relay.selector.record_result(&node_id, false, elapsed);
                    debug!("{} {} via {node_id}: {e}", head.method, head.target);
                    last_error = e;
                    continue;
                }
            };
            self.relay.selector.record_result(&node_id, true, elapsed);
            if let Some(session_id) = credentials.params.sticky_session() {
                self.bind_session(session_id, &node_id, &credentials.params).await;
            }

            let response_body = match response.body.as_deref().map(|b| STANDARD.decode(b)) {
                Some(Ok(body)) => body,
                Some(Err(_)) => {
                    write_status(&mut stream, StatusCode::BAD_GATEWAY, "malformed response body").await?;
                    return Ok(());
                }
                None => Vec::new(),
            };
            let bytes_in = response_body.len() as u64;
            write_response(&mut stream, response.status_code.unwrap_or(200), response.headers.as_ref(), &response_body).await?;
            self.settle(&credentials, &node_id, &target, body.len() as u64, bytes_in, elapsed);
            return Ok(());
        }

        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        warn!("{} {} failed on every node: {last_error}", head.method, head.target);
        write_status(&mut stream, failure_status(&last_error), &last_error.to_string()).await?;
        Ok(())
    }

    /// Distinct nodes to try, best first: the targeted node alone, or the
    /// session's node followed by fresh selections.
    async fn http_candidates(&self, params: &RouteParams) -> Vec<String> {
        if params.is_targeted() {
            return self
                .targeted_node(params)
                .map(|c| vec![c.node_id().to_string()])
                .unwrap_or_default();
        }

        let budget = self.relay.config.connect.rounds + 1;
        let mut out = Vec::with_capacity(budget);
        if let Some(session_id) = params.sticky_session() {
            if let Some((conn, _)) = self.relay.sessions.resolve(session_id).await {
                out.push(conn.node_id().to_string());
            }
        }
        let skip: HashSet<String> = out.iter().cloned().collect();
        let fresh = self
            .relay
            .selector
            .top_nodes(params.country(), budget - out.len(), &skip)
            .await;
        out.extend(fresh.iter().map(|c| c.node_id().to_string()));
        out.truncate(budget);
        out
    }

    async fn read_body<S>(&self, stream: &mut S, head: &RequestHead, leftover: Bytes) -> Result<Vec<u8>, StatusCode>
    where
        S: AsyncRead + Unpin,
    {
        if head
            .header("transfer-encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
        {
            return Err(StatusCode::LENGTH_REQUIRED);
        }
        let length = match head.header("content-length") {
            Some(raw) => raw.trim().parse::<usize>().map_err(|_| StatusCode::BAD_REQUEST)?,
            None => 0,
        };
        if length > self.relay.config.gateway.max_body_bytes {
            return Err(StatusCode::PAYLOAD_TOO_LARGE);
        }

        let mut body = leftover.to_vec();
        body.truncate(length);
        if body.len() < length {
            let mut rest = vec![0u8; length - body.len()];
            tokio::time::timeout(self.relay.config.gateway.head_timeout, stream.read_exact(&mut rest))
                .await
                .map_err(|_| StatusCode::REQUEST_TIMEOUT)?
                .map_err(|_| StatusCode::BAD_REQUEST)?;
            body.extend_from_slice(&rest);
        }
        Ok(body)
    }
}

/// Runs both directions. When the client stops sending the node side is
/// still drained until it ends or idles out.
async fn relay_both<U, D>(upstream: U, downstream: D)
where
    U: std::future::Future<Output = ()>,
    D: std::future::Future<Output = ()>,
{
    tokio::pin!(upstream);
    tokio::pin!(downstream);
    tokio::select! {
        _ = &mut upstream => downstream.await,
        _ = &mut downstream => {}
    }
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    headers: Option<&HashMap<String, String>>,
    body: &[u8],
) -> Result<(), RelayError> {
    let reason = StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or_default();
    let mut head = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in headers.into_iter().flatten() {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("connection")
        {
            continue;
        }
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", body.len()));
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Accepts proxy clients until shutdown.
pub async fn serve(gateway: Arc<Gateway>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<(), RelayError> {
    info!("proxy gateway listening on {}", listener.local_addr()?);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("proxy accept failed: {e}");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    if let Err(e) = gateway.handle_client(stream).await {
                        debug!("proxy client {peer}: {e}");
                    }
                });
            }
            _ = shutdown.recv() => break,
        }
    }
    info!("proxy gateway stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connect_head() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nProxy-Authorization: Basic abc\r\n";
        let head = RequestHead::parse(raw).unwrap();
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "example.com:443");
        assert_eq!(head.header("proxy-authorization"), Some("Basic abc"));
        assert_eq!(head.header("missing"), None);
        assert!(RequestHead::parse(b"GARBAGE\r\n").is_err());
    }

    #[tokio::test]
    async fn read_head_keeps_early_payload() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"CONNECT a.test:443 HTTP/1.1\r\nHost: a.test\r\n\r\n\x16\x03\x01")
            .await
            .unwrap();
        let (head, rest) = read_head(&mut server, 4096).await.unwrap();
        assert_eq!(head.target, "a.test:443");
        assert_eq!(&rest[..], b"\x16\x03\x01");
    }

    #[tokio::test]
    async fn read_head_enforces_limit() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(&[b'a'; 600]).await.unwrap();
        assert!(matches!(
            read_head(&mut server, 512).await,
            Err(RelayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn absolute_uris() {
        assert_eq!(parse_absolute_uri("http://example.com/x?y=1").unwrap(), ("example.com".into(), 80));
        assert_eq!(parse_absolute_uri("http://u:p@example.com:8080").unwrap(), ("example.com".into(), 8080));
        assert!(parse_absolute_uri("/relative").is_err());
        assert!(parse_absolute_uri("https://example.com/").is_err());
    }

    #[test]
    fn failures_map_to_gateway_statuses() {
        assert_eq!(failure_status(&RelayError::NoNodes), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(failure_status(&RelayError::NodeNotConnected("n".into())), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(failure_status(&RelayError::Exhausted(6)), StatusCode::BAD_GATEWAY);
        assert_eq!(failure_status(&RelayError::FastEof("n".into())), StatusCode::BAD_GATEWAY);
    }
}
