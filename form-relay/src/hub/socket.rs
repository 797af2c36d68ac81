//! The per-node session: handshake, then one writer task and one reader
//! loop over the node's duplex link.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use chrono::Utc;
use log::{debug, info, warn};
use tokio::{sync::mpsc, time::Instant};

use crate::{
    error::RelayError,
    events::RelayEvent,
    hub::{ConnectionQueues, NodeConnection, NodeInfo},
    link::{DuplexLink, WireMessage},
    message::{
        now_rfc3339, ControlMessage, CooldownNotice, HeartbeatAck, Hello, RegistrationAck, RegistrationData, Welcome,
    },
    relay::Relay,
    store::NodeRecord,
};

const PONG_QUEUE: usize = 8;

/// Runs a node session to completion. Returns once the node is gone and
/// everything bound to its connection has been cleaned up.
pub async fn serve_node(relay: Arc<Relay>, link: DuplexLink, remote_addr: String) {
    let (tx, mut rx) = link.split();
    let config = relay.hub.config().clone();

    let hello = match tokio::time::timeout(config.hello_timeout, next_text(&mut rx)).await {
        Ok(Some(text)) => match serde_json::from_str::<ControlMessage>(&text) {
            Ok(ControlMessage::Hello(hello)) if !hello.node_id.trim().is_empty() => hello,
            _ => {
                debug!("{remote_addr}: first message was not a hello");
                let _ = tx.send(WireMessage::Close).await;
                return;
            }
        },
        Ok(None) => return,
        Err(_) => {
            debug!("{remote_addr}: no hello within {:?}", config.hello_timeout);
            let _ = tx.send(WireMessage::Close).await;
            return;
        }
    };

    let (conn, queues) = NodeConnection::new(node_info(&hello, &remote_addr), config.send_queue);
    match relay.hub.add(conn.clone()) {
        Ok(_) => {}
        Err(RelayError::Cooldown { retry_after_secs, .. }) => {
            let notice = ControlMessage::Cooldown(CooldownNotice {
                reason: "too many reconnects".to_string(),
                retry_after_sec: retry_after_secs,
            });
            let _ = tx.send(WireMessage::Text(notice.to_text())).await;
            let _ = tx.send(WireMessage::Close).await;
            return;
        }
        Err(e) => {
            warn!("node {} rejected: {e}", hello.node_id);
            let _ = tx.send(WireMessage::Close).await;
            return;
        }
    }

    let welcome = ControlMessage::Welcome(Welcome {
        ping_interval: config.ping_interval.as_secs(),
        server_time: now_rfc3339(),
    });
    if let Err(e) = conn.send_control(&welcome) {
        debug!("node {}: welcome not queued: {e}", conn.node_id());
    }

    let (pong_tx, pong_rx) = mpsc::channel(PONG_QUEUE);
    let writer = tokio::spawn(write_loop(conn.clone(), queues, pong_rx, tx, relay.clone()));
    let reason = read_loop(&relay, &conn, &mut rx, &pong_tx).await;

    relay.hub.remove_if_current(conn.node_id(), conn.conn_id(), &reason);
    conn.close();
    let closed = relay.tunnels.close_connection_tunnels(conn.conn_id()).await;
    if closed > 0 {
        debug!("node {}: closed {closed} tunnels with its connection", conn.node_id());
    }
    let _ = writer.await;
}

fn node_info(hello: &Hello, remote_addr: &str) -> NodeInfo {
    NodeInfo {
        node_id: hello.node_id.trim().to_string(),
        device_model: hello.device_model.clone().unwrap_or_default(),
        sdk_version: hello.sdk_version.clone().unwrap_or_default(),
        os: hello.os.clone().unwrap_or_default(),
        address: remote_addr.to_string(),
        ..Default::default()
    }
}

async fn next_text(rx: &mut mpsc::Receiver<WireMessage>) -> Option<String> {
    loop {
        match rx.recv().await? {
            WireMessage::Text(text) => return Some(text),
            WireMessage::Close => return None,
            _ => continue,
        }
    }
}

/// Serialises everything bound for the node: control messages, frames,
/// pings and the reader's pongs. Once the session is up only this task
/// writes to the link.
async fn write_loop(
    conn: Arc<NodeConnection>,
    mut queues: ConnectionQueues,
    mut pongs: mpsc::Receiver<Bytes>,
    tx: mpsc::Sender<WireMessage>,
    relay: Arc<Relay>,
) {
    let config = relay.hub.config();
    let mut ping = tokio::time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);

    loop {
        let msg = tokio::select! {
            biased;
            _ = conn.closed() => break,
            Some(payload) = pongs.recv() => WireMessage::Pong(payload),
            text = queues.text_rx.recv() => match text {
                Some(text) => WireMessage::Text(text),
                None => break,
            },
            frame = queues.binary_rx.recv() => match frame {
                Some(frame) => WireMessage::Binary(frame),
                None => break,
            },
            _ = ping.tick() => {
                conn.record_ping();
                WireMessage::Ping(Bytes::new())
            }
        };
        match tokio::time::timeout(config.write_wait, tx.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                debug!("node {}: link gone", conn.node_id());
                break;
            }
            Err(_) => {
                warn!("node {}: write stalled for {:?}", conn.node_id(), config.write_wait);
                break;
            }
        }
    }
    conn.close();
    let _ = tx.try_send(WireMessage::Close);
}

/// Returns the disconnect reason.
async fn read_loop(
    relay: &Relay,
    conn: &Arc<NodeConnection>,
    rx: &mut mpsc::Receiver<WireMessage>,
    pongs: &mpsc::Sender<Bytes>,
) -> String {
    let deadline = relay.hub.config().read_deadline();
    loop {
        let next = tokio::select! {
            _ = conn.closed() => return "connection replaced or closed".to_string(),
            next = tokio::time::timeout(deadline, rx.recv()) => next,
        };
        let msg = match next {
            Ok(Some(msg)) => msg,
            Ok(None) => return "connection lost".to_string(),
            Err(_) => return format!("no traffic for {deadline:?}"),
        };
        conn.touch();

        match msg {
            WireMessage::Text(text) => handle_text(relay, conn, &text).await,
            WireMessage::Binary(raw) => {
                if let Err(e) = relay.tunnels.handle_frame(&raw).await {
                    debug!("node {}: {e}", conn.node_id());
                }
            }
            WireMessage::Ping(payload) => {
                // a node flooding pings loses pongs, not its session
                let _ = pongs.try_send(payload);
            }
            WireMessage::Pong(_) => conn.record_pong(),
            WireMessage::Close => return "closed by node".to_string(),
        }
    }
}

async fn handle_text(relay: &Relay, conn: &Arc<NodeConnection>, text: &str) {
    let msg = match serde_json::from_str::<ControlMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("node {}: ignoring message: {e}", conn.node_id());
            return;
        }
    };

    match msg {
        ControlMessage::Register { data } => handle_register(relay, conn, data).await,
        ControlMessage::Heartbeat { .. } => {
            let ack = ControlMessage::HeartbeatAck {
                data: HeartbeatAck {
                    node_id: conn.node_id().to_string(),
                    timestamp: now_rfc3339(),
                    status: "active".to_string(),
                },
            };
            reply(conn, &ack);
            relay.events.publish(RelayEvent::NodeHeartbeat {
                node_id: conn.node_id().to_string(),
            });
        }
        ControlMessage::Keepalive => reply(conn, &ControlMessage::KeepaliveAck),
        ControlMessage::KeepaliveAck => {}
        ControlMessage::IpInfo(update) => relay.hub.apply_ip_info(conn.node_id(), &update),
        ControlMessage::TunnelResponse { data } => relay.tunnels.handle_response(data).await,
        ControlMessage::TunnelData { data } => match STANDARD.decode(data.data.as_bytes()) {
            Ok(payload) => {
                relay
                    .tunnels
                    .handle_data(&data.tunnel_id, Bytes::from(payload), data.eof)
                    .await
            }
            Err(e) => debug!("node {}: bad tunnel_data payload: {e}", conn.node_id()),
        },
        ControlMessage::TunnelStats(stats) => relay.tunnels.reconcile(&stats).await,
        ControlMessage::ProxyResponse { data } => relay.proxies.handle_proxy_response(data),
        other => debug!("node {}: unexpected {other:?}", conn.node_id()),
    }
}

fn reply(conn: &NodeConnection, msg: &ControlMessage) {
    if let Err(e) = conn.send_control(msg) {
        debug!("node {}: reply dropped: {e}", conn.node_id());
    }
}

async fn handle_register(relay: &Relay, conn: &Arc<NodeConnection>, data: serde_json::Value) {
    let Ok(mut reg) = serde_json::from_value::<RegistrationData>(data) else {
        reply(conn, &ControlMessage::error("Invalid registration data"));
        return;
    };

    let min = &relay.hub.config().min_sdk_version;
    if !version_at_least(&reg.sdk_version, min) {
        warn!("node {}: rejected sdk {:?}", conn.node_id(), reg.sdk_version);
        reply(conn, &ControlMessage::error(format!("SDK version too old. Minimum required: {min}")));
        return;
    }

    let address = {
        let seen = conn.address();
        if seen.is_empty() {
            reg.ip_address.clone()
        } else {
            seen
        }
    };

    if reg.country.is_empty() {
        if let Some(geo) = relay.geo.lookup(&address).await {
            reg.country = geo.country;
            reg.country_name = geo.country_name;
            reg.city = geo.city;
            reg.region = geo.region;
            reg.isp = geo.isp;
            reg.latitude = geo.latitude;
            reg.longitude = geo.longitude;
            if !geo.asn.is_empty() {
                reg.asn = serde_json::Value::String(geo.asn);
            }
        } else {
            debug!("node {}: no geo for {address}", conn.node_id());
        }
    } else {
        fill_from_loc_and_org(&mut reg);
    }

    let asn = reg.asn_string().unwrap_or_default();
    conn.update_info(|info| {
        info.device_id = reg.device_id.clone();
        info.sdk_version = reg.sdk_version.clone();
        info.address = address.clone();
        info.country = reg.country.to_uppercase();
        info.country_name = if reg.country_name.is_empty() {
            reg.country.clone()
        } else {
            reg.country_name.clone()
        };
        info.city = reg.city.clone();
        info.region = reg.region.clone();
        info.isp = reg.isp.clone();
        info.asn = asn;
        info.carrier = reg.carrier.clone();
        info.connection_type = if reg.connection_type.is_empty() {
            "unknown".to_string()
        } else {
            reg.connection_type.clone()
        };
        info.device_type = reg.device_type.clone();
        info.timezone = reg.timezone.clone();
        info.latitude = reg.latitude;
        info.longitude = reg.longitude;
        info.registered = true;
    });

    let ack = ControlMessage::RegistrationSuccess {
        data: RegistrationAck {
            node_id: conn.node_id().to_string(),
            status: "registered".to_string(),
            message: "Node successfully registered".to_string(),
            timestamp: now_rfc3339(),
        },
    };
    reply(conn, &ack);

    let info = conn.info();
    relay.events.publish(RelayEvent::NodeOnline(NodeRecord {
        node_id: info.node_id.clone(),
        address: info.address.clone(),
        country: info.country.clone(),
        city: info.city.clone(),
        isp: info.isp.clone(),
        sdk_version: info.sdk_version.clone(),
        connected_since: Utc::now(),
    }));
    info!(
        "node registered id={} ip={} country={} city={} sdk={}",
        info.node_id, info.address, info.country, info.city, info.sdk_version
    );
}

/// `loc` is `"lat,lon"`, `org` is `"AS<n> <isp name>"`. Both only fill
/// fields the node left empty.
fn fill_from_loc_and_org(reg: &mut RegistrationData) {
    if reg.latitude == 0.0 && reg.longitude == 0.0 {
        if let Some((lat, lon)) = reg.loc.split_once(',') {
            if let (Ok(lat), Ok(lon)) = (lat.trim().parse(), lon.trim().parse()) {
                reg.latitude = lat;
                reg.longitude = lon;
            }
        }
    }
    if !reg.org.is_empty() {
        let org = reg.org.clone();
        let (first, rest) = org.split_once(' ').unwrap_or((org.as_str(), ""));
        if reg.asn_string().is_none() {
            if let Some(n) = first.strip_prefix("AS").and_then(|n| n.parse::<u64>().ok()) {
                reg.asn = serde_json::Value::from(n);
            }
        }
        if reg.isp.is_empty() && !rest.is_empty() {
            reg.isp = rest.to_string();
        }
    }
}

/// Compares dotted `major.minor.patch` versions. Anything that is not
/// three numeric parts is refused.
pub fn version_at_least(version: &str, min: &str) -> bool {
    fn parse(v: &str) -> Option<(u64, u64, u64)> {
        let mut parts = v.trim().split('.').map(|p| p.parse::<u64>().ok());
        let parsed = (parts.next()??, parts.next()??, parts.next()??);
        parts.next().is_none().then_some(parsed)
    }
    match (parse(version), parse(min)) {
        (Some(v), Some(m)) => v >= m,
        _ => false,
    }
}
