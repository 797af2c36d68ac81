//! Simulated nodes driving a real relay over in-memory links.

#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use form_relay::{
    config::RelayConfig,
    frame::Frame,
    hub::socket::serve_node,
    link::{DuplexLink, WireMessage},
    message::{ControlMessage, Hello, ProxyResponse, TunnelResponse},
    relay::Relay,
};
use serde_json::json;
use tokio::task::JoinHandle;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Small windows so races and idle relays finish quickly.
pub fn test_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.connect.stability_window = Duration::from_millis(50);
    config.connect.round_timeout = Duration::from_secs(2);
    config.tunnel.open_timeout = Duration::from_secs(2);
    config.gateway.idle_timeout = Duration::from_millis(300);
    config.warm.enabled = false;
    config.pool.enabled = false;
    config
}

/// How a simulated node answers tunnel_open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behaviour {
    /// Accepts and echoes every data frame back prefixed with `echo:`.
    Echo,
    /// Accepts, then immediately sends EOF.
    FastEof,
    Refuse,
}

pub struct FakeNode {
    pub node_id: String,
    pub link: DuplexLink,
}

impl FakeNode {
    /// Opens a session and completes the hello/welcome handshake.
    pub async fn connect(relay: &Arc<Relay>, node_id: &str, address: &str) -> FakeNode {
        let mut node = Self::connect_raw(relay, node_id, address).await;
        let welcome = node.next_control().await;
        assert!(
            matches!(welcome, ControlMessage::Welcome(_)),
            "expected welcome, got {welcome:?}"
        );
        node
    }

    /// Sends the hello without waiting for an answer.
    pub async fn connect_raw(relay: &Arc<Relay>, node_id: &str, address: &str) -> FakeNode {
        let (ours, theirs) = DuplexLink::pair(256);
        tokio::spawn(serve_node(relay.clone(), theirs, address.to_string()));
        let hello = ControlMessage::Hello(Hello {
            node_id: node_id.to_string(),
            device_model: Some("Pixel 7".to_string()),
            sdk_version: Some("1.0.70".to_string()),
            os: Some("android".to_string()),
        });
        ours.send_text(hello.to_text()).await.unwrap();
        FakeNode {
            node_id: node_id.to_string(),
            link: ours,
        }
    }

    /// Next control message, answering pings on the way.
    pub async fn next_control(&mut self) -> ControlMessage {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.link.recv())
                .await
                .expect("relay went quiet")
                .expect("relay closed the link");
            match msg {
                WireMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
                WireMessage::Ping(p) => self.link.send(WireMessage::Pong(p)).await.unwrap(),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    pub async fn register(&mut self, country: &str, sdk_version: &str) -> ControlMessage {
        let register = json!({
            "type": "register",
            "data": {
                "device_id": format!("dev-{}", self.node_id),
                "country": country,
                "city": "Austin",
                "isp": "Example ISP",
                "asn": 7922,
                "connection_type": "wifi",
                "sdk_version": sdk_version,
            }
        });
        self.link.send_text(register.to_string()).await.unwrap();
        self.next_control().await
    }

    /// Answers tunnel and proxy traffic in the background until the
    /// relay closes the link.
    pub fn serve(self, behaviour: Behaviour) -> NodeHandle {
        let eofs = Arc::new(AtomicUsize::new(0));
        let opens = Arc::new(AtomicUsize::new(0));
        let node_id = self.node_id.clone();
        let task = tokio::spawn(play(self.link, behaviour, eofs.clone(), opens.clone()));
        NodeHandle {
            node_id,
            eofs,
            opens,
            task,
        }
    }
}

pub struct NodeHandle {
    pub node_id: String,
    pub eofs: Arc<AtomicUsize>,
    pub opens: Arc<AtomicUsize>,
    pub task: JoinHandle<()>,
}

impl NodeHandle {
    pub fn eof_count(&self) -> usize {
        self.eofs.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Drops the node's link, as if the device went offline.
    pub fn disconnect(self) {
        self.task.abort();
    }
}

async fn play(mut link: DuplexLink, behaviour: Behaviour, eofs: Arc<AtomicUsize>, opens: Arc<AtomicUsize>) {
    while let Some(msg) = link.recv().await {
        match msg {
            WireMessage::Text(text) => {
                let Ok(msg) = serde_json::from_str::<ControlMessage>(&text) else {
                    continue;
                };
                match msg {
                    ControlMessage::TunnelOpen { data } => {
                        opens.fetch_add(1, Ordering::SeqCst);
                        let success = behaviour != Behaviour::Refuse;
                        let resp = ControlMessage::TunnelResponse {
                            data: TunnelResponse {
                                tunnel_id: data.tunnel_id.clone(),
                                success,
                                error: (!success).then(|| "connection refused".to_string()),
                            },
                        };
                        let _ = link.send_text(resp.to_text()).await;
                        if behaviour == Behaviour::FastEof {
                            let eof = Frame::eof(data.tunnel_id).encode();
                            let _ = link.send(WireMessage::Binary(Bytes::from(eof))).await;
                        }
                    }
                    ControlMessage::ProxyRequest { data } => {
                        let resp = ControlMessage::ProxyResponse {
                            data: ProxyResponse {
                                request_id: data.request_id,
                                success: true,
                                status_code: Some(200),
                                headers: Some([("Content-Type".to_string(), "text/plain".to_string())].into()),
                                body: Some(STANDARD.encode(format!("{} {}", data.method.unwrap_or_default(), data.host))),
                                ..Default::default()
                            },
                        };
                        let _ = link.send_text(resp.to_text()).await;
                    }
                    _ => {}
                }
            }
            WireMessage::Binary(raw) => {
                let Ok(frame) = Frame::decode(&raw) else { continue };
                if frame.eof {
                    eofs.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                let mut reply = b"echo:".to_vec();
                reply.extend_from_slice(&frame.payload);
                let echo = Frame::data(frame.tunnel_id, reply).encode();
                let _ = link.send(WireMessage::Binary(Bytes::from(echo))).await;
            }
            WireMessage::Ping(p) => {
                let _ = link.send(WireMessage::Pong(p)).await;
            }
            WireMessage::Close => break,
            WireMessage::Pong(_) => {}
        }
    }
}

/// Registers a serving node in `country`.
pub async fn serving_node(relay: &Arc<Relay>, node_id: &str, address: &str, country: &str, behaviour: Behaviour) -> NodeHandle {
    let mut node = FakeNode::connect(relay, node_id, address).await;
    let ack = node.register(country, "1.0.70").await;
    assert!(
        matches!(ack, ControlMessage::RegistrationSuccess { .. }),
        "registration failed: {ack:?}"
    );
    node.serve(behaviour)
}

/// Polls `check` until it holds or a second passes.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
