use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::{error::RelayError, frame::Frame, message::ControlMessage};

/// Identity and geo metadata a node declared about itself.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub device_id: String,
    pub device_model: String,
    pub sdk_version: String,
    pub os: String,
    /// Egress address as seen by the relay or reported by the node
    pub address: String,
    pub country: String,
    pub country_name: String,
    pub city: String,
    pub region: String,
    pub isp: String,
    pub asn: String,
    pub carrier: String,
    pub connection_type: String,
    pub device_type: String,
    /// Connection class reported by the node's ip lookup (VPN, DCH, ...)
    pub proxy_type: String,
    pub timezone: String,
    pub latitude: f64,
    pub longitude: f64,
    pub registered: bool,
    pub has_ip_info: bool,
}

/// Point-in-time view of a connection for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub conn_id: String,
    #[serde(flatten)]
    pub info: NodeInfo,
    pub connected_since: DateTime<Utc>,
    pub uptime_sec: u64,
    pub idle_sec: u64,
    pub pings_sent: u64,
    pub pongs_received: u64,
}

/// Receiving halves of a connection's outbound queues, owned by the
/// writer task.
pub struct ConnectionQueues {
    pub text_rx: mpsc::Receiver<String>,
    pub binary_rx: mpsc::Receiver<Bytes>,
}

/// One live duplex connection bound to a node.
pub struct NodeConnection {
    conn_id: String,
    node_id: String,
    info: RwLock<NodeInfo>,
    text_tx: mpsc::Sender<String>,
    binary_tx: mpsc::Sender<Bytes>,
    connected_at: Instant,
    connected_since: DateTime<Utc>,
    last_pong: Mutex<Instant>,
    last_seen: Mutex<Instant>,
    pings_sent: AtomicU64,
    pongs_received: AtomicU64,
    closed: CancellationToken,
}

impl NodeConnection {
    pub fn new(mut info: NodeInfo, queue_capacity: usize) -> (Arc<Self>, ConnectionQueues) {
        let (text_tx, text_rx) = mpsc::channel(queue_capacity);
        let (binary_tx, binary_rx) = mpsc::channel(queue_capacity);
        let now = Instant::now();
        let node_id = info.node_id.clone();
        if info.os.is_empty() {
            info.os = "unknown".to_string();
        }

        let conn = Arc::new(Self {
            conn_id: Uuid::new_v4().to_string(),
            node_id,
            info: RwLock::new(info),
            text_tx,
            binary_tx,
            connected_at: now,
            connected_since: Utc::now(),
            last_pong: Mutex::new(now),
            last_seen: Mutex::new(now),
            pings_sent: AtomicU64::new(0),
            pongs_received: AtomicU64::new(0),
            closed: CancellationToken::new(),
        });

        (conn, ConnectionQueues { text_rx, binary_rx })
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn info(&self) -> NodeInfo {
        self.info.read().clone()
    }

    pub fn update_info<F: FnOnce(&mut NodeInfo)>(&self, f: F) {
        f(&mut *self.info.write());
    }

    pub fn country(&self) -> String {
        self.info.read().country.clone()
    }

    pub fn address(&self) -> String {
        self.info.read().address.clone()
    }

    pub fn proxy_type(&self) -> String {
        self.info.read().proxy_type.clone()
    }

    /// Queues a control message without waiting.
    pub fn send_control(&self, msg: &ControlMessage) -> Result<(), RelayError> {
        self.send_text(msg.to_text())
    }

    pub fn send_text(&self, text: String) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::NodeNotConnected(self.node_id.clone()));
        }
        self.text_tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RelayError::SendQueueFull(self.node_id.clone()),
            mpsc::error::TrySendError::Closed(_) => {
                RelayError::NodeNotConnected(self.node_id.clone())
            }
        })
    }

    /// Queues a binary frame, waiting at most `wait` for queue space.
    pub async fn send_frame(&self, frame: &Frame, wait: Duration) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::NodeNotConnected(self.node_id.clone()));
        }
        let bytes = Bytes::from(frame.encode());
        match tokio::time::timeout(wait, self.binary_tx.send(bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RelayError::NodeNotConnected(self.node_id.clone())),
            Err(_) => Err(RelayError::timeout("binary frame hand-off")),
        }
    }

    pub fn record_ping(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pong(&self) {
        *self.last_pong.lock() = Instant::now();
        self.pongs_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks inbound activity.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn last_pong(&self) -> Instant {
        *self.last_pong.lock()
    }

    pub fn pings_sent(&self) -> u64 {
        self.pings_sent.load(Ordering::Relaxed)
    }

    pub fn pongs_received(&self) -> u64 {
        self.pongs_received.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            conn_id: self.conn_id.clone(),
            info: self.info(),
            connected_since: self.connected_since,
            uptime_sec: self.uptime().as_secs(),
            idle_sec: self.last_seen.lock().elapsed().as_secs(),
            pings_sent: self.pings_sent(),
            pongs_received: self.pongs_received(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(node_id: &str) -> NodeInfo {
        NodeInfo {
            node_id: node_id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn full_text_queue_is_a_capacity_error() {
        let (conn, _queues) = NodeConnection::new(info("n1"), 1);
        conn.send_text("a".into()).unwrap();
        assert!(matches!(
            conn.send_text("b".into()),
            Err(RelayError::SendQueueFull(_))
        ));
    }

    #[test]
    fn missing_os_is_unknown() {
        let (conn, _queues) = NodeConnection::new(info("n1"), 1);
        assert_eq!(conn.info().os, "unknown");
        let (conn, _queues) = NodeConnection::new(
            NodeInfo {
                os: "ios".into(),
                ..info("n2")
            },
            1,
        );
        assert_eq!(conn.info().os, "ios");
    }

    #[tokio::test]
    async fn closed_connection_refuses_sends() {
        let (conn, mut queues) = NodeConnection::new(info("n1"), 4);
        conn.send_frame(&Frame::eof("t"), Duration::from_millis(10)).await.unwrap();
        assert!(queues.binary_rx.recv().await.is_some());

        conn.close();
        assert!(conn.is_closed());
        assert!(matches!(
            conn.send_text("x".into()),
            Err(RelayError::NodeNotConnected(_))
        ));
    }
}
