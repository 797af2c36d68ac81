//! Virtual circuits multiplexed over node connections.
//!
//! Each tunnel owns a bounded inbound queue (node -> relay) fed by the
//! connection reader, and a bounded outbound queue (relay -> node) drained
//! by one writer task that turns writes into binary frames.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex, RwLock},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::{
    config::TunnelConfig,
    error::RelayError,
    frame::Frame,
    hub::{Hub, NodeConnection},
    message::{ControlMessage, TunnelOpen, TunnelResponse, TunnelStats},
};

type ReadySender = oneshot::Sender<Result<(), String>>;

pub struct Tunnel {
    id: String,
    node_id: String,
    target: String,
    conn: Arc<NodeConnection>,
    created_at: Instant,
    inbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: Mutex<mpsc::Receiver<Bytes>>,
    outbound_tx: mpsc::Sender<Bytes>,
    outbound_rx: parking_lot::Mutex<Option<mpsc::Receiver<Bytes>>>,
    ready: parking_lot::Mutex<Option<ReadySender>>,
    closed: CancellationToken,
    bytes_to_node: AtomicU64,
    bytes_from_node: AtomicU64,
    write_timeout: Duration,
}

impl Tunnel {
    fn new(
        id: String,
        conn: Arc<NodeConnection>,
        target: String,
        config: &TunnelConfig,
    ) -> (Arc<Self>, oneshot::Receiver<Result<(), String>>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (ready_tx, ready_rx) = oneshot::channel();
        let tunnel = Arc::new(Self {
            id,
            node_id: conn.node_id().to_string(),
            target,
            conn,
            created_at: Instant::now(),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: parking_lot::Mutex::new(Some(outbound_rx)),
            ready: parking_lot::Mutex::new(Some(ready_tx)),
            closed: CancellationToken::new(),
            bytes_to_node: AtomicU64::new(0),
            bytes_from_node: AtomicU64::new(0),
            write_timeout: config.write_timeout,
        });
        (tunnel, ready_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn conn_id(&self) -> &str {
        self.conn.conn_id()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn bytes_to_node(&self) -> u64 {
        self.bytes_to_node.load(Ordering::Relaxed)
    }

    pub fn bytes_from_node(&self) -> u64 {
        self.bytes_from_node.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Queues data for the node. Waits at most the write deadline when the
    /// queue is full.
    pub async fn write(&self, data: Bytes) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::TunnelClosed);
        }
        let data = match self.outbound_tx.try_send(data) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(RelayError::TunnelClosed),
            Err(mpsc::error::TrySendError::Full(data)) => data,
        };
        tokio::select! {
            _ = self.closed.cancelled() => Err(RelayError::TunnelClosed),
            sent = tokio::time::timeout(self.write_timeout, self.outbound_tx.send(data)) => match sent {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(RelayError::TunnelClosed),
                Err(_) => Err(RelayError::timeout("tunnel write")),
            },
        }
    }

    /// Next chunk from the node. Data that arrived before the close is
    /// still returned; after that every read fails with `TunnelClosed`.
    pub async fn read(&self) -> Result<Bytes, RelayError> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            biased;
            data = rx.recv() => data.ok_or(RelayError::TunnelClosed),
            _ = self.closed.cancelled() => rx.try_recv().map_err(|_| RelayError::TunnelClosed),
        }
    }

    pub async fn read_timeout(&self, timeout: Duration) -> Result<Bytes, RelayError> {
        tokio::time::timeout(timeout, self.read())
            .await
            .map_err(|_| RelayError::timeout("tunnel read"))?
    }

    fn signal_ready(&self, result: Result<(), String>) {
        if let Some(tx) = self.ready.lock().take() {
            let _ = tx.send(result);
        }
    }

    fn mark_closed(&self) {
        self.closed.cancel();
        // wakes an opener still waiting on the ready signal
        self.ready.lock().take();
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TunnelManagerStats {
    pub active: usize,
    pub opened: u64,
    pub failed: u64,
    pub closed: u64,
    pub expired: u64,
    pub bytes_to_node: u64,
    pub bytes_from_node: u64,
}

#[derive(Default)]
struct Counters {
    opened: AtomicU64,
    failed: AtomicU64,
    closed: AtomicU64,
    expired: AtomicU64,
    bytes_to_node: AtomicU64,
    bytes_from_node: AtomicU64,
}

struct TunnelTable {
    config: TunnelConfig,
    hub: Arc<Hub>,
    tunnels: RwLock<HashMap<String, Arc<Tunnel>>>,
    counters: Counters,
}

/// Opens, routes and closes tunnels for every node connection.
#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<TunnelTable>,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig, hub: Arc<Hub>) -> Self {
        Self {
            inner: Arc::new(TunnelTable {
                config,
                hub,
                tunnels: RwLock::new(HashMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.inner.config
    }

    pub async fn open_tunnel(&self, node_id: &str, host: &str, port: u16) -> Result<Arc<Tunnel>, RelayError> {
        self.open_tunnel_with_timeout(node_id, host, port, self.inner.config.open_timeout)
            .await
    }

    pub async fn open_tunnel_with_timeout(
        &self,
        node_id: &str,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Arc<Tunnel>, RelayError> {
        let conn = self
            .inner
            .hub
            .get_by_node_id(node_id)
            .ok_or_else(|| RelayError::NodeNotConnected(node_id.to_string()))?;
        let target = format!("{host}:{port}");

        let (tunnel, ready_rx) = {
            let mut tunnels = self.inner.tunnels.write().await;
            let mut id = Uuid::new_v4().to_string();
            while tunnels.contains_key(&id) {
                id = Uuid::new_v4().to_string();
            }
            let (tunnel, ready_rx) = Tunnel::new(id.clone(), conn.clone(), target.clone(), &self.inner.config);
            tunnels.insert(id, tunnel.clone());
            (tunnel, ready_rx)
        };

        let open = ControlMessage::TunnelOpen {
            data: TunnelOpen {
                tunnel_id: tunnel.id.clone(),
                host: host.to_string(),
                port: port.to_string(),
            },
        };
        if let Err(e) = conn.send_control(&open) {
            self.discard(&tunnel.id).await;
            return Err(e);
        }

        let outcome = match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(RelayError::TunnelOpenFailed(reason)),
            Ok(Err(_)) => Err(RelayError::TunnelClosed),
            Err(_) => Err(RelayError::timeout("tunnel ready")),
        };

        if let Err(e) = outcome {
            debug!("tunnel {} to {target} via {} failed: {e}", short(&tunnel.id), conn.node_id());
            self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.close_tunnel(&tunnel.id).await;
            return Err(e);
        }

        self.inner.counters.opened.fetch_add(1, Ordering::Relaxed);
        self.spawn_writer(tunnel.clone());
        debug!("tunnel {} open to {target} via {}", short(&tunnel.id), conn.node_id());
        Ok(tunnel)
    }

    /// The writer owns the tunnel's EOF: data queued before a close is
    /// handed to the connection first, then the EOF frame.
    fn spawn_writer(&self, tunnel: Arc<Tunnel>) {
        let Some(mut outbound) = tunnel.outbound_rx.lock().take() else {
            return;
        };
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let data = tokio::select! {
                    biased;
                    data = outbound.recv() => match data {
                        Some(data) => data,
                        None => break,
                    },
                    _ = tunnel.closed.cancelled() => break,
                };
                if let Err(e) = manager.forward(&tunnel, data).await {
                    warn!("tunnel {} frame hand-off failed: {e}", short(&tunnel.id));
                    manager.close_tunnel(&tunnel.id).await;
                    return;
                }
            }
            while let Ok(data) = outbound.try_recv() {
                if let Err(e) = manager.forward(&tunnel, data).await {
                    debug!("tunnel {} dropped queued data on close: {e}", short(&tunnel.id));
                    break;
                }
            }
            manager.send_eof(&tunnel).await;
        });
    }

    async fn forward(&self, tunnel: &Tunnel, data: Bytes) -> Result<(), RelayError> {
        let len = data.len() as u64;
        let frame = Frame::data(tunnel.id.clone(), data);
        tunnel.conn.send_frame(&frame, self.inner.config.frame_timeout).await?;
        tunnel.bytes_to_node.fetch_add(len, Ordering::Relaxed);
        self.inner.counters.bytes_to_node.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    async fn send_eof(&self, tunnel: &Tunnel) {
        if tunnel.conn.is_closed() {
            return;
        }
        if let Err(e) = tunnel
            .conn
            .send_frame(&Frame::eof(tunnel.id.clone()), self.inner.config.eof_timeout)
            .await
        {
            debug!("tunnel {} EOF not delivered: {e}", short(&tunnel.id));
        }
    }

    /// Drops a tunnel the node never learned about.
    async fn discard(&self, id: &str) {
        if let Some(tunnel) = self.inner.tunnels.write().await.remove(id) {
            tunnel.mark_closed();
        }
    }

    /// Idempotent: only the caller that actually removes the tunnel causes
    /// an EOF frame. Once the writer runs it sends the EOF after draining.
    pub async fn close_tunnel(&self, id: &str) -> bool {
        let Some(tunnel) = self.inner.tunnels.write().await.remove(id) else {
            return false;
        };
        tunnel.mark_closed();
        self.inner.counters.closed.fetch_add(1, Ordering::Relaxed);

        let writer_running = tunnel.outbound_rx.lock().is_none();
        if !writer_running {
            self.send_eof(&tunnel).await;
        }

        let (sent, recv) = (tunnel.bytes_to_node(), tunnel.bytes_from_node());
        if sent > 0 || recv > 0 {
            debug!(
                "tunnel {} closed node={} target={} sent={sent} recv={recv} age={:?}",
                short(id),
                tunnel.node_id,
                tunnel.target,
                tunnel.age()
            );
        }
        true
    }

    /// Closes every tunnel riding on a connection that went away.
    pub async fn close_connection_tunnels(&self, conn_id: &str) -> usize {
        let ids: Vec<String> = self
            .inner
            .tunnels
            .read()
            .await
            .values()
            .filter(|t| t.conn_id() == conn_id)
            .map(|t| t.id.clone())
            .collect();
        let mut closed = 0;
        for id in ids {
            if self.close_tunnel(&id).await {
                closed += 1;
            }
        }
        closed
    }

    pub async fn handle_response(&self, resp: TunnelResponse) {
        let tunnel = self.inner.tunnels.read().await.get(&resp.tunnel_id).cloned();
        match tunnel {
            Some(tunnel) => {
                let result = if resp.success {
                    Ok(())
                } else {
                    Err(resp.error.unwrap_or_else(|| "node refused tunnel".to_string()))
                };
                tunnel.signal_ready(result);
            }
            None => debug!("tunnel_response for unknown tunnel {}", short(&resp.tunnel_id)),
        }
    }

    /// Demultiplexes one binary frame from a node.
    pub async fn handle_frame(&self, raw: &[u8]) -> Result<(), RelayError> {
        let frame = Frame::decode(raw)?;
        self.handle_data(&frame.tunnel_id, frame.payload, frame.eof).await;
        Ok(())
    }

    pub async fn handle_data(&self, tunnel_id: &str, payload: Bytes, eof: bool) {
        let tunnel = self.inner.tunnels.read().await.get(tunnel_id).cloned();
        let Some(tunnel) = tunnel else {
            debug!("dropping data for unknown tunnel {}", short(tunnel_id));
            return;
        };

        if !payload.is_empty() {
            let len = payload.len() as u64;
            let delivered = match tunnel.inbound_tx.try_send(payload) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
                Err(mpsc::error::TrySendError::Full(payload)) => matches!(
                    tokio::time::timeout(
                        self.inner.config.deliver_timeout,
                        tunnel.inbound_tx.send(payload)
                    )
                    .await,
                    Ok(Ok(()))
                ),
            };
            if !delivered {
                warn!("tunnel {} inbound queue stuck, closing", short(tunnel_id));
                self.close_tunnel(tunnel_id).await;
                return;
            }
            tunnel.bytes_from_node.fetch_add(len, Ordering::Relaxed);
            self.inner.counters.bytes_from_node.fetch_add(len, Ordering::Relaxed);
        }

        if eof {
            self.close_tunnel(tunnel_id).await;
        }
    }

    /// Compares a node's own byte accounting with ours.
    pub async fn reconcile(&self, stats: &TunnelStats) {
        let tunnel = self.inner.tunnels.read().await.get(&stats.tunnel_id).cloned();
        let Some(tunnel) = tunnel else {
            debug!(
                "tunnel_stats for closed tunnel {} sent={} recv={}",
                short(&stats.tunnel_id),
                stats.bytes_sent_to_target,
                stats.bytes_recv_from_target
            );
            return;
        };
        let (sent, recv) = (tunnel.bytes_to_node(), tunnel.bytes_from_node());
        if sent != stats.bytes_sent_to_target || recv != stats.bytes_recv_from_target {
            info!(
                "tunnel {} byte mismatch relay_sent={sent} node_sent={} node_recv={} relay_recv={recv}",
                short(&stats.tunnel_id),
                stats.bytes_sent_to_target,
                stats.bytes_recv_from_target
            );
        } else {
            debug!("tunnel {} bytes match {sent}/{recv}", short(&stats.tunnel_id));
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Tunnel>> {
        self.inner.tunnels.read().await.get(id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.inner.tunnels.read().await.len()
    }

    /// Closes tunnels older than the configured ceiling.
    pub async fn sweep_expired(&self) -> usize {
        let max_age = self.inner.config.max_age;
        let expired: Vec<String> = self
            .inner
            .tunnels
            .read()
            .await
            .values()
            .filter(|t| t.age() > max_age)
            .map(|t| t.id.clone())
            .collect();
        let mut n = 0;
        for id in expired {
            if self.close_tunnel(&id).await {
                n += 1;
            }
        }
        if n > 0 {
            self.inner.counters.expired.fetch_add(n as u64, Ordering::Relaxed);
            info!("expired {n} tunnels older than {max_age:?}");
        }
        n
    }

    pub fn spawn_sweeper(&self, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        let manager = self.clone();
        let mut shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.inner.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        manager.sweep_expired().await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    pub async fn stats(&self) -> TunnelManagerStats {
        let c = &self.inner.counters;
        TunnelManagerStats {
            active: self.count().await,
            opened: c.opened.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            closed: c.closed.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            bytes_to_node: c.bytes_to_node.load(Ordering::Relaxed),
            bytes_from_node: c.bytes_from_node.load(Ordering::Relaxed),
        }
    }
}

/// Anything that can open and close tunnels to a node by id.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    async fn open(&self, node_id: &str, host: &str, port: u16) -> Result<Arc<Tunnel>, RelayError>;

    async fn close(&self, tunnel_id: &str) -> bool;
}

#[async_trait]
impl TunnelTransport for TunnelManager {
    async fn open(&self, node_id: &str, host: &str, port: u16) -> Result<Arc<Tunnel>, RelayError> {
        self.open_tunnel(node_id, host, port).await
    }

    async fn close(&self, tunnel_id: &str) -> bool {
        self.close_tunnel(tunnel_id).await
    }
}

pub(crate) fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
