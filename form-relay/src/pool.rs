//! Pre-opened standby tunnels.
//!
//! A standby link is a duplex channel to the [`StandbyEndpoint`] that has
//! already confirmed its node is alive but has no target yet. Activation
//! sends `host:port` as the first text message and waits for
//! `tunnel_active`; after that the link carries the circuit's bytes as
//! binary messages.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{stream::FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::broadcast, task::JoinHandle, time::Instant};

use crate::{
    config::PoolConfig,
    error::RelayError,
    hub::Hub,
    link::{DuplexLink, WireMessage},
    tunnel::{short, Tunnel, TunnelManager},
    warm::WarmPool,
};

pub const STANDBY_READY: &str = "standby_ready";
pub const TUNNEL_ACTIVE: &str = "tunnel_active";
pub const LINK_CAPACITY: usize = 256;

/// Splits `host:port`, defaulting the port to 80. IPv6 literals must be
/// bracketed.
pub fn parse_target(target: &str) -> Result<(String, u16), RelayError> {
    parse_target_or(target, 80)
}

pub fn parse_target_or(target: &str, default_port: u16) -> Result<(String, u16), RelayError> {
    let target = target.trim();
    let (host, port) = match target.rsplit_once(':') {
        Some((host, _)) if !host.ends_with(']') && host.contains(':') => (target, None),
        Some((host, port)) => (host, Some(port)),
        None => (target, None),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(RelayError::InvalidRequest(format!("invalid target {target:?}")));
    }
    let port = match port {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| RelayError::InvalidRequest(format!("invalid port in {target:?}")))?,
        None => default_port,
    };
    Ok((host.to_string(), port))
}

/// Server side of standby and direct links.
pub struct StandbyEndpoint {
    hub: Arc<Hub>,
    tunnels: TunnelManager,
    standby_wait: Duration,
    idle_timeout: Duration,
}

impl StandbyEndpoint {
    pub fn new(hub: Arc<Hub>, tunnels: TunnelManager, standby_wait: Duration, idle_timeout: Duration) -> Self {
        Self {
            hub,
            tunnels,
            standby_wait,
            idle_timeout,
        }
    }

    /// Two-phase link: confirm the node, wait for a target, then relay.
    pub async fn serve_standby(&self, node_id: String, mut link: DuplexLink) {
        if !self.hub.is_connected(&node_id) {
            let _ = link.send_text("error:node_not_connected").await;
            let _ = link.send(WireMessage::Close).await;
            return;
        }
        if link.send_text(STANDBY_READY).await.is_err() {
            return;
        }

        let target = match tokio::time::timeout(self.standby_wait, link.recv_text()).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                debug!("standby link for {node_id} closed while idle");
                return;
            }
            Err(_) => {
                debug!("standby link for {node_id} expired");
                let _ = link.send(WireMessage::Close).await;
                return;
            }
        };

        let Ok((host, port)) = parse_target(&target) else {
            let _ = link.send_text("error:invalid_target").await;
            return;
        };
        if !self.hub.is_connected(&node_id) {
            let _ = link.send_text("error:node_disconnected").await;
            return;
        }

        let tunnel = match self.tunnels.open_tunnel(&node_id, &host, port).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                debug!("standby activation via {node_id} to {host}:{port} failed: {e}");
                let _ = link.send_text(format!("error:{e}")).await;
                return;
            }
        };
        if link.send_text(TUNNEL_ACTIVE).await.is_err() {
            self.tunnels.close_tunnel(tunnel.id()).await;
            return;
        }
        info!("standby tunnel {} active via {node_id} to {host}:{port}", short(tunnel.id()));
        self.relay(tunnel, link).await;
    }

    /// Single-phase link: the target is known up front.
    pub async fn serve_direct(&self, node_id: String, host: String, port: u16, link: DuplexLink) {
        let tunnel = match self.tunnels.open_tunnel(&node_id, &host, port).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                let _ = link.send_text(serde_json::json!({ "error": e.to_string() }).to_string()).await;
                let _ = link.send(WireMessage::Close).await;
                return;
            }
        };
        self.relay(tunnel, link).await;
    }

    async fn relay(&self, tunnel: Arc<Tunnel>, link: DuplexLink) {
        let (tx, mut rx) = link.split();

        let upstream = async {
            while let Some(msg) = rx.recv().await {
                let data = match msg {
                    WireMessage::Binary(data) => data,
                    WireMessage::Text(text) => text.into_bytes().into(),
                    WireMessage::Close => break,
                    _ => continue,
                };
                if let Err(e) = tunnel.write(data).await {
                    debug!("tunnel {} write failed: {e}", short(tunnel.id()));
                    break;
                }
            }
        };
        let downstream = async {
            loop {
                match tunnel.read_timeout(self.idle_timeout).await {
                    Ok(data) => {
                        if tx.send(WireMessage::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        let _ = tx.send(WireMessage::Close).await;
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = upstream => {}
            _ = downstream => {}
        }
        self.tunnels.close_tunnel(tunnel.id()).await;
        debug!(
            "link tunnel {} closed sent={} recv={}",
            short(tunnel.id()),
            tunnel.bytes_to_node(),
            tunnel.bytes_from_node()
        );
    }
}

/// An open link waiting for its first target.
pub struct StandbyTunnel {
    pub node_id: String,
    pub country: String,
    pub created_at: Instant,
    link: DuplexLink,
}

impl StandbyTunnel {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub target: usize,
    pub opened: u64,
    pub served: u64,
    pub expired: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicU64,
    served: AtomicU64,
    expired: AtomicU64,
    failed: AtomicU64,
}

pub struct TunnelPool {
    config: PoolConfig,
    hub: Arc<Hub>,
    warm: Arc<WarmPool>,
    endpoint: Arc<StandbyEndpoint>,
    idle: Mutex<Vec<StandbyTunnel>>,
    counters: Counters,
}

impl TunnelPool {
    pub fn new(config: PoolConfig, hub: Arc<Hub>, warm: Arc<WarmPool>, endpoint: Arc<StandbyEndpoint>) -> Self {
        Self {
            config,
            hub,
            warm,
            endpoint,
            idle: Mutex::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// A standby link, preferring `country`. Links whose node has gone
    /// are dropped on the way.
    pub fn get_tunnel(&self, country: &str) -> Option<StandbyTunnel> {
        self.take(country, true)
    }

    /// Like [`get_tunnel`](Self::get_tunnel) but only ever hands out a
    /// link in `country`.
    pub fn get_country_tunnel(&self, country: &str) -> Option<StandbyTunnel> {
        self.take(country, false)
    }

    fn take(&self, country: &str, any_fallback: bool) -> Option<StandbyTunnel> {
        let mut idle = self.idle.lock();
        idle.retain(|t| self.hub.is_connected(&t.node_id));

        let country = country.trim();
        let index = if country.is_empty() {
            None
        } else {
            idle.iter().position(|t| t.country.eq_ignore_ascii_case(country))
        };
        let index = match index {
            Some(i) => i,
            None if idle.is_empty() || (!country.is_empty() && !any_fallback) => return None,
            None => 0,
        };
        self.counters.served.fetch_add(1, Ordering::Relaxed);
        Some(idle.remove(index))
    }

    pub fn size(&self) -> usize {
        self.idle.lock().len()
    }

    /// Sends the target over a standby link and waits for the endpoint to
    /// confirm the circuit. The returned link relays the circuit's bytes.
    pub async fn activate_tunnel(&self, standby: StandbyTunnel, host: &str, port: u16) -> Result<DuplexLink, RelayError> {
        let mut link = standby.link;
        tokio::time::timeout(self.config.activate_write_timeout, link.send_text(format!("{host}:{port}")))
            .await
            .map_err(|_| RelayError::timeout("standby activation write"))??;

        match tokio::time::timeout(self.config.activate_ack_timeout, link.recv_text()).await {
            Ok(Some(ack)) if ack == TUNNEL_ACTIVE => Ok(link),
            Ok(Some(ack)) => Err(RelayError::TunnelOpenFailed(
                ack.strip_prefix("error:").unwrap_or(&ack).to_string(),
            )),
            Ok(None) => Err(RelayError::ConnectionClosed),
            Err(_) => Err(RelayError::timeout("standby activation ack")),
        }
    }

    /// Closes standby links older than the idle ceiling.
    pub fn evict_stale(&self) -> usize {
        let max_idle = self.config.max_idle;
        let mut idle = self.idle.lock();
        let before = idle.len();
        idle.retain(|t| t.age() <= max_idle);
        let evicted = before - idle.len();
        if evicted > 0 {
            self.counters.expired.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        evicted
    }

    /// Opens standby links to fast-lane nodes until the pool is full,
    /// at most `refill_concurrency` per call.
    pub async fn refill(&self) -> usize {
        let needed = self
            .config
            .size
            .saturating_sub(self.size())
            .min(self.config.refill_concurrency.max(1));
        if needed == 0 {
            return 0;
        }

        let targets = self.target_nodes(needed).await;
        if targets.is_empty() {
            return 0;
        }

        let mut opens: FuturesUnordered<_> = targets.iter().map(|id| self.open_standby(id)).collect();
        let mut added = 0;
        while let Some(result) = opens.next().await {
            match result {
                Ok(standby) => {
                    let mut idle = self.idle.lock();
                    if idle.len() < self.config.size {
                        idle.push(standby);
                        added += 1;
                    }
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    debug!("standby open failed: {e}");
                }
            }
        }
        added
    }

    async fn target_nodes(&self, count: usize) -> Vec<String> {
        let mut seen: HashSet<String> = self.idle.lock().iter().map(|t| t.node_id.clone()).collect();
        let mut out = Vec::with_capacity(count);
        for _ in 0..count * 3 {
            if out.len() >= count {
                break;
            }
            let Some(conn) = self.warm.get_fast_node("").await else {
                break;
            };
            if seen.insert(conn.node_id().to_string()) {
                out.push(conn.node_id().to_string());
            }
        }
        out
    }

    /// Opens one standby link and waits for the endpoint's ready signal.
    pub async fn open_standby(&self, node_id: &str) -> Result<StandbyTunnel, RelayError> {
        let country = self
            .hub
            .get_by_node_id(node_id)
            .map(|c| c.country())
            .ok_or_else(|| RelayError::NodeNotConnected(node_id.to_string()))?;

        let (mut ours, theirs) = DuplexLink::pair(LINK_CAPACITY);
        let endpoint = self.endpoint.clone();
        let id = node_id.to_string();
        tokio::spawn(async move { endpoint.serve_standby(id, theirs).await });

        match tokio::time::timeout(self.config.open_timeout, ours.recv_text()).await {
            Ok(Some(msg)) if msg == STANDBY_READY => {}
            Ok(Some(msg)) => return Err(RelayError::TunnelOpenFailed(format!("unexpected standby response {msg}"))),
            Ok(None) => return Err(RelayError::ConnectionClosed),
            Err(_) => return Err(RelayError::timeout("standby ready")),
        }

        self.counters.opened.fetch_add(1, Ordering::Relaxed);
        debug!("standby link open to {node_id} ({country})");
        Ok(StandbyTunnel {
            node_id: node_id.to_string(),
            country,
            created_at: Instant::now(),
            link: ours,
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size(),
            target: self.config.size,
            opened: self.counters.opened.load(Ordering::Relaxed),
            served: self.counters.served.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Refill loop and stats reporter. Idle links are dropped on shutdown.
    pub fn spawn(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let pool = self.clone();
        let mut stop = shutdown.subscribe();
        let refill = tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.config.refill_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        pool.evict_stale();
                        pool.refill().await;
                    }
                    _ = stop.recv() => break,
                }
            }
            pool.idle.lock().clear();
        });

        let pool = self.clone();
        let mut stop = shutdown.subscribe();
        let report = tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.config.stats_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let s = pool.stats();
                        if s.size < s.target / 2 {
                            warn!(
                                "tunnel pool low: size={}/{} opened={} served={} expired={} failed={}",
                                s.size, s.target, s.opened, s.served, s.expired, s.failed
                            );
                        } else {
                            info!(
                                "tunnel pool: size={}/{} opened={} served={} expired={} failed={}",
                                s.size, s.target, s.opened, s.served, s.expired, s.failed
                            );
                        }
                    }
                    _ = stop.recv() => break,
                }
            }
        });

        vec![refill, report]
    }
}
