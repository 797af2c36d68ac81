//! Background validation of idle nodes.
//!
//! A periodic probe opens a tunnel through a sample of nodes to a known
//! HTTP endpoint. Nodes that answer in time go into the fast lane for their
//! country and the global lane, where request routing and the standby pool
//! pick them up first.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::{Bytes, BytesMut};
use futures::{stream::FuturesUnordered, StreamExt};
use log::{debug, info};
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::{sync::broadcast, task::JoinHandle, time::Instant};

use crate::{
    config::WarmConfig,
    error::RelayError,
    hub::{Hub, NodeConnection},
    score::ScoreBoard,
    select::is_routable,
    store::{SharedStore, ANY_COUNTRY},
    tunnel::TunnelTransport,
};

#[derive(Debug, Default)]
struct Counters {
    probes_run: AtomicU64,
    probes_ok: AtomicU64,
    probes_fail: AtomicU64,
    fast_hits: AtomicU64,
    fast_misses: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmStats {
    pub probes_run: u64,
    pub probes_ok: u64,
    pub probes_fail: u64,
    /// Members of country lanes, excluding the global lane
    pub fast_nodes_total: usize,
    pub fast_by_country: HashMap<String, usize>,
    pub fast_hits: u64,
    pub fast_misses: u64,
}

pub struct WarmPool {
    config: WarmConfig,
    hub: Arc<Hub>,
    scores: Arc<ScoreBoard>,
    store: Arc<dyn SharedStore>,
    transport: Arc<dyn TunnelTransport>,
    counters: Counters,
}

impl WarmPool {
    pub fn new(
        config: WarmConfig,
        hub: Arc<Hub>,
        scores: Arc<ScoreBoard>,
        store: Arc<dyn SharedStore>,
        transport: Arc<dyn TunnelTransport>,
    ) -> Self {
        Self {
            config,
            hub,
            scores,
            store,
            transport,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &WarmConfig {
        &self.config
    }

    /// Takes a fast-lane node, preferring `country`. The node is removed
    /// from the lane it came from. Members this instance cannot use stay
    /// in place since another instance may hold their connection.
    pub async fn get_fast_node(&self, country: &str) -> Option<Arc<NodeConnection>> {
        let country = country.trim().to_uppercase();
        let targeted = !country.is_empty() && country != ANY_COUNTRY;

        if targeted {
            if let Some(conn) = self.take_from_lane(&country, None).await {
                self.counters.fast_hits.fetch_add(1, Ordering::Relaxed);
                return Some(conn);
            }
        }
        let wanted = targeted.then_some(country.as_str());
        if let Some(conn) = self.take_from_lane(ANY_COUNTRY, wanted).await {
            self.counters.fast_hits.fetch_add(1, Ordering::Relaxed);
            return Some(conn);
        }

        self.counters.fast_misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn take_from_lane(&self, lane: &str, country: Option<&str>) -> Option<Arc<NodeConnection>> {
        let mut members = match self.store.fast_nodes(lane).await {
            Ok(members) => members,
            Err(e) => {
                debug!("fast lane {lane} unavailable: {e}");
                return None;
            }
        };
        members.shuffle(&mut rand::thread_rng());

        for node_id in members {
            if self.scores.is_quarantined(&node_id) {
                continue;
            }
            let Some(conn) = self.hub.get_by_node_id(&node_id) else {
                continue;
            };
            if !is_routable(&conn) {
                continue;
            }
            if let Some(country) = country {
                if !conn.country().eq_ignore_ascii_case(country) {
                    continue;
                }
            }
            match self.store.remove_node_fast(lane, &node_id).await {
                // another caller took it first
                Ok(false) => continue,
                Ok(true) => return Some(conn),
                Err(e) => {
                    debug!("fast lane {lane} remove failed: {e}");
                    return Some(conn);
                }
            }
        }
        None
    }

    /// Probes one batch of connected nodes that are not in the fast lane
    /// yet. Returns how many passed.
    pub async fn probe_round(&self) -> usize {
        let mut candidates = Vec::new();
        for conn in self.hub.all_connections() {
            if conn.is_closed() || !conn.info().registered || self.scores.is_quarantined(conn.node_id()) {
                continue;
            }
            if let Ok(true) = self.store.contains_fast(ANY_COUNTRY, conn.node_id()).await {
                continue;
            }
            candidates.push(conn);
        }
        if candidates.is_empty() {
            return 0;
        }

        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(self.config.batch_size.max(1));

        let mut probes: FuturesUnordered<_> = candidates.into_iter().map(|conn| self.probe_node(conn)).collect();
        let mut passed = 0;
        while let Some(ok) = probes.next().await {
            if ok {
                passed += 1;
            }
        }
        passed
    }

    /// Sends a minimal HTTP request through a throwaway tunnel and adds the
    /// node to the fast lane if a response starts coming back in time.
    pub async fn probe_node(&self, conn: Arc<NodeConnection>) -> bool {
        self.counters.probes_run.fetch_add(1, Ordering::Relaxed);
        let node_id = conn.node_id().to_string();
        let started = Instant::now();

        let ok = match self.run_probe(&node_id).await {
            Ok(head) if !head.starts_with(b"HTTP/") => {
                debug!("warm probe {node_id}: no HTTP response ({} bytes)", head.len());
                false
            }
            Ok(_) if started.elapsed() > self.config.probe_timeout => {
                debug!("warm probe {node_id}: too slow ({:?})", started.elapsed());
                false
            }
            Ok(_) => true,
            Err(e) => {
                debug!("warm probe {node_id} failed: {e}");
                false
            }
        };

        if !ok {
            self.counters.probes_fail.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.counters.probes_ok.fetch_add(1, Ordering::Relaxed);
        self.add_to_fast_lane(&node_id, &conn.country()).await;
        debug!("warm probe {node_id} ok in {:?}", started.elapsed());
        true
    }

    async fn run_probe(&self, node_id: &str) -> Result<Bytes, RelayError> {
        let host = &self.config.probe_host;
        let tunnel = self.transport.open(node_id, host, self.config.probe_port).await?;
        let request = format!("GET /ip HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");

        let result = async {
            tunnel.write(Bytes::from(request)).await?;
            let deadline = Instant::now() + self.config.probe_timeout;
            let mut head = BytesMut::new();
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tunnel.read_timeout(remaining).await {
                    Ok(chunk) => head.extend_from_slice(&chunk),
                    Err(_) => break,
                }
            }
            Ok::<_, RelayError>(head.freeze())
        }
        .await;

        self.transport.close(tunnel.id()).await;
        result
    }

    async fn add_to_fast_lane(&self, node_id: &str, country: &str) {
        let ttl = self.config.fast_ttl;
        if !country.is_empty() {
            if let Err(e) = self.store.put_node_fast(country, node_id, ttl).await {
                debug!("fast lane {country} add failed: {e}");
            }
        }
        if let Err(e) = self.store.put_node_fast(ANY_COUNTRY, node_id, ttl).await {
            debug!("fast lane {ANY_COUNTRY} add failed: {e}");
        }
    }

    pub async fn stats(&self) -> WarmStats {
        let fast_by_country = self.store.fast_lane_sizes().await.unwrap_or_default();
        let fast_nodes_total = fast_by_country
            .iter()
            .filter(|(lane, _)| lane.as_str() != ANY_COUNTRY)
            .map(|(_, n)| n)
            .sum();
        WarmStats {
            probes_run: self.counters.probes_run.load(Ordering::Relaxed),
            probes_ok: self.counters.probes_ok.load(Ordering::Relaxed),
            probes_fail: self.counters.probes_fail.load(Ordering::Relaxed),
            fast_nodes_total,
            fast_by_country,
            fast_hits: self.counters.fast_hits.load(Ordering::Relaxed),
            fast_misses: self.counters.fast_misses.load(Ordering::Relaxed),
        }
    }

    /// Probe loop and stats reporter.
    pub fn spawn(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let pool = self.clone();
        let mut stop = shutdown.subscribe();
        let probe = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(pool.config.start_delay) => {}
                _ = stop.recv() => return,
            }
            let mut interval = tokio::time::interval(pool.config.check_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let passed = pool.probe_round().await;
                        if passed > 0 {
                            debug!("warm round added {passed} nodes to the fast lane");
                        }
                    }
                    _ = stop.recv() => break,
                }
            }
        });

        let pool = self.clone();
        let mut stop = shutdown.subscribe();
        let report = tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.config.stats_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let s = pool.stats().await;
                        info!(
                            "warm pool: probes={} ok={} fail={} fast_nodes={} hits={} misses={}",
                            s.probes_run, s.probes_ok, s.probes_fail, s.fast_nodes_total, s.fast_hits, s.fast_misses
                        );
                    }
                    _ = stop.recv() => break,
                }
            }
        });

        vec![probe, report]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::{
        config::{HubConfig, ScoreConfig, TunnelConfig},
        events::EventQueue,
        hub::{ConnectionQueues, NodeInfo},
        message::{ControlMessage, TunnelResponse},
        store::MemoryStore,
        frame::Frame,
        tunnel::TunnelManager,
    };

    struct Fixture {
        warm: WarmPool,
        hub: Arc<Hub>,
        tunnels: TunnelManager,
        scores: Arc<ScoreBoard>,
        store: Arc<MemoryStore>,
        _events: EventQueue,
    }

    fn fixture() -> Fixture {
        let events = EventQueue::new(64);
        let hub = Arc::new(Hub::new(HubConfig::default(), events.publisher()));
        let tunnels = TunnelManager::new(TunnelConfig::default(), hub.clone());
        let scores = Arc::new(ScoreBoard::new(ScoreConfig::default()));
        let store = Arc::new(MemoryStore::new());
        let warm = WarmPool::new(
            WarmConfig::default(),
            hub.clone(),
            scores.clone(),
            store.clone(),
            Arc::new(tunnels.clone()),
        );
        Fixture {
            warm,
            hub,
            tunnels,
            scores,
            store,
            _events: events,
        }
    }

    impl Fixture {
        fn node(&self, node_id: &str, country: &str) -> ConnectionQueues {
            let (conn, queues) = NodeConnection::new(
                NodeInfo {
                    node_id: node_id.into(),
                    country: country.into(),
                    registered: true,
                    ..Default::default()
                },
                64,
            );
            self.hub.add(conn).unwrap();
            queues
        }
    }

    /// Accepts every tunnel and answers the first write with `reply`.
    fn answer(tunnels: TunnelManager, mut queues: ConnectionQueues, reply: &'static [u8]) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    text = queues.text_rx.recv() => {
                        let Some(text) = text else { break };
                        if let Ok(ControlMessage::TunnelOpen { data }) = serde_json::from_str::<ControlMessage>(&text) {
                            tunnels.handle_response(TunnelResponse {
                                tunnel_id: data.tunnel_id,
                                success: true,
                                error: None,
                            }).await;
                        }
                    }
                    raw = queues.binary_rx.recv() => {
                        let Some(raw) = raw else { break };
                        let Ok(frame) = Frame::decode(&raw) else { continue };
                        if !frame.eof {
                            tunnels.handle_data(&frame.tunnel_id, Bytes::from_static(reply), true).await;
                        }
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn passing_nodes_join_country_and_global_lanes() {
        let f = fixture();
        answer(f.tunnels.clone(), f.node("good", "DE"), b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        answer(f.tunnels.clone(), f.node("junk", "DE"), b"garbage\r\n\r\n");

        assert_eq!(f.warm.probe_round().await, 1);
        assert_eq!(f.store.fast_nodes("DE").await.unwrap(), vec!["good".to_string()]);
        assert!(f.store.contains_fast(ANY_COUNTRY, "good").await.unwrap());
        assert_eq!(f.tunnels.count().await, 0);

        let stats = f.warm.stats().await;
        assert_eq!((stats.probes_run, stats.probes_ok, stats.probes_fail), (2, 1, 1));
        assert_eq!(stats.fast_nodes_total, 1);

        // already in the lane, so not probed again
        assert_eq!(f.warm.probe_round().await, 0);
        assert_eq!(f.warm.stats().await.probes_run, 3);
    }

    #[tokio::test]
    async fn fast_node_prefers_country_and_is_consumed() {
        let f = fixture();
        let _us = f.node("us1", "US");
        let _de = f.node("de1", "DE");
        let ttl = Duration::from_secs(600);
        f.store.put_node_fast("US", "us1", ttl).await.unwrap();
        f.store.put_node_fast(ANY_COUNTRY, "us1", ttl).await.unwrap();
        f.store.put_node_fast(ANY_COUNTRY, "de1", ttl).await.unwrap();

        let got = f.warm.get_fast_node("us").await.unwrap();
        assert_eq!(got.node_id(), "us1");
        assert!(f.store.fast_nodes("US").await.unwrap().is_empty());

        // only de1 in the global lane matches DE
        let got = f.warm.get_fast_node("DE").await.unwrap();
        assert_eq!(got.node_id(), "de1");
        assert!(f.warm.get_fast_node("DE").await.is_none());

        let stats = f.warm.stats().await;
        assert_eq!((stats.fast_hits, stats.fast_misses), (2, 1));
    }

    #[tokio::test]
    async fn fast_node_skips_disconnected_and_quarantined() {
        let f = fixture();
        let _a = f.node("sick", "US");
        let ttl = Duration::from_secs(600);
        for id in ["gone", "sick"] {
            f.store.put_node_fast("US", id, ttl).await.unwrap();
        }
        for _ in 0..5 {
            f.scores.record_result("sick", false, Duration::from_millis(1));
        }

        assert!(f.warm.get_fast_node("US").await.is_none());
        // left in place for other instances
        assert_eq!(f.store.fast_nodes("US").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn fast_node_skips_unregistered_members() {
        let f = fixture();
        let (pending, _queues) = NodeConnection::new(
            NodeInfo {
                node_id: "pending".into(),
                country: "US".into(),
                ..Default::default()
            },
            8,
        );
        f.hub.add(pending).unwrap();
        f.store.put_node_fast("US", "pending", Duration::from_secs(600)).await.unwrap();

        assert!(f.warm.get_fast_node("US").await.is_none());
        assert_eq!(f.store.fast_nodes("US").await.unwrap(), vec!["pending".to_string()]);
    }
}
