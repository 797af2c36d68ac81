//! Registry of live node connections.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::{
    config::HubConfig,
    error::RelayError,
    events::{EventPublisher, RelayEvent},
    message::IpInfoUpdate,
};

pub mod connection;
pub mod cooldown;
pub mod socket;

pub use connection::{ConnectionQueues, NodeConnection, NodeInfo, NodeSnapshot};
pub use cooldown::{CooldownCheck, CooldownTracker};

/// Shortest identifier accepted for prefix lookups.
const MIN_PREFIX_LEN: usize = 8;

#[derive(Debug, Clone, Serialize)]
pub struct DisconnectEvent {
    pub node_id: String,
    pub ip: String,
    pub reason: String,
    pub duration: String,
    pub duration_sec: f64,
    pub pings_sent: u64,
    pub pongs_received: u64,
    pub at: DateTime<Utc>,
    pub proxy_type: String,
    pub country: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connected: usize,
    pub registered: usize,
    pub total_connects: u64,
    pub total_disconnects: u64,
    pub avg_session_sec: f64,
    pub min_session_sec: f64,
    pub max_session_sec: f64,
    pub by_model: HashMap<String, usize>,
    pub by_country: HashMap<String, usize>,
    pub by_sdk_version: HashMap<String, usize>,
    pub total_cooldowns: u64,
    pub active_cooldowns: usize,
    pub disconnect_reasons: HashMap<String, usize>,
    pub disconnects_last_hour: usize,
    pub recent_disconnects: Vec<DisconnectEvent>,
}

pub struct Hub {
    config: HubConfig,
    connections: RwLock<HashMap<String, Arc<NodeConnection>>>,
    cooldowns: CooldownTracker,
    disconnects: Mutex<VecDeque<DisconnectEvent>>,
    total_connects: AtomicU64,
    total_disconnects: AtomicU64,
    events: EventPublisher,
}

impl Hub {
    pub fn new(config: HubConfig, events: EventPublisher) -> Self {
        let cooldowns = CooldownTracker::new(
            config.cooldown_max_connects,
            config.cooldown_window,
            config.cooldown_duration,
        );
        Self {
            config,
            connections: RwLock::new(HashMap::new()),
            cooldowns,
            disconnects: Mutex::new(VecDeque::new()),
            total_connects: AtomicU64::new(0),
            total_disconnects: AtomicU64::new(0),
            events,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Registers a connection unless its node is cooling down. A previous
    /// connection for the same node is closed and returned.
    pub fn add(&self, conn: Arc<NodeConnection>) -> Result<Option<Arc<NodeConnection>>, RelayError> {
        let node_id = conn.node_id().to_string();
        if let CooldownCheck::Rejected { retry_after } = self.cooldowns.check(&node_id) {
            return Err(RelayError::Cooldown {
                node_id,
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }

        let previous = self.connections.write().insert(node_id.clone(), conn.clone());
        self.total_connects.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = &previous {
            debug!("node {node_id} reconnected, closing connection {}", old.conn_id());
            old.close();
        }

        let info = conn.info();
        info!(
            "node connected id={node_id} ip={} model={} os={} sdk={} total={}",
            info.address,
            info.device_model,
            info.os,
            info.sdk_version,
            self.count()
        );
        Ok(previous)
    }

    /// Idempotent eviction of whatever connection the node currently has.
    pub fn remove(&self, node_id: &str, reason: &str) -> Option<DisconnectEvent> {
        let conn = self.connections.write().remove(node_id)?;
        Some(self.finish_remove(conn, reason))
    }

    /// Evicts the node only if `conn_id` is still its current connection,
    /// so a reader that outlived a reconnect cannot evict its successor.
    pub fn remove_if_current(&self, node_id: &str, conn_id: &str, reason: &str) -> Option<DisconnectEvent> {
        let conn = {
            let mut connections = self.connections.write();
            let current = connections
                .get(node_id)
                .map(|c| c.conn_id() == conn_id)
                .unwrap_or(false);
            if !current {
                return None;
            }
            connections.remove(node_id)?
        };
        Some(self.finish_remove(conn, reason))
    }

    fn finish_remove(&self, conn: Arc<NodeConnection>, reason: &str) -> DisconnectEvent {
        conn.close();
        self.total_disconnects.fetch_add(1, Ordering::Relaxed);

        let info = conn.info();
        let uptime = conn.uptime();
        let event = DisconnectEvent {
            node_id: conn.node_id().to_string(),
            ip: info.address,
            reason: reason.to_string(),
            duration: format!("{:?}", Duration::from_secs(uptime.as_secs())),
            duration_sec: uptime.as_secs_f64(),
            pings_sent: conn.pings_sent(),
            pongs_received: conn.pongs_received(),
            at: Utc::now(),
            proxy_type: info.proxy_type,
            country: info.country,
        };

        {
            let mut ring = self.disconnects.lock();
            if ring.len() >= self.config.disconnect_history.max(1) {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        self.cooldowns.release(conn.node_id());
        self.events.publish(RelayEvent::NodeOffline {
            node_id: event.node_id.clone(),
            reason: event.reason.clone(),
        });

        info!(
            "node disconnected id={} reason={:?} duration={} pongs/pings={}/{} total={}",
            event.node_id,
            event.reason,
            event.duration,
            event.pongs_received,
            event.pings_sent,
            self.count()
        );
        event
    }

    /// Exact match first, then a unique-enough prefix.
    pub fn get_by_node_id(&self, id: &str) -> Option<Arc<NodeConnection>> {
        let connections = self.connections.read();
        if let Some(conn) = connections.get(id) {
            return Some(conn.clone());
        }
        if id.len() < MIN_PREFIX_LEN {
            return None;
        }
        connections
            .iter()
            .find(|(node_id, _)| node_id.starts_with(id))
            .map(|(_, conn)| conn.clone())
    }

    pub fn get_by_address(&self, addr: &str) -> Option<Arc<NodeConnection>> {
        self.connections
            .read()
            .values()
            .find(|c| c.address() == addr)
            .cloned()
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.connections.read().contains_key(node_id)
    }

    pub fn all_connections(&self) -> Vec<Arc<NodeConnection>> {
        self.connections.read().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn record_pong(&self, node_id: &str) {
        if let Some(conn) = self.connections.read().get(node_id) {
            conn.record_pong();
        }
    }

    /// Applies a node-reported ip lookup to its live connection.
    pub fn apply_ip_info(&self, node_id: &str, update: &IpInfoUpdate) {
        let Some(conn) = self.connections.read().get(node_id).cloned() else {
            return;
        };
        conn.update_info(|info| {
            info.has_ip_info = true;
            if let Some(ip) = update.ip.as_deref().filter(|s| !s.is_empty()) {
                info.address = ip.to_string();
            }
            let Some(geo) = &update.ip_info else { return };
            let set = |field: &mut String, value: &Option<String>| {
                if let Some(v) = value.as_deref().filter(|s| !s.is_empty()) {
                    *field = v.to_string();
                }
            };
            set(&mut info.country, &geo.country_code);
            set(&mut info.city, &geo.city_name);
            set(&mut info.isp, &geo.isp);
            set(&mut info.asn, &geo.asn);
            if let Some(proxy) = &geo.proxy {
                set(&mut info.proxy_type, &proxy.proxy_type);
            }
        });
    }

    pub fn sweep_cooldowns(&self) -> usize {
        self.cooldowns.sweep()
    }

    pub fn recent_disconnects(&self, n: usize) -> Vec<DisconnectEvent> {
        let ring = self.disconnects.lock();
        ring.iter().rev().take(n).cloned().collect()
    }

    pub fn stats(&self) -> HubStats {
        let connections = self.all_connections();
        let mut by_model = HashMap::new();
        let mut by_country = HashMap::new();
        let mut by_sdk_version = HashMap::new();
        let mut registered = 0;
        for conn in &connections {
            let info = conn.info();
            if info.registered {
                registered += 1;
            }
            *by_model.entry(or_unknown(&info.device_model)).or_insert(0) += 1;
            *by_country.entry(or_unknown(&info.country)).or_insert(0) += 1;
            *by_sdk_version.entry(or_unknown(&info.sdk_version)).or_insert(0) += 1;
        }

        let ring = self.disconnects.lock();
        let mut disconnect_reasons = HashMap::new();
        let (mut sum, mut min, mut max) = (0.0, f64::MAX, 0.0f64);
        for event in ring.iter() {
            *disconnect_reasons.entry(event.reason.clone()).or_insert(0) += 1;
            sum += event.duration_sec;
            min = min.min(event.duration_sec);
            max = max.max(event.duration_sec);
        }
        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        let disconnects_last_hour = ring.iter().filter(|e| e.at > hour_ago).count();
        let avg = if ring.is_empty() { 0.0 } else { sum / ring.len() as f64 };
        if ring.is_empty() {
            min = 0.0;
        }
        let recent_disconnects = ring.iter().rev().take(10).cloned().collect();
        drop(ring);

        HubStats {
            connected: connections.len(),
            registered,
            total_connects: self.total_connects.load(Ordering::Relaxed),
            total_disconnects: self.total_disconnects.load(Ordering::Relaxed),
            avg_session_sec: avg,
            min_session_sec: min,
            max_session_sec: max,
            by_model,
            by_country,
            by_sdk_version,
            total_cooldowns: self.cooldowns.total(),
            active_cooldowns: self.cooldowns.active(),
            disconnect_reasons,
            disconnects_last_hour,
            recent_disconnects,
        }
    }
}

fn or_unknown(s: &str) -> String {
    if s.is_empty() {
        "unknown".to_string()
    } else {
        s.to_string()
    }
}
