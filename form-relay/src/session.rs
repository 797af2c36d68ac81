//! Sticky sessions: a client-chosen session id pinned to one node.
//!
//! Bindings live in the shared store so every relay instance resolves the
//! same session to the same node. A small local cache keeps serving
//! bindings this instance already knows while the store is unreachable.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use log::{debug, info};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::{sync::broadcast, task::JoinHandle, time::Instant};

use crate::{
    auth::RouteParams,
    config::SessionConfig,
    hub::{Hub, NodeConnection},
    store::{SessionBinding, SharedStore},
};

struct CachedBinding {
    binding: SessionBinding,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    rotations: AtomicU64,
    bound: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SessionStats {
    pub cached: usize,
    pub hits: u64,
    pub misses: u64,
    pub rotations: u64,
    pub bound: u64,
}

pub struct SessionCoordinator {
    config: SessionConfig,
    hub: Arc<Hub>,
    store: Arc<dyn SharedStore>,
    cache: RwLock<HashMap<String, CachedBinding>>,
    counters: Counters,
}

impl SessionCoordinator {
    pub fn new(config: SessionConfig, hub: Arc<Hub>, store: Arc<dyn SharedStore>) -> Self {
        Self {
            config,
            hub,
            store,
            cache: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// The node bound to `session_id` if the binding is live and its node
    /// is connected here. Counts the request and extends the binding.
    ///
    /// A binding whose node is not connected to this instance stays in the
    /// store: another instance may still be serving it.
    pub async fn resolve(&self, session_id: &str) -> Option<(Arc<NodeConnection>, SessionBinding)> {
        let mut binding = match self.store.get_session_binding(session_id).await {
            Ok(Some(binding)) => binding,
            Ok(None) => {
                self.cache.write().remove(session_id);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                debug!("session store unavailable, using local cache: {e}");
                match self.cached(session_id) {
                    Some(binding) => binding,
                    None => {
                        self.counters.misses.fetch_add(1, Ordering::Relaxed);
                        return None;
                    }
                }
            }
        };

        if binding.expires_at <= Utc::now() {
            self.forget(session_id).await;
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        if binding.rotate_after > 0 && binding.request_count >= binding.rotate_after {
            debug!("session {session_id} rotating after {} requests", binding.request_count);
            self.forget(session_id).await;
            self.counters.rotations.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let conn = self.hub.get_by_node_id(&binding.node_id).or_else(|| {
            (!binding.node_address.is_empty())
                .then(|| self.hub.get_by_address(&binding.node_address))
                .flatten()
        });
        let Some(conn) = conn.filter(|c| !c.is_closed()) else {
            debug!("session {session_id} node {} not connected here", binding.node_id);
            self.cache.write().remove(session_id);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let ttl = Duration::from_secs(binding.ttl_secs.max(1));
        binding.request_count += 1;
        binding.expires_at = Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64);
        if let Err(e) = self.store.put_session_binding(&binding, ttl).await {
            debug!("session {session_id} refresh failed: {e}");
        }
        self.remember(&binding, ttl);
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some((conn, binding))
    }

    /// Pins `session_id` to `conn`, replacing any previous binding.
    pub async fn bind(&self, session_id: &str, conn: &NodeConnection, params: &RouteParams) -> SessionBinding {
        let ttl = params.lifetime.unwrap_or(self.config.ttl).max(Duration::from_secs(1));
        let now = Utc::now();
        let binding = SessionBinding {
            session_id: session_id.to_string(),
            node_id: conn.node_id().to_string(),
            node_address: conn.address(),
            country: params.country().to_string(),
            city: params.city.clone().unwrap_or_default(),
            request_count: 0,
            rotate_after: params.rotate_after.unwrap_or(0),
            ttl_secs: ttl.as_secs(),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl.as_secs() as i64),
        };
        if let Err(e) = self.store.put_session_binding(&binding, ttl).await {
            debug!("session {session_id} store write failed: {e}");
        }
        self.remember(&binding, ttl);
        self.counters.bound.fetch_add(1, Ordering::Relaxed);
        info!("session {session_id} bound to {} for {:?}", binding.node_id, ttl);
        binding
    }

    /// Drops a binding everywhere so the next request picks a new node.
    pub async fn rotate(&self, session_id: &str) -> bool {
        let known = self.get(session_id).await.is_some();
        self.forget(session_id).await;
        if known {
            self.counters.rotations.fetch_add(1, Ordering::Relaxed);
        }
        known
    }

    /// Reads a binding without counting a request.
    pub async fn get(&self, session_id: &str) -> Option<SessionBinding> {
        match self.store.get_session_binding(session_id).await {
            Ok(binding) => binding,
            Err(_) => self.cached(session_id),
        }
    }

    async fn forget(&self, session_id: &str) {
        self.cache.write().remove(session_id);
        if let Err(e) = self.store.delete_session_binding(session_id).await {
            debug!("session {session_id} delete failed: {e}");
        }
    }

    fn cached(&self, session_id: &str) -> Option<SessionBinding> {
        self.cache
            .read()
            .get(session_id)
            .filter(|c| c.expires_at > Instant::now())
            .map(|c| c.binding.clone())
    }

    fn remember(&self, binding: &SessionBinding, ttl: Duration) {
        self.cache.write().insert(
            binding.session_id.clone(),
            CachedBinding {
                binding: binding.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn sweep_cache(&self) -> usize {
        let now = Instant::now();
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, c| c.expires_at > now);
        before - cache.len()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            cached: self.cache.read().len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            rotations: self.counters.rotations.load(Ordering::Relaxed),
            bound: self.counters.bound.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        let sessions = self.clone();
        let mut shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sessions.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let n = sessions.sweep_cache();
                        if n > 0 {
                            debug!("dropped {n} expired cached sessions");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::HubConfig,
        events::EventQueue,
        hub::NodeInfo,
        store::MemoryStore,
    };

    struct Fixture {
        sessions: SessionCoordinator,
        hub: Arc<Hub>,
        store: Arc<MemoryStore>,
        _events: EventQueue,
    }

    fn fixture() -> Fixture {
        let events = EventQueue::new(64);
        let hub = Arc::new(Hub::new(HubConfig::default(), events.publisher()));
        let store = Arc::new(MemoryStore::new());
        let sessions = SessionCoordinator::new(SessionConfig::default(), hub.clone(), store.clone());
        Fixture {
            sessions,
            hub,
            store,
            _events: events,
        }
    }

    fn node(hub: &Hub, node_id: &str, address: &str) -> Arc<NodeConnection> {
        let (conn, _queues) = NodeConnection::new(
            NodeInfo {
                node_id: node_id.into(),
                address: address.into(),
                country: "US".into(),
                ..Default::default()
            },
            8,
        );
        hub.add(conn.clone()).unwrap();
        conn
    }

    fn params(rotate_after: Option<u64>) -> RouteParams {
        RouteParams {
            country: Some("US".into()),
            session_id: Some("s1".into()),
            rotate_after,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn rebinding_and_reuse_refresh_the_binding() {
        let f = fixture();
        let n1 = node(&f.hub, "n1", "198.51.100.1");
        assert!(f.sessions.resolve("s1").await.is_none());

        f.sessions.bind("s1", &n1, &params(None)).await;
        let (conn, binding) = f.sessions.resolve("s1").await.unwrap();
        assert_eq!(conn.node_id(), "n1");
        assert_eq!(binding.request_count, 1);
        assert_eq!(binding.ttl_secs, 30 * 60);

        let stored = f.store.get_session_binding("s1").await.unwrap().unwrap();
        assert_eq!(stored.request_count, 1);
    }

    #[tokio::test]
    async fn rotates_after_request_budget() {
        let f = fixture();
        let n1 = node(&f.hub, "n1", "198.51.100.1");
        f.sessions.bind("s1", &n1, &params(Some(2))).await;

        assert!(f.sessions.resolve("s1").await.is_some());
        assert!(f.sessions.resolve("s1").await.is_some());
        assert!(f.sessions.resolve("s1").await.is_none());
        assert!(f.store.get_session_binding("s1").await.unwrap().is_none());
        assert_eq!(f.sessions.stats().rotations, 1);
    }

    #[tokio::test]
    async fn missing_node_keeps_store_entry() {
        let f = fixture();
        let n1 = node(&f.hub, "n1", "198.51.100.1");
        f.sessions.bind("s1", &n1, &params(None)).await;
        f.hub.remove("n1", "test");

        assert!(f.sessions.resolve("s1").await.is_none());
        assert!(f.store.get_session_binding("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn falls_back_to_address_match() {
        let f = fixture();
        let old = node(&f.hub, "old-id", "198.51.100.7");
        f.sessions.bind("s1", &old, &params(None)).await;
        f.hub.remove("old-id", "test");
        node(&f.hub, "new-id", "198.51.100.7");

        let (conn, binding) = f.sessions.resolve("s1").await.unwrap();
        assert_eq!(conn.node_id(), "new-id");
        assert_eq!(binding.node_id, "old-id");
    }

    #[tokio::test]
    async fn explicit_rotation_deletes_binding() {
        let f = fixture();
        let n1 = node(&f.hub, "n1", "198.51.100.1");
        f.sessions.bind("s1", &n1, &params(None)).await;
        assert!(f.sessions.rotate("s1").await);
        assert!(!f.sessions.rotate("s1").await);
        assert!(f.sessions.resolve("s1").await.is_none());
    }
}
