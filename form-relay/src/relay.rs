//! Wires every component of a relay instance together and owns their
//! background loops.

use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::broadcast, task::JoinHandle};

use crate::{
    collab::{Authorizer, GeoResolver, LogLedger, NoGeo, StaticAuthorizer, UsageLedger},
    config::RelayConfig,
    connect::ConnectOrchestrator,
    error::RelayError,
    events::{EventPublisher, EventQueue, EventSinks, EventStats},
    hub::{Hub, HubStats},
    pool::{PoolStats, StandbyEndpoint, TunnelPool},
    proxy::{ProxyManager, ProxyStats},
    retry::RetryPolicy,
    score::ScoreBoard,
    select::{FastLaneSelector, NodeSelector, TieredSelector},
    session::{SessionCoordinator, SessionStats},
    store::{MemoryStore, SharedStore},
    tunnel::{TunnelManager, TunnelManagerStats, TunnelTransport},
    warm::{WarmPool, WarmStats},
};

#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub hub: HubStats,
    pub tunnels: TunnelManagerStats,
    pub proxy: ProxyStats,
    pub warm: WarmStats,
    pub pool: PoolStats,
    pub sessions: SessionStats,
    pub events: EventStats,
    pub scored_nodes: usize,
}

pub struct Relay {
    pub config: RelayConfig,
    pub hub: Arc<Hub>,
    pub tunnels: TunnelManager,
    pub proxies: Arc<ProxyManager>,
    pub scores: Arc<ScoreBoard>,
    pub selector: Arc<dyn NodeSelector>,
    pub connector: ConnectOrchestrator,
    pub store: Arc<dyn SharedStore>,
    pub warm: Arc<WarmPool>,
    pub standby: Arc<StandbyEndpoint>,
    pub pool: Arc<TunnelPool>,
    pub sessions: Arc<SessionCoordinator>,
    pub events: EventPublisher,
    pub geo: Arc<dyn GeoResolver>,
    pub authorizer: Arc<dyn Authorizer>,
    pub ledger: Arc<dyn UsageLedger>,
    queue: Mutex<Option<EventQueue>>,
}

pub struct RelayBuilder {
    config: RelayConfig,
    store: Option<Arc<dyn SharedStore>>,
    geo: Option<Arc<dyn GeoResolver>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    ledger: Option<Arc<dyn UsageLedger>>,
}

impl RelayBuilder {
    pub fn store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn geo(mut self, geo: Arc<dyn GeoResolver>) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn UsageLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn build(self) -> Arc<Relay> {
        let config = self.config;
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let authorizer = self
            .authorizer
            .unwrap_or_else(|| Arc::new(StaticAuthorizer::new(config.gateway.accounts.clone())));

        let queue = EventQueue::new(config.events.capacity);
        let events = queue.publisher();
        let hub = Arc::new(Hub::new(config.hub.clone(), events.clone()));
        let tunnels = TunnelManager::new(config.tunnel.clone(), hub.clone());
        let transport: Arc<dyn TunnelTransport> = Arc::new(tunnels.clone());
        let proxies = Arc::new(ProxyManager::new(config.proxy.clone(), hub.clone()));
        let scores = Arc::new(ScoreBoard::new(config.score.clone()));
        let warm = Arc::new(WarmPool::new(
            config.warm.clone(),
            hub.clone(),
            scores.clone(),
            store.clone(),
            transport.clone(),
        ));
        let selector: Arc<dyn NodeSelector> = Arc::new(FastLaneSelector::new(
            warm.clone(),
            TieredSelector::new(hub.clone(), scores.clone()),
        ));
        let connector = ConnectOrchestrator::new(config.connect.clone(), selector.clone(), transport);
        let standby = Arc::new(StandbyEndpoint::new(
            hub.clone(),
            tunnels.clone(),
            config.pool.standby_wait,
            config.gateway.idle_timeout,
        ));
        let pool = Arc::new(TunnelPool::new(
            config.pool.clone(),
            hub.clone(),
            warm.clone(),
            standby.clone(),
        ));
        let sessions = Arc::new(SessionCoordinator::new(config.session.clone(), hub.clone(), store.clone()));

        Arc::new(Relay {
            hub,
            tunnels,
            proxies,
            scores,
            selector,
            connector,
            store,
            warm,
            standby,
            pool,
            sessions,
            events,
            geo: self.geo.unwrap_or_else(|| Arc::new(NoGeo)),
            authorizer,
            ledger: self.ledger.unwrap_or_else(|| Arc::new(LogLedger)),
            queue: Mutex::new(Some(queue)),
            config,
        })
    }
}

impl Relay {
    pub fn builder(config: RelayConfig) -> RelayBuilder {
        RelayBuilder {
            config,
            store: None,
            geo: None,
            authorizer: None,
            ledger: None,
        }
    }

    /// A relay with in-memory state and no external collaborators.
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Self::builder(config).build()
    }

    /// Opens the configured shared store, in-memory when none is set.
    pub async fn open_store(config: &RelayConfig) -> Result<Arc<dyn SharedStore>, RelayError> {
        match &config.store.redis_url {
            None => Ok(Arc::new(MemoryStore::new())),
            #[cfg(feature = "redis-store")]
            Some(url) => {
                let store = crate::store::redis::RedisStore::connect(url, config.store.op_timeout).await?;
                info!("shared store: redis at {url}");
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "redis-store"))]
            Some(_) => Err(RelayError::InvalidRequest(
                "redis_url set but the relay was built without the redis-store feature".to_string(),
            )),
        }
    }

    /// Starts event delivery and every periodic loop. Call once.
    pub fn spawn_background(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(queue) = self.queue.lock().take() {
            let sinks = EventSinks {
                store: self.store.clone(),
                ledger: self.ledger.clone(),
                directory_ttl: self.config.hub.read_deadline(),
            };
            handles.extend(queue.spawn_workers(
                sinks,
                self.config.events.workers,
                RetryPolicy::from(&self.config.events),
                shutdown,
            ));
        } else {
            debug!("background tasks already running");
            return handles;
        }

        handles.push(self.tunnels.spawn_sweeper(shutdown));
        handles.push(self.proxies.spawn_sweeper(shutdown));
        handles.push(self.scores.spawn_pruner(self.hub.clone(), shutdown));
        handles.push(self.sessions.spawn_sweeper(shutdown));
        handles.push(self.spawn_cooldown_sweeper(shutdown));
        if self.config.warm.enabled {
            handles.extend(self.warm.spawn(shutdown));
        }
        if self.config.pool.enabled {
            handles.extend(self.pool.spawn(shutdown));
        }
        info!("relay background tasks started ({})", handles.len());
        handles
    }

    fn spawn_cooldown_sweeper(&self, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        let hub = self.hub.clone();
        let mut shutdown = shutdown.subscribe();
        let period = self.config.hub.cooldown_window;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let n = hub.sweep_cooldowns();
                        if n > 0 {
                            debug!("forgot {n} idle cooldown trackers");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            hub: self.hub.stats(),
            tunnels: self.tunnels.stats().await,
            proxy: self.proxies.stats(),
            warm: self.warm.stats().await,
            pool: self.pool.stats(),
            sessions: self.sessions.stats(),
            events: self.events.stats(),
            scored_nodes: self.scores.len(),
        }
    }
}
