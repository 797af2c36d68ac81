//! Outbound side effects (node directory upkeep, usage accounting) go
//! through a bounded queue drained by a fixed set of workers. Publishing
//! never blocks: a full queue drops the event and counts it.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, warn};
use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};

use crate::{
    collab::{UsageLedger, UsageRecord},
    error::RelayError,
    retry::{with_retry, RetryPolicy},
    store::{NodeRecord, SharedStore},
};

#[derive(Debug, Clone)]
pub enum RelayEvent {
    NodeOnline(NodeRecord),
    NodeHeartbeat { node_id: String },
    NodeOffline { node_id: String, reason: String },
    Usage(UsageRecord),
}

impl RelayEvent {
    fn label(&self) -> &'static str {
        match self {
            RelayEvent::NodeOnline(_) => "node_online",
            RelayEvent::NodeHeartbeat { .. } => "node_heartbeat",
            RelayEvent::NodeOffline { .. } => "node_offline",
            RelayEvent::Usage(_) => "usage",
        }
    }
}

#[derive(Debug, Default)]
pub struct EventCounters {
    published: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct EventStats {
    pub published: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<RelayEvent>,
    counters: Arc<EventCounters>,
}

impl EventPublisher {
    /// Returns false if the event was dropped.
    pub fn publish(&self, event: RelayEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("event queue full, dropping {}", event.label());
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("event queue closed, dropping {}", event.label());
                false
            }
        }
    }

    pub fn stats(&self) -> EventStats {
        EventStats {
            published: self.counters.published.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

pub struct EventQueue {
    publisher: EventPublisher,
    rx: mpsc::Receiver<RelayEvent>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            publisher: EventPublisher {
                tx,
                counters: Arc::new(EventCounters::default()),
            },
            rx,
        }
    }

    pub fn publisher(&self) -> EventPublisher {
        self.publisher.clone()
    }

    /// Starts `workers` tasks draining the queue into `sinks` until
    /// shutdown.
    pub fn spawn_workers(
        self,
        sinks: EventSinks,
        workers: usize,
        policy: RetryPolicy,
        shutdown: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(self.rx));
        let sinks = Arc::new(sinks);
        (0..workers.max(1))
            .map(|id| {
                let rx = rx.clone();
                let sinks = sinks.clone();
                let policy = policy.clone();
                let counters = self.publisher.counters.clone();
                let mut shutdown = shutdown.subscribe();
                tokio::spawn(async move {
                    loop {
                        let next = tokio::select! {
                            _ = shutdown.recv() => None,
                            event = async { rx.lock().await.recv().await } => event,
                        };
                        let Some(event) = next else {
                            debug!("event worker {id} stopping");
                            break;
                        };
                        let label = event.label();
                        match with_retry(|| sinks.deliver(&event), &policy).await {
                            Ok(()) => {
                                counters.delivered.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                counters.failed.fetch_add(1, Ordering::Relaxed);
                                warn!("event {label} failed after retries: {e}");
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

/// Where events end up.
pub struct EventSinks {
    pub store: Arc<dyn SharedStore>,
    pub ledger: Arc<dyn UsageLedger>,
    /// TTL of node directory entries
    pub directory_ttl: Duration,
}

impl EventSinks {
    async fn deliver(&self, event: &RelayEvent) -> Result<(), RelayError> {
        match event {
            RelayEvent::NodeOnline(record) => {
                self.store.put_node_record(record, self.directory_ttl).await?;
            }
            RelayEvent::NodeHeartbeat { node_id } => {
                if !self.store.touch_node_record(node_id, self.directory_ttl).await? {
                    debug!("heartbeat for {node_id} with no directory entry");
                }
            }
            RelayEvent::NodeOffline { node_id, reason } => {
                debug!("removing {node_id} from directory ({reason})");
                self.store.remove_node_record(node_id).await?;
            }
            RelayEvent::Usage(usage) => {
                self.ledger.record(usage).await?;
            }
        }
        Ok(())
    }
}
