//! Request/response correlation for unary proxy calls carried as control
//! messages.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{broadcast, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::ProxyConfig,
    error::RelayError,
    hub::Hub,
    message::{ControlMessage, ProxyRequest, ProxyResponse},
};

struct PendingRequest {
    tx: oneshot::Sender<ProxyResponse>,
    created_at: Instant,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProxyStats {
    pub pending: usize,
    pub sent: u64,
    pub answered: u64,
    pub timed_out: u64,
    pub expired: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    answered: AtomicU64,
    timed_out: AtomicU64,
    expired: AtomicU64,
}

pub struct ProxyManager {
    config: ProxyConfig,
    hub: Arc<Hub>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    counters: Counters,
}

/// Removes the pending entry however the wait ends, including the
/// caller's future being dropped.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<String, PendingRequest>>,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.request_id);
    }
}

impl ProxyManager {
    pub fn new(config: ProxyConfig, hub: Arc<Hub>) -> Self {
        Self {
            config,
            hub,
            pending: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Sends `req` to the node and waits for the matching response, the
    /// request timeout, or cancellation, whichever comes first.
    pub async fn send_proxy_request(
        &self,
        node_id: &str,
        mut req: ProxyRequest,
        cancel: &CancellationToken,
    ) -> Result<ProxyResponse, RelayError> {
        let conn = self
            .hub
            .get_by_node_id(node_id)
            .ok_or_else(|| RelayError::NodeNotConnected(node_id.to_string()))?;

        let timeout = if req.timeout_ms > 0 {
            Duration::from_millis(req.timeout_ms)
        } else {
            self.config.default_timeout
        };
        req.timeout_ms = timeout.as_millis() as u64;
        req.request_id = Uuid::new_v4().to_string();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            req.request_id.clone(),
            PendingRequest {
                tx,
                created_at: Instant::now(),
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id: req.request_id.clone(),
        };

        conn.send_control(&ControlMessage::ProxyRequest { data: req })?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);

        tokio::select! {
            resp = rx => resp.map_err(|_| RelayError::ProxyFailed("request expired".to_string())),
            _ = tokio::time::sleep(timeout) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                Err(RelayError::timeout("proxy response"))
            }
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
        }
    }

    /// Never blocks: the waiter either takes the response or is gone.
    pub fn handle_proxy_response(&self, resp: ProxyResponse) {
        let pending = self.pending.lock().remove(&resp.request_id);
        match pending {
            Some(p) => {
                self.counters.answered.fetch_add(1, Ordering::Relaxed);
                if p.tx.send(resp).is_err() {
                    debug!("proxy response arrived after its caller left");
                }
            }
            None => debug!("proxy response for unknown request {}", resp.request_id),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn sweep_expired(&self) -> usize {
        let max_age = self.config.max_age;
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, p| p.created_at.elapsed() <= max_age);
        let removed = before - pending.len();
        drop(pending);
        if removed > 0 {
            self.counters.expired.fetch_add(removed as u64, Ordering::Relaxed);
            info!("dropped {removed} abandoned proxy requests");
        }
        removed
    }

    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        let manager = self.clone();
        let mut shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        manager.sweep_expired();
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    pub fn stats(&self) -> ProxyStats {
        ProxyStats {
            pending: self.pending_count(),
            sent: self.counters.sent.load(Ordering::Relaxed),
            answered: self.counters.answered.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
        }
    }
}
