//! Per-node outcome counters and quarantine.

use std::{collections::HashMap, sync::Arc, time::Duration};

use log::{debug, warn};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::{sync::broadcast, task::JoinHandle, time::Instant};

use crate::{config::ScoreConfig, hub::Hub};

/// Reported for nodes with no successful attempt yet.
pub const NO_LATENCY_MS: u64 = 9999;

#[derive(Debug, Clone)]
pub struct NodeScore {
    pub success: u64,
    pub fail: u64,
    pub total_latency_ms: u64,
    pub last_used: Instant,
    pub quarantined_until: Option<Instant>,
}

impl NodeScore {
    fn new() -> Self {
        Self {
            success: 0,
            fail: 0,
            total_latency_ms: 0,
            last_used: Instant::now(),
            quarantined_until: None,
        }
    }

    pub fn total(&self) -> u64 {
        self.success + self.fail
    }

    /// 0.5 until there is any data.
    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 0.5,
            n => self.success as f64 / n as f64,
        }
    }

    pub fn avg_latency_ms(&self) -> u64 {
        match self.success {
            0 => NO_LATENCY_MS,
            n => self.total_latency_ms / n,
        }
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    fn view(&self, node_id: &str, now: Instant) -> ScoreView {
        ScoreView {
            node_id: node_id.to_string(),
            success: self.success,
            fail: self.fail,
            total: self.total(),
            success_rate: self.success_rate(),
            avg_latency_ms: self.avg_latency_ms(),
            quarantined: self.is_quarantined(),
            quarantine_remaining_sec: self
                .quarantined_until
                .map(|u| u.saturating_duration_since(now).as_secs())
                .unwrap_or(0),
            idle_sec: now.saturating_duration_since(self.last_used).as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreView {
    pub node_id: String,
    pub success: u64,
    pub fail: u64,
    pub total: u64,
    pub success_rate: f64,
    pub avg_latency_ms: u64,
    pub quarantined: bool,
    pub quarantine_remaining_sec: u64,
    pub idle_sec: u64,
}

pub struct ScoreBoard {
    config: ScoreConfig,
    scores: RwLock<HashMap<String, NodeScore>>,
}

impl ScoreBoard {
    pub fn new(config: ScoreConfig) -> Self {
        Self {
            config,
            scores: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ScoreConfig {
        &self.config
    }

    pub fn record_result(&self, node_id: &str, success: bool, latency: Duration) {
        let mut scores = self.scores.write();
        let score = scores.entry(node_id.to_string()).or_insert_with(NodeScore::new);
        if success {
            score.success += 1;
            score.total_latency_ms += latency.as_millis() as u64;
        } else {
            score.fail += 1;
        }
        score.last_used = Instant::now();

        if score.total() >= self.config.quarantine_min_samples
            && score.success_rate() < self.config.quarantine_below
        {
            let fresh = !score.is_quarantined();
            score.quarantined_until = Some(Instant::now() + self.config.quarantine_duration);
            if fresh {
                warn!(
                    "quarantined node {node_id}: {:.0}% success ({}/{}) for {:?}",
                    score.success_rate() * 100.0,
                    score.success,
                    score.total(),
                    self.config.quarantine_duration
                );
            }
        }
    }

    pub fn get(&self, node_id: &str) -> Option<NodeScore> {
        self.scores.read().get(node_id).cloned()
    }

    pub fn is_quarantined(&self, node_id: &str) -> bool {
        self.scores
            .read()
            .get(node_id)
            .map(NodeScore::is_quarantined)
            .unwrap_or(false)
    }

    /// Copies out the scores of the given nodes in one lock acquisition.
    pub fn get_many<'a>(&self, node_ids: impl IntoIterator<Item = &'a str>) -> HashMap<String, NodeScore> {
        let scores = self.scores.read();
        node_ids
            .into_iter()
            .filter_map(|id| scores.get(id).map(|s| (id.to_string(), s.clone())))
            .collect()
    }

    pub fn view(&self, node_id: &str) -> Option<ScoreView> {
        let now = Instant::now();
        self.scores.read().get(node_id).map(|s| s.view(node_id, now))
    }

    /// Best success rate first.
    pub fn snapshot(&self) -> Vec<ScoreView> {
        let now = Instant::now();
        let mut views: Vec<ScoreView> = self
            .scores
            .read()
            .iter()
            .map(|(node_id, s)| s.view(node_id, now))
            .collect();
        views.sort_by(|a, b| {
            b.success_rate
                .partial_cmp(&a.success_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.total.cmp(&a.total))
        });
        views
    }

    /// Forgets nodes that are gone and have not been used for a while.
    pub fn prune<F: Fn(&str) -> bool>(&self, is_connected: F) -> usize {
        let idle = self.config.prune_idle;
        let mut scores = self.scores.write();
        let before = scores.len();
        scores.retain(|node_id, s| is_connected(node_id) || s.last_used.elapsed() < idle || s.is_quarantined());
        before - scores.len()
    }

    pub fn len(&self) -> usize {
        self.scores.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn spawn_pruner(self: &Arc<Self>, hub: Arc<Hub>, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        let board = self.clone();
        let mut shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(board.config.prune_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let n = board.prune(|id| hub.is_connected(id));
                        if n > 0 {
                            debug!("pruned {n} stale node scores");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}
