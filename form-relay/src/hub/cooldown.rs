use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use log::warn;
use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownCheck {
    Allowed,
    Rejected { retry_after: Duration },
}

#[derive(Debug, Default)]
struct CooldownEntry {
    connect_times: Vec<Instant>,
    until: Option<Instant>,
}

impl CooldownEntry {
    fn is_idle(&self, now: Instant, window: Duration) -> bool {
        let cooling = self.until.map(|u| now < u).unwrap_or(false);
        let recent = self
            .connect_times
            .iter()
            .any(|t| now.saturating_duration_since(*t) < window);
        !cooling && !recent
    }
}

/// Sliding-window reconnect limiter keyed by node id.
pub struct CooldownTracker {
    entries: Mutex<HashMap<String, CooldownEntry>>,
    max_connects: usize,
    window: Duration,
    duration: Duration,
    total_cooldowns: AtomicU64,
}

impl CooldownTracker {
    pub fn new(max_connects: usize, window: Duration, duration: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_connects,
            window,
            duration,
            total_cooldowns: AtomicU64::new(0),
        }
    }

    /// Records a connect attempt and decides whether it may proceed.
    pub fn check(&self, node_id: &str) -> CooldownCheck {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(node_id.to_string()).or_default();

        if let Some(until) = entry.until {
            if now < until {
                return CooldownCheck::Rejected {
                    retry_after: until - now,
                };
            }
            entry.until = None;
        }

        let window = self.window;
        entry
            .connect_times
            .retain(|t| now.saturating_duration_since(*t) < window);
        entry.connect_times.push(now);

        if entry.connect_times.len() > self.max_connects {
            entry.until = Some(now + self.duration);
            entry.connect_times.clear();
            self.total_cooldowns.fetch_add(1, Ordering::Relaxed);
            warn!(
                "node {node_id} tripped cooldown: more than {} connects in {:?}, blocked for {:?}",
                self.max_connects, self.window, self.duration
            );
            return CooldownCheck::Rejected {
                retry_after: self.duration,
            };
        }

        CooldownCheck::Allowed
    }

    /// Drops the node's bookkeeping if it no longer constrains anything.
    pub fn release(&self, node_id: &str) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries
            .get(node_id)
            .map(|e| e.is_idle(now, self.window))
            .unwrap_or(false)
        {
            entries.remove(node_id);
        }
    }

    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_idle(now, self.window));
        before - entries.len()
    }

    pub fn active(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| e.until.map(|u| now < u).unwrap_or(false))
            .count()
    }

    pub fn total(&self) -> u64 {
        self.total_cooldowns.load(Ordering::Relaxed)
    }
}
