use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{
    fast_key, node_key, session_key, NodeRecord, SessionBinding, SharedStore, StoreError,
};

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Single-process store with key expiry. Shared between coordinators in
/// the same process by cloning the `Arc` it lives in.
#[derive(Default)]
pub struct MemoryStore {
    sets: Mutex<HashMap<String, Expiring<HashSet<String>>>>,
    values: Mutex<HashMap<String, Expiring<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut values = self.values.lock();
        match values.get(key) {
            Some(entry) if entry.live(now) => Some(entry.value.clone()),
            Some(_) => {
                values.remove(key);
                None
            }
            None => None,
        }
    }

    fn set_value(&self, key: String, value: String, ttl: Duration) {
        self.values.lock().insert(
            key,
            Expiring {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn members(&self, key: &str) -> Vec<String> {
        let now = Instant::now();
        let mut sets = self.sets.lock();
        match sets.get(key) {
            Some(entry) if entry.live(now) => entry.value.iter().cloned().collect(),
            Some(_) => {
                sets.remove(key);
                Vec::new()
            }
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn put_node_fast(&self, country: &str, node_id: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut sets = self.sets.lock();
        let entry = sets.entry(fast_key(country)).or_insert_with(|| Expiring {
            value: HashSet::new(),
            expires_at: now,
        });
        if !entry.live(now) {
            entry.value.clear();
        }
        entry.value.insert(node_id.to_string());
        entry.expires_at = now + ttl;
        Ok(())
    }

    async fn fast_nodes(&self, country: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.members(&fast_key(country)))
    }

    async fn contains_fast(&self, country: &str, node_id: &str) -> Result<bool, StoreError> {
        Ok(self.members(&fast_key(country)).iter().any(|n| n == node_id))
    }

    async fn remove_node_fast(&self, country: &str, node_id: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut sets = self.sets.lock();
        Ok(match sets.get_mut(&fast_key(country)) {
            Some(entry) if entry.live(now) => entry.value.remove(node_id),
            _ => false,
        })
    }

    async fn fast_lane_sizes(&self) -> Result<HashMap<String, usize>, StoreError> {
        let now = Instant::now();
        let sets = self.sets.lock();
        Ok(sets
            .iter()
            .filter(|(_, entry)| entry.live(now) && !entry.value.is_empty())
            .filter_map(|(key, entry)| {
                key.strip_prefix("fastnode:")
                    .map(|cc| (cc.to_string(), entry.value.len()))
            })
            .collect())
    }

    async fn get_session_binding(&self, session_id: &str) -> Result<Option<SessionBinding>, StoreError> {
        match self.get_value(&session_key(session_id)) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_session_binding(&self, binding: &SessionBinding, ttl: Duration) -> Result<(), StoreError> {
        let raw = serde_json::to_string(binding)?;
        self.set_value(session_key(&binding.session_id), raw, ttl);
        Ok(())
    }

    async fn delete_session_binding(&self, session_id: &str) -> Result<(), StoreError> {
        self.values.lock().remove(&session_key(session_id));
        Ok(())
    }

    async fn put_node_record(&self, record: &NodeRecord, ttl: Duration) -> Result<(), StoreError> {
        let raw = serde_json::to_string(record)?;
        self.set_value(node_key(&record.node_id), raw, ttl);
        Ok(())
    }

    async fn touch_node_record(&self, node_id: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut values = self.values.lock();
        match values.get_mut(&node_key(node_id)) {
            Some(entry) if entry.live(now) => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_node_record(&self, node_id: &str) -> Result<Option<NodeRecord>, StoreError> {
        match self.get_value(&node_key(node_id)) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn remove_node_record(&self, node_id: &str) -> Result<(), StoreError> {
        self.values.lock().remove(&node_key(node_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test(start_paused = true)]
    async fn fast_lanes_expire_as_a_whole() {
        let store = MemoryStore::new();
        store.put_node_fast("us", "a", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        store.put_node_fast("US", "b", Duration::from_secs(10)).await.unwrap();
        store.put_node_fast("", "a", Duration::from_secs(10)).await.unwrap();

        let mut us = store.fast_nodes("US").await.unwrap();
        us.sort();
        assert_eq!(us, vec!["a", "b"]);
        let sizes = store.fast_lane_sizes().await.unwrap();
        assert_eq!(sizes.get("US"), Some(&2));
        assert_eq!(sizes.get("ANY"), Some(&1));

        assert!(store.remove_node_fast("US", "a").await.unwrap());
        assert!(!store.remove_node_fast("US", "a").await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.fast_nodes("US").await.unwrap().is_empty());
        assert!(!store.contains_fast("", "a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn session_bindings_honour_ttl() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let binding = SessionBinding {
            session_id: "abc".into(),
            node_id: "n1".into(),
            node_address: "203.0.113.9".into(),
            country: "US".into(),
            city: String::new(),
            request_count: 1,
            rotate_after: 0,
            ttl_secs: 30,
            created_at: now,
            expires_at: now,
        };
        store.put_session_binding(&binding, Duration::from_secs(30)).await.unwrap();
        assert_eq!(store.get_session_binding("abc").await.unwrap(), Some(binding));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.get_session_binding("abc").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn node_records_can_be_extended() {
        let store = MemoryStore::new();
        let record = NodeRecord {
            node_id: "n1".into(),
            address: "198.51.100.4".into(),
            country: "DE".into(),
            city: "berlin".into(),
            isp: "Example".into(),
            sdk_version: "1.0.70".into(),
            connected_since: Utc::now(),
        };
        store.put_node_record(&record, Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.touch_node_record("n1", Duration::from_secs(10)).await.unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.get_node_record("n1").await.unwrap().is_some());

        store.remove_node_record("n1").await.unwrap();
        assert!(!store.touch_node_record("n1", Duration::from_secs(10)).await.unwrap());
    }
}
