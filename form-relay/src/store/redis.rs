use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use futures::Future;
use redis::{aio::ConnectionManager, AsyncCommands};

use super::{
    fast_key, lane, node_key, session_key, NodeRecord, SessionBinding, SharedStore, StoreError,
};

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Redis-backed store. Every command is bounded by `op_timeout` so an
/// unreachable server degrades routing instead of stalling relay I/O.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl RedisStore {
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(op_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(Self { conn, op_timeout })
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

const FAST_LANE_PATTERN: &str = "fastnode:*";

fn lane_of_key(key: &str) -> Option<String> {
    key.strip_prefix("fastnode:").map(lane)
}

fn ttl_secs(ttl: Duration) -> usize {
    ttl.as_secs().max(1) as usize
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn put_node_fast(&self, country: &str, node_id: &str, ttl: Duration) -> Result<(), StoreError> {
        let key = fast_key(country);
        let mut conn = self.conn.clone();
        self.bounded(
            redis::pipe()
                .atomic()
                .sadd(&key, node_id)
                .ignore()
                .expire(&key, ttl_secs(ttl))
                .ignore()
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn fast_nodes(&self, country: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(conn.smembers(fast_key(country))).await
    }

    async fn contains_fast(&self, country: &str, node_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(conn.sismember(fast_key(country), node_id)).await
    }

    async fn remove_node_fast(&self, country: &str, node_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self.bounded(conn.srem(fast_key(country), node_id)).await?;
        Ok(removed > 0)
    }

    async fn fast_lane_sizes(&self) -> Result<HashMap<String, usize>, StoreError> {
        let mut conn = self.conn.clone();
        // never KEYS on a shared server
        let mut keys: Vec<String> = self
            .bounded(async {
                let mut iter = conn.scan_match::<_, String>(FAST_LANE_PATTERN).await?;
                let mut keys = Vec::new();
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
                Ok::<_, redis::RedisError>(keys)
            })
            .await?;
        // a key may be reported more than once by a scan
        keys.sort_unstable();
        keys.dedup();

        let mut sizes = HashMap::new();
        for key in keys {
            let Some(lane) = lane_of_key(&key) else {
                continue;
            };
            let size: usize = self.bounded(conn.scard(&key)).await?;
            if size > 0 {
                sizes.insert(lane, size);
            }
        }
        Ok(sizes)
    }

    async fn get_session_binding(&self, session_id: &str) -> Result<Option<SessionBinding>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = self.bounded(conn.get(session_key(session_id))).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_session_binding(&self, binding: &SessionBinding, ttl: Duration) -> Result<(), StoreError> {
        let raw = serde_json::to_string(binding)?;
        let mut conn = self.conn.clone();
        self.bounded(conn.set_ex(session_key(&binding.session_id), raw, ttl_secs(ttl)))
            .await
    }

    async fn delete_session_binding(&self, session_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(conn.del(session_key(session_id))).await
    }

    async fn put_node_record(&self, record: &NodeRecord, ttl: Duration) -> Result<(), StoreError> {
        let raw = serde_json::to_string(record)?;
        let mut conn = self.conn.clone();
        self.bounded(conn.set_ex(node_key(&record.node_id), raw, ttl_secs(ttl)))
            .await
    }

    async fn touch_node_record(&self, node_id: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(conn.expire(node_key(node_id), ttl_secs(ttl))).await
    }

    async fn get_node_record(&self, node_id: &str) -> Result<Option<NodeRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = self.bounded(conn.get(node_key(node_id))).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn remove_node_record(&self, node_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(conn.del(node_key(node_id))).await
    }
}
