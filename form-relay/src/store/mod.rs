//! Cross-instance state shared by every relay process: fast-lane sets,
//! sticky session bindings and the node directory.
//!
//! Callers only see the typed [`SharedStore`] operations. Key layout is
//! private to each backend.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;

pub use memory::MemoryStore;

/// Country key used for the global fast lane.
pub const ANY_COUNTRY: &str = "ANY";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store operation timed out")]
    Timeout,

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A sticky session as persisted in the shared store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionBinding {
    pub session_id: String,
    pub node_id: String,
    pub node_address: String,
    pub country: String,
    pub city: String,
    pub request_count: u64,
    /// 0 disables count-based rotation
    pub rotate_after: u64,
    pub ttl_secs: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Directory entry mirroring a connected node for other instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub address: String,
    pub country: String,
    pub city: String,
    pub isp: String,
    pub sdk_version: String,
    pub connected_since: DateTime<Utc>,
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Adds a node to the fast lane for `country` (or the global lane when
    /// `country` is empty) and resets that lane's TTL.
    async fn put_node_fast(&self, country: &str, node_id: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn fast_nodes(&self, country: &str) -> Result<Vec<String>, StoreError>;

    async fn contains_fast(&self, country: &str, node_id: &str) -> Result<bool, StoreError>;

    /// Returns whether the node was a member.
    async fn remove_node_fast(&self, country: &str, node_id: &str) -> Result<bool, StoreError>;

    /// Lane sizes keyed by country code, including [`ANY_COUNTRY`].
    async fn fast_lane_sizes(&self) -> Result<HashMap<String, usize>, StoreError>;

    async fn get_session_binding(&self, session_id: &str) -> Result<Option<SessionBinding>, StoreError>;

    async fn put_session_binding(&self, binding: &SessionBinding, ttl: Duration) -> Result<(), StoreError>;

    async fn delete_session_binding(&self, session_id: &str) -> Result<(), StoreError>;

    async fn put_node_record(&self, record: &NodeRecord, ttl: Duration) -> Result<(), StoreError>;

    /// Extends an existing directory entry. Returns false if it had expired.
    async fn touch_node_record(&self, node_id: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn get_node_record(&self, node_id: &str) -> Result<Option<NodeRecord>, StoreError>;

    async fn remove_node_record(&self, node_id: &str) -> Result<(), StoreError>;
}

pub(crate) fn lane(country: &str) -> String {
    if country.is_empty() {
        ANY_COUNTRY.to_string()
    } else {
        country.to_uppercase()
    }
}

pub(crate) fn fast_key(country: &str) -> String {
    format!("fastnode:{}", lane(country))
}

pub(crate) fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

pub(crate) fn node_key(node_id: &str) -> String {
    format!("node:{node_id}")
}
