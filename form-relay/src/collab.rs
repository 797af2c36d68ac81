//! Narrow capabilities the relay consumes from systems it does not own:
//! account authorization, usage accounting and geo enrichment.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;

use crate::{auth::Credentials, error::RelayError};

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Admits or refuses a client request before any routing happens.
    async fn authorize(&self, credentials: &Credentials) -> Result<(), RelayError>;
}

/// Checks api keys against a fixed table. An empty table admits everyone.
pub struct StaticAuthorizer {
    accounts: HashMap<String, String>,
}

impl StaticAuthorizer {
    pub fn new(accounts: HashMap<String, String>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authorize(&self, credentials: &Credentials) -> Result<(), RelayError> {
        if self.accounts.is_empty() {
            return Ok(());
        }
        match self.accounts.get(&credentials.account) {
            Some(key) if *key == credentials.api_key => Ok(()),
            Some(_) => Err(RelayError::Unauthorized(format!(
                "bad api key for {}",
                credentials.account
            ))),
            None => Err(RelayError::Unauthorized(format!(
                "unknown account {:?}",
                credentials.account
            ))),
        }
    }
}

/// Bytes relayed for one client session.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub account: String,
    pub node_id: String,
    pub target: String,
    /// node -> client
    pub bytes_in: u64,
    /// client -> node
    pub bytes_out: u64,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn record(&self, usage: &UsageRecord) -> Result<(), RelayError>;
}

pub struct LogLedger;

#[async_trait]
impl UsageLedger for LogLedger {
    async fn record(&self, usage: &UsageRecord) -> Result<(), RelayError> {
        info!(
            "usage account={} node={} target={} in={} out={} duration={}ms",
            usage.account, usage.node_id, usage.target, usage.bytes_in, usage.bytes_out, usage.duration_ms
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GeoInfo {
    pub country: String,
    pub country_name: String,
    pub city: String,
    pub region: String,
    pub isp: String,
    pub asn: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[async_trait]
pub trait GeoResolver: Send + Sync {
    async fn lookup(&self, address: &str) -> Option<GeoInfo>;
}

/// Resolver used when no geo service is configured.
pub struct NoGeo;

#[async_trait]
impl GeoResolver for NoGeo {
    async fn lookup(&self, _address: &str) -> Option<GeoInfo> {
        None
    }
}

/// Fixed address table, handy for tests and static deployments.
#[derive(Default)]
pub struct StaticGeo {
    table: HashMap<String, GeoInfo>,
}

impl StaticGeo {
    pub fn new(table: HashMap<String, GeoInfo>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl GeoResolver for StaticGeo {
    async fn lookup(&self, address: &str) -> Option<GeoInfo> {
        self.table.get(address).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::parse_password;

    fn creds(account: &str, password: &str) -> Credentials {
        let (api_key, params) = parse_password(password);
        Credentials {
            account: account.to_string(),
            api_key,
            params,
        }
    }

    #[tokio::test]
    async fn static_authorizer_checks_keys() {
        let open = StaticAuthorizer::new(HashMap::new());
        assert!(open.authorize(&creds("anyone", "x")).await.is_ok());

        let auth = StaticAuthorizer::new(HashMap::from([("acme".to_string(), "k3y".to_string())]));
        assert!(auth.authorize(&creds("acme", "k3y-country-us")).await.is_ok());
        assert!(auth.authorize(&creds("acme", "nope")).await.is_err());
        assert!(auth.authorize(&creds("other", "k3y")).await.is_err());
    }
}
