use std::{collections::HashMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Durations are written to and read from config files as integer
/// milliseconds.
mod millis {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub api_addr: String,
    pub proxy_addr: String,
    pub hub: HubConfig,
    pub tunnel: TunnelConfig,
    pub proxy: ProxyConfig,
    pub score: ScoreConfig,
    pub connect: ConnectConfig,
    pub warm: WarmConfig,
    pub pool: PoolConfig,
    pub session: SessionConfig,
    pub gateway: GatewayConfig,
    pub events: EventConfig,
    pub store: StoreConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_addr: "0.0.0.0:8080".to_string(),
            proxy_addr: "0.0.0.0:8000".to_string(),
            hub: HubConfig::default(),
            tunnel: TunnelConfig::default(),
            proxy: ProxyConfig::default(),
            score: ScoreConfig::default(),
            connect: ConnectConfig::default(),
            warm: WarmConfig::default(),
            pool: PoolConfig::default(),
            session: SessionConfig::default(),
            gateway: GatewayConfig::default(),
            events: EventConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let config: RelayConfig = serde_json::from_slice(&std::fs::read(path)?)?;
        Ok(config)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Connects allowed per node inside one cooldown window
    pub cooldown_max_connects: usize,
    #[serde(with = "millis")]
    pub cooldown_window: Duration,
    /// How long a node is refused once it trips the limit
    #[serde(with = "millis")]
    pub cooldown_duration: Duration,
    #[serde(with = "millis")]
    pub ping_interval: Duration,
    #[serde(with = "millis")]
    pub pong_wait: Duration,
    #[serde(with = "millis")]
    pub hello_timeout: Duration,
    #[serde(with = "millis")]
    pub write_wait: Duration,
    pub send_queue: usize,
    pub disconnect_history: usize,
    pub min_sdk_version: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            cooldown_max_connects: 10,
            cooldown_window: Duration::from_secs(5 * 60),
            cooldown_duration: Duration::from_secs(10 * 60),
            ping_interval: Duration::from_secs(330),
            pong_wait: Duration::from_secs(45),
            hello_timeout: Duration::from_secs(10),
            write_wait: Duration::from_secs(10),
            send_queue: 256,
            disconnect_history: 1000,
            min_sdk_version: "1.0.62".to_string(),
        }
    }
}

impl HubConfig {
    /// Silence longer than this evicts the node.
    pub fn read_deadline(&self) -> Duration {
        self.ping_interval + self.pong_wait
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    #[serde(with = "millis")]
    pub open_timeout: Duration,
    pub queue_capacity: usize,
    #[serde(with = "millis")]
    pub write_timeout: Duration,
    /// Bound on handing one outbound frame to the connection writer
    #[serde(with = "millis")]
    pub frame_timeout: Duration,
    #[serde(with = "millis")]
    pub eof_timeout: Duration,
    /// Bound on delivering one inbound frame into a tunnel's queue
    #[serde(with = "millis")]
    pub deliver_timeout: Duration,
    #[serde(with = "millis")]
    pub sweep_interval: Duration,
    #[serde(with = "millis")]
    pub max_age: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(6),
            queue_capacity: 256,
            write_timeout: Duration::from_secs(5),
            frame_timeout: Duration::from_secs(10),
            eof_timeout: Duration::from_secs(5),
            deliver_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(30),
            max_age: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    #[serde(with = "millis")]
    pub default_timeout: Duration,
    #[serde(with = "millis")]
    pub sweep_interval: Duration,
    #[serde(with = "millis")]
    pub max_age: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
            max_age: Duration::from_secs(2 * 60),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreConfig {
    pub quarantine_min_samples: u64,
    pub quarantine_below: f64,
    #[serde(with = "millis")]
    pub quarantine_duration: Duration,
    /// Below this many samples a node sits in the exploration tier
    pub tier_min_samples: u64,
    pub good_rate: f64,
    pub good_share: f64,
    pub unknown_share: f64,
    /// Connection classes that are never ranked as good without evidence
    pub lower_trust: Vec<String>,
    #[serde(with = "millis")]
    pub prune_idle: Duration,
    #[serde(with = "millis")]
    pub prune_interval: Duration,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            quarantine_min_samples: 5,
            quarantine_below: 0.30,
            quarantine_duration: Duration::from_secs(10 * 60),
            tier_min_samples: 3,
            good_rate: 0.5,
            good_share: 0.80,
            unknown_share: 0.15,
            lower_trust: vec!["VPN".to_string(), "DCH".to_string(), "PUB".to_string()],
            prune_idle: Duration::from_secs(60 * 60),
            prune_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    pub candidates: usize,
    pub rounds: usize,
    #[serde(with = "millis")]
    pub stability_window: Duration,
    #[serde(with = "millis")]
    pub round_timeout: Duration,
    #[serde(with = "millis")]
    pub drain_timeout: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            candidates: 3,
            rounds: 2,
            stability_window: Duration::from_millis(300),
            round_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(12),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmConfig {
    pub enabled: bool,
    #[serde(with = "millis")]
    pub start_delay: Duration,
    #[serde(with = "millis")]
    pub check_interval: Duration,
    #[serde(with = "millis")]
    pub probe_timeout: Duration,
    pub batch_size: usize,
    #[serde(with = "millis")]
    pub fast_ttl: Duration,
    #[serde(with = "millis")]
    pub stats_interval: Duration,
    pub probe_host: String,
    pub probe_port: u16,
}

impl Default for WarmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start_delay: Duration::from_secs(5),
            check_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            batch_size: 32,
            fast_ttl: Duration::from_secs(10 * 60),
            stats_interval: Duration::from_secs(2 * 60),
            probe_host: "httpbin.org".to_string(),
            probe_port: 80,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub enabled: bool,
    pub size: usize,
    #[serde(with = "millis")]
    pub refill_interval: Duration,
    #[serde(with = "millis")]
    pub max_idle: Duration,
    #[serde(with = "millis")]
    pub open_timeout: Duration,
    pub refill_concurrency: usize,
    #[serde(with = "millis")]
    pub stats_interval: Duration,
    #[serde(with = "millis")]
    pub activate_write_timeout: Duration,
    #[serde(with = "millis")]
    pub activate_ack_timeout: Duration,
    /// How long the server side of a standby link waits for its target
    #[serde(with = "millis")]
    pub standby_wait: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size: 50,
            refill_interval: Duration::from_secs(5),
            max_idle: Duration::from_secs(2 * 60),
            open_timeout: Duration::from_secs(8),
            refill_concurrency: 10,
            stats_interval: Duration::from_secs(2 * 60),
            activate_write_timeout: Duration::from_secs(5),
            activate_ack_timeout: Duration::from_secs(8),
            standby_wait: Duration::from_secs(3 * 60),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(with = "millis")]
    pub ttl: Duration,
    #[serde(with = "millis")]
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub max_head_bytes: usize,
    #[serde(with = "millis")]
    pub head_timeout: Duration,
    pub max_body_bytes: usize,
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
    pub buffer_size: usize,
    /// A session that sent more than this and received less counts as a
    /// dead egress path.
    pub dead_egress_bytes: u64,
    /// account token -> api key. Empty admits every account.
    pub accounts: HashMap<String, String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
            head_timeout: Duration::from_secs(60),
            max_body_bytes: 1024 * 1024,
            idle_timeout: Duration::from_secs(60),
            buffer_size: 32 * 1024,
            dead_egress_bytes: 100,
            accounts: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub capacity: usize,
    pub workers: usize,
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    #[serde(with = "millis")]
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            workers: 2,
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub redis_url: Option<String>,
    #[serde(with = "millis")]
    pub op_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            op_timeout: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let raw = r#"{"hub": {"cooldown_max_connects": 3}, "connect": {"stability_window": 500}}"#;
        let config: RelayConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.hub.cooldown_max_connects, 3);
        assert_eq!(config.hub.cooldown_window, Duration::from_secs(300));
        assert_eq!(config.connect.stability_window, Duration::from_millis(500));
        assert_eq!(config.connect.rounds, 2);
        assert_eq!(config.hub.read_deadline(), Duration::from_secs(375));
    }
}
