//! JSON control messages exchanged with nodes over the text channel.

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Hello(Hello),
    Welcome(Welcome),
    Cooldown(CooldownNotice),
    /// Kept as raw JSON so a malformed payload can be answered with an
    /// error instead of being dropped as an unknown message.
    Register {
        #[serde(default)]
        data: Value,
    },
    RegistrationSuccess {
        data: RegistrationAck,
    },
    Heartbeat {
        #[serde(default)]
        data: Value,
    },
    HeartbeatAck {
        data: HeartbeatAck,
    },
    Keepalive,
    KeepaliveAck,
    IpInfo(IpInfoUpdate),
    TunnelOpen {
        data: TunnelOpen,
    },
    TunnelResponse {
        data: TunnelResponse,
    },
    TunnelData {
        data: TunnelDataMessage,
    },
    TunnelStats(TunnelStats),
    ProxyRequest {
        data: ProxyRequest,
    },
    ProxyResponse {
        data: ProxyResponse,
    },
    Error {
        data: ErrorBody,
    },
}

impl ControlMessage {
    pub fn to_text(&self) -> String {
        // Every variant is plain data with string keys.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        ControlMessage::Error {
            data: ErrorBody {
                error: message.into(),
                timestamp: now_rfc3339(),
            },
        }
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Hello {
    pub node_id: String,
    pub device_model: Option<String>,
    pub sdk_version: Option<String>,
    pub os: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Welcome {
    /// seconds
    pub ping_interval: u64,
    pub server_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownNotice {
    pub reason: String,
    pub retry_after_sec: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationData {
    pub device_id: String,
    pub ip_address: String,
    pub country: String,
    pub country_name: String,
    pub city: String,
    pub region: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Some SDK builds send a number, others a string.
    pub asn: Value,
    pub isp: String,
    pub carrier: String,
    pub connection_type: String,
    pub device_type: String,
    pub sdk_version: String,
    pub loc: String,
    pub org: String,
    pub timezone: String,
}

impl RegistrationData {
    pub fn asn_string(&self) -> Option<String> {
        match &self.asn {
            Value::Number(n) if n.as_i64() != Some(0) => Some(n.to_string()),
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationAck {
    pub node_id: String,
    pub status: String,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub node_id: String,
    pub timestamp: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IpInfoUpdate {
    pub ip: Option<String>,
    pub ip_info: Option<IpInfoBody>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IpInfoBody {
    pub country_code: Option<String>,
    pub city_name: Option<String>,
    pub isp: Option<String>,
    pub asn: Option<String>,
    pub proxy: Option<ProxyClass>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyClass {
    pub proxy_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelOpen {
    pub tunnel_id: String,
    pub host: String,
    pub port: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelResponse {
    pub tunnel_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Legacy JSON data path, payload base64 encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelDataMessage {
    pub tunnel_id: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub eof: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TunnelStats {
    pub tunnel_id: String,
    pub bytes_sent_to_target: u64,
    pub bytes_recv_from_target: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyRequest {
    #[serde(default)]
    pub request_id: String,
    pub host: String,
    pub port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    /// base64
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    /// base64
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub bytes_read: u64,
    pub bytes_write: u64,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub timestamp: String,
}
