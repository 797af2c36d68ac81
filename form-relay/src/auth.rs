//! Client credentials: `Proxy-Authorization: Basic base64(account:password)`
//! where the password is the api key followed by dash separated
//! `key-value` targeting pairs, e.g. `k3y-country-us-session-abc-rotate-20`.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionType {
    #[default]
    Sticky,
    Rotating,
    PerRequest,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteParams {
    pub country: Option<String>,
    pub city: Option<String>,
    pub session_id: Option<String>,
    pub session_type: SessionType,
    pub node: Option<String>,
    pub ip: Option<String>,
    pub rotate_after: Option<u64>,
    pub lifetime: Option<Duration>,
}

impl RouteParams {
    /// Session id that should pin this request to a node, if any.
    pub fn sticky_session(&self) -> Option<&str> {
        match self.session_type {
            SessionType::Sticky => self.session_id.as_deref().filter(|s| !s.is_empty()),
            _ => None,
        }
    }

    pub fn country(&self) -> &str {
        self.country.as_deref().unwrap_or("")
    }

    pub fn is_targeted(&self) -> bool {
        self.node.is_some() || self.ip.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credentials {
    pub account: String,
    pub api_key: String,
    pub params: RouteParams,
}

/// Parses a `Proxy-Authorization` header value. A missing header yields
/// anonymous credentials with no targeting.
pub fn parse_proxy_authorization(header: Option<&str>) -> Result<Credentials, RelayError> {
    let header = match header {
        Some(h) => h.trim(),
        None => return Ok(Credentials::default()),
    };
    let encoded = header
        .strip_prefix("Basic ")
        .ok_or_else(|| RelayError::Unauthorized("unsupported auth scheme".to_string()))?;
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| RelayError::Unauthorized("malformed basic credentials".to_string()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| RelayError::Unauthorized("malformed basic credentials".to_string()))?;
    let (account, password) = decoded
        .split_once(':')
        .ok_or_else(|| RelayError::Unauthorized("missing password".to_string()))?;

    let (api_key, params) = parse_password(password);
    Ok(Credentials {
        account: account.to_string(),
        api_key,
        params,
    })
}

/// Splits a password into its api key and targeting parameters. Unknown
/// tokens are skipped one at a time so new keys never break old clients.
pub fn parse_password(password: &str) -> (String, RouteParams) {
    let tokens: Vec<&str> = password.split('-').collect();
    let api_key = tokens.first().copied().unwrap_or_default().to_string();
    let mut params = RouteParams::default();

    let mut i = 1;
    while i + 1 < tokens.len() {
        let value = tokens[i + 1];
        let consumed = match tokens[i].to_ascii_lowercase().as_str() {
            "country" => {
                params.country = Some(value.to_uppercase());
                true
            }
            "city" => {
                params.city = Some(normalize_city(value));
                true
            }
            "session" | "sess" => {
                params.session_id = Some(value.to_string());
                true
            }
            "sesstype" | "stype" => {
                params.session_type = match value.to_ascii_lowercase().as_str() {
                    "rotating" | "rotate" => SessionType::Rotating,
                    "per_request" | "perrequest" | "request" => SessionType::PerRequest,
                    _ => SessionType::Sticky,
                };
                true
            }
            "node" => {
                params.node = Some(value.to_string());
                true
            }
            "ip" => {
                params.ip = Some(value.to_string());
                true
            }
            "rotate" => {
                params.rotate_after = value.parse().ok();
                true
            }
            "ttl" | "lifetime" => {
                params.lifetime = parse_lifetime(value);
                true
            }
            _ => false,
        };
        i += if consumed { 2 } else { 1 };
    }

    (api_key, params)
}

/// Longest sticky lifetime a client may ask for.
pub const MAX_LIFETIME: Duration = Duration::from_secs(7 * 24 * 3600);

/// `90s`, `30m`, `2h`, or bare minutes. Zero, overflowing and over-long
/// values are rejected.
pub fn parse_lifetime(raw: &str) -> Option<Duration> {
    let raw = raw.trim().to_ascii_lowercase();
    let (digits, unit) = match raw.chars().last()? {
        's' | 'm' | 'h' => raw.split_at(raw.len() - 1),
        _ => (raw.as_str(), "m"),
    };
    let n: u64 = digits.parse().ok()?;
    if n == 0 {
        return None;
    }
    let secs = match unit {
        "s" => n,
        "h" => n.checked_mul(3600)?,
        _ => n.checked_mul(60)?,
    };
    let lifetime = Duration::from_secs(secs);
    (lifetime <= MAX_LIFETIME).then_some(lifetime)
}

pub fn normalize_city(raw: &str) -> String {
    raw.trim().replace(['_', '+'], " ").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(user_pass: &str) -> String {
        format!("Basic {}", STANDARD.encode(user_pass))
    }

    #[test]
    fn parses_targeting_pairs() {
        let creds = parse_proxy_authorization(Some(&basic(
            "acme:k3y-country-us-city-new_york-session-abc123-rotate-20-ttl-45m",
        )))
        .unwrap();
        assert_eq!(creds.account, "acme");
        assert_eq!(creds.api_key, "k3y");
        assert_eq!(creds.params.country.as_deref(), Some("US"));
        assert_eq!(creds.params.city.as_deref(), Some("new york"));
        assert_eq!(creds.params.sticky_session(), Some("abc123"));
        assert_eq!(creds.params.rotate_after, Some(20));
        assert_eq!(creds.params.lifetime, Some(Duration::from_secs(45 * 60)));
    }

    #[test]
    fn rotating_sessions_do_not_pin() {
        let (_, params) = parse_password("k-session-abc-sesstype-rotating");
        assert_eq!(params.session_type, SessionType::Rotating);
        assert_eq!(params.sticky_session(), None);
    }

    #[test]
    fn unknown_tokens_are_skipped() {
        let (key, params) = parse_password("k-zone-residential-node-6f1c2a7e-ip-203.0.113.7");
        assert_eq!(key, "k");
        assert_eq!(params.node.as_deref(), Some("6f1c2a7e"));
        assert_eq!(params.ip.as_deref(), Some("203.0.113.7"));
        assert!(params.is_targeted());
    }

    #[test]
    fn missing_header_is_anonymous() {
        let creds = parse_proxy_authorization(None).unwrap();
        assert!(creds.account.is_empty());
        assert!(parse_proxy_authorization(Some("Bearer xyz")).is_err());
    }

    #[test]
    fn lifetimes() {
        assert_eq!(parse_lifetime("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_lifetime("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_lifetime("15"), Some(Duration::from_secs(900)));
        assert_eq!(parse_lifetime("soon"), None);
        assert_eq!(parse_lifetime("0m"), None);
    }

    #[test]
    fn oversized_lifetimes_are_rejected() {
        assert_eq!(parse_lifetime("168h"), Some(MAX_LIFETIME));
        assert_eq!(parse_lifetime("169h"), None);
        assert_eq!(parse_lifetime("18446744073709551615h"), None);
        assert_eq!(parse_lifetime("6148914691236517206"), None);
        assert_eq!(parse_lifetime("99999999999999999999s"), None);
    }
}
