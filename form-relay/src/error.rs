use thiserror::Error;

use crate::store::StoreError;

/// Coarse classification used by callers to decide between retrying,
/// penalising a node or surfacing a gateway failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Capacity,
    Routing,
    Auth,
    Protocol,
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Node not connected: {0}")]
    NodeNotConnected(String),

    #[error("Node {node_id} is cooling down, retry after {retry_after_secs}s")]
    Cooldown {
        node_id: String,
        retry_after_secs: u64,
    },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Tunnel closed")]
    TunnelClosed,

    #[error("Tunnel open failed: {0}")]
    TunnelOpenFailed(String),

    #[error("Node {0} closed the tunnel inside the stability window")]
    FastEof(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Send queue full for node {0}")]
    SendQueueFull(String),

    #[error("Tunnel queue full")]
    TunnelQueueFull,

    #[error("Request cancelled")]
    Cancelled,

    #[error("No eligible nodes")]
    NoNodes,

    #[error("No stable tunnel after {0} rounds")]
    Exhausted(usize),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Proxy request failed: {0}")]
    ProxyFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Io(_)
            | RelayError::NodeNotConnected(_)
            | RelayError::TunnelClosed
            | RelayError::TunnelOpenFailed(_)
            | RelayError::FastEof(_)
            | RelayError::ProxyFailed(_)
            | RelayError::ConnectionClosed => ErrorKind::Transport,
            RelayError::Timeout(_) | RelayError::Cancelled => ErrorKind::Timeout,
            RelayError::SendQueueFull(_)
            | RelayError::TunnelQueueFull
            | RelayError::Cooldown { .. }
            | RelayError::Store(_) => ErrorKind::Capacity,
            RelayError::NoNodes | RelayError::Exhausted(_) => ErrorKind::Routing,
            RelayError::Unauthorized(_) => ErrorKind::Auth,
            RelayError::Json(_)
            | RelayError::MalformedFrame(_)
            | RelayError::InvalidRequest(_) => ErrorKind::Protocol,
        }
    }

    /// Timeouts and capacity rejections are transient; everything else is
    /// either terminal for the connection involved or a caller mistake.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Capacity)
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        RelayError::Timeout(what.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_capacity_are_retryable() {
        assert!(RelayError::timeout("tunnel ready").is_retryable());
        assert!(RelayError::SendQueueFull("n1".into()).is_retryable());
        assert!(!RelayError::TunnelClosed.is_retryable());
        assert_eq!(RelayError::Exhausted(2).kind(), ErrorKind::Routing);
        assert_eq!(RelayError::MalformedFrame("short".into()).kind(), ErrorKind::Protocol);
    }
}
