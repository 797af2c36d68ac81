//! Transport-neutral duplex channel between the relay and a node.
//!
//! The node session loop only ever sees a [`DuplexLink`]. The HTTP layer
//! bridges an axum WebSocket into one, tests drive the other end directly.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::debug;
use tokio::sync::mpsc;

use crate::error::RelayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

pub struct DuplexLink {
    pub tx: mpsc::Sender<WireMessage>,
    pub rx: mpsc::Receiver<WireMessage>,
}

impl DuplexLink {
    /// Two linked ends: whatever one sends the other receives.
    pub fn pair(capacity: usize) -> (DuplexLink, DuplexLink) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            DuplexLink { tx: a_tx, rx: a_rx },
            DuplexLink { tx: b_tx, rx: b_rx },
        )
    }

    pub async fn send(&self, msg: WireMessage) -> Result<(), RelayError> {
        self.tx.send(msg).await.map_err(|_| RelayError::ConnectionClosed)
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), RelayError> {
        self.send(WireMessage::Text(text.into())).await
    }

    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.rx.recv().await
    }

    /// Next text message, skipping keepalive traffic. `None` once the
    /// peer is gone or closed the link.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await? {
                WireMessage::Text(text) => return Some(text),
                WireMessage::Close => return None,
                _ => continue,
            }
        }
    }

    pub fn split(self) -> (mpsc::Sender<WireMessage>, mpsc::Receiver<WireMessage>) {
        (self.tx, self.rx)
    }
}

/// Pumps a WebSocket into a [`DuplexLink`]. Dropping the returned link
/// closes the socket.
pub fn attach_websocket(socket: WebSocket, capacity: usize) -> DuplexLink {
    let (ours, theirs) = DuplexLink::pair(capacity);
    let (inbound_tx, mut outbound_rx) = theirs.split();
    let (mut sink, mut stream) = socket.split();

    tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let msg = match msg {
                WireMessage::Text(t) => Message::Text(t),
                WireMessage::Binary(b) => Message::Binary(b.to_vec()),
                WireMessage::Ping(b) => Message::Ping(b.to_vec()),
                WireMessage::Pong(b) => Message::Pong(b.to_vec()),
                WireMessage::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = sink.send(msg).await {
                debug!("websocket write failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(next) = stream.next().await {
            let msg = match next {
                Ok(Message::Text(t)) => WireMessage::Text(t),
                Ok(Message::Binary(b)) => WireMessage::Binary(Bytes::from(b)),
                Ok(Message::Ping(b)) => WireMessage::Ping(Bytes::from(b)),
                Ok(Message::Pong(b)) => WireMessage::Pong(Bytes::from(b)),
                Ok(Message::Close(_)) => WireMessage::Close,
                Err(e) => {
                    debug!("websocket read failed: {e}");
                    break;
                }
            };
            let closing = msg == WireMessage::Close;
            if inbound_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    ours
}
