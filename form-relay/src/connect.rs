//! Race-to-first-stable-tunnel connection establishment.
//!
//! Each round asks the selector for a few candidates, opens a tunnel on all
//! of them at once and keeps the first one that stays open through the
//! stability window. Losers are closed in the background.

use std::{
    collections::HashSet,
    sync::Arc,
    time::Duration,
};

use log::{debug, info, warn};
use tokio::{sync::mpsc, time::Instant};

use crate::{
    config::ConnectConfig,
    error::RelayError,
    select::NodeSelector,
    tunnel::{short, Tunnel, TunnelTransport},
};

/// The winning attempt of a race.
pub struct Connected {
    pub tunnel: Arc<Tunnel>,
    pub node_id: String,
    /// Time from the open request to the node's ready signal
    pub latency: Duration,
    pub round: usize,
    pub attempts: usize,
}

struct Attempt {
    node_id: String,
    latency: Duration,
    result: Result<Arc<Tunnel>, RelayError>,
}

pub struct ConnectOrchestrator {
    config: ConnectConfig,
    selector: Arc<dyn NodeSelector>,
    transport: Arc<dyn TunnelTransport>,
}

impl ConnectOrchestrator {
    pub fn new(
        config: ConnectConfig,
        selector: Arc<dyn NodeSelector>,
        transport: Arc<dyn TunnelTransport>,
    ) -> Self {
        Self {
            config,
            selector,
            transport,
        }
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    pub fn selector(&self) -> &Arc<dyn NodeSelector> {
        &self.selector
    }

    pub async fn connect(&self, country: &str, host: &str, port: u16) -> Result<Connected, RelayError> {
        self.connect_excluding(country, host, port, HashSet::new()).await
    }

    /// Opens a tunnel through one specific node, held through the same
    /// stability window as a race.
    pub async fn connect_node(&self, node_id: &str, host: &str, port: u16) -> Result<Connected, RelayError> {
        let attempt = attempt(
            self.transport.as_ref(),
            node_id.to_string(),
            host,
            port,
            self.config.stability_window,
        )
        .await;
        let success = attempt.result.is_ok();
        self.selector.record_result(&attempt.node_id, success, attempt.latency);
        Ok(Connected {
            tunnel: attempt.result?,
            node_id: attempt.node_id,
            latency: attempt.latency,
            round: 1,
            attempts: 1,
        })
    }

    /// Like [`connect`](Self::connect) but never tries the nodes in `tried`.
    pub async fn connect_excluding(
        &self,
        country: &str,
        host: &str,
        port: u16,
        mut tried: HashSet<String>,
    ) -> Result<Connected, RelayError> {
        let rounds = self.config.rounds.max(1);
        let mut attempts = 0;

        for round in 1..=rounds {
            let candidates = self
                .selector
                .top_nodes(country, self.config.candidates.max(1), &tried)
                .await;
            if candidates.is_empty() {
                if attempts == 0 {
                    return Err(RelayError::NoNodes);
                }
                break;
            }

            let ids: Vec<String> = candidates.iter().map(|c| c.node_id().to_string()).collect();
            debug!("round {round}/{rounds} for {host}:{port}: racing {ids:?}");
            attempts += ids.len();
            tried.extend(ids.iter().cloned());

            if let Some(mut winner) = self.race(ids, host, port).await {
                winner.round = round;
                winner.attempts = attempts;
                info!(
                    "connected {host}:{port} via {} in {:?} (round {round}, {attempts} attempts)",
                    winner.node_id, winner.latency
                );
                return Ok(winner);
            }
        }

        warn!("no stable tunnel to {host}:{port} after {attempts} attempts");
        Err(RelayError::Exhausted(attempts))
    }

    async fn race(&self, node_ids: Vec<String>, host: &str, port: u16) -> Option<Connected> {
        let (tx, mut rx) = mpsc::channel::<Attempt>(node_ids.len());
        let mut pending = node_ids.len();

        for node_id in node_ids {
            let tx = tx.clone();
            let transport = self.transport.clone();
            let host = host.to_string();
            let window = self.config.stability_window;
            tokio::spawn(async move {
                let attempt = attempt(transport.as_ref(), node_id, &host, port, window).await;
                // nobody is listening anymore: do not leak the tunnel
                if let Err(mpsc::error::SendError(late)) = tx.send(attempt).await {
                    if let Ok(tunnel) = late.result {
                        transport.close(tunnel.id()).await;
                    }
                }
            });
        }
        drop(tx);

        let deadline = Instant::now() + self.config.round_timeout;
        let mut winner = None;
        while pending > 0 {
            let Ok(Some(attempt)) = tokio::time::timeout_at(deadline, rx.recv()).await else {
                break;
            };
            pending -= 1;
            match attempt.result {
                Ok(tunnel) => {
                    self.selector.record_result(&attempt.node_id, true, attempt.latency);
                    winner = Some(Connected {
                        tunnel,
                        node_id: attempt.node_id,
                        latency: attempt.latency,
                        round: 0,
                        attempts: 0,
                    });
                    break;
                }
                Err(e) => {
                    debug!("attempt via {} failed: {e}", attempt.node_id);
                    self.selector.record_result(&attempt.node_id, false, attempt.latency);
                }
            }
        }

        if pending > 0 {
            self.drain(rx, pending);
        }
        winner
    }

    /// Scores and closes the attempts still running once a round is over.
    fn drain(&self, mut rx: mpsc::Receiver<Attempt>, mut pending: usize) {
        let selector = self.selector.clone();
        let transport = self.transport.clone();
        let drain_timeout = self.config.drain_timeout;
        tokio::spawn(async move {
            let deadline = Instant::now() + drain_timeout;
            while pending > 0 {
                let Ok(Some(attempt)) = tokio::time::timeout_at(deadline, rx.recv()).await else {
                    break;
                };
                pending -= 1;
                match attempt.result {
                    Ok(tunnel) => {
                        selector.record_result(&attempt.node_id, true, attempt.latency);
                        debug!("closing losing tunnel {} via {}", short(tunnel.id()), attempt.node_id);
                        transport.close(tunnel.id()).await;
                    }
                    Err(_) => selector.record_result(&attempt.node_id, false, attempt.latency),
                }
            }
            if pending > 0 {
                debug!("{pending} race attempts still running after drain timeout");
            }
        });
    }
}

/// Opens one tunnel and holds it through the stability window. A peer
/// close inside the window is a fast EOF and counts as a failure.
async fn attempt(
    transport: &dyn TunnelTransport,
    node_id: String,
    host: &str,
    port: u16,
    window: Duration,
) -> Attempt {
    let started = Instant::now();
    let tunnel = match transport.open(&node_id, host, port).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            return Attempt {
                node_id,
                latency: started.elapsed(),
                result: Err(e),
            }
        }
    };
    let latency = started.elapsed();

    let result = tokio::select! {
        _ = tunnel.closed() => {
            transport.close(tunnel.id()).await;
            Err(RelayError::FastEof(node_id.clone()))
        }
        _ = tokio::time::sleep(window) => Ok(tunnel),
    };
    Attempt {
        node_id,
        latency,
        result,
    }
}
