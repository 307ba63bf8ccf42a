//! Outbound peer links.
//!
//! A link is opened by the reconciler, reports the peer alive, then sits in
//! a receive loop. The first receive failure produces exactly one alert and
//! one dead transition, and the link exits. Reopening is left to the next
//! reconciliation pass.

use crate::config::Config;
use crate::reconciler::PeerDialer;
use crate::transport::{self, ClientStream, TransportError};
use async_trait::async_trait;
use futures::StreamExt;
use mesh_core::{Action, AlertRecord, Envelope, LivenessTransition, PeerTarget};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Dials peers at `<ip>:<peer_port><ws_path>`.
pub struct LinkDialer {
    self_name: String,
    port: u16,
    ws_path: String,
    probe_timeout: Duration,
    transitions: mpsc::UnboundedSender<LivenessTransition>,
    alerts: mpsc::UnboundedSender<AlertRecord>,
}

impl LinkDialer {
    pub fn new(
        config: &Config,
        self_name: &str,
        transitions: mpsc::UnboundedSender<LivenessTransition>,
        alerts: mpsc::UnboundedSender<AlertRecord>,
    ) -> Self {
        Self {
            self_name: self_name.to_string(),
            port: config.peer_port,
            ws_path: config.ws_path.clone(),
            probe_timeout: config.timing.probe_timeout(),
            transitions,
            alerts,
        }
    }
}

#[async_trait]
impl PeerDialer for LinkDialer {
    async fn open(&self, target: PeerTarget) -> Result<(), TransportError> {
        let addr = format!("{}:{}", target.ip, self.port);
        transport::probe(&addr, self.probe_timeout).await?;
        let ws = transport::connect(&transport::ws_url(&addr, &self.ws_path)).await?;

        let link = PeerLink {
            peer: target.name,
            self_name: self.self_name.clone(),
            transitions: self.transitions.clone(),
            alerts: self.alerts.clone(),
        };
        // Reported before the reader starts so the next pass sees it
        link.report(LivenessTransition::alive(&link.peer));
        tokio::spawn(link.run(ws));
        Ok(())
    }
}

/// One live outbound connection to a peer.
pub struct PeerLink {
    peer: String,
    self_name: String,
    transitions: mpsc::UnboundedSender<LivenessTransition>,
    alerts: mpsc::UnboundedSender<AlertRecord>,
}

impl PeerLink {
    /// Identify ourselves, then answer pings until the connection fails.
    pub async fn run(self, ws: ClientStream) {
        let (mut sink, mut stream) = ws.split();

        if self.self_name.is_empty() {
            debug!("No node name, not identifying to {}", self.peer);
        } else if let Err(e) =
            transport::send_envelope(&mut sink, &Envelope::identify(&self.self_name)).await
        {
            self.fail(e);
            return;
        }

        loop {
            let message = match transport::recv_envelope(&mut stream).await {
                Ok(message) => message,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            };

            match message.action() {
                Ok(Action::Ping) => {
                    if let Err(e) = transport::send_envelope(&mut sink, &Envelope::pong()).await {
                        self.fail(e);
                        return;
                    }
                }
                _ => debug!("Ignoring {} from peer {}", message.action, self.peer),
            }
        }
    }

    fn fail(&self, error: TransportError) {
        info!("Link to peer {} dropped: {}", self.peer, error);
        if self
            .alerts
            .send(AlertRecord::now(&self.self_name, &self.peer))
            .is_err()
        {
            debug!("Alert queue closed");
        }
        self.report(LivenessTransition::dead(&self.peer));
    }

    fn report(&self, transition: LivenessTransition) {
        if self.transitions.send(transition).is_err() {
            debug!("Liveness queue closed");
        }
    }
}
