//! Forwarding of peer disconnect alerts to the curator.

use crate::agent::Agent;
use mesh_core::{AlertRecord, Payload};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Single consumer of [`AlertRecord`]s.
///
/// Every record is forwarded: a flapping peer produces one alert per drop.
pub struct AlertPipeline {
    alerts: mpsc::UnboundedReceiver<AlertRecord>,
}

impl AlertPipeline {
    pub fn new(alerts: mpsc::UnboundedReceiver<AlertRecord>) -> Self {
        Self { alerts }
    }

    pub async fn run(mut self, agent: Arc<Agent>) {
        debug!("Alert pipeline started");
        while let Some(alert) = self.alerts.recv().await {
            warn!(
                node = %alert.self_name,
                disconnected = %alert.disconnected_peer,
                at = %alert.timestamp,
                "Peer disconnected"
            );
            agent.send_to_curator(alert.to_envelope());
        }
        debug!("Alert pipeline stopped");
    }
}
