//! Liveness aggregation and snapshot publishing.
//!
//! The [`StateAggregator`] is the only writer of the liveness map. Peer links
//! enqueue transitions; the aggregator applies them in order, shares the
//! result through a `watch` channel and reports it to the curator.

use crate::agent::Agent;
use mesh_core::{LivenessMap, LivenessTransition};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct StateAggregator {
    transitions: mpsc::UnboundedReceiver<LivenessTransition>,
    map: LivenessMap,
    snapshot: watch::Sender<LivenessMap>,
}

impl StateAggregator {
    pub fn new(
        transitions: mpsc::UnboundedReceiver<LivenessTransition>,
        snapshot: watch::Sender<LivenessMap>,
    ) -> Self {
        Self {
            transitions,
            map: LivenessMap::new(),
            snapshot,
        }
    }

    /// Apply one transition and share the new map. Returns whether the map
    /// changed.
    pub fn apply(&mut self, transition: &LivenessTransition) -> bool {
        let changed = self.map.apply(transition);
        if changed {
            info!("Peer {} is now {:?}", transition.peer, transition.state);
        } else {
            debug!("Peer {} already {:?}", transition.peer, transition.state);
        }
        self.snapshot.send_replace(self.map.clone());
        changed
    }

    /// Consume transitions for the life of the process, publishing after each.
    pub async fn run(mut self, agent: Arc<Agent>) {
        debug!("State aggregator started");
        while let Some(transition) = self.transitions.recv().await {
            self.apply(&transition);
            agent.publish(&self.map);
        }
        debug!("State aggregator stopped");
    }
}

/// Resend the full snapshot every publish interval until `token` is cancelled.
pub async fn publish_periodically(agent: Arc<Agent>, token: CancellationToken) {
    let interval = agent.config().timing.publish_interval();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => agent.publish(&agent.liveness()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::identity::NodeIdentity;
    use crate::reconciler::tests::RecordingDialer;
    use crate::supervisor::SupervisorState;
    use mesh_core::{Action, Liveness, NodeUpdate};
    use std::time::Duration;

    fn aggregator() -> (StateAggregator, watch::Receiver<LivenessMap>) {
        let (_tx, rx) = mpsc::unbounded_channel();
        let (snapshot, watcher) = watch::channel(LivenessMap::new());
        (StateAggregator::new(rx, snapshot), watcher)
    }

    fn registered_agent(publish_ms: u64) -> (Arc<Agent>, crate::agent::AgentQueues) {
        let mut config = Config::default();
        config.timing.publish_interval_ms = publish_ms;
        let identity = NodeIdentity {
            name: "me".into(),
            ip: "10.0.0.5".into(),
        };
        let (agent, queues) =
            Agent::with_dialer(config, identity, Arc::new(RecordingDialer::default()));
        agent.set_state(SupervisorState::Registered);
        (agent, queues)
    }

    // ==================== Applying transitions ====================

    #[test]
    fn test_apply_shares_snapshot() {
        let (mut agg, watcher) = aggregator();

        assert!(agg.apply(&LivenessTransition::alive("n1")));
        assert!(agg.apply(&LivenessTransition::alive("n2")));
        assert_eq!(watcher.borrow().len(), 2);

        assert!(agg.apply(&LivenessTransition::dead("n1")));
        let snapshot = watcher.borrow().clone();
        assert_eq!(snapshot.get("n1"), Liveness::Dead);
        assert!(!snapshot.contains("n1"));
        assert!(snapshot.contains("n2"));
    }

    #[test]
    fn test_repeated_transition_is_not_a_change() {
        let (mut agg, _watcher) = aggregator();
        assert!(agg.apply(&LivenessTransition::alive("n1")));
        assert!(!agg.apply(&LivenessTransition::alive("n1")));
        assert!(!agg.apply(&LivenessTransition::dead("n9")));
    }

    // ==================== Publishing ====================

    #[tokio::test]
    async fn test_every_transition_publishes_a_snapshot() {
        let (agent, mut queues) = registered_agent(60_000);
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot, _watcher) = watch::channel(LivenessMap::new());
        tokio::spawn(StateAggregator::new(rx, snapshot).run(agent.clone()));

        tx.send(LivenessTransition::alive("n1")).unwrap();
        tx.send(LivenessTransition::dead("n1")).unwrap();

        let first: NodeUpdate = queues
            .outbound
            .recv()
            .await
            .unwrap()
            .envelope
            .decode()
            .unwrap();
        assert_eq!(first.liveness.get("n1"), Some(&1));

        let second: NodeUpdate = queues
            .outbound
            .recv()
            .await
            .unwrap()
            .envelope
            .decode()
            .unwrap();
        assert!(second.liveness.is_empty());
    }

    #[tokio::test]
    async fn test_periodic_publisher_stops_on_cancel() {
        let (agent, mut queues) = registered_agent(10);
        let token = CancellationToken::new();
        let publisher = tokio::spawn(publish_periodically(agent.clone(), token.clone()));

        let update = tokio::time::timeout(Duration::from_secs(2), queues.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.envelope.action().unwrap(), Action::NodeUpdate);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), publisher)
            .await
            .unwrap()
            .unwrap();
    }
}
