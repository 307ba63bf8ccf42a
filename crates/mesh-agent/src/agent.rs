//! Shared agent state and the channels between its tasks.
//!
//! Every long-running task holds an `Arc<Agent>` and talks to the others
//! through it:
//! - the curator outbound queue (drained by the supervisor's writer)
//! - the liveness transition queue (drained by the [`StateAggregator`])
//! - the alert queue (drained by the [`AlertPipeline`](crate::alerts::AlertPipeline))
//!
//! Membership and liveness are published through `watch` channels, so readers
//! always see a whole snapshot and never a map being edited.

use crate::aggregator::{self, StateAggregator};
use crate::config::Config;
use crate::identity::NodeIdentity;
use crate::peer_link::LinkDialer;
use crate::reconciler::{PeerDialer, Reconciler};
use crate::supervisor::{Session, SupervisorState};
use mesh_core::{
    AlertRecord, Dispatch, Envelope, LivenessMap, LivenessTransition, MembershipSnapshot,
    NodeUpdate, Payload, Registration,
};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// A message waiting for the curator writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CuratorMessage {
    pub envelope: Envelope,
    /// Id of the session this answers. Untagged messages go to any session.
    pub session: Option<u64>,
}

impl CuratorMessage {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            session: None,
        }
    }

    pub fn for_session(envelope: Envelope, session: u64) -> Self {
        Self {
            envelope,
            session: Some(session),
        }
    }

    /// Whether the writer of session `current` may send this.
    pub fn belongs_to(&self, current: u64) -> bool {
        self.session.is_none_or(|id| id == current)
    }
}

/// Receiving ends handed to the tasks that own them.
pub struct AgentQueues {
    /// Messages bound for the curator
    pub outbound: mpsc::UnboundedReceiver<CuratorMessage>,
    /// Disconnect alerts
    pub alerts: mpsc::UnboundedReceiver<AlertRecord>,
}

pub struct Agent {
    identity: NodeIdentity,
    config: Config,
    outbound: mpsc::UnboundedSender<CuratorMessage>,
    transitions: mpsc::UnboundedSender<LivenessTransition>,
    alerts: mpsc::UnboundedSender<AlertRecord>,
    membership: watch::Sender<MembershipSnapshot>,
    liveness: watch::Receiver<LivenessMap>,
    state: watch::Sender<SupervisorState>,
    /// Taken by the first registration; later sessions reuse the running one
    aggregator: Mutex<Option<StateAggregator>>,
    dialer: Arc<dyn PeerDialer>,
}

impl Agent {
    /// Build the agent with real outbound peer links.
    pub fn new(config: Config, identity: NodeIdentity) -> (Arc<Self>, AgentQueues) {
        Self::assemble(config, identity, None)
    }

    /// Build the agent with a custom dialer (used by tests).
    pub fn with_dialer(
        config: Config,
        identity: NodeIdentity,
        dialer: Arc<dyn PeerDialer>,
    ) -> (Arc<Self>, AgentQueues) {
        Self::assemble(config, identity, Some(dialer))
    }

    fn assemble(
        config: Config,
        identity: NodeIdentity,
        dialer: Option<Arc<dyn PeerDialer>>,
    ) -> (Arc<Self>, AgentQueues) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (transitions_tx, transitions_rx) = mpsc::unbounded_channel();
        let (alerts_tx, alerts_rx) = mpsc::unbounded_channel();
        let (membership, _) = watch::channel(MembershipSnapshot::new());
        let (liveness_tx, liveness_rx) = watch::channel(LivenessMap::new());
        let (state, _) = watch::channel(SupervisorState::Disconnected);

        let dialer = dialer.unwrap_or_else(|| {
            Arc::new(LinkDialer::new(
                &config,
                &identity.name,
                transitions_tx.clone(),
                alerts_tx.clone(),
            ))
        });

        let agent = Arc::new(Self {
            identity,
            config,
            outbound: outbound_tx,
            transitions: transitions_tx,
            alerts: alerts_tx,
            membership,
            liveness: liveness_rx,
            state,
            aggregator: Mutex::new(Some(StateAggregator::new(transitions_rx, liveness_tx))),
            dialer,
        });

        let queues = AgentQueues {
            outbound: outbound_rx,
            alerts: alerts_rx,
        };
        (agent, queues)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registration payload for a new curator session.
    pub fn registration(&self) -> Envelope {
        Registration {
            ip: self.identity.ip.clone(),
            node_name: self.identity.name.clone(),
        }
        .to_envelope()
    }

    // ==================== Queues ====================

    /// Enqueue a message for the curator. Delivered by the current (or next)
    /// session's writer.
    pub fn send_to_curator(&self, envelope: Envelope) {
        self.enqueue(CuratorMessage::new(envelope));
    }

    /// Enqueue a reply that is dropped if `session` ends before it is sent.
    pub fn reply_to_curator(&self, envelope: Envelope, session: &Session) {
        self.enqueue(CuratorMessage::for_session(envelope, session.id()));
    }

    fn enqueue(&self, message: CuratorMessage) {
        if self.outbound.send(message).is_err() {
            warn!("Curator queue is closed, dropping message");
        }
    }

    pub fn report_transition(&self, transition: LivenessTransition) {
        if self.transitions.send(transition).is_err() {
            warn!("Liveness queue is closed, dropping transition");
        }
    }

    pub fn report_alert(&self, alert: AlertRecord) {
        if self.alerts.send(alert).is_err() {
            warn!("Alert queue is closed, dropping alert");
        }
    }

    // ==================== Shared state ====================

    /// Swap in a new membership snapshot in one step.
    pub fn replace_membership(&self, snapshot: MembershipSnapshot) {
        info!("Membership updated: {} node(s)", snapshot.len());
        self.membership.send_replace(snapshot);
    }

    pub fn membership(&self) -> MembershipSnapshot {
        self.membership.borrow().clone()
    }

    pub fn subscribe_membership(&self) -> watch::Receiver<MembershipSnapshot> {
        self.membership.subscribe()
    }

    /// Latest liveness snapshot written by the aggregator.
    pub fn liveness(&self) -> LivenessMap {
        self.liveness.borrow().clone()
    }

    pub fn subscribe_liveness(&self) -> watch::Receiver<LivenessMap> {
        self.liveness.clone()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn set_state(&self, state: SupervisorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Supervisor state: {:?} -> {:?}", previous, state);
        }
    }

    pub fn is_registered(&self) -> bool {
        self.state() == SupervisorState::Registered
    }

    // ==================== Curator side ====================

    /// Send a full liveness snapshot to the curator, if registered.
    pub fn publish(&self, liveness: &LivenessMap) {
        if !self.is_registered() {
            debug!("Not registered, skipping liveness publish");
            return;
        }
        let update = NodeUpdate {
            ip: self.identity.ip.clone(),
            node_name: self.identity.name.clone(),
            liveness: liveness.to_wire(),
        };
        self.send_to_curator(update.to_envelope());
    }

    /// Carry out a routing decision made on the curator connection.
    pub fn dispatch_curator(self: &Arc<Self>, dispatch: Dispatch, session: &Arc<Session>) {
        match dispatch {
            Dispatch::Reply(envelope) => self.reply_to_curator(envelope, session),
            Dispatch::Registered => {
                self.on_registered(session);
            }
            Dispatch::ReplaceMembership(snapshot) => self.replace_membership(snapshot),
            Dispatch::PeerAlive { .. } | Dispatch::Identify(_) => {
                debug!("Ignoring peer-side dispatch on curator connection");
            }
            Dispatch::Ignore => {}
        }
    }

    /// Handle `registrationOk`: mark the session registered and start its
    /// dependent tasks.
    ///
    /// Returns `false` (and starts nothing) on a duplicate acknowledgment
    /// within the same session.
    pub fn on_registered(self: &Arc<Self>, session: &Arc<Session>) -> bool {
        if !session.claim_dependents() {
            debug!("Duplicate registrationOk, dependents already running");
            return false;
        }

        self.set_state(SupervisorState::Registered);
        info!("Registered with curator as {:?}", self.identity.name);

        if let Some(aggregator) = self.take_aggregator() {
            tokio::spawn(aggregator.run(self.clone()));
        }

        let reconciler = Reconciler::new(
            self.subscribe_membership(),
            self.subscribe_liveness(),
            self.dialer.clone(),
            self.config.timing.reconcile_interval(),
        );
        tokio::spawn(reconciler.run(session.token().clone()));
        tokio::spawn(aggregator::publish_periodically(
            self.clone(),
            session.token().clone(),
        ));

        self.publish(&self.liveness());
        true
    }

    fn take_aggregator(&self) -> Option<StateAggregator> {
        match self.aggregator.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}
