//! Membership reconciliation: dial peers the curator lists but we have no
//! link to.
//!
//! Runs once per registered session. Each pass compares the current
//! membership snapshot with the liveness map using the size-only policy from
//! [`mesh_core::membership`], then opens links to the missing peers without
//! waiting for them.

use crate::transport::TransportError;
use async_trait::async_trait;
use mesh_core::membership;
use mesh_core::{LivenessMap, MembershipSnapshot, PeerTarget};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Opens an outbound link to one peer.
///
/// `open` returns once the link is established (its reader running in the
/// background) or has failed.
#[async_trait]
pub trait PeerDialer: Send + Sync {
    async fn open(&self, target: PeerTarget) -> Result<(), TransportError>;
}

pub struct Reconciler {
    membership: watch::Receiver<MembershipSnapshot>,
    liveness: watch::Receiver<LivenessMap>,
    dialer: Arc<dyn PeerDialer>,
    interval: Duration,
    /// Peers with an open attempt still running
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Reconciler {
    pub fn new(
        membership: watch::Receiver<MembershipSnapshot>,
        liveness: watch::Receiver<LivenessMap>,
        dialer: Arc<dyn PeerDialer>,
        interval: Duration,
    ) -> Self {
        Self {
            membership,
            liveness,
            dialer,
            interval,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// One reconciliation pass. Returns the number of opens started.
    pub fn pass(&self) -> usize {
        let membership = self.membership.borrow().clone();
        let liveness = self.liveness.borrow().clone();

        let targets = membership::plan(&membership, &liveness);
        if targets.is_empty() {
            return 0;
        }
        debug!(
            "Membership has {} node(s), liveness has {}; {} missing",
            membership.len(),
            liveness.len(),
            targets.len()
        );

        let mut started = 0;
        for target in targets {
            if !self.claim(&target.name) {
                debug!("Open to {} already in flight", target.name);
                continue;
            }
            started += 1;

            let dialer = self.dialer.clone();
            let in_flight = self.in_flight.clone();
            tokio::spawn(async move {
                let name = target.name.clone();
                let ip = target.ip.clone();
                match dialer.open(target).await {
                    Ok(()) => info!("Opened link to {} ({})", name, ip),
                    Err(e) => warn!("Cannot open link to {} ({}): {}", name, ip, e),
                }
                release(&in_flight, &name);
            });
        }
        started
    }

    /// Pass every interval until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) {
        debug!("Reconciler started, interval {:?}", self.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    self.pass();
                }
            }
        }
        debug!("Reconciler stopped");
    }

    fn claim(&self, peer: &str) -> bool {
        let mut in_flight = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        in_flight.insert(peer.to_string())
    }
}

fn release(in_flight: &Mutex<HashSet<String>>, peer: &str) {
    let mut in_flight = match in_flight.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    in_flight.remove(peer);
}
