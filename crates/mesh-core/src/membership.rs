//! Curator-supplied membership and the reconciliation diff.
//!
//! The snapshot is always replaced wholesale, never merged. Reconciliation
//! decides which peers still need a link by comparing the snapshot against
//! the local liveness map.
//!
//! # Equality policy
//!
//! The two maps are considered reconciled when their **sizes** match. A
//! membership of `{A, B}` against liveness `{A, C}` therefore triggers no
//! dials: same-size-different-membership never reconciles on its own. This is
//! the deployed behaviour and is kept as is; [`missing_peers`] computes the
//! real set difference for callers that want it.

use crate::liveness::LivenessMap;
use crate::protocol::{Action, Payload};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Authoritative `peerName → IP` map from the curator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MembershipSnapshot(BTreeMap<String, String>);

impl MembershipSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(name, ip)| (name.as_str(), ip.as_str()))
    }
}

impl Payload for MembershipSnapshot {
    const ACTION: Action = Action::NodesInfo;
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MembershipSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, ip)| (name.into(), ip.into()))
                .collect(),
        )
    }
}

/// A peer the reconciler should open a link to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerTarget {
    pub name: String,
    pub ip: String,
}

impl PeerTarget {
    pub fn new(name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
        }
    }
}

/// Size-only equality check (see module docs).
pub fn is_reconciled(membership: &MembershipSnapshot, liveness: &LivenessMap) -> bool {
    membership.len() == liveness.len()
}

/// Membership entries with no entry in the liveness map.
pub fn missing_peers(membership: &MembershipSnapshot, liveness: &LivenessMap) -> Vec<PeerTarget> {
    membership
        .iter()
        .filter(|(name, _)| !liveness.contains(name))
        .map(|(name, ip)| PeerTarget::new(name, ip))
        .collect()
}

/// Peers to dial on one reconciliation pass: nothing when reconciled,
/// otherwise every missing peer.
pub fn plan(membership: &MembershipSnapshot, liveness: &LivenessMap) -> Vec<PeerTarget> {
    if is_reconciled(membership, liveness) {
        return Vec::new();
    }
    missing_peers(membership, liveness)
}
