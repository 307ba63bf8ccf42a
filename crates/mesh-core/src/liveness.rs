//! Local record of which peers are currently reachable.
//!
//! Only alive peers are stored; an absent entry means dead. The map has a
//! single owner (the state aggregator); everyone else sees cloned snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reachability of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Liveness {
    Alive,
    Dead,
}

impl Liveness {
    /// `1` for alive, `0` for dead, as the curator expects.
    pub fn as_wire(&self) -> u8 {
        match self {
            Liveness::Alive => 1,
            Liveness::Dead => 0,
        }
    }
}

/// A peer changed reachability. Produced by peer links, consumed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessTransition {
    pub peer: String,
    pub state: Liveness,
}

impl LivenessTransition {
    pub fn alive(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            state: Liveness::Alive,
        }
    }

    pub fn dead(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            state: Liveness::Dead,
        }
    }
}

/// Map of reachable peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessMap {
    peers: BTreeMap<String, Liveness>,
}

impl LivenessMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one transition: alive upserts, dead deletes.
    ///
    /// Returns true if the map changed.
    pub fn apply(&mut self, transition: &LivenessTransition) -> bool {
        match transition.state {
            Liveness::Alive => self
                .peers
                .insert(transition.peer.clone(), Liveness::Alive)
                .is_none(),
            Liveness::Dead => self.peers.remove(&transition.peer).is_some(),
        }
    }

    /// Reachability of a peer (absent = dead).
    pub fn get(&self, peer: &str) -> Liveness {
        self.peers.get(peer).copied().unwrap_or(Liveness::Dead)
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// `peerName → 0|1` for a `nodeUpdate` payload.
    pub fn to_wire(&self) -> BTreeMap<String, u8> {
        self.peers
            .iter()
            .map(|(peer, state)| (peer.clone(), state.as_wire()))
            .collect()
    }
}
