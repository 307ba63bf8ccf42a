//! mesh-core: Protocol and state logic for the node liveness mesh.
//!
//! This crate provides the pieces that do not touch the network:
//! - Wire envelope and curator payloads
//! - Protocol routing decisions for curator and peer connections
//! - The liveness map and its transitions
//! - Membership snapshots and the reconciliation diff

pub mod liveness;
pub mod membership;
pub mod protocol;
pub mod router;

pub use liveness::{Liveness, LivenessMap, LivenessTransition};
pub use membership::{MembershipSnapshot, PeerTarget};
pub use protocol::{
    Action, AlertRecord, Envelope, NodeUpdate, Payload, ProtocolError, Registration,
};
pub use router::{route, Dispatch, Role};
