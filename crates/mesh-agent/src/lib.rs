//! mesh-agent library: the agent's tasks, exposed for integration tests.
//!
//! The binary in `main.rs` wires these together; `tests/e2e.rs` drives them
//! against a fake curator and fake peers.

pub mod agent;
pub mod aggregator;
pub mod alerts;
pub mod config;
pub mod identity;
pub mod peer_link;
pub mod reconciler;
pub mod server;
pub mod supervisor;
pub mod transport;

// Re-export key types for convenience
pub use agent::{Agent, AgentQueues, CuratorMessage};
pub use alerts::AlertPipeline;
pub use config::Config;
pub use identity::NodeIdentity;
pub use reconciler::{PeerDialer, Reconciler};
pub use server::{InboundLiveness, PeerServer};
pub use supervisor::{Session, Supervisor, SupervisorState};
