//! Protocol dispatch by message kind and connection role.
//!
//! [`route`] is a pure decision function: it never blocks and never touches
//! shared state. The caller executes the returned [`Dispatch`], spawning any
//! follow-on work as independent tasks.

use crate::membership::MembershipSnapshot;
use crate::protocol::{Action, Envelope, NOT_IDENTIFIED};
use tracing::{debug, warn};

/// Which side of the mesh a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role<'a> {
    /// Our single connection to the curator
    Curator,
    /// An inbound connection from another agent, with the name it
    /// declared via `identify` (if any)
    Peer { identified: Option<&'a str> },
}

/// What the connection owner should do with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Send this envelope back on the same connection
    Reply(Envelope),
    /// Curator acknowledged our registration
    Registered,
    /// Replace the membership snapshot wholesale
    ReplaceMembership(MembershipSnapshot),
    /// Inbound peer pinged us: mark it alive and answer
    PeerAlive { peer: String, reply: Envelope },
    /// Inbound peer declared its node name
    Identify(String),
    /// Nothing to do
    Ignore,
}

/// Decide how to handle `message` received in `role`.
pub fn route(role: Role<'_>, message: &Envelope) -> Dispatch {
    let action = match message.action() {
        Ok(action) => action,
        Err(unknown) => {
            debug!("{}; replying notRecognized", unknown);
            return Dispatch::Reply(Envelope::not_recognized());
        }
    };

    match role {
        Role::Curator => route_curator(action, message),
        Role::Peer { identified } => route_peer(identified, action, message),
    }
}

fn route_curator(action: Action, message: &Envelope) -> Dispatch {
    match action {
        Action::Ping => Dispatch::Reply(Envelope::pong()),
        Action::RegistrationOk => Dispatch::Registered,
        Action::NodesInfo => match message.decode::<MembershipSnapshot>() {
            Ok(snapshot) => Dispatch::ReplaceMembership(snapshot),
            Err(e) => {
                warn!("Cannot update nodes info from curator: {}", e);
                Dispatch::Ignore
            }
        },
        Action::Pong => Dispatch::Ignore,
        Action::Error => {
            warn!("Curator reported error: {}", message.content);
            Dispatch::Ignore
        }
        _ => Dispatch::Reply(Envelope::not_recognized()),
    }
}

fn route_peer(identified: Option<&str>, action: Action, message: &Envelope) -> Dispatch {
    match action {
        Action::Identify => {
            let name = message.content.trim();
            if name.is_empty() {
                Dispatch::Reply(Envelope::error(NOT_IDENTIFIED))
            } else {
                Dispatch::Identify(name.to_string())
            }
        }
        Action::Pong => Dispatch::Ignore,
        Action::Error => {
            debug!(
                "Peer {} reported error: {}",
                identified.unwrap_or("<unidentified>"),
                message.content
            );
            Dispatch::Ignore
        }
        Action::Ping => match identified {
            Some(peer) => Dispatch::PeerAlive {
                peer: peer.to_string(),
                reply: Envelope::pong(),
            },
            None => Dispatch::Reply(Envelope::error(NOT_IDENTIFIED)),
        },
        _ => Dispatch::Reply(Envelope::not_recognized()),
    }
}
