//! Wire envelope shared by the curator link and peer links.
//!
//! Every frame is a JSON object `{"action": ..., "content": ...}` sent as a
//! websocket text frame. `content` is itself serialized JSON for structured
//! payloads, a bare code string for `error`, and empty for `ping`/`pong`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Error code sent back for an action outside the known set.
pub const NOT_RECOGNIZED: &str = "notRecognized";

/// Error code sent back when an inbound peer talks before identifying itself.
pub const NOT_IDENTIFIED: &str = "notIdentified";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("Malformed {action} payload: {source}")]
    Payload {
        action: Action,
        #[source]
        source: serde_json::Error,
    },

    #[error("Expected {expected} envelope, got {found:?}")]
    UnexpectedAction { expected: Action, found: String },
}

/// Every action this agent understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Ping,
    Pong,
    Registration,
    RegistrationOk,
    NodesInfo,
    NodeUpdate,
    Alert,
    Error,
    /// Peer declares its node name on an inbound connection
    Identify,
}

impl Action {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Ping => "ping",
            Action::Pong => "pong",
            Action::Registration => "registration",
            Action::RegistrationOk => "registrationOk",
            Action::NodesInfo => "nodesInfo",
            Action::NodeUpdate => "nodeUpdate",
            Action::Alert => "alert",
            Action::Error => "error",
            Action::Identify => "identify",
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when an action string is outside the known set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unrecognized action: {0:?}")]
pub struct UnknownAction(pub String);

impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let action = match s {
            "ping" => Action::Ping,
            "pong" => Action::Pong,
            "registration" => Action::Registration,
            "registrationOk" => Action::RegistrationOk,
            "nodesInfo" => Action::NodesInfo,
            "nodeUpdate" => Action::NodeUpdate,
            "alert" => Action::Alert,
            "error" => Action::Error,
            "identify" => Action::Identify,
            other => return Err(UnknownAction(other.to_string())),
        };
        Ok(action)
    }
}

/// A structured payload carried in an envelope's `content` field.
pub trait Payload: Serialize + DeserializeOwned {
    /// The action this payload travels under.
    const ACTION: Action;

    /// Wrap this payload in an envelope.
    fn to_envelope(&self) -> Envelope {
        // Payload types are plain string/number maps; serialization cannot fail.
        let content =
            serde_json::to_string(self).expect("payload serialization should not fail");
        Envelope::new(Self::ACTION, content)
    }
}

/// One logical message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(default)]
    pub content: String,
}

impl Envelope {
    pub fn new(action: Action, content: impl Into<String>) -> Self {
        Self {
            action: action.as_str().to_string(),
            content: content.into(),
        }
    }

    /// Envelope with empty content.
    pub fn bare(action: Action) -> Self {
        Self::new(action, "")
    }

    pub fn ping() -> Self {
        Self::bare(Action::Ping)
    }

    pub fn pong() -> Self {
        Self::bare(Action::Pong)
    }

    /// `{error, <code>}`
    pub fn error(code: &str) -> Self {
        Self::new(Action::Error, code)
    }

    pub fn not_recognized() -> Self {
        Self::error(NOT_RECOGNIZED)
    }

    pub fn identify(node_name: &str) -> Self {
        Self::new(Action::Identify, node_name)
    }

    /// Parse the action string. Unknown actions are an error, not a panic.
    pub fn action(&self) -> Result<Action, UnknownAction> {
        self.action.parse()
    }

    /// Decode the content as the payload type `T`.
    ///
    /// Fails if the envelope carries a different action or the content is
    /// not valid JSON for `T`.
    pub fn decode<T: Payload>(&self) -> Result<T, ProtocolError> {
        if self.action != T::ACTION.as_str() {
            return Err(ProtocolError::UnexpectedAction {
                expected: T::ACTION,
                found: self.action.clone(),
            });
        }
        serde_json::from_str(&self.content).map_err(|source| ProtocolError::Payload {
            action: T::ACTION,
            source,
        })
    }

    /// Serialize to the JSON text sent in a websocket frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Envelope serialization should not fail")
    }

    /// Parse a frame's JSON text.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Envelope)
    }
}
