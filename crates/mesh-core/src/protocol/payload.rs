//! Structured payloads exchanged with the curator.
//!
//! Field names match the curator's wire format, which is not uniformly
//! cased (`IP`/`NodeName` for registration, lowercase elsewhere).

use super::envelope::{Action, Payload};
use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sent once per curator session, after reader and writer are ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "NodeName")]
    pub node_name: String,
}

impl Payload for Registration {
    const ACTION: Action = Action::Registration;
}

/// Full liveness snapshot reported to the curator.
///
/// Values are `1` for alive; dead peers are simply absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub ip: String,
    #[serde(rename = "nodename")]
    pub node_name: String,
    #[serde(rename = "nodesAvailableMap")]
    pub liveness: BTreeMap<String, u8>,
}

impl Payload for NodeUpdate {
    const ACTION: Action = Action::NodeUpdate;
}

/// A peer link dropped. One record per failure, no retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecord {
    #[serde(rename = "nodename")]
    pub self_name: String,
    #[serde(rename = "disconnectednode")]
    pub disconnected_peer: String,
    #[serde(rename = "datetime")]
    pub timestamp: String,
}

impl AlertRecord {
    /// Build a record stamped with the current local time.
    pub fn now(self_name: &str, disconnected_peer: &str) -> Self {
        Self {
            self_name: self_name.to_string(),
            disconnected_peer: disconnected_peer.to_string(),
            timestamp: format_timestamp(&chrono::Local::now().naive_local()),
        }
    }
}

impl Payload for AlertRecord {
    const ACTION: Action = Action::Alert;
}

/// `DD.MM.YYYY HH:MM:SS.<nanos>`, nanoseconds unpadded.
pub fn format_timestamp(at: &NaiveDateTime) -> String {
    format!(
        "{}.{}",
        at.format("%d.%m.%Y %H:%M:%S"),
        at.nanosecond()
    )
}
