//! Wire protocol between agents and the curator.
//!
//! - Envelope framing and action names
//! - Structured payloads carried in the envelope content

pub mod envelope;
pub mod payload;

pub use envelope::{
    Action, Envelope, Payload, ProtocolError, UnknownAction, NOT_IDENTIFIED, NOT_RECOGNIZED,
};
pub use payload::{format_timestamp, AlertRecord, NodeUpdate, Registration};
