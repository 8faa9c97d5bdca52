//! Event types carried by the event bus.
//!
//! The bus moves opaque `Event { topic, payload, sequence }` values.
//! Producers encode a typed envelope into the payload and consumers decode it
//! again; the bus never looks inside.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::checkin::CheckinMessage;
use crate::connect::ConnectResponse;
use crate::error::Result;

/// Topic names.
pub mod topics {
    pub const AUTHENTICATE: &str = "mdm.Authenticate";
    pub const TOKEN_UPDATE: &str = "mdm.TokenUpdate";
    pub const CHECK_OUT: &str = "mdm.CheckOut";
    /// Command creation.
    pub const COMMAND: &str = "mdm.Command";
    /// Every processed connect/acknowledge exchange.
    pub const CONNECT: &str = "mdm.Connect";
}

/// A message on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Position in the bus-wide dispatch order, assigned by the dispatcher.
    /// Lets a consumer of several topics restore publish order across them.
    pub sequence: u64,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            sequence: 0,
        }
    }
}

/// Encode an envelope into bus payload bytes.
///
/// bincode is deterministic for these types, so `encode(decode(b)) == b`.
pub fn encode<T: Serialize>(envelope: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(envelope)?)
}

/// Decode an envelope from bus payload bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Generate a new unique envelope identifier.
pub fn new_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A device check-in, as published by the check-in service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckinEvent {
    pub id: String,
    pub time: DateTime<Utc>,
    pub message: CheckinMessage,
}

impl CheckinEvent {
    pub fn new(message: CheckinMessage) -> Self {
        Self {
            id: new_event_id(),
            time: Utc::now(),
            message,
        }
    }

    /// Topic this event is published on.
    pub fn topic(&self) -> &'static str {
        self.message.topic()
    }
}

/// A processed connect/acknowledge exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectEvent {
    pub id: String,
    pub time: DateTime<Utc>,
    pub response: ConnectResponse,
}

impl ConnectEvent {
    pub fn new(response: ConnectResponse) -> Self {
        Self {
            id: new_event_id(),
            time: Utc::now(),
            response,
        }
    }
}
