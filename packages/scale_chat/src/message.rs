//! Chat message wire types.
//!
//! Client frames and backbone payloads are JSON objects:
//! `{ "message_id": 7, "text": "hi", "sender": "A", "sent_at": "...Z", "room": "r1" }`.
//! Backbone payloads add `"server_id"` so an instance can recognise its own publishes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// One chat message. Never mutated once ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Assigned by the sending client, unique only per sender.
    #[serde(default)]
    pub message_id: u64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default = "Utc::now")]
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub room: String,
}

impl Message {
    pub fn new(
        message_id: u64,
        text: impl Into<String>,
        sender: impl Into<String>,
        room: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            text: text.into(),
            sender: sender.into(),
            sent_at: Utc::now(),
            room: room.into(),
        }
    }

    /// Decode a client frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Rebind the message to `room`. Clients can only post into the room
    /// their connection was opened for.
    pub fn in_room(mut self, room: &str) -> Self {
        if self.room != room {
            self.room = room.to_string();
        }
        self
    }
}

/// Server-to-server variant carried over the backbone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionMessage {
    #[serde(flatten)]
    pub message: Message,
    pub server_id: String,
}

impl DistributionMessage {
    pub fn new(message: Message, server_id: impl Into<String>) -> Self {
        Self {
            message,
            server_id: server_id.into(),
        }
    }

    pub fn decode(payload: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
