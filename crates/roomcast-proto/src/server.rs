//! Server → client events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Kind tag stored with every message.
///
/// Only text messages are created over the socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Plain text
    #[default]
    Text,
}

/// A persisted chat message as sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageData {
    /// Message ID assigned by the log
    pub id: u64,
    /// Room the message belongs to
    pub room_id: u64,
    /// Sender's user ID
    pub sender_id: u64,
    /// Sender's display name
    pub sender_username: String,
    /// Message body
    pub content: String,
    /// Time the server accepted the message
    pub timestamp: DateTime<Utc>,
    /// Kind tag
    pub message_type: MessageType,
    /// Always false for messages created by the fan-out path
    pub is_edited: bool,
    /// Per-room sequence number assigned by the log
    pub sequence: u64,
}

/// Machine-readable error and warning codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame could not be decoded
    MalformedFrame,
    /// Event type is not handled
    UnsupportedEvent,
    /// Content is empty after trimming whitespace
    EmptyMessage,
    /// Content exceeds the configured limit
    ContentTooLong,
    /// Message could not be stored, it was dropped
    PersistenceFailure,
    /// Message was stored but could not be broadcast
    BroadcastDegraded,
}

/// Events the server sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent once after the connection joined its room.
    Connected {
        /// Room the connection is bound to
        room_id: u64,
        /// Authenticated user
        user_id: u64,
    },

    /// A chat message published to the room.
    Message {
        /// The message
        data: MessageData,
    },

    /// Typing indicator from another room member.
    Typing {
        /// Room the indicator belongs to
        room_id: u64,
        /// User who is typing
        user_id: u64,
        /// Display name of the user
        username: String,
        /// Started or stopped typing
        is_typing: bool,
    },

    /// Error reported to the sender only. The connection stays open.
    Error {
        /// Error code
        code: ErrorCode,
        /// Human-readable description
        message: String,
    },

    /// Soft warning reported to the sender only.
    Warning {
        /// Warning code
        code: ErrorCode,
        /// Human-readable description
        message: String,
    },
}

impl ServerEvent {
    /// Create an error event.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error { code, message: message.into() }
    }

    /// Create a warning event.
    pub fn warning(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Warning { code, message: message.into() }
    }

    /// Encode as a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode a JSON text frame (client side and tests).
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
