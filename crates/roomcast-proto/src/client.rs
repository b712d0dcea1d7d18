//! Client → server events.

use serde::Deserialize;

use crate::errors::{ProtocolError, Result};

/// Event type assumed when a client omits `type`.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// An inbound event after decoding.
///
/// Decoding is lenient about missing fields (a message without `content` has
/// empty content and is rejected later by validation) but strict about field
/// types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Chat message to persist and broadcast.
    Message {
        /// Raw content as sent. Not trimmed.
        content: String,
    },
    /// Typing indicator, relayed but never persisted.
    Typing {
        /// Whether the user started or stopped typing
        is_typing: bool,
    },
}

/// Loose envelope used for decoding. Unknown fields are ignored.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    content: Option<String>,
    is_typing: Option<bool>,
}

impl ClientEvent {
    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Malformed` if the frame is not a JSON object or a
    ///   field has the wrong type
    /// - `ProtocolError::UnsupportedEvent` if `type` names an event the
    ///   server does not handle
    pub fn parse(raw: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(raw)?;

        match envelope.kind.as_deref().unwrap_or(DEFAULT_EVENT_TYPE) {
            "message" => Ok(Self::Message { content: envelope.content.unwrap_or_default() }),
            "typing" => Ok(Self::Typing { is_typing: envelope.is_typing.unwrap_or(false) }),
            other => Err(ProtocolError::UnsupportedEvent(other.to_string())),
        }
    }
}
