//! Protocol errors.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while decoding or encoding wire events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame is not a JSON object of the expected shape.
    ///
    /// Non-fatal: the sender gets an error event and the connection stays
    /// open.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Frame is well-formed but its `type` is not handled by the server.
    #[error("unsupported event type: {0}")]
    UnsupportedEvent(String),

    /// Outbound event could not be serialized.
    ///
    /// Indicates a bug, every `ServerEvent` is serializable.
    #[error("encode error: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}
