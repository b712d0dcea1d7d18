//! Error types for the roomcast core.
//!
//! One enum per concern: connection lifecycle, registry bookkeeping and
//! message ingest. None of them carry I/O errors; those live in the server
//! crate.

use roomcast_proto::{ErrorCode, ProtocolError};
use thiserror::Error;

use crate::connection::ConnectionState;

/// Errors from the connection state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Invalid state transition attempted
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current state when error occurred
        state: ConnectionState,
        /// Operation that was attempted
        operation: &'static str,
    },
}

/// Errors from the connection registry.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// Handle is already registered. Indicates a handle collision or a
    /// double register, both fatal for the connection.
    #[error("connection handle {0:#018x} is already registered")]
    AlreadyRegistered(u64),
}

/// Per-frame ingest failures.
///
/// All of these are reported to the sender only and never close the
/// connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// Frame is not valid JSON or has a wrong field type
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Event type is not handled by the server
    #[error("unsupported event type: {0}")]
    UnsupportedEvent(String),

    /// Content is empty or whitespace only
    #[error("message content is empty")]
    EmptyMessage,

    /// Content exceeds the configured limit
    #[error("message content is {len} characters, limit is {max}")]
    ContentTooLong {
        /// Length in Unicode scalar values
        len: usize,
        /// Configured limit
        max: usize,
    },

    /// Message log rejected the append. Nothing was published.
    #[error("message could not be stored: {0}")]
    PersistenceFailure(String),
}

impl IngestError {
    /// Wire error code sent to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MalformedFrame(_) => ErrorCode::MalformedFrame,
            Self::UnsupportedEvent(_) => ErrorCode::UnsupportedEvent,
            Self::EmptyMessage => ErrorCode::EmptyMessage,
            Self::ContentTooLong { .. } => ErrorCode::ContentTooLong,
            Self::PersistenceFailure(_) => ErrorCode::PersistenceFailure,
        }
    }

    /// Message sent to the client.
    ///
    /// Storage details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::MalformedFrame(_) => "Invalid message format".to_string(),
            Self::PersistenceFailure(_) => "Message could not be saved".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<ProtocolError> for IngestError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnsupportedEvent(kind) => Self::UnsupportedEvent(kind),
            ProtocolError::Malformed(reason) | ProtocolError::Encode(reason) => {
                Self::MalformedFrame(reason)
            },
        }
    }
}
