//! Server error types.

use std::fmt;

use crate::{broadcast::BroadcastError, storage::StorageError};

/// Errors that can occur while starting or running the server.
///
/// Per-connection failures never surface here; they close the one
/// connection and are logged.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (bad bind address, unreadable rooms file, etc.).
    ///
    /// Fatal at startup. Fix configuration and restart.
    Config(String),

    /// Transport/network error (bind failure, listener I/O error).
    Transport(String),

    /// Message log could not be opened.
    Storage(StorageError),

    /// Broadcast backend could not be reached at startup.
    Broadcast(BroadcastError),

    /// Internal error (unexpected state, logic bug, etc.).
    ///
    /// Should never happen in correct implementation. Indicates a bug.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Storage(err) => write!(f, "storage error: {err}"),
            Self::Broadcast(err) => write!(f, "broadcast error: {err}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(err) => Some(err),
            Self::Broadcast(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StorageError> for ServerError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<BroadcastError> for ServerError {
    fn from(err: BroadcastError) -> Self {
        Self::Broadcast(err)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
