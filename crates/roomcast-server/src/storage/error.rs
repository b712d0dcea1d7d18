//! Storage error types.
//!
//! - `Conflict`: the room's sequence counter disagrees with its stored log
//! - `Serialization`: failed to encode/decode a stored message
//! - `Io`: underlying storage system errors

use thiserror::Error;

/// Errors that can occur during message log operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Sequence counter and stored log disagree
    ///
    /// The append is refused rather than overwriting an existing entry.
    #[error("sequence conflict in room {room_id}: sequence {sequence} is already stored")]
    Conflict {
        /// Room whose log is inconsistent
        room_id: u64,
        /// Sequence that was about to be reused
        sequence: u64,
    },

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, worker task, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}
