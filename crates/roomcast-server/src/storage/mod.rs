//! Message log abstraction.
//!
//! The log is the durable record of a room and the authority on ordering:
//! it assigns each message a per-room `sequence` (0, 1, 2, ...) and a global
//! `id`. The trait is synchronous; async callers run it on the blocking pool
//! (see [`crate::ingest`]).

mod chaotic;
mod error;
mod memory;
mod redb;

use chrono::{DateTime, Utc};
pub use chaotic::ChaoticMessageLog;
pub use error::StorageError;
pub use memory::MemoryMessageLog;
use roomcast_proto::{MessageData, MessageType};
use serde::{Deserialize, Serialize};

pub use self::redb::RedbMessageLog;

/// A message accepted by ingest, not yet stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Room the message is posted to
    pub room_id: u64,
    /// Sender's user ID
    pub sender_id: u64,
    /// Content as sent by the client
    pub content: String,
    /// Kind tag
    pub message_type: MessageType,
    /// Server acceptance time
    pub timestamp: DateTime<Utc>,
}

/// A message as persisted in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Globally unique message ID, starting at 1
    pub id: u64,
    /// Room the message belongs to
    pub room_id: u64,
    /// Position in the room's log, starting at 0
    pub sequence: u64,
    /// Sender's user ID
    pub sender_id: u64,
    /// Content as sent by the client
    pub content: String,
    /// Kind tag
    pub message_type: MessageType,
    /// Server acceptance time
    pub timestamp: DateTime<Utc>,
    /// Whether the message was edited after creation
    pub is_edited: bool,
}

impl StoredMessage {
    /// Build a stored message from an accepted one.
    pub fn from_new(message: NewMessage, id: u64, sequence: u64) -> Self {
        Self {
            id,
            room_id: message.room_id,
            sequence,
            sender_id: message.sender_id,
            content: message.content,
            message_type: message.message_type,
            timestamp: message.timestamp,
            is_edited: false,
        }
    }

    /// Wire representation, with the sender's display name.
    pub fn to_wire(&self, sender_username: &str) -> MessageData {
        MessageData {
            id: self.id,
            room_id: self.room_id,
            sender_id: self.sender_id,
            sender_username: sender_username.to_string(),
            content: self.content.clone(),
            timestamp: self.timestamp,
            message_type: self.message_type,
            is_edited: self.is_edited,
            sequence: self.sequence,
        }
    }
}

/// Order of a page returned by [`MessageLog::read_page`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PageOrder {
    /// Descending sequence
    #[default]
    NewestFirst,
    /// Ascending sequence
    OldestFirst,
}

/// Durable per-room message log.
///
/// Implementations share internal state, so one instance can be handed to
/// every connection as `Arc<dyn MessageLog>`.
///
/// # Invariants
///
/// - `append` assigns `sequence` = number of messages already in the room
/// - `id` is unique across rooms and strictly increasing
/// - A failed `append` leaves no trace: the next append in that room gets the
///   same sequence the failed one would have
pub trait MessageLog: Send + Sync + 'static {
    /// Append a message to its room's log.
    fn append(&self, message: NewMessage) -> Result<StoredMessage, StorageError>;

    /// Read up to `limit` messages with `sequence < before_sequence` (or the
    /// newest messages when `None`), returned in `order`.
    ///
    /// The page is always the `limit` newest matching messages; `order` only
    /// changes how they are sorted.
    fn read_page(
        &self,
        room_id: u64,
        before_sequence: Option<u64>,
        limit: usize,
        order: PageOrder,
    ) -> Result<Vec<StoredMessage>, StorageError>;

    /// Latest sequence in a room. `None` if the room has no messages.
    fn latest_sequence(&self, room_id: u64) -> Result<Option<u64>, StorageError>;
}
