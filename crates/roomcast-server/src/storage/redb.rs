//! Redb-backed durable message log.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. An
//! append writes the message and bumps both counters in one transaction, so a
//! crash never leaves a gap or a reused sequence.

use std::{fmt::Display, path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};

use super::{MessageLog, NewMessage, PageOrder, StorageError, StoredMessage};

/// Table: messages
/// Key: (room_id: u64, sequence: u64) as big-endian bytes [16 bytes]
/// Value: CBOR-encoded StoredMessage
const MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("messages");

/// Table: room_sequences
/// Key: room_id
/// Value: next sequence to assign in that room
const ROOM_SEQUENCES: TableDefinition<u64, u64> = TableDefinition::new("room_sequences");

/// Table: counters
/// Key: counter name
/// Value: counter value
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// Last assigned message ID, global across rooms.
const LAST_MESSAGE_ID: &str = "last_message_id";

/// Durable message log backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbMessageLog {
    db: Arc<Database>,
}

impl RedbMessageLog {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            let _ = txn.open_table(MESSAGES).map_err(io)?;
            let _ = txn.open_table(ROOM_SEQUENCES).map_err(io)?;
            let _ = txn.open_table(COUNTERS).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl MessageLog for RedbMessageLog {
    fn append(&self, message: NewMessage) -> Result<StoredMessage, StorageError> {
        let txn = self.db.begin_write().map_err(io)?;

        let stored = {
            let mut messages = txn.open_table(MESSAGES).map_err(io)?;
            let mut sequences = txn.open_table(ROOM_SEQUENCES).map_err(io)?;
            let mut counters = txn.open_table(COUNTERS).map_err(io)?;

            let id = counters.get(LAST_MESSAGE_ID).map_err(io)?.map_or(0, |v| v.value()) + 1;
            let room_id = message.room_id;
            let sequence = sequences.get(room_id).map_err(io)?.map_or(0, |v| v.value());

            let key = encode_message_key(room_id, sequence);
            if messages.get(key.as_slice()).map_err(io)?.is_some() {
                return Err(StorageError::Conflict { room_id, sequence });
            }

            let stored = StoredMessage::from_new(message, id, sequence);

            let mut bytes = Vec::new();
            ciborium::into_writer(&stored, &mut bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;

            messages.insert(key.as_slice(), bytes.as_slice()).map_err(io)?;
            sequences.insert(room_id, sequence + 1).map_err(io)?;
            counters.insert(LAST_MESSAGE_ID, id).map_err(io)?;

            stored
        };

        txn.commit().map_err(io)?;

        Ok(stored)
    }

    fn read_page(
        &self,
        room_id: u64,
        before_sequence: Option<u64>,
        limit: usize,
        order: PageOrder,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(MESSAGES).map_err(io)?;

        let start_key = encode_message_key(room_id, 0);
        let end_key = encode_message_key(room_id, before_sequence.unwrap_or(u64::MAX));

        let results = table.range(start_key.as_slice()..end_key.as_slice()).map_err(io)?;

        let mut page = Vec::with_capacity(limit.min(256));
        for result in results.rev().take(limit) {
            let (_, value) = result.map_err(io)?;
            let message: StoredMessage = ciborium::from_reader(value.value())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            page.push(message);
        }

        if order == PageOrder::OldestFirst {
            page.reverse();
        }

        Ok(page)
    }

    fn latest_sequence(&self, room_id: u64) -> Result<Option<u64>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(MESSAGES).map_err(io)?;

        let start_key = encode_message_key(room_id, 0);
        let end_key = encode_message_key(room_id, u64::MAX);

        let mut results = table.range(start_key.as_slice()..=end_key.as_slice()).map_err(io)?;

        match results.next_back() {
            Some(result) => {
                let (key, _) = result.map_err(io)?;
                Ok(Some(decode_message_key(key.value()).1))
            },
            None => Ok(None),
        }
    }
}

fn io(err: impl Display) -> StorageError {
    StorageError::Io(err.to_string())
}

/// Encode (room_id, sequence) as a 16-byte big-endian key.
///
/// Big-endian keeps a room's messages contiguous and in sequence order.
fn encode_message_key(room_id: u64, sequence: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&room_id.to_be_bytes());
    key[8..].copy_from_slice(&sequence.to_be_bytes());
    key
}

fn decode_message_key(key: &[u8]) -> (u64, u64) {
    let mut room = [0u8; 8];
    let mut sequence = [0u8; 8];
    room.copy_from_slice(&key[..8]);
    sequence.copy_from_slice(&key[8..16]);
    (u64::from_be_bytes(room), u64::from_be_bytes(sequence))
}
