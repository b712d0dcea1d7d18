use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use super::{MessageLog, NewMessage, PageOrder, StorageError, StoredMessage};

/// In-memory message log for tests and single-process deployments
///
/// Messages are kept per room in sequence order, so `sequence` doubles as the
/// index into the room's `Vec`. Clone shares the same state.
#[derive(Clone, Default)]
pub struct MemoryMessageLog {
    inner: Arc<Mutex<MemoryLogInner>>,
}

#[derive(Default)]
struct MemoryLogInner {
    /// Messages by room, in sequence order
    rooms: HashMap<u64, Vec<StoredMessage>>,
    /// Last assigned message ID
    last_id: u64,
}

impl MemoryMessageLog {
    /// Create a new empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of messages across all rooms.
    pub fn total_message_count(&self) -> usize {
        self.lock().rooms.values().map(Vec::len).sum()
    }

    /// Every message in a room, oldest first.
    pub fn messages(&self, room_id: u64) -> Vec<StoredMessage> {
        self.lock().rooms.get(&room_id).cloned().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryLogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageLog for MemoryMessageLog {
    fn append(&self, message: NewMessage) -> Result<StoredMessage, StorageError> {
        let mut inner = self.lock();

        inner.last_id += 1;
        let id = inner.last_id;

        let room = inner.rooms.entry(message.room_id).or_default();
        let stored = StoredMessage::from_new(message, id, room.len() as u64);
        room.push(stored.clone());

        Ok(stored)
    }

    fn read_page(
        &self,
        room_id: u64,
        before_sequence: Option<u64>,
        limit: usize,
        order: PageOrder,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let inner = self.lock();
        let Some(room) = inner.rooms.get(&room_id) else {
            return Ok(Vec::new());
        };

        let end = before_sequence.map_or(room.len(), |before| room.len().min(before as usize));
        let start = end.saturating_sub(limit);

        let mut page = room[start..end].to_vec();
        if order == PageOrder::NewestFirst {
            page.reverse();
        }

        Ok(page)
    }

    fn latest_sequence(&self, room_id: u64) -> Result<Option<u64>, StorageError> {
        let inner = self.lock();
        Ok(inner.rooms.get(&room_id).and_then(|room| room.len().checked_sub(1)).map(|s| s as u64))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use roomcast_proto::MessageType;

    use super::*;

    fn new_message(room_id: u64, content: &str) -> NewMessage {
        NewMessage {
            room_id,
            sender_id: 1,
            content: content.to_string(),
            message_type: MessageType::Text,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn sequences_are_per_room() {
        let log = MemoryMessageLog::new();

        let a0 = log.append(new_message(1, "a0")).unwrap();
        let b0 = log.append(new_message(2, "b0")).unwrap();
        let a1 = log.append(new_message(1, "a1")).unwrap();

        assert_eq!((a0.sequence, b0.sequence, a1.sequence), (0, 0, 1));
        assert_eq!((a0.id, b0.id, a1.id), (1, 2, 3));
        assert_eq!(log.latest_sequence(1).unwrap(), Some(1));
        assert_eq!(log.latest_sequence(3).unwrap(), None);
    }

    #[test]
    fn read_page_newest_first() {
        let log = MemoryMessageLog::new();
        for i in 0..10 {
            log.append(new_message(1, &format!("m{i}"))).unwrap();
        }

        let page = log.read_page(1, None, 3, PageOrder::NewestFirst).unwrap();
        let seqs: Vec<u64> = page.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![9, 8, 7]);

        let page = log.read_page(1, Some(7), 3, PageOrder::OldestFirst).unwrap();
        let seqs: Vec<u64> = page.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![4, 5, 6]);
    }

    #[test]
    fn read_page_edges() {
        let log = MemoryMessageLog::new();
        log.append(new_message(1, "only")).unwrap();

        assert!(log.read_page(2, None, 10, PageOrder::NewestFirst).unwrap().is_empty());
        assert!(log.read_page(1, Some(0), 10, PageOrder::NewestFirst).unwrap().is_empty());
        assert!(log.read_page(1, None, 0, PageOrder::NewestFirst).unwrap().is_empty());
        assert_eq!(log.read_page(1, Some(100), 10, PageOrder::NewestFirst).unwrap().len(), 1);
    }

    #[test]
    fn content_is_stored_verbatim() {
        let log = MemoryMessageLog::new();
        let stored = log.append(new_message(1, "  padded  ")).unwrap();

        assert_eq!(stored.content, "  padded  ");
        assert!(!stored.is_edited);
        assert_eq!(log.messages(1), vec![stored]);
    }
}
