//! Room membership store.

use std::{
    collections::HashMap,
    path::Path,
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;
use roomcast_core::Room;
use serde::Deserialize;
use thiserror::Error;

/// Errors from the membership collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MembershipError {
    /// Rooms file could not be read
    #[error("cannot read rooms file: {0}")]
    Io(String),

    /// Rooms file is not valid TOML or has the wrong shape
    #[error("invalid rooms file: {0}")]
    Invalid(String),

    /// Backend could not be reached
    #[error("membership backend unavailable: {0}")]
    Unavailable(String),
}

/// Answers "may this user join this room".
#[async_trait]
pub trait MembershipStore: Send + Sync + 'static {
    /// Whether `user_id` is a member of `room_id`. Unknown rooms have no
    /// members.
    async fn is_member(&self, room_id: u64, user_id: u64) -> Result<bool, MembershipError>;

    /// All members of `room_id`, ascending.
    async fn members_of(&self, room_id: u64) -> Result<Vec<u64>, MembershipError>;
}

/// Shape of the rooms file.
///
/// ```toml
/// [[rooms]]
/// id = 1
/// kind = "group"
/// members = [1, 2, 3]
/// ```
#[derive(Debug, Deserialize)]
struct RoomsFile {
    #[serde(default)]
    rooms: Vec<Room>,
}

/// In-memory membership table.
#[derive(Debug, Default)]
pub struct MemoryMembership {
    rooms: RwLock<HashMap<u64, Room>>,
}

impl MemoryMembership {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table from a list of rooms. Later duplicates replace earlier
    /// ones.
    pub fn from_rooms(rooms: impl IntoIterator<Item = Room>) -> Self {
        let rooms = rooms.into_iter().map(|room| (room.id, room)).collect();
        Self { rooms: RwLock::new(rooms) }
    }

    /// Parse a rooms file body.
    pub fn from_toml(body: &str) -> Result<Self, MembershipError> {
        let file: RoomsFile =
            toml::from_str(body).map_err(|e| MembershipError::Invalid(e.to_string()))?;
        Ok(Self::from_rooms(file.rooms))
    }

    /// Load a rooms file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MembershipError> {
        let body = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MembershipError::Io(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_toml(&body)
    }

    /// Insert or replace a room.
    pub fn insert_room(&self, room: Room) {
        self.rooms.write().unwrap_or_else(PoisonError::into_inner).insert(room.id, room);
    }

    /// Number of known rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl MembershipStore for MemoryMembership {
    async fn is_member(&self, room_id: u64, user_id: u64) -> Result<bool, MembershipError> {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rooms.get(&room_id).is_some_and(|room| room.is_member(user_id)))
    }

    async fn members_of(&self, room_id: u64) -> Result<Vec<u64>, MembershipError> {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rooms.get(&room_id).map(|room| room.members.iter().copied().collect()).unwrap_or_default())
    }
}
