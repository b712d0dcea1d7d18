//! Room and user model.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Authenticated user, as returned by credential validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserIdentity {
    /// Stable user ID
    pub user_id: u64,
    /// Display name, copied into outbound messages
    pub username: String,
}

impl UserIdentity {
    /// Create an identity.
    pub fn new(user_id: u64, username: impl Into<String>) -> Self {
        Self { user_id, username: username.into() }
    }
}

/// Room kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    /// Direct conversation between two users
    OneToOne,
    /// Any number of members
    #[default]
    Group,
}

/// A chat room and its member set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    /// Room ID
    pub id: u64,
    /// Room kind
    #[serde(default)]
    pub kind: RoomKind,
    /// User IDs allowed to join
    #[serde(default)]
    pub members: BTreeSet<u64>,
}

impl Room {
    /// Create a room with the given members.
    pub fn new(id: u64, kind: RoomKind, members: impl IntoIterator<Item = u64>) -> Self {
        Self { id, kind, members: members.into_iter().collect() }
    }

    /// Whether `user_id` may join this room.
    pub fn is_member(&self, user_id: u64) -> bool {
        self.members.contains(&user_id)
    }
}
