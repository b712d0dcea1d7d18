//! Connection registry for room membership of live sockets.
//!
//! Maintains bidirectional mappings: room → handles (diagnostics) and
//! handle → (room, user) (cleanup), plus a per-user live connection count
//! that drives online/offline presence. A user with two tabs open has two
//! handles and goes offline only when the last one is released.
//!
//! The registry is bookkeeping only. Message delivery goes through the
//! broadcast channel and never iterates these maps.

use std::collections::{HashMap, HashSet};

use crate::error::RegistryError;

/// A live registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ConnectionEntry {
    /// Room the connection is bound to
    room_id: u64,
    /// Authenticated user
    user_id: u64,
}

/// Outcome of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationResult {
    /// True when this is the user's first live connection in any room
    pub came_online: bool,
}

/// Presence transition caused by an unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    /// The user's last live connection went away
    WentOffline {
        /// User who went offline
        user_id: u64,
    },
}

/// Registry of live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Handle → entry
    connections: HashMap<u64, ConnectionEntry>,
    /// Room ID → handles in that room
    rooms: HashMap<u64, HashSet<u64>>,
    /// User ID → number of live handles across all rooms
    user_counts: HashMap<u64, usize>,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a joined connection.
    ///
    /// # Errors
    ///
    /// - `RegistryError::AlreadyRegistered` if `handle` is already present.
    ///   The registry is left unchanged.
    pub fn register(
        &mut self,
        room_id: u64,
        user_id: u64,
        handle: u64,
    ) -> Result<RegistrationResult, RegistryError> {
        if self.connections.contains_key(&handle) {
            return Err(RegistryError::AlreadyRegistered(handle));
        }

        self.connections.insert(handle, ConnectionEntry { room_id, user_id });
        self.rooms.entry(room_id).or_default().insert(handle);

        let count = self.user_counts.entry(user_id).or_insert(0);
        *count += 1;

        Ok(RegistrationResult { came_online: *count == 1 })
    }

    /// Remove a connection. Idempotent.
    ///
    /// Unknown handles, or a handle registered under a different room or
    /// user, are ignored and return `None`.
    pub fn unregister(&mut self, room_id: u64, user_id: u64, handle: u64) -> Option<PresenceChange> {
        let entry = self.connections.get(&handle)?;
        if entry.room_id != room_id || entry.user_id != user_id {
            return None;
        }
        self.connections.remove(&handle);

        if let Some(handles) = self.rooms.get_mut(&room_id) {
            handles.remove(&handle);
            if handles.is_empty() {
                self.rooms.remove(&room_id);
            }
        }

        let count = self.user_counts.get_mut(&user_id)?;
        *count -= 1;
        if *count == 0 {
            self.user_counts.remove(&user_id);
            return Some(PresenceChange::WentOffline { user_id });
        }

        None
    }

    /// Snapshot of handles live in `room_id`.
    pub fn members_of(&self, room_id: u64) -> HashSet<u64> {
        self.rooms.get(&room_id).cloned().unwrap_or_default()
    }

    /// Check if a handle is registered.
    pub fn contains(&self, handle: u64) -> bool {
        self.connections.contains_key(&handle)
    }

    /// Total live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Live connections for a user across all rooms.
    pub fn user_connection_count(&self, user_id: u64) -> usize {
        self.user_counts.get(&user_id).copied().unwrap_or(0)
    }

    /// Whether the user has at least one live connection.
    pub fn is_online(&self, user_id: u64) -> bool {
        self.user_counts.contains_key(&user_id)
    }
}
