//! Thread-safe registry wrapper and connection leases.
//!
//! [`SharedRegistry`] puts the core [`ConnectionRegistry`] and the presence
//! sink behind one lock. The presence call happens while the lock is held, so
//! for any user the sink sees strictly alternating online/offline calls no
//! matter how connects and disconnects interleave.
//!
//! [`ConnectionLease`] is the guaranteed-release handle a joined connection
//! holds. Releasing unsubscribes and unregisters exactly once, either
//! explicitly or on drop.

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use roomcast_core::{ConnectionRegistry, PresenceChange, RegistrationResult, RegistryError};

use crate::{broadcast::Broadcast, presence::PresenceSink};

/// Registry plus presence sink, shared by all connection tasks.
pub struct SharedRegistry {
    inner: Mutex<ConnectionRegistry>,
    presence: Arc<dyn PresenceSink>,
}

impl SharedRegistry {
    /// Create an empty registry reporting to `presence`.
    pub fn new(presence: Arc<dyn PresenceSink>) -> Self {
        Self { inner: Mutex::new(ConnectionRegistry::new()), presence }
    }

    /// Register a joined connection and report the user online if this is
    /// their first live connection.
    pub fn register(
        &self,
        room_id: u64,
        user_id: u64,
        handle: u64,
    ) -> Result<RegistrationResult, RegistryError> {
        let mut registry = self.lock();
        let result = registry.register(room_id, user_id, handle)?;

        if result.came_online {
            self.presence.set_online(user_id, true);
        }

        tracing::debug!(room_id, user_id, handle, came_online = result.came_online, "registered");
        Ok(result)
    }

    /// Unregister a connection and report the user offline if it was their
    /// last. Idempotent.
    pub fn unregister(&self, room_id: u64, user_id: u64, handle: u64) -> Option<PresenceChange> {
        let mut registry = self.lock();
        let change = registry.unregister(room_id, user_id, handle);

        if let Some(PresenceChange::WentOffline { user_id }) = change {
            self.presence.set_online(user_id, false);
        }

        change
    }

    /// Snapshot of handles live in `room_id`.
    pub fn members_of(&self, room_id: u64) -> HashSet<u64> {
        self.lock().members_of(room_id)
    }

    /// Whether `handle` is registered.
    pub fn contains(&self, handle: u64) -> bool {
        self.lock().contains(handle)
    }

    /// Total live connections.
    pub fn connection_count(&self) -> usize {
        self.lock().connection_count()
    }

    /// Live connections for a user.
    pub fn user_connection_count(&self, user_id: u64) -> usize {
        self.lock().user_connection_count(user_id)
    }

    /// Whether the user has a live connection.
    pub fn is_online(&self, user_id: u64) -> bool {
        self.lock().is_online(user_id)
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionRegistry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registration plus subscription held by a joined connection.
///
/// Created only after a successful register. Release runs once: the first
/// of [`ConnectionLease::release`] or drop does the work, later calls are
/// no-ops.
pub struct ConnectionLease {
    registry: Arc<SharedRegistry>,
    broadcast: Arc<dyn Broadcast>,
    room_id: u64,
    user_id: u64,
    handle: u64,
    subscription: Option<(String, u64)>,
    released: AtomicBool,
}

impl ConnectionLease {
    /// Register `handle` and return the lease for it.
    pub fn acquire(
        registry: Arc<SharedRegistry>,
        broadcast: Arc<dyn Broadcast>,
        room_id: u64,
        user_id: u64,
        handle: u64,
    ) -> Result<(Self, RegistrationResult), RegistryError> {
        let result = registry.register(room_id, user_id, handle)?;
        let lease = Self {
            registry,
            broadcast,
            room_id,
            user_id,
            handle,
            subscription: None,
            released: AtomicBool::new(false),
        };
        Ok((lease, result))
    }

    /// Record the subscription so release removes it too.
    pub fn attach_subscription(&mut self, topic: impl Into<String>, subscription_id: u64) {
        self.subscription = Some((topic.into(), subscription_id));
    }

    /// Unsubscribe and unregister. Returns false if already released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Some((topic, subscription_id)) = &self.subscription {
            self.broadcast.unsubscribe(topic, *subscription_id);
        }
        self.registry.unregister(self.room_id, self.user_id, self.handle);

        tracing::debug!(
            room_id = self.room_id,
            user_id = self.user_id,
            handle = self.handle,
            "connection released"
        );
        true
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.release();
    }
}
