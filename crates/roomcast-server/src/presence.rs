//! Presence sink.
//!
//! Receives online/offline transitions from the shared registry. Calls are
//! made while the registry lock is held, so implementations must be quick and
//! must not call back into the registry.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use roomcast_core::Environment;

/// Receives presence transitions.
pub trait PresenceSink: Send + Sync + 'static {
    /// Record that `user_id` came online (`true`) or went offline (`false`).
    fn set_online(&self, user_id: u64, online: bool);
}

/// Presence record for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceRecord {
    /// Whether the user has a live connection
    pub online: bool,
    /// When the user last went offline
    pub last_seen: Option<DateTime<Utc>>,
}

/// In-memory presence table.
pub struct MemoryPresence {
    env: Arc<dyn Environment>,
    state: Mutex<PresenceState>,
}

#[derive(Default)]
struct PresenceState {
    records: HashMap<u64, PresenceRecord>,
    /// Every transition in arrival order
    transitions: Vec<(u64, bool)>,
}

impl MemoryPresence {
    /// Create an empty table that stamps last-seen from `env`.
    pub fn new(env: Arc<dyn Environment>) -> Self {
        Self { env, state: Mutex::new(PresenceState::default()) }
    }

    /// Current record for a user. `None` if never seen.
    pub fn record(&self, user_id: u64) -> Option<PresenceRecord> {
        self.lock().records.get(&user_id).copied()
    }

    /// Whether the user is currently online.
    pub fn is_online(&self, user_id: u64) -> bool {
        self.record(user_id).is_some_and(|r| r.online)
    }

    /// Transitions received for `user_id`, oldest first.
    pub fn transitions_for(&self, user_id: u64) -> Vec<bool> {
        self.lock().transitions.iter().filter(|(u, _)| *u == user_id).map(|(_, o)| *o).collect()
    }

    fn lock(&self) -> MutexGuard<'_, PresenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PresenceSink for MemoryPresence {
    fn set_online(&self, user_id: u64, online: bool) {
        let now = self.env.wall_clock();
        let mut state = self.lock();

        let record =
            state.records.entry(user_id).or_insert(PresenceRecord { online, last_seen: None });
        record.online = online;
        if !online {
            record.last_seen = Some(now);
        }
        state.transitions.push((user_id, online));

        tracing::debug!(user_id, online, "presence changed");
    }
}
