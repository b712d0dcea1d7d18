//! Broadcast channel: topic-based fan-out to connection queues.
//!
//! Each connection subscribes to its room's topic with a bounded queue.
//! Publishing never waits on a subscriber: an event is offered to every
//! queue with `try_send`, and a subscriber whose queue is full is evicted on
//! the spot. Its connection then closes as a slow consumer. Other subscribers
//! are unaffected.
//!
//! There is no replay. A subscriber sees only events published after it
//! subscribed.
//!
//! - [`LocalBroadcast`]: one process
//! - [`RedisBroadcast`]: every process sharing a Redis server

mod local;
mod redis_hub;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
pub use local::LocalBroadcast;
pub use redis_hub::RedisBroadcast;
use thiserror::Error;
use tokio::sync::mpsc;

/// Topic name for a room.
pub fn room_topic(room_id: u64) -> String {
    format!("room:{room_id}")
}

/// Errors from the broadcast channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// Backend is unreachable or refused the operation
    #[error("broadcast backend unavailable: {0}")]
    Unavailable(String),
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A published event, already encoded as JSON text
    Event(Arc<str>),
    /// The queue overflowed and the hub dropped this subscriber
    Evicted,
    /// The hub went away
    Closed,
}

/// A subscriber's end of a topic.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<Arc<str>>,
    evicted: Arc<AtomicBool>,
}

impl Subscription {
    /// Build a subscription. Used by [`Broadcast`] implementations.
    pub fn new(id: u64, receiver: mpsc::Receiver<Arc<str>>, evicted: Arc<AtomicBool>) -> Self {
        Self { id, receiver, evicted }
    }

    /// Subscription ID, unique within its hub.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next delivery.
    ///
    /// Eviction is reported before any events still queued: a subscriber that
    /// fell behind is closed rather than fed a backlog.
    pub async fn recv(&mut self) -> Delivery {
        if self.evicted.load(Ordering::Acquire) {
            return Delivery::Evicted;
        }

        match self.receiver.recv().await {
            Some(event) => Delivery::Event(event),
            None if self.evicted.load(Ordering::Acquire) => Delivery::Evicted,
            None => Delivery::Closed,
        }
    }
}

/// Pub/sub transport between ingest and connections.
///
/// `unsubscribe` is synchronous so it can run from `Drop`.
#[async_trait]
pub trait Broadcast: Send + Sync + 'static {
    /// Publish to every current subscriber of `topic`.
    ///
    /// Returns how many receivers the event was handed to. For the local hub
    /// that is subscribers; for Redis it is server processes.
    async fn publish(&self, topic: &str, payload: Arc<str>) -> Result<usize, BroadcastError>;

    /// Subscribe to `topic` with a queue of `capacity` events.
    async fn subscribe(&self, topic: &str, capacity: usize) -> Result<Subscription, BroadcastError>;

    /// Remove a subscription. Returns false if it was not present.
    fn unsubscribe(&self, topic: &str, subscription_id: u64) -> bool;
}
