//! In-process hub.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::{Broadcast, BroadcastError, Subscription};

struct Subscriber {
    sender: mpsc::Sender<Arc<str>>,
    evicted: Arc<AtomicBool>,
}

/// In-process broadcast hub.
#[derive(Default)]
pub struct LocalBroadcast {
    /// Topic → subscription ID → subscriber
    topics: Mutex<HashMap<String, HashMap<u64, Subscriber>>>,
    next_id: AtomicU64,
}

impl LocalBroadcast {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().get(topic).map_or(0, HashMap::len)
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.lock().len()
    }

    /// Offer `payload` to every subscriber of `topic` without waiting.
    ///
    /// Returns the number of subscribers it was queued for. Full queues are
    /// evicted.
    pub fn deliver(&self, topic: &str, payload: &Arc<str>) -> usize {
        let mut topics = self.lock();
        let Some(subscribers) = topics.get_mut(topic) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dropped = Vec::new();

        for (&id, subscriber) in subscribers.iter() {
            match subscriber.sender.try_send(Arc::clone(payload)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    subscriber.evicted.store(true, Ordering::Release);
                    tracing::warn!(topic, subscription_id = id, "subscriber queue full, evicting");
                    dropped.push(id);
                },
                Err(TrySendError::Closed(_)) => dropped.push(id),
            }
        }

        // Dropping the sender wakes the evicted subscriber
        for id in dropped {
            subscribers.remove(&id);
        }
        if subscribers.is_empty() {
            topics.remove(topic);
        }

        delivered
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<u64, Subscriber>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Broadcast for LocalBroadcast {
    async fn publish(&self, topic: &str, payload: Arc<str>) -> Result<usize, BroadcastError> {
        Ok(self.deliver(topic, &payload))
    }

    async fn subscribe(&self, topic: &str, capacity: usize) -> Result<Subscription, BroadcastError> {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let evicted = Arc::new(AtomicBool::new(false));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        self.lock()
            .entry(topic.to_string())
            .or_default()
            .insert(id, Subscriber { sender, evicted: Arc::clone(&evicted) });

        tracing::debug!(topic, subscription_id = id, "subscribed");
        Ok(Subscription::new(id, receiver, evicted))
    }

    fn unsubscribe(&self, topic: &str, subscription_id: u64) -> bool {
        let mut topics = self.lock();
        let Some(subscribers) = topics.get_mut(topic) else {
            return false;
        };

        let removed = subscribers.remove(&subscription_id).is_some();
        if subscribers.is_empty() {
            topics.remove(topic);
        }
        removed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::broadcast::Delivery;

    fn payload(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let hub = LocalBroadcast::new();
        let mut a = hub.subscribe("room:1", 8).await.unwrap();
        let mut b = hub.subscribe("room:1", 8).await.unwrap();
        let mut other = hub.subscribe("room:2", 8).await.unwrap();

        assert_eq!(hub.publish("room:1", payload("hi")).await.unwrap(), 2);

        assert_eq!(a.recv().await, Delivery::Event(payload("hi")));
        assert_eq!(b.recv().await, Delivery::Event(payload("hi")));

        hub.publish("room:2", payload("elsewhere")).await.unwrap();
        assert_eq!(other.recv().await, Delivery::Event(payload("elsewhere")));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let hub = LocalBroadcast::new();
        assert_eq!(hub.publish("room:9", payload("x")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn full_queue_evicts_only_that_subscriber() {
        let hub = LocalBroadcast::new();
        let mut slow = hub.subscribe("room:1", 2).await.unwrap();
        let mut fast = hub.subscribe("room:1", 16).await.unwrap();

        for i in 0..3 {
            hub.publish("room:1", payload(&format!("m{i}"))).await.unwrap();
            assert_eq!(fast.recv().await, Delivery::Event(payload(&format!("m{i}"))));
        }

        assert_eq!(slow.recv().await, Delivery::Evicted);
        assert_eq!(hub.subscriber_count("room:1"), 1);

        assert_eq!(hub.publish("room:1", payload("after")).await.unwrap(), 1);
        assert_eq!(fast.recv().await, Delivery::Event(payload("after")));
    }

    #[tokio::test]
    async fn unsubscribe_removes_and_cleans_topic() {
        let hub = LocalBroadcast::new();
        let sub = hub.subscribe("room:1", 4).await.unwrap();

        assert!(hub.unsubscribe("room:1", sub.id()));
        assert!(!hub.unsubscribe("room:1", sub.id()));
        assert_eq!(hub.topic_count(), 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_publish() {
        let hub = LocalBroadcast::new();
        let sub = hub.subscribe("room:1", 4).await.unwrap();
        drop(sub);

        assert_eq!(hub.publish("room:1", payload("x")).await.unwrap(), 0);
        assert_eq!(hub.subscriber_count("room:1"), 0);
    }

    #[tokio::test]
    async fn no_replay_for_late_subscribers() {
        let hub = LocalBroadcast::new();
        let _early = hub.subscribe("room:1", 4).await.unwrap();
        hub.publish("room:1", payload("before")).await.unwrap();

        let mut late = hub.subscribe("room:1", 4).await.unwrap();
        hub.publish("room:1", payload("after")).await.unwrap();

        assert_eq!(late.recv().await, Delivery::Event(payload("after")));
    }
}
