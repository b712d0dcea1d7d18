//! Redis pub/sub hub for multi-process deployments.
//!
//! Publishing is a `PUBLISH` on the room's channel. Receiving goes through
//! one pattern subscription per process: every event on `room:*`, including
//! the ones this process published, is handed to a process-local
//! [`LocalBroadcast`], which owns the bounded per-connection queues and the
//! eviction policy. Subscribers therefore see a single delivery path and
//! one publisher's events arrive in publish order.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::{
    Client, RedisError, RedisResult,
    aio::{MultiplexedConnection, PubSub},
};
use tokio::task::JoinHandle;

use super::{Broadcast, BroadcastError, LocalBroadcast, Subscription};

/// Channel pattern covering every room topic.
const TOPIC_PATTERN: &str = "room:*";

/// Pause between attempts to re-establish a lost subscription.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Broadcast hub backed by Redis pub/sub.
pub struct RedisBroadcast {
    local: Arc<LocalBroadcast>,
    publisher: MultiplexedConnection,
    listener: JoinHandle<()>,
}

impl RedisBroadcast {
    /// Connect to `url` and start listening on every room topic.
    ///
    /// The pattern subscription is in place when this returns, so events
    /// published afterwards by any process reach this hub's subscribers.
    ///
    /// # Errors
    ///
    /// - `BroadcastError::Unavailable` if the URL is invalid or the server
    ///   cannot be reached
    pub async fn connect(url: &str) -> Result<Self, BroadcastError> {
        let client = Client::open(url).map_err(unavailable)?;
        let publisher = client.get_multiplexed_async_connection().await.map_err(unavailable)?;
        let pubsub = listen(&client).await.map_err(unavailable)?;

        let local = Arc::new(LocalBroadcast::new());
        let listener = tokio::spawn(relay(client, pubsub, Arc::clone(&local)));

        tracing::info!(pattern = TOPIC_PATTERN, "redis broadcast connected");
        Ok(Self { local, publisher, listener })
    }

    /// Number of subscribers on `topic` in this process.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.local.subscriber_count(topic)
    }
}

impl Drop for RedisBroadcast {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl Broadcast for RedisBroadcast {
    async fn publish(&self, topic: &str, payload: Arc<str>) -> Result<usize, BroadcastError> {
        let mut connection = self.publisher.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(&*payload)
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;

        Ok(usize::try_from(receivers).unwrap_or(0))
    }

    async fn subscribe(&self, topic: &str, capacity: usize) -> Result<Subscription, BroadcastError> {
        self.local.subscribe(topic, capacity).await
    }

    fn unsubscribe(&self, topic: &str, subscription_id: u64) -> bool {
        self.local.unsubscribe(topic, subscription_id)
    }
}

fn unavailable(err: RedisError) -> BroadcastError {
    BroadcastError::Unavailable(err.to_string())
}

async fn listen(client: &Client) -> RedisResult<PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(TOPIC_PATTERN).await?;
    Ok(pubsub)
}

/// Forward every Redis message into the local hub, resubscribing when the
/// connection drops. Events published while disconnected are lost.
async fn relay(client: Client, mut pubsub: PubSub, local: Arc<LocalBroadcast>) {
    loop {
        {
            let mut messages = pubsub.on_message();
            while let Some(message) = messages.next().await {
                let topic = message.get_channel_name();
                match message.get_payload::<String>() {
                    Ok(payload) => {
                        local.deliver(topic, &Arc::from(payload));
                    },
                    Err(e) => tracing::warn!(topic, error = %e, "dropping undecodable event"),
                }
            }
        }

        tracing::error!("redis subscription lost, resubscribing");
        pubsub = loop {
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            match listen(&client).await {
                Ok(pubsub) => break pubsub,
                Err(e) => tracing::warn!(error = %e, "resubscribe failed"),
            }
        };
        tracing::info!("redis subscription restored");
    }
}
