//! Message ingest pipeline.
//!
//! Turns one inbound text frame into at most one published event:
//!
//! 1. decode and validate ([`IngestPolicy`])
//! 2. append to the message log
//! 3. publish on the room topic
//!
//! Step 3 never starts unless step 2 returned. A message a client sees on the
//! socket is always already in the log.

use std::sync::Arc;

use roomcast_core::{Environment, IngestError, IngestPolicy, UserIdentity};
use roomcast_proto::{ClientEvent, ErrorCode, MessageType, ServerEvent};

use crate::{
    broadcast::{Broadcast, room_topic},
    storage::{MessageLog, NewMessage, StorageError, StoredMessage},
};

/// Successful ingest results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored and published
    Delivered(StoredMessage),
    /// Stored, but publishing failed. Subscribers did not get it live.
    BroadcastDegraded(StoredMessage),
    /// Typing indicator relayed (never stored)
    Relayed {
        /// Whether the publish failed
        degraded: bool,
    },
}

impl IngestOutcome {
    /// Event to send back to the sender only, if any.
    pub fn sender_reply(&self) -> Option<ServerEvent> {
        match self {
            Self::BroadcastDegraded(_) => Some(ServerEvent::warning(
                ErrorCode::BroadcastDegraded,
                "Message saved but could not be delivered live",
            )),
            Self::Delivered(_) | Self::Relayed { .. } => None,
        }
    }
}

/// Error event for the sender.
pub fn error_reply(err: &IngestError) -> ServerEvent {
    ServerEvent::error(err.code(), err.client_message())
}

/// Validates, persists and publishes inbound frames.
pub struct IngestPipeline {
    log: Arc<dyn MessageLog>,
    broadcast: Arc<dyn Broadcast>,
    env: Arc<dyn Environment>,
    policy: IngestPolicy,
}

impl IngestPipeline {
    /// Create a pipeline.
    pub fn new(
        log: Arc<dyn MessageLog>,
        broadcast: Arc<dyn Broadcast>,
        env: Arc<dyn Environment>,
        policy: IngestPolicy,
    ) -> Self {
        Self { log, broadcast, env, policy }
    }

    /// Validation policy in effect.
    pub fn policy(&self) -> IngestPolicy {
        self.policy
    }

    /// Process one text frame from `sender` in `room_id`.
    ///
    /// # Errors
    ///
    /// Every error is local to this frame: the sender gets an error event and
    /// the connection stays open.
    pub async fn ingest(
        &self,
        room_id: u64,
        sender: &UserIdentity,
        raw: &str,
    ) -> Result<IngestOutcome, IngestError> {
        match self.policy.decode(raw)? {
            ClientEvent::Message { content } => self.ingest_message(room_id, sender, content).await,
            ClientEvent::Typing { is_typing } => {
                Ok(self.relay_typing(room_id, sender, is_typing).await)
            },
        }
    }

    async fn ingest_message(
        &self,
        room_id: u64,
        sender: &UserIdentity,
        content: String,
    ) -> Result<IngestOutcome, IngestError> {
        let message = NewMessage {
            room_id,
            sender_id: sender.user_id,
            content,
            message_type: MessageType::Text,
            timestamp: self.env.wall_clock(),
        };

        let stored = self.append(message).await.map_err(|e| {
            tracing::error!(room_id, user_id = sender.user_id, error = %e, "append failed");
            IngestError::PersistenceFailure(e.to_string())
        })?;

        let event = ServerEvent::Message { data: stored.to_wire(&sender.username) };
        if self.publish(room_id, &event).await {
            tracing::debug!(room_id, message_id = stored.id, sequence = stored.sequence, "delivered");
            Ok(IngestOutcome::Delivered(stored))
        } else {
            Ok(IngestOutcome::BroadcastDegraded(stored))
        }
    }

    async fn relay_typing(&self, room_id: u64, sender: &UserIdentity, is_typing: bool) -> IngestOutcome {
        let event = ServerEvent::Typing {
            room_id,
            user_id: sender.user_id,
            username: sender.username.clone(),
            is_typing,
        };
        IngestOutcome::Relayed { degraded: !self.publish(room_id, &event).await }
    }

    /// Run the blocking append on the blocking pool.
    async fn append(&self, message: NewMessage) -> Result<StoredMessage, StorageError> {
        let log = Arc::clone(&self.log);
        tokio::task::spawn_blocking(move || log.append(message))
            .await
            .map_err(|e| StorageError::Io(format!("append task failed: {e}")))?
    }

    /// Publish an event on the room topic. Returns false on failure.
    async fn publish(&self, room_id: u64, event: &ServerEvent) -> bool {
        let payload = match event.to_json() {
            Ok(json) => Arc::<str>::from(json),
            Err(e) => {
                tracing::error!(room_id, error = %e, "event encoding failed");
                return false;
            },
        };

        match self.broadcast.publish(&room_topic(room_id), payload).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(room_id, error = %e, "broadcast degraded");
                false
            },
        }
    }
}
