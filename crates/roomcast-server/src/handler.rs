//! Connection handler.
//!
//! Drives one socket through the [`Connection`] state machine and executes
//! its actions. Once joined, three futures run concurrently in the
//! connection's task:
//!
//! - inbound pump: socket → ingest pipeline
//! - outbound pump: room subscription and direct replies → socket
//! - shutdown watcher: server shutdown → close
//!
//! All three share a [`CloseSignal`]. Whichever notices a close condition
//! first sets the reason, the others see it and stop. Release then runs once
//! through the connection's [`ConnectionLease`], which also releases on drop
//! if the task unwinds.

use std::{collections::VecDeque, sync::Arc};

use roomcast_core::{
    AuthOutcome, CloseReason, Connection, ConnectionAction, ConnectionState, Environment,
    UserIdentity,
};
use roomcast_proto::{ServerEvent, close};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch,
};
use tokio_util::task::TaskTracker;

use crate::{
    auth::Authenticator,
    broadcast::{Broadcast, Delivery, Subscription, room_topic},
    config::ConnectionConfig,
    ingest::{IngestPipeline, error_reply},
    membership::MembershipStore,
    presence::PresenceSink,
    registry::{ConnectionLease, SharedRegistry},
    socket::{InboundFrame, SocketReader, SocketWriter},
    storage::MessageLog,
};

/// External collaborators the server is assembled from.
pub struct Collaborators {
    /// Credential validation
    pub auth: Arc<dyn Authenticator>,
    /// Room membership
    pub membership: Arc<dyn MembershipStore>,
    /// Durable message log
    pub log: Arc<dyn MessageLog>,
    /// Fan-out transport
    pub broadcast: Arc<dyn Broadcast>,
    /// Online/offline sink
    pub presence: Arc<dyn PresenceSink>,
    /// Time and randomness
    pub env: Arc<dyn Environment>,
}

/// State shared by every connection task.
#[derive(Clone)]
pub struct ChatState {
    /// Credential validation
    pub auth: Arc<dyn Authenticator>,
    /// Room membership
    pub membership: Arc<dyn MembershipStore>,
    /// Live connections and presence
    pub registry: Arc<SharedRegistry>,
    /// Fan-out transport
    pub broadcast: Arc<dyn Broadcast>,
    /// Validate, persist, publish
    pub ingest: Arc<IngestPipeline>,
    /// Time and randomness
    pub env: Arc<dyn Environment>,
    /// Per-connection limits
    pub config: ConnectionConfig,
    /// Flips to `true` when the server shuts down
    pub shutdown: watch::Receiver<bool>,
    /// Live connection tasks, awaited on shutdown
    pub connections: TaskTracker,
}

impl ChatState {
    /// Wire collaborators together.
    pub fn new(
        collaborators: Collaborators,
        config: ConnectionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let Collaborators { auth, membership, log, broadcast, presence, env } = collaborators;

        let ingest = IngestPipeline::new(
            log,
            Arc::clone(&broadcast),
            Arc::clone(&env),
            config.ingest_policy(),
        );

        Self {
            auth,
            membership,
            registry: Arc::new(SharedRegistry::new(presence)),
            broadcast,
            ingest: Arc::new(ingest),
            env,
            config,
            shutdown,
            connections: TaskTracker::new(),
        }
    }
}

/// First-wins close trigger shared by a connection's pumps.
pub struct CloseSignal {
    tx: watch::Sender<Option<CloseReason>>,
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Set the close reason. Returns false if a reason was already set.
    pub fn trigger(&self, reason: CloseReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    /// The winning reason, if triggered.
    pub fn reason(&self) -> Option<CloseReason> {
        self.tx.borrow().clone()
    }

    /// Resolves once triggered.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(Option::is_some).await;
    }
}

/// Run one connection from upgrade to close.
///
/// `credential` is the bearer token from the upgrade request. Returns the
/// reason the connection closed.
pub async fn handle_connection<R, W>(
    state: &ChatState,
    room_id: u64,
    credential: Option<String>,
    reader: R,
    mut writer: W,
) -> CloseReason
where
    R: SocketReader,
    W: SocketWriter,
{
    let handle = state.env.random_handle();
    let started = state.env.now();
    let (reply_tx, mut reply_rx) = mpsc::channel(state.config.reply_capacity.max(1));

    let mut session = Session {
        state,
        conn: Connection::new(room_id, handle),
        lease: None,
        subscription: None,
        replies: reply_tx,
    };

    let actions = match session.conn.accept(credential.as_deref()) {
        Ok(actions) => actions,
        Err(e) => session.conn.begin_close(CloseReason::Internal(e.to_string())),
    };
    session.execute(actions, &mut writer).await;

    if session.conn.state() != ConnectionState::Joined {
        let reason = session
            .conn
            .close_reason()
            .cloned()
            .unwrap_or_else(|| CloseReason::Internal("closed before join".to_string()));
        tracing::info!(room_id, handle, reason = %reason.description(), "connection refused");
        return reason;
    }

    let (Some(identity), Some(mut subscription)) =
        (session.conn.identity().cloned(), session.subscription.take())
    else {
        let reason = CloseReason::Internal("join incomplete".to_string());
        let actions = session.conn.begin_close(reason.clone());
        session.execute(actions, &mut writer).await;
        return reason;
    };

    tracing::info!(room_id, user_id = identity.user_id, handle, "connection joined");

    let signal = CloseSignal::new();
    tokio::join!(
        inbound_pump(state, room_id, &identity, reader, session.replies.clone(), &signal),
        outbound_pump(&mut writer, &mut subscription, &mut reply_rx, state.config, &signal),
        watch_shutdown(state.shutdown.clone(), &signal),
    );

    let reason =
        signal.reason().unwrap_or_else(|| CloseReason::Internal("pumps stopped".to_string()));
    let actions = session.conn.begin_close(reason.clone());
    session.execute(actions, &mut writer).await;

    let elapsed_ms = (state.env.now() - started).as_millis() as u64;
    if reason.is_slow_consumer() {
        tracing::warn!(
            room_id,
            user_id = identity.user_id,
            handle,
            reason = %reason.description(),
            elapsed_ms,
            "slow consumer disconnected"
        );
    } else {
        tracing::info!(
            room_id,
            user_id = identity.user_id,
            handle,
            reason = %reason.description(),
            elapsed_ms,
            "connection closed"
        );
    }

    reason
}

/// Per-connection resources owned while executing actions.
struct Session<'a> {
    state: &'a ChatState,
    conn: Connection,
    lease: Option<ConnectionLease>,
    subscription: Option<Subscription>,
    replies: mpsc::Sender<ServerEvent>,
}

impl Session<'_> {
    async fn execute<W: SocketWriter>(&mut self, actions: Vec<ConnectionAction>, writer: &mut W) {
        let mut queue: VecDeque<ConnectionAction> = actions.into();

        while let Some(action) = queue.pop_front() {
            let follow_up = match action {
                ConnectionAction::Authenticate { credential } => {
                    match self.authenticate(&credential).await {
                        Ok(outcome) => self.conn.authenticated(outcome).unwrap_or_else(|e| {
                            self.abort(&mut queue, CloseReason::Internal(e.to_string()))
                        }),
                        Err(detail) => {
                            let room_id = self.conn.room_id();
                            tracing::error!(room_id, error = %detail, "auth check failed");
                            self.abort(&mut queue, CloseReason::Internal(detail))
                        },
                    }
                },

                ConnectionAction::Register { room_id, user_id, handle } => {
                    match ConnectionLease::acquire(
                        Arc::clone(&self.state.registry),
                        Arc::clone(&self.state.broadcast),
                        room_id,
                        user_id,
                        handle,
                    ) {
                        Ok((lease, _)) => {
                            self.lease = Some(lease);
                            Vec::new()
                        },
                        Err(e) => {
                            tracing::error!(room_id, user_id, handle, error = %e, "register failed");
                            self.abort(&mut queue, CloseReason::Internal(e.to_string()))
                        },
                    }
                },

                ConnectionAction::Subscribe { room_id } => {
                    let topic = room_topic(room_id);
                    let capacity = self.state.config.outbound_capacity;
                    match self.state.broadcast.subscribe(&topic, capacity).await {
                        Ok(subscription) => {
                            if let Some(lease) = self.lease.as_mut() {
                                lease.attach_subscription(topic, subscription.id());
                            }
                            self.subscription = Some(subscription);
                            Vec::new()
                        },
                        Err(e) => {
                            tracing::error!(room_id, error = %e, "subscribe failed");
                            self.abort(&mut queue, CloseReason::Internal(e.to_string()))
                        },
                    }
                },

                ConnectionAction::Send(event) => match self.replies.try_send(event) {
                    Ok(()) => Vec::new(),
                    Err(_) => self.abort(&mut queue, CloseReason::SlowConsumer),
                },

                ConnectionAction::Reject(reason) => {
                    let code = close::POLICY_VIOLATION;
                    close_socket(writer, code, reason.as_str(), self.state.config).await;
                    Vec::new()
                },

                ConnectionAction::Release { .. } => {
                    if let Some(lease) = &self.lease {
                        lease.release();
                    }
                    Vec::new()
                },

                ConnectionAction::CloseSocket { code, reason } => {
                    close_socket(writer, code, &reason, self.state.config).await;
                    self.conn.finish_close();
                    Vec::new()
                },
            };

            queue.extend(follow_up);
        }
    }

    /// Drop pending join actions and start closing.
    fn abort(
        &mut self,
        queue: &mut VecDeque<ConnectionAction>,
        reason: CloseReason,
    ) -> Vec<ConnectionAction> {
        queue.clear();
        self.conn.begin_close(reason)
    }

    /// Credential then membership. `Err` only for collaborator failures.
    async fn authenticate(&self, credential: &str) -> Result<AuthOutcome, String> {
        let room_id = self.conn.room_id();

        let Some(identity) =
            self.state.auth.validate_credential(credential).await.map_err(|e| e.to_string())?
        else {
            return Ok(AuthOutcome::InvalidCredential);
        };

        let member = self
            .state
            .membership
            .is_member(room_id, identity.user_id)
            .await
            .map_err(|e| e.to_string())?;

        if member { Ok(AuthOutcome::Accepted(identity)) } else { Ok(AuthOutcome::NotMember) }
    }
}

async fn close_socket<W: SocketWriter>(
    writer: &mut W,
    code: u16,
    reason: &str,
    config: ConnectionConfig,
) {
    match tokio::time::timeout(config.write_timeout, writer.close(code, reason)).await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => tracing::debug!(code, error = %e, "close frame not delivered"),
        Err(_) => tracing::debug!(code, "close frame timed out"),
    }
}

/// Socket → ingest. Replies for the sender go through `replies`.
async fn inbound_pump<R: SocketReader>(
    state: &ChatState,
    room_id: u64,
    identity: &UserIdentity,
    mut reader: R,
    replies: mpsc::Sender<ServerEvent>,
    signal: &CloseSignal,
) {
    loop {
        let next = tokio::select! {
            frame = reader.recv() => frame,
            () = signal.closed() => return,
        };

        let text = match next {
            Some(Ok(InboundFrame::Text(text))) => text,
            Some(Ok(InboundFrame::Binary(_))) => {
                let detail = "binary frames are not supported".to_string();
                signal.trigger(CloseReason::ProtocolViolation(detail));
                return;
            },
            Some(Ok(InboundFrame::Close)) | None => {
                signal.trigger(CloseReason::ClientClosed);
                return;
            },
            Some(Err(e)) => {
                signal.trigger(CloseReason::Transport(e.to_string()));
                return;
            },
        };

        // Closing abandons a stuck append; publish only ever follows a
        // completed one
        let ingested = tokio::select! {
            result = state.ingest.ingest(room_id, identity, &text) => result,
            () = signal.closed() => return,
        };

        let reply = match ingested {
            Ok(outcome) => outcome.sender_reply(),
            Err(e) => {
                tracing::debug!(room_id, user_id = identity.user_id, error = %e, "frame rejected");
                Some(error_reply(&e))
            },
        };

        if let Some(event) = reply {
            match replies.try_send(event) {
                Ok(()) => {},
                Err(TrySendError::Full(_)) => {
                    signal.trigger(CloseReason::SlowConsumer);
                    return;
                },
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }
}

/// Subscription and direct replies → socket, one write at a time.
async fn outbound_pump<W: SocketWriter>(
    writer: &mut W,
    subscription: &mut Subscription,
    replies: &mut mpsc::Receiver<ServerEvent>,
    config: ConnectionConfig,
    signal: &CloseSignal,
) {
    loop {
        let payload: Arc<str> = tokio::select! {
            biased;

            () = signal.closed() => return,

            Some(event) = replies.recv() => match event.to_json() {
                Ok(json) => Arc::from(json),
                Err(e) => {
                    tracing::error!(error = %e, "reply encoding failed");
                    continue;
                },
            },

            delivery = subscription.recv() => match delivery {
                Delivery::Event(payload) => payload,
                Delivery::Evicted => {
                    signal.trigger(CloseReason::SlowConsumer);
                    return;
                },
                Delivery::Closed => {
                    signal.trigger(CloseReason::Internal("broadcast channel closed".to_string()));
                    return;
                },
            },
        };

        match tokio::time::timeout(config.write_timeout, writer.send(&payload)).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                signal.trigger(CloseReason::Transport(e.to_string()));
                return;
            },
            Err(_) => {
                signal.trigger(CloseReason::WriteTimeout);
                return;
            },
        }
    }
}

/// Server shutdown → close.
async fn watch_shutdown(mut shutdown: watch::Receiver<bool>, signal: &CloseSignal) {
    let stopped = async { shutdown.wait_for(|stop| *stop).await.is_ok() };

    tokio::select! {
        ok = stopped => {
            if ok {
                signal.trigger(CloseReason::ServerShutdown);
            } else {
                // Shutdown sender gone, nothing left to watch
                signal.closed().await;
            }
        },
        () = signal.closed() => {},
    }
}
