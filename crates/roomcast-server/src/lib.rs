//! Roomcast production server.
//!
//! Realtime chat fan-out over WebSockets: axum for the transport, Tokio for
//! the runtime, redb for the durable message log, system time with
//! cryptographic RNG.
//!
//! # Architecture
//!
//! This crate wraps [`roomcast_core`]'s action-based connection logic with
//! real I/O. Each WebSocket gets one task running [`handle_connection`],
//! which executes the actions of a [`roomcast_core::Connection`] and pumps
//! frames between the socket, the [`IngestPipeline`] and the room's
//! [`Broadcast`] topic.
//!
//! # Components
//!
//! - [`Server`]: binds, serves, shuts down gracefully
//! - [`ChatState`]: collaborators shared by every connection
//! - [`SharedRegistry`] / [`ConnectionLease`]: live connections and presence
//! - [`IngestPipeline`]: validate, persist, publish
//! - [`LocalBroadcast`] / [`RedisBroadcast`]: fan-out within one process or
//!   across every process sharing a Redis server
//! - [`storage`]: message log implementations
//! - [`SystemEnv`]: production environment (real time, crypto RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod broadcast;
mod config;
mod error;
mod handler;
mod ingest;
mod membership;
mod presence;
mod registry;
mod socket;
pub mod storage;
mod system_env;
mod ws;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

pub use auth::{AuthError, Authenticator, Claims, JwtAuthenticator, StaticAuthenticator};
use axum::{Router, routing::get};
pub use broadcast::{
    Broadcast, BroadcastError, Delivery, LocalBroadcast, RedisBroadcast, Subscription, room_topic,
};
pub use config::{
    ConnectionConfig, DEFAULT_OUTBOUND_CAPACITY, DEFAULT_REPLY_CAPACITY, DEFAULT_WRITE_TIMEOUT,
    ServerRuntimeConfig,
};
pub use error::ServerError;
pub use handler::{ChatState, CloseSignal, Collaborators, handle_connection};
pub use ingest::{IngestOutcome, IngestPipeline, error_reply};
pub use membership::{MemoryMembership, MembershipError, MembershipStore};
pub use presence::{MemoryPresence, PresenceRecord, PresenceSink};
pub use registry::{ConnectionLease, SharedRegistry};
use roomcast_core::Environment;
pub use socket::{
    ClientEnd, InboundFrame, MemoryReader, MemoryWriter, OutboundFrame, SocketReader,
    SocketWriter, TransportError, memory_socket,
};
pub use storage::{
    ChaoticMessageLog, MemoryMessageLog, MessageLog, NewMessage, PageOrder, RedbMessageLog,
    StorageError, StoredMessage,
};
pub use system_env::SystemEnv;
use tokio::{net::TcpListener, sync::watch};
pub use ws::{ChatQuery, RoomConnections, WsReader, WsWriter};

/// HTTP routes served by [`Server`].
///
/// - `GET /ws/chat/{room_id}`: chat WebSocket
/// - `GET /rooms/{room_id}/connections`: live handles in a room
/// - `GET /health`
pub fn router(state: ChatState) -> Router {
    Router::new()
        .route("/ws/chat/{room_id}", get(ws::chat_socket))
        .route("/rooms/{room_id}/connections", get(ws::room_connections))
        .route("/health", get(ws::health))
        .with_state(state)
}

/// Extra time, on top of the write timeout, that shutdown waits for live
/// connections to finish closing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Production Roomcast server.
pub struct Server {
    listener: TcpListener,
    state: ChatState,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Build collaborators from `config` and bind the listener.
    ///
    /// # Errors
    ///
    /// - `ServerError::Config` if the JWT secret is missing or the rooms file
    ///   cannot be loaded
    /// - `ServerError::Storage` if the message log cannot be opened
    /// - `ServerError::Broadcast` if the Redis server cannot be reached
    /// - `ServerError::Transport` if the address cannot be bound
    pub async fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        let secret = config
            .jwt_secret
            .as_deref()
            .filter(|secret| !secret.is_empty())
            .ok_or_else(|| ServerError::Config("a JWT secret is required".to_string()))?;

        let env: Arc<dyn Environment> = Arc::new(SystemEnv::new());

        let log: Arc<dyn MessageLog> = match &config.database_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "opening message log");
                Arc::new(RedbMessageLog::open(path)?)
            },
            None => {
                tracing::warn!("No database path - messages are kept in memory only");
                Arc::new(MemoryMessageLog::new())
            },
        };

        let membership = match &config.rooms_path {
            Some(path) => {
                let membership =
                    MemoryMembership::load(path).map_err(|e| ServerError::Config(e.to_string()))?;
                tracing::info!(path = %path.display(), rooms = membership.room_count(), "loaded rooms");
                membership
            },
            None => {
                tracing::warn!("No rooms file - every join will be rejected");
                MemoryMembership::new()
            },
        };

        let broadcast: Arc<dyn Broadcast> = match &config.redis_url {
            Some(url) => Arc::new(RedisBroadcast::connect(url).await?),
            None => {
                tracing::warn!("No Redis URL - fan-out reaches this process only");
                Arc::new(LocalBroadcast::new())
            },
        };

        let collaborators = Collaborators {
            auth: Arc::new(JwtAuthenticator::new(secret.as_bytes())),
            membership: Arc::new(membership),
            log,
            broadcast,
            presence: Arc::new(MemoryPresence::new(Arc::clone(&env))),
            env,
        };

        let listener = TcpListener::bind(&config.bind_address).await.map_err(|e| {
            ServerError::Transport(format!("cannot bind {}: {e}", config.bind_address))
        })?;

        Ok(Self::from_parts(listener, collaborators, config.connection))
    }

    /// Assemble a server from an already-bound listener and collaborators.
    pub fn from_parts(
        listener: TcpListener,
        collaborators: Collaborators,
        connection: ConnectionConfig,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = ChatState::new(collaborators, connection, shutdown_rx);
        Self { listener, state, shutdown }
    }

    /// Shared connection state.
    pub fn state(&self) -> &ChatState {
        &self.state
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until Ctrl-C.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve until `signal` resolves.
    ///
    /// Live connections are closed with 1001 and the call returns once they
    /// have finished, or after the write timeout plus a short grace period.
    pub async fn run_until<F>(self, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Self { listener, state, shutdown } = self;
        tracing::info!("Server listening on {}", listener.local_addr()?);

        // Upgraded sockets outlive the HTTP connection axum waits for
        let connections = state.connections.clone();
        let drain = state.config.write_timeout + SHUTDOWN_GRACE;

        let graceful = async move {
            signal.await;
            tracing::info!("shutdown requested, closing connections");
            shutdown.send_replace(true);
        };

        axum::serve(listener, router(state))
            .with_graceful_shutdown(graceful)
            .await
            .map_err(|e| ServerError::Transport(e.to_string()))?;

        connections.close();
        if tokio::time::timeout(drain, connections.wait()).await.is_err() {
            tracing::warn!(
                remaining = connections.len(),
                "connections still open after shutdown drain"
            );
        }

        Ok(())
    }
}
