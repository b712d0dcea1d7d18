//! Connection lifecycle state machine.
//!
//! Tracks a single socket from upgrade to close. Uses the action pattern:
//! methods take inputs (credential, auth outcome, close trigger) and return
//! actions for the handler to execute. No I/O happens here.
//!
//! # State Machine
//!
//! ```text
//! ┌────────────┐ credential ┌────────────────┐  accepted  ┌────────┐
//! │ Connecting │───────────>│ Authenticating │───────────>│ Joined │
//! └────────────┘            └────────────────┘            └────────┘
//!       │ no credential             │ rejected                │ begin_close
//!       ↓                           ↓                         ↓
//!   ┌────────┐                 ┌────────┐  finish_close  ┌─────────┐
//!   │ Closed │                 │ Closed │<───────────────│ Closing │
//!   └────────┘                 └────────┘                └─────────┘
//! ```
//!
//! `begin_close` is idempotent. The first reason wins and later calls return
//! no actions, so concurrent close triggers (client close racing a slow
//! consumer eviction, say) release the connection exactly once.

use roomcast_proto::{ServerEvent, close};

use crate::{error::ConnectionError, room::UserIdentity};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket upgraded, nothing checked yet
    Connecting,
    /// Credential received, waiting for auth and membership checks
    Authenticating,
    /// Registered and subscribed, pumps running
    Joined,
    /// Close triggered, release in progress
    Closing,
    /// Terminal
    Closed,
}

/// Why a connection was refused before joining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No token in the query string or `Authorization` header
    MissingCredential,
    /// Token failed validation or expired
    InvalidCredential,
    /// User is not a member of the requested room
    NotMember,
}

impl RejectReason {
    /// Reason string sent in the close frame.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingCredential => "missing credential",
            Self::InvalidCredential => "invalid credential",
            Self::NotMember => "not a member of this room",
        }
    }
}

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Refused before joining
    Rejected(RejectReason),
    /// Client sent a close frame or the stream ended
    ClientClosed,
    /// Socket read or write failed
    Transport(String),
    /// Client broke the protocol (binary frame)
    ProtocolViolation(String),
    /// Outbound queue overflowed
    SlowConsumer,
    /// A socket write did not finish within the write timeout
    WriteTimeout,
    /// Server is shutting down
    ServerShutdown,
    /// Collaborator failure or handle collision
    Internal(String),
}

impl CloseReason {
    /// WebSocket close code for this reason.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Rejected(_) => close::POLICY_VIOLATION,
            Self::ClientClosed => close::NORMAL,
            Self::ProtocolViolation(_) => close::UNSUPPORTED_DATA,
            Self::SlowConsumer | Self::WriteTimeout => close::TRY_AGAIN_LATER,
            Self::ServerShutdown => close::GOING_AWAY,
            Self::Transport(_) | Self::Internal(_) => close::INTERNAL_ERROR,
        }
    }

    /// Short reason text for the close frame and logs.
    pub fn description(&self) -> String {
        match self {
            Self::Rejected(reason) => reason.as_str().to_string(),
            Self::ClientClosed => "client closed".to_string(),
            Self::Transport(detail) => format!("transport error: {detail}"),
            Self::ProtocolViolation(detail) => format!("protocol violation: {detail}"),
            Self::SlowConsumer => "slow consumer".to_string(),
            Self::WriteTimeout => "write timeout".to_string(),
            Self::ServerShutdown => "server shutting down".to_string(),
            Self::Internal(detail) => format!("internal error: {detail}"),
        }
    }

    /// Whether the connection was dropped for falling behind.
    pub fn is_slow_consumer(&self) -> bool {
        matches!(self, Self::SlowConsumer | Self::WriteTimeout)
    }
}

/// Result of the credential and membership checks, fed back by the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Credential valid and user is a member
    Accepted(UserIdentity),
    /// Credential invalid or expired
    InvalidCredential,
    /// Credential valid, user not in room
    NotMember,
}

/// Actions returned by the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Validate this credential and check room membership
    Authenticate {
        /// Bearer token as received
        credential: String,
    },

    /// Add the connection to the registry
    Register {
        /// Room the connection joins
        room_id: u64,
        /// Authenticated user
        user_id: u64,
        /// Connection handle
        handle: u64,
    },

    /// Subscribe to the room topic
    Subscribe {
        /// Room whose topic to subscribe to
        room_id: u64,
    },

    /// Send this event to the client
    Send(ServerEvent),

    /// Close the socket with a policy-violation code. Nothing to release.
    Reject(RejectReason),

    /// Unsubscribe and unregister
    Release {
        /// Room the connection was in
        room_id: u64,
        /// User of the connection
        user_id: u64,
        /// Connection handle
        handle: u64,
    },

    /// Close the socket
    CloseSocket {
        /// WebSocket close code
        code: u16,
        /// Close reason text
        reason: String,
    },
}

/// Connection state machine.
///
/// One per socket. Pure: the handler executes the returned actions.
#[derive(Debug, Clone)]
pub struct Connection {
    state: ConnectionState,
    room_id: u64,
    handle: u64,
    identity: Option<UserIdentity>,
    close_reason: Option<CloseReason>,
}

impl Connection {
    /// Create a connection in [`ConnectionState::Connecting`] for `room_id`.
    pub fn new(room_id: u64, handle: u64) -> Self {
        debug_assert_ne!(handle, 0);
        Self { state: ConnectionState::Connecting, room_id, handle, identity: None, close_reason: None }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Room this connection targets.
    pub fn room_id(&self) -> u64 {
        self.room_id
    }

    /// Connection handle.
    pub fn handle(&self) -> u64 {
        self.handle
    }

    /// Authenticated user. `None` until joined.
    pub fn identity(&self) -> Option<&UserIdentity> {
        self.identity.as_ref()
    }

    /// Reason the connection closed or is closing.
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    /// Start the handshake with the credential from the upgrade request.
    ///
    /// A missing or empty credential rejects immediately.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::InvalidState` if not in `Connecting`
    pub fn accept(
        &mut self,
        credential: Option<&str>,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if self.state != ConnectionState::Connecting {
            return Err(ConnectionError::InvalidState { state: self.state, operation: "accept" });
        }

        match credential.map(str::trim).filter(|c| !c.is_empty()) {
            Some(credential) => {
                self.state = ConnectionState::Authenticating;
                Ok(vec![ConnectionAction::Authenticate { credential: credential.to_string() }])
            },
            None => Ok(self.reject(RejectReason::MissingCredential)),
        }
    }

    /// Apply the auth and membership result.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::InvalidState` if not in `Authenticating`
    pub fn authenticated(
        &mut self,
        outcome: AuthOutcome,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if self.state != ConnectionState::Authenticating {
            return Err(ConnectionError::InvalidState {
                state: self.state,
                operation: "authenticated",
            });
        }

        match outcome {
            AuthOutcome::Accepted(identity) => {
                let user_id = identity.user_id;
                self.identity = Some(identity);
                self.state = ConnectionState::Joined;

                Ok(vec![
                    ConnectionAction::Register { room_id: self.room_id, user_id, handle: self.handle },
                    ConnectionAction::Subscribe { room_id: self.room_id },
                    ConnectionAction::Send(ServerEvent::Connected { room_id: self.room_id, user_id }),
                ])
            },
            AuthOutcome::InvalidCredential => Ok(self.reject(RejectReason::InvalidCredential)),
            AuthOutcome::NotMember => Ok(self.reject(RejectReason::NotMember)),
        }
    }

    /// Trigger close. First reason wins.
    ///
    /// Releases registry and subscription only if the connection had joined.
    /// Returns no actions when already closing or closed.
    pub fn begin_close(&mut self, reason: CloseReason) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();

        match self.state {
            ConnectionState::Closing | ConnectionState::Closed => return actions,
            ConnectionState::Joined => {
                if let Some(identity) = &self.identity {
                    actions.push(ConnectionAction::Release {
                        room_id: self.room_id,
                        user_id: identity.user_id,
                        handle: self.handle,
                    });
                }
            },
            ConnectionState::Connecting | ConnectionState::Authenticating => {},
        }

        actions.push(ConnectionAction::CloseSocket {
            code: reason.close_code(),
            reason: reason.description(),
        });

        self.state = ConnectionState::Closing;
        self.close_reason = Some(reason);
        actions
    }

    /// Mark the socket as closed.
    pub fn finish_close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    fn reject(&mut self, reason: RejectReason) -> Vec<ConnectionAction> {
        self.state = ConnectionState::Closed;
        self.close_reason = Some(CloseReason::Rejected(reason));
        vec![ConnectionAction::Reject(reason)]
    }
}
