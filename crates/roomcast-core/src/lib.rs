//! Roomcast core logic.
//!
//! Everything in this crate is pure: no sockets, no tasks, no locks. The
//! server crate drives these types and executes the actions they return.
//!
//! - [`connection`]: per-connection lifecycle state machine
//! - [`registry`]: which connections are live in which room, and who is
//!   online
//! - [`ingest`]: decoding and validation of inbound frames
//! - [`env`]: time and randomness, injectable for tests

#![forbid(unsafe_code)]

pub mod connection;
pub mod env;
pub mod error;
pub mod ingest;
pub mod registry;
pub mod room;

pub use connection::{
    AuthOutcome, CloseReason, Connection, ConnectionAction, ConnectionState, RejectReason,
};
pub use env::Environment;
pub use error::{ConnectionError, IngestError, RegistryError};
pub use ingest::{DEFAULT_MAX_CONTENT_CHARS, IngestPolicy};
pub use registry::{ConnectionRegistry, PresenceChange, RegistrationResult};
pub use room::{Room, RoomKind, UserIdentity};
