//! Roomcast wire protocol.
//!
//! Every frame on the socket is a UTF-8 JSON object with a `type` tag. Clients
//! send [`ClientEvent`]s, the server sends [`ServerEvent`]s. Binary frames are
//! not part of the protocol.
//!
//! # Inbound
//!
//! ```json
//! { "type": "message", "content": "hi" }
//! { "type": "typing", "is_typing": true }
//! ```
//!
//! # Outbound
//!
//! ```json
//! { "type": "message", "data": { "id": 7, "room_id": 1, "sequence": 6, ... } }
//! ```
//!
//! The `sequence` inside a message is authoritative for ordering. The broadcast
//! layer may reorder events from concurrent publishers, the log never does.

#![forbid(unsafe_code)]

pub mod client;
pub mod close;
pub mod errors;
pub mod server;

pub use client::ClientEvent;
pub use errors::{ProtocolError, Result};
pub use server::{ErrorCode, MessageData, MessageType, ServerEvent};
