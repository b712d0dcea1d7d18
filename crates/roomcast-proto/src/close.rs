//! WebSocket close codes used by the server (RFC 6455 §7.4).

/// Normal closure, the client went away cleanly.
pub const NORMAL: u16 = 1000;

/// Server is shutting down.
pub const GOING_AWAY: u16 = 1001;

/// Client sent a binary frame.
pub const UNSUPPORTED_DATA: u16 = 1003;

/// Authentication or membership check failed.
pub const POLICY_VIOLATION: u16 = 1008;

/// Unexpected server failure.
pub const INTERNAL_ERROR: u16 = 1011;

/// Client could not keep up with the room and was disconnected.
pub const TRY_AGAIN_LATER: u16 = 1013;
