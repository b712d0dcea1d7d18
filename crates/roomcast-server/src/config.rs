//! Runtime configuration.

use std::{path::PathBuf, time::Duration};

use roomcast_core::{DEFAULT_MAX_CONTENT_CHARS, IngestPolicy};

/// Default per-connection outbound queue capacity.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 128;

/// Default capacity of the direct-reply queue (errors, warnings, confirmation).
pub const DEFAULT_REPLY_CAPACITY: usize = 16;

/// Default socket write timeout.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Room events queued per connection before it is evicted
    pub outbound_capacity: usize,
    /// Direct replies queued per connection before it is closed
    pub reply_capacity: usize,
    /// Maximum time a single socket write may take
    pub write_timeout: Duration,
    /// Maximum message length in Unicode scalar values
    pub max_content_chars: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            reply_capacity: DEFAULT_REPLY_CAPACITY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
        }
    }
}

impl ConnectionConfig {
    /// Ingest policy derived from these limits.
    pub fn ingest_policy(&self) -> IngestPolicy {
        IngestPolicy::new(self.max_content_chars)
    }
}

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:8000")
    pub bind_address: String,
    /// Redb file for the message log. In-memory log when `None`.
    pub database_path: Option<PathBuf>,
    /// TOML rooms file. No rooms (every join rejected) when `None`.
    pub rooms_path: Option<PathBuf>,
    /// HS256 secret for credential validation
    pub jwt_secret: Option<String>,
    /// Redis server for cross-process fan-out. In-process hub when `None`.
    pub redis_url: Option<String>,
    /// Per-connection limits
    pub connection: ConnectionConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8000".to_string(),
            database_path: None,
            rooms_path: None,
            jwt_secret: None,
            redis_url: None,
            connection: ConnectionConfig::default(),
        }
    }
}
