//! Roomcast server binary.
//!
//! # Usage
//!
//! ```bash
//! # Development: in-memory message log
//! roomcast-server --bind 0.0.0.0:8000 --rooms rooms.toml --jwt-secret dev-secret
//!
//! # Production: durable message log, secret from the environment
//! ROOMCAST_JWT_SECRET=... roomcast-server --database roomcast.redb --rooms rooms.toml
//!
//! # Several processes behind a load balancer share one Redis for fan-out
//! roomcast-server --redis-url redis://127.0.0.1:6379 --database a.redb --rooms rooms.toml
//! ```

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use roomcast_server::{
    ConnectionConfig, DEFAULT_OUTBOUND_CAPACITY, Server, ServerRuntimeConfig,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Roomcast chat fan-out server
#[derive(Parser, Debug)]
#[command(name = "roomcast-server")]
#[command(about = "Realtime chat fan-out server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8000")]
    bind: String,

    /// Path to the redb message log (in-memory when omitted)
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Path to the TOML rooms file
    #[arg(short, long)]
    rooms: Option<PathBuf>,

    /// HS256 secret for bearer tokens
    #[arg(long, env = "ROOMCAST_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Redis URL for fan-out across server processes (single process when
    /// omitted)
    #[arg(long, env = "ROOMCAST_REDIS_URL")]
    redis_url: Option<String>,

    /// Room events queued per connection before it is dropped as slow
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_CAPACITY)]
    outbound_capacity: usize,

    /// Socket write timeout in milliseconds
    #[arg(long, default_value = "5000")]
    write_timeout_ms: u64,

    /// Maximum message length in characters
    #[arg(long, default_value = "2000")]
    max_content_chars: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Roomcast server starting");
    tracing::info!("Binding to {}", args.bind);

    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        database_path: args.database,
        rooms_path: args.rooms,
        jwt_secret: args.jwt_secret,
        redis_url: args.redis_url,
        connection: ConnectionConfig {
            outbound_capacity: args.outbound_capacity.max(1),
            write_timeout: Duration::from_millis(args.write_timeout_ms),
            max_content_chars: args.max_content_chars,
            ..Default::default()
        },
    };

    let server = Server::bind(config).await?;
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}
