//! Quill relay - reference sync server for collaborative documents.
//!
//! Configuration comes from the environment:
//! - `QUILL_RELAY_ADDR`: bind address (default `127.0.0.1:9090`)
//! - `QUILL_RELAY_CAPACITY`: broadcast buffer per room (default 256)
//! - `QUILL_RELAY_MAX_PEERS`: members per room before joins are rejected
//! - `RUST_LOG`: log filter, as usual for `env_logger`

use std::env;
use std::str::FromStr;

use log::{info, warn};
use quill_sync::{ServerConfig, SyncServer};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Ignoring unparsable {key}={raw}");
            default
        }),
        Err(_) => default,
    }
}

fn config_from_env() -> ServerConfig {
    let defaults = ServerConfig::default();
    ServerConfig {
        bind_addr: env::var("QUILL_RELAY_ADDR").unwrap_or(defaults.bind_addr),
        broadcast_capacity: env_or("QUILL_RELAY_CAPACITY", defaults.broadcast_capacity),
        max_peers_per_room: env_or("QUILL_RELAY_MAX_PEERS", defaults.max_peers_per_room),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = config_from_env();
    info!(
        "Starting Quill relay on {} (capacity {}, max {} per room)",
        config.bind_addr, config.broadcast_capacity, config.max_peers_per_room
    );

    SyncServer::new(config).run().await
}
