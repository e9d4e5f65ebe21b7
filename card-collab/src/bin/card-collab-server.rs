//! Card collaboration gateway.
//!
//! ```text
//! RUST_LOG=info card-collab-server --bind 0.0.0.0:4000 --data-dir ./collab \
//!     --card-api http://localhost:3000/api --card-api-token $TOKEN
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use card_collab::{CardApiConfig, Gateway, ServerConfig, StorageConfig};

#[derive(Parser, Debug)]
#[command(name = "card-collab-server")]
#[command(version, about = "Real-time collaboration gateway for card descriptions")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "COLLAB_BIND", default_value = "127.0.0.1:4000")]
    bind: SocketAddr,

    /// RocksDB directory for document snapshots; in-memory when omitted
    #[arg(long, env = "COLLAB_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Base URL of the card API receiving description writes
    #[arg(long, env = "COLLAB_CARD_API")]
    card_api: Option<String>,

    /// Bearer token for the card API
    #[arg(long, env = "COLLAB_CARD_API_TOKEN", hide_env_values = true)]
    card_api_token: Option<String>,

    /// Quiet period in milliseconds before a description is written
    #[arg(long, env = "COLLAB_SAVE_DEBOUNCE_MS", default_value = "2000")]
    save_debounce_ms: u64,

    /// Seconds between heartbeat pings
    #[arg(long, env = "COLLAB_HEARTBEAT_SECS", default_value = "30")]
    heartbeat_secs: u64,

    /// Per-room relay buffer before a slow peer is resynchronized
    #[arg(long, env = "COLLAB_BROADCAST_CAPACITY", default_value = "256")]
    broadcast_capacity: usize,

    /// Relays queued per socket before a slow peer is resynchronized
    #[arg(long, env = "COLLAB_OUTBOUND_CAPACITY", default_value = "256")]
    outbound_capacity: usize,

    /// Keep rooms in memory after their last client leaves
    #[arg(long, env = "COLLAB_RETAIN_ROOMS")]
    retain_rooms: bool,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let storage = match self.data_dir {
            Some(path) => StorageConfig::Rocks { path },
            None => StorageConfig::Memory,
        };
        let card_api = self.card_api.map(|base_url| CardApiConfig {
            token: self.card_api_token,
            ..CardApiConfig::new(base_url)
        });
        ServerConfig {
            bind_addr: self.bind,
            broadcast_capacity: self.broadcast_capacity.max(1),
            outbound_capacity: self.outbound_capacity.max(1),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            save_debounce: Duration::from_millis(self.save_debounce_ms),
            evict_idle_rooms: !self.retain_rooms,
            storage,
            card_api,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let gateway = Gateway::from_config(config)?;

    gateway
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
            log::info!("Shutdown requested");
        })
        .await?;
    Ok(())
}
