//! Server configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::debounce::DEFAULT_QUIET_PERIOD;
use crate::registry::RegistryConfig;

/// Where room snapshots live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    /// Process memory; snapshots vanish on restart.
    Memory,
    /// RocksDB directory.
    Rocks { path: PathBuf },
}

/// Downstream card API used for debounced description writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardApiConfig {
    /// e.g. `http://localhost:3000/api`
    pub base_url: String,
    /// Sent as `Authorization: Bearer <token>`.
    pub token: Option<String>,
    pub timeout: Duration,
}

impl CardApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the WebSocket listener to
    pub bind_addr: SocketAddr,
    /// Per-room broadcast buffer; a peer further behind is resynchronized
    pub broadcast_capacity: usize,
    /// Relays queued for one peer's socket before it is resynchronized
    pub outbound_capacity: usize,
    /// Ping period; two silent periods close the connection
    pub heartbeat_interval: Duration,
    /// Quiet period before a card description is written downstream
    pub save_debounce: Duration,
    /// Drop rooms with no clients once their last save succeeded
    pub evict_idle_rooms: bool,
    pub storage: StorageConfig,
    /// `None` logs descriptions instead of writing them
    pub card_api: Option<CardApiConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 4000)),
            broadcast_capacity: 256,
            outbound_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            save_debounce: DEFAULT_QUIET_PERIOD,
            evict_idle_rooms: true,
            storage: StorageConfig::Memory,
            card_api: None,
        }
    }
}

impl ServerConfig {
    /// Defaults bound to an explicit address.
    pub fn bound_to(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }

    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            broadcast_capacity: self.broadcast_capacity,
            evict_idle_rooms: self.evict_idle_rooms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 4000);
        assert_eq!(config.save_debounce, Duration::from_secs(2));
        assert_eq!(config.storage, StorageConfig::Memory);
        assert!(config.evict_idle_rooms);
        assert!(config.card_api.is_none());
        assert_eq!(config.outbound_capacity, 256);
    }

    #[test]
    fn test_registry_config_follows_server_config() {
        let config = ServerConfig {
            broadcast_capacity: 8,
            evict_idle_rooms: false,
            ..ServerConfig::bound_to("0.0.0.0:9000".parse().unwrap())
        };
        let registry = config.registry();
        assert_eq!(registry.broadcast_capacity, 8);
        assert!(!registry.evict_idle_rooms);
        assert_eq!(config.bind_addr.port(), 9000);
    }
}
