//! # card-collab: Real-time collaborative editing of card descriptions
//!
//! Several people edit one card's rich-text description at once. Every
//! participant holds a CRDT replica; a central gateway merges, relays,
//! persists, and eventually writes the description back to the card.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐  WebSocket (JSON)  ┌─────────────────┐
//! │ CollabProvider │ ◄────────────────► │     Gateway     │
//! │  (per editor)  │  card:* awareness:*│    (central)    │
//! └───────┬────────┘                    └────────┬────────┘
//!         │                                      │
//!         ▼                                      ▼
//! ┌────────────────┐                    ┌─────────────────┐     ┌───────────────┐
//! │ Yrs Doc        │                    │ SessionRegistry │ ──► │ DocumentStore │
//! │ (local)        │                    │ rooms card:<id> │     │ memory, rocks │
//! └────────────────┘                    └────────┬────────┘     └───────────────┘
//!                                                │
//!                                       ┌────────┴────────┐     ┌───────────────┐
//!                                       │  SaveDebouncer  │ ──► │  CardUpdater  │
//!                                       └─────────────────┘     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`]: Yrs document with the editor's XML layout and JSON projection
//! - [`store`]: Snapshot persistence behind a key-value backend
//! - [`presence`]: Cursor and "who is here" awareness
//! - [`registry`]: Room table with single-flight creation and idle eviction
//! - [`broadcast`]: Per-room fan-out
//! - [`debounce`]: Per-card debounced description writes
//! - [`card_api`]: HTTP and log-only description writers
//! - [`protocol`]: JSON wire events
//! - [`gateway`]: WebSocket server and per-connection state machine
//! - [`client`]: Client provider and WebSocket driver
//! - [`config`]: Server configuration

pub mod broadcast;
pub mod card_api;
pub mod client;
pub mod config;
pub mod debounce;
pub mod document;
pub mod error;
pub mod gateway;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod store;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, ConnId};
pub use card_api::{HttpCardUpdater, LogOnlyCardUpdater};
pub use client::{
    connect, ApplyPhase, CollabProvider, ConnectedProvider, LocalUser, Outbound, ProviderEvent,
};
pub use config::{CardApiConfig, ServerConfig, StorageConfig};
pub use debounce::{CardUpdater, SaveDebouncer};
pub use document::CollabDocument;
pub use error::{CollabError, Result};
pub use gateway::{Connection, Gateway, GatewayStats, Outbox};
pub use presence::{
    ClientId, CursorSelection, PresenceChange, PresenceState, PresenceTracker, PresenceUpdate,
    PresenceUser,
};
pub use protocol::{Actor, ClientMessage, RoomId, ServerMessage};
pub use registry::{Room, SessionRegistry};
pub use store::{DocumentStore, KvBackend, MemoryBackend, RocksBackend, RocksConfig};
