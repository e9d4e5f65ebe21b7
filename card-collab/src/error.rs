//! Error taxonomy for the collaboration core.
//!
//! Every fallible operation returns [`CollabError`]. Handlers in the gateway
//! log these and keep the connection alive; only transport errors end a
//! connection.

use thiserror::Error;

/// Errors raised by the collaboration core.
#[derive(Debug, Error)]
pub enum CollabError {
    /// Key-value backend read or write failed.
    #[error("store error: {0}")]
    Store(String),

    /// Inbound bytes could not be decoded (CRDT update, presence, snapshot).
    #[error("decode error: {0}")]
    Decode(String),

    /// Outbound payload could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// The CRDT rejected an update while merging.
    #[error("crdt error: {0}")]
    Crdt(String),

    /// A wire frame was malformed or carried an unknown event.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// WebSocket transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// An event referenced a room the connection never joined.
    #[error("connection has not joined room {0}")]
    RoomNotJoined(String),

    /// The downstream card-description write failed.
    #[error("card update failed for {card_id}: {reason}")]
    CardUpdate { card_id: String, reason: String },

    /// The peer side of a channel went away.
    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, CollabError>;

impl From<yrs::encoding::read::Error> for CollabError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        CollabError::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(e: serde_json::Error) -> Self {
        CollabError::Protocol(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CollabError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        CollabError::Transport(e.to_string())
    }
}

impl From<std::io::Error> for CollabError {
    fn from(e: std::io::Error) -> Self {
        CollabError::Transport(e.to_string())
    }
}

impl From<rocksdb::Error> for CollabError {
    fn from(e: rocksdb::Error) -> Self {
        CollabError::Store(e.to_string())
    }
}
