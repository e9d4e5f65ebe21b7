//! Wire protocol between collaboration providers and the gateway.
//!
//! Frames are JSON text messages with an event name and a payload; binary
//! CRDT and presence deltas are base64-encoded:
//!
//! ```text
//! {"event":"card:join",        "data":{"cardId":"42"}}
//! {"event":"card:update",      "data":{"cardId":"42","update":"AQHN..."}}
//! {"event":"awareness:update", "data":{"room":"card:42","update":"AQsB..."}}
//! {"event":"card:sync",        "data":{"state":"AQLN..."}}
//! ```

use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// Prefix shared by all card rooms.
const CARD_ROOM_PREFIX: &str = "card:";

/// Namespace for document snapshots in the key-value store.
const SNAPSHOT_KEY_PREFIX: &str = "yjs:";

/// Pre-encoded server frame, shared between all receivers of a broadcast.
pub type Frame = Arc<str>;

/// Collaboration room identifier, `card:<cardId>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn for_card(card_id: &str) -> Self {
        Self(format!("{CARD_ROOM_PREFIX}{card_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key under which the room's snapshot is stored.
    pub fn snapshot_key(&self) -> String {
        format!("{SNAPSHOT_KEY_PREFIX}{}", self.0)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Events sent by a provider.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "card:join", rename_all = "camelCase")]
    Join { card_id: String },

    #[serde(rename = "card:leave", rename_all = "camelCase")]
    Leave { card_id: String },

    #[serde(rename = "card:update", rename_all = "camelCase")]
    Update {
        card_id: String,
        #[serde_as(as = "Base64")]
        update: Vec<u8>,
    },

    #[serde(rename = "awareness:update")]
    Awareness {
        room: RoomId,
        #[serde_as(as = "Base64")]
        update: Vec<u8>,
    },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Events sent by the gateway.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    /// Full document state, sent right after a join.
    #[serde(rename = "card:sync")]
    Sync {
        #[serde_as(as = "Base64")]
        state: Vec<u8>,
    },

    /// Another participant's update, relayed verbatim.
    #[serde(rename = "card:update", rename_all = "camelCase")]
    Update {
        card_id: String,
        #[serde_as(as = "Base64")]
        update: Vec<u8>,
    },

    #[serde(rename = "awareness:update")]
    Awareness {
        room: RoomId,
        #[serde_as(as = "Base64")]
        update: Vec<u8>,
    },

    /// A join could not be served.
    #[serde(rename = "card:error", rename_all = "camelCase")]
    Error { card_id: String, message: String },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Arc::from(self.encode()?))
    }
}

/// Acting user, taken from the WebSocket handshake query string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub user_id: String,
    pub name: Option<String>,
}

impl Actor {
    /// Parse `userId` / `userName` from a query string.
    pub fn from_query(query: Option<&str>) -> Option<Self> {
        let query = query?;
        let mut user_id = None;
        let mut name = None;
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "userId" => user_id = Some(value.into_owned()),
                "userName" => name = Some(value.into_owned()),
                _ => {}
            }
        }
        user_id
            .filter(|id| !id.is_empty())
            .map(|user_id| Self { user_id, name })
    }

    /// Encode as a query string for client connections.
    pub fn to_query(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("userId", &self.user_id);
        if let Some(name) = &self.name {
            query.append_pair("userName", name);
        }
        query.finish()
    }
}
