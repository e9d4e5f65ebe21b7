//! Client-side collaboration provider.
//!
//! Binds a local [`CollabDocument`] and [`PresenceTracker`] to one card room:
//!
//! ```text
//!  local edit ──► observe_update_v1 ──(phase == Idle)──► card:update ──► gateway
//!                                                                           │
//!  gateway ──► card:update / card:sync ──► RemoteApplyGuard ──► apply ──────┘ (no echo)
//!  gateway ──► awareness:update (room matches) ──► PresenceTracker
//! ```
//!
//! The apply phase is an explicit state: remote bytes are merged only while
//! the phase is `ApplyingRemote`, and the update observer forwards changes
//! upstream only while it is `Idle`. The guard enters the phase after the
//! transaction is opened and leaves it after the transaction commits, so the
//! observer call made during commit always sees `ApplyingRemote`.
//!
//! [`CollabProvider`] is transport-free: it queues [`Outbound`] items on a
//! channel. [`connect`] drives one over a real WebSocket.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use yrs::updates::decoder::Decode;
use yrs::{Subscription, Transact, Update};

use crate::document::{is_empty_update, state_vector_of, CollabDocument};
use crate::error::{CollabError, Result};
use crate::presence::{
    ClientId, CursorSelection, PresenceChange, PresenceState, PresenceTracker, PresenceUser,
    SERVER_ORIGIN,
};
use crate::protocol::{Actor, ClientMessage, RoomId, ServerMessage};

/// The person editing through this provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub name: String,
    /// Caret color; derived from the name when unset.
    pub color: Option<String>,
}

impl LocalUser {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: None,
        }
    }

    fn presence_user(&self) -> PresenceUser {
        match &self.color {
            Some(color) => PresenceUser {
                name: self.name.clone(),
                color: color.clone(),
            },
            None => PresenceUser::new(self.name.clone()),
        }
    }
}

/// What the provider wants sent upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(ClientMessage),
    /// Close the transport after everything queued before it.
    Close,
}

/// Whether the document is currently merging remote bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPhase {
    Idle,
    ApplyingRemote,
}

/// Holds the provider in [`ApplyPhase::ApplyingRemote`] until dropped.
struct RemoteApplyGuard {
    phase: Arc<Mutex<ApplyPhase>>,
}

impl RemoteApplyGuard {
    fn enter(phase: &Arc<Mutex<ApplyPhase>>) -> Self {
        *phase.lock() = ApplyPhase::ApplyingRemote;
        Self {
            phase: phase.clone(),
        }
    }
}

impl Drop for RemoteApplyGuard {
    fn drop(&mut self) {
        *self.phase.lock() = ApplyPhase::Idle;
    }
}

/// Notable things that happened while handling a server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// Full state received and merged.
    Synced,
    /// A peer's update was merged.
    RemoteUpdate,
    PresenceChanged(PresenceChange),
    /// The gateway could not serve the join.
    JoinFailed(String),
    /// The transport went away; remote presence was cleared.
    Disconnected,
}

/// Collaboration provider for one card.
pub struct CollabProvider {
    card_id: String,
    room: RoomId,
    user: LocalUser,
    document: CollabDocument,
    presence: PresenceTracker,
    phase: Arc<Mutex<ApplyPhase>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    subscription: Option<Subscription>,
    synced: bool,
}

impl CollabProvider {
    /// Create a provider and queue its join and initial presence.
    pub fn new(
        card_id: impl Into<String>,
        user: LocalUser,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Outbound>)> {
        let card_id = card_id.into();
        let room = RoomId::for_card(&card_id);
        let document = CollabDocument::new();
        let presence = PresenceTracker::new(document.doc().client_id());
        let phase = Arc::new(Mutex::new(ApplyPhase::Idle));
        let (outbound, rx) = mpsc::unbounded_channel();

        let subscription = {
            let phase = phase.clone();
            let outbound = outbound.clone();
            let card_id = card_id.clone();
            document
                .doc()
                .observe_update_v1(move |_txn, event| {
                    if *phase.lock() != ApplyPhase::Idle {
                        return;
                    }
                    let _ = outbound.send(Outbound::Message(ClientMessage::Update {
                        card_id: card_id.clone(),
                        update: event.update.clone(),
                    }));
                })
                .map_err(|e| CollabError::Crdt(e.to_string()))?
        };

        let mut provider = Self {
            card_id,
            room,
            user,
            document,
            presence,
            phase,
            outbound,
            subscription: Some(subscription),
            synced: false,
        };
        provider.announce_join()?;
        Ok((provider, rx))
    }

    pub fn card_id(&self) -> &str {
        &self.card_id
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn client_id(&self) -> ClientId {
        self.presence.local_id()
    }

    pub fn document(&self) -> &CollabDocument {
        &self.document
    }

    pub fn plain_text(&self) -> String {
        self.document.plain_text()
    }

    pub fn phase(&self) -> ApplyPhase {
        *self.phase.lock()
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn is_destroyed(&self) -> bool {
        self.subscription.is_none()
    }

    /// Handle one message from the gateway.
    pub fn receive(&mut self, message: ServerMessage) -> Result<Option<ProviderEvent>> {
        match message {
            ServerMessage::Sync { state } => {
                self.apply_remote(&state)?;
                self.push_local_changes(&state)?;
                self.synced = true;
                log::debug!("Provider for {} synced", self.room);
                Ok(Some(ProviderEvent::Synced))
            }
            ServerMessage::Update { card_id, update } => {
                if card_id != self.card_id {
                    return Ok(None);
                }
                self.apply_remote(&update)?;
                Ok(Some(ProviderEvent::RemoteUpdate))
            }
            ServerMessage::Awareness { room, update } => {
                if room != self.room {
                    return Ok(None);
                }
                let change = self.presence.apply_remote_update(&update, SERVER_ORIGIN)?;
                Ok((!change.is_empty()).then_some(ProviderEvent::PresenceChanged(change)))
            }
            ServerMessage::Error { card_id, message } => {
                if card_id != self.card_id {
                    return Ok(None);
                }
                log::error!("Gateway refused {}: {message}", self.room);
                Ok(Some(ProviderEvent::JoinFailed(message)))
            }
        }
    }

    /// Forget remote participants after the transport dropped.
    pub fn handle_disconnect(&mut self) -> Vec<ClientId> {
        self.synced = false;
        self.presence.clear_remote()
    }

    /// Re-queue the join and local presence, e.g. after reconnecting.
    pub fn resume(&mut self) -> Result<()> {
        self.announce_join()
    }

    /// Move the local caret and re-announce presence.
    pub fn set_cursor(&mut self, cursor: Option<CursorSelection>) -> Result<()> {
        let mut state = self
            .presence
            .local_state()
            .cloned()
            .unwrap_or_else(|| PresenceState::new(self.user.presence_user()));
        state.cursor = cursor;
        let update = self.presence.set_local_state(Some(state))?;
        self.queue(ClientMessage::Awareness {
            room: self.room.clone(),
            update,
        })
    }

    /// Other participants currently present, ordered by client id.
    pub fn remote_presence(&self) -> Vec<(ClientId, PresenceState)> {
        self.presence.remote_states()
    }

    /// Announce departure, leave the room, and stop observing the document.
    pub fn destroy(&mut self) -> Result<()> {
        if self.subscription.take().is_none() {
            return Ok(());
        }
        let update = self.presence.set_local_state(None)?;
        self.queue(ClientMessage::Awareness {
            room: self.room.clone(),
            update,
        })?;
        self.queue(ClientMessage::Leave {
            card_id: self.card_id.clone(),
        })?;
        self.outbound
            .send(Outbound::Close)
            .map_err(|_| CollabError::ConnectionClosed)
    }

    fn announce_join(&mut self) -> Result<()> {
        self.queue(ClientMessage::Join {
            card_id: self.card_id.clone(),
        })?;
        let state = self
            .presence
            .local_state()
            .cloned()
            .unwrap_or_else(|| PresenceState::new(self.user.presence_user()));
        let update = self.presence.set_local_state(Some(state))?;
        self.queue(ClientMessage::Awareness {
            room: self.room.clone(),
            update,
        })
    }

    fn apply_remote(&self, update: &[u8]) -> Result<()> {
        let update = Update::decode_v1(update)?;
        let mut txn = self.document.doc().transact_mut();
        let guard = RemoteApplyGuard::enter(&self.phase);
        let applied = txn
            .apply_update(update)
            .map_err(|e| CollabError::Crdt(e.to_string()));
        drop(txn);
        drop(guard);
        applied
    }

    /// After a sync, send whatever the server's state does not cover yet.
    ///
    /// The diff always carries the full local delete set, so it is merged into
    /// a copy of the server state first and only sent if that changes it.
    fn push_local_changes(&self, server_state: &[u8]) -> Result<()> {
        let server_sv = state_vector_of(server_state)?;
        let diff = self.document.diff_since(&server_sv);
        if is_empty_update(&diff) {
            return Ok(());
        }
        let server = CollabDocument::from_state(server_state)?;
        let before = server.encode_state();
        server.apply_update(&diff)?;
        if server.encode_state() == before {
            return Ok(());
        }
        log::debug!("Pushing offline edits for {} after sync", self.room);
        self.queue(ClientMessage::Update {
            card_id: self.card_id.clone(),
            update: diff,
        })
    }

    fn queue(&self, message: ClientMessage) -> Result<()> {
        self.outbound
            .send(Outbound::Message(message))
            .map_err(|_| CollabError::ConnectionClosed)
    }
}

// ───────────────────────────────────────────────────────────────────
// WebSocket driver
// ───────────────────────────────────────────────────────────────────

/// A provider wired to a live WebSocket.
pub struct ConnectedProvider {
    provider: Arc<Mutex<CollabProvider>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ConnectedProvider {
    /// Run `f` against the provider. Local document edits made inside are
    /// sent upstream automatically.
    pub fn with<R>(&self, f: impl FnOnce(&mut CollabProvider) -> R) -> R {
        f(&mut self.provider.lock())
    }

    pub fn plain_text(&self) -> String {
        self.provider.lock().plain_text()
    }

    pub fn remote_presence(&self) -> Vec<(ClientId, PresenceState)> {
        self.provider.lock().remote_presence()
    }

    /// Leave the room and close the socket once queued frames are written.
    pub async fn close(self) -> Result<()> {
        let destroyed = self.provider.lock().destroy();
        if let Err(e) = self.writer.await {
            log::warn!("Provider writer task failed: {e}");
        }
        self.reader.abort();
        destroyed
    }
}

/// Connect a provider for `card_id` to the gateway at `url`.
///
/// The actor, when given, is passed in the handshake query string.
pub async fn connect(
    url: &str,
    card_id: &str,
    user: LocalUser,
    actor: Option<&Actor>,
) -> Result<(ConnectedProvider, mpsc::UnboundedReceiver<ProviderEvent>)> {
    let mut url = Url::parse(url).map_err(|e| CollabError::Transport(format!("invalid url {url}: {e}")))?;
    if let Some(actor) = actor {
        url.set_query(Some(&actor.to_query()));
    }

    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (mut sink, mut stream) = ws.split();
    log::info!("Provider for card {card_id} connected to {url}");

    let (provider, mut outbound) = CollabProvider::new(card_id, user)?;
    let provider = Arc::new(Mutex::new(provider));
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let writer = tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Message(message) => {
                    let text = match message.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            log::error!("Failed to encode outbound message: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::text(text)).await {
                        log::warn!("Provider send failed: {e}");
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    });

    let reader = {
        let provider = provider.clone();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        log::warn!("Provider receive failed: {e}");
                        break;
                    }
                };
                let message = match ServerMessage::decode(text.as_str()) {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Dropped malformed server frame: {e}");
                        continue;
                    }
                };
                let event = provider.lock().receive(message);
                match event {
                    Ok(Some(event)) => {
                        let _ = events_tx.send(event);
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("Failed to apply server message: {e}"),
                }
            }
            provider.lock().handle_disconnect();
            let _ = events_tx.send(ProviderEvent::Disconnected);
        })
    };

    Ok((
        ConnectedProvider {
            provider,
            reader,
            writer,
        },
        events_rx,
    ))
}
