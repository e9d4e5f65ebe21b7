//! Realtime transport gateway.
//!
//! Architecture:
//! ```text
//! Provider A ──┐  WebSocket (JSON events)
//!              ├── Connection ── rooms: card:42 ─┐
//! Provider B ──┘                                 ▼
//!                              SessionRegistry ── Room ── CollabDocument
//!                                                 │  ├── PresenceTracker
//!                                                 │  └── BroadcastGroup ──► forwarders ──► peers
//!                                                 │
//!                               persist ◄─────────┤
//!                               (DocumentStore)   └──► SaveDebouncer ──► CardUpdater
//! ```
//!
//! Each connection runs one task that reads frames, dispatches them, and
//! writes whatever lands in its [`Outbox`]. Every joined room adds a
//! forwarder task that copies the room's relays into the outbox's bounded
//! relay queue, skipping relays the connection sent itself. A forwarder that
//! finds the queue full, or that lags behind the room's broadcast buffer,
//! resynchronizes the peer with full presence and state instead of queueing
//! more.
//!
//! Per connection, each room is either not joined or joined:
//! - `card:join` acquires the room, then sends presence and full state.
//! - `card:update` merges under the room lock and relays under the same lock,
//!   so peers observe updates in apply order. The snapshot is persisted and a
//!   debounced description write is scheduled after the lock is released.
//! - `card:leave` (or disconnect) purges the presence ids the connection
//!   announced, tells the remaining peers, and releases the room.
//!
//! Handler errors are logged and confined to the connection; only transport
//! failures end it.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{ConnId, Relay};
use crate::card_api::{HttpCardUpdater, LogOnlyCardUpdater};
use crate::config::{ServerConfig, StorageConfig};
use crate::debounce::{CardUpdater, SaveDebouncer};
use crate::error::{CollabError, Result};
use crate::presence::ClientId;
use crate::protocol::{Actor, ClientMessage, Frame, RoomId, ServerMessage};
use crate::registry::{Room, SessionRegistry};
use crate::store::{DocumentStore, RocksBackend, RocksConfig};

/// Gateway statistics.
#[derive(Debug, Clone, Default)]
pub struct GatewayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub messages_received: u64,
    /// Slow peers brought back with a full resync.
    pub resyncs: u64,
    pub active_rooms: usize,
}

/// The collaboration gateway: room registry, persistence, and debounced writes.
pub struct Gateway {
    config: ServerConfig,
    registry: SessionRegistry,
    debouncer: SaveDebouncer,
    next_conn: AtomicU64,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    messages_received: AtomicU64,
    resyncs: AtomicU64,
}

impl Gateway {
    pub fn new(
        config: ServerConfig,
        store: DocumentStore,
        updater: Arc<dyn CardUpdater>,
    ) -> Arc<Self> {
        let registry = SessionRegistry::new(store, config.registry());
        let debouncer = SaveDebouncer::new(config.save_debounce, updater);
        Arc::new(Self {
            config,
            registry,
            debouncer,
            next_conn: AtomicU64::new(1),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
        })
    }

    /// Build the store and card updater the configuration asks for.
    pub fn from_config(config: ServerConfig) -> Result<Arc<Self>> {
        let store = match &config.storage {
            StorageConfig::Memory => {
                log::warn!("Using in-memory snapshot store; documents are lost on restart");
                DocumentStore::in_memory()
            }
            StorageConfig::Rocks { path } => {
                DocumentStore::new(Arc::new(RocksBackend::open(RocksConfig::at(path))?))
            }
        };
        let updater: Arc<dyn CardUpdater> = match &config.card_api {
            Some(api) => Arc::new(HttpCardUpdater::new(api)?),
            None => Arc::new(LogOnlyCardUpdater),
        };
        Ok(Self::new(config, store, updater))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn debouncer(&self) -> &SaveDebouncer {
        &self.debouncer
    }

    pub async fn stats(&self) -> GatewayStats {
        GatewayStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            active_rooms: self.registry.room_count().await,
        }
    }

    /// Register a new connection. Frames for the peer arrive in the outbox.
    pub fn open_connection(self: &Arc<Self>, actor: Option<Actor>) -> (Connection, Outbox) {
        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        let (replies, replies_rx) = mpsc::unbounded_channel();
        let (relays, relays_rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let connection = Connection {
            id,
            actor,
            gateway: self.clone(),
            replies,
            relays,
            rooms: HashMap::new(),
        };
        let outbox = Outbox {
            replies: replies_rx,
            relays: relays_rx,
        };
        (connection, outbox)
    }

    /// Bind the configured address and serve until the process exits.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves, then flush pending writes.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        log::info!(
            "Card gateway listening on {} (description saves after {:?} of quiet)",
            listener.local_addr()?,
            self.debouncer.quiet_period()
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        let gateway = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = gateway.serve_connection(stream, addr).await {
                                log::error!("Connection error from {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => log::warn!("Failed to accept connection: {e}"),
                },
                _ = &mut shutdown => break,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Run every pending description write now.
    pub async fn shutdown(&self) -> usize {
        log::debug!("Rooms open at shutdown: {:?}", self.registry.room_ids().await);
        let flushed = self.debouncer.flush_all().await;
        log::info!("Gateway stopped, flushed {flushed} pending description saves");
        flushed
    }

    /// Drive one WebSocket connection to completion.
    async fn serve_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let mut query: Option<String> = None;
        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
                query = req.uri().query().map(str::to_owned);
                Ok(resp)
            },
        )
        .await?;
        let actor = Actor::from_query(query.as_deref());
        let (mut sink, mut stream) = ws.split();

        let (mut connection, mut outbox) = self.open_connection(actor);
        log::info!(
            "WebSocket connection {} established from {addr} (user {})",
            connection.id(),
            connection.actor().map_or("anonymous", |a| a.user_id.as_str())
        );

        let interval = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        let result = loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        if let Err(e) = connection.handle_text(text.as_str()).await {
                            log::warn!("Connection {}: {e}", connection.id());
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        log::warn!("Connection {}: dropped {} byte binary frame", connection.id(), data.len());
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => break Err(CollabError::from(e)),
                },
                frame = outbox.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(Message::text(frame.to_string())).await {
                            break Err(CollabError::from(e));
                        }
                    }
                    None => break Ok(()),
                },
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() >= interval * 2 {
                        log::info!("Connection {} timed out after {:?} of silence", connection.id(), last_seen.elapsed());
                        break Ok(());
                    }
                    if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                        break Err(CollabError::from(e));
                    }
                }
            }
        };

        let id = connection.id();
        connection.close().await;
        let _ = sink.close().await;
        log::info!("Connection {id} from {addr} closed");
        result
    }
}

/// Frames waiting to be written to one peer.
///
/// Direct replies are produced only while handling that peer's own frames,
/// at most two per frame, and are drained ahead of relays. Relays from other
/// peers go through a bounded queue.
pub struct Outbox {
    replies: mpsc::UnboundedReceiver<Frame>,
    relays: mpsc::Receiver<Frame>,
}

impl Outbox {
    /// Next frame to write, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            Some(frame) = self.replies.recv() => Some(frame),
            Some(frame) = self.relays.recv() => Some(frame),
            else => None,
        }
    }

    /// Relays currently queued.
    pub fn queued_relays(&self) -> usize {
        self.relays.len()
    }
}

/// A room this connection has joined.
struct JoinedRoom {
    room: Arc<Room>,
    forwarder: JoinHandle<()>,
    /// Presence ids announced through this connection.
    presence_ids: HashSet<ClientId>,
}

/// Transport-independent state of one client connection.
pub struct Connection {
    id: ConnId,
    actor: Option<Actor>,
    gateway: Arc<Gateway>,
    replies: mpsc::UnboundedSender<Frame>,
    relays: mpsc::Sender<Frame>,
    rooms: HashMap<RoomId, JoinedRoom>,
}

impl Connection {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn actor(&self) -> Option<&Actor> {
        self.actor.as_ref()
    }

    pub fn joined_rooms(&self) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self.rooms.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Decode and dispatch one inbound text frame.
    pub async fn handle_text(&mut self, text: &str) -> Result<()> {
        self.gateway.messages_received.fetch_add(1, Ordering::Relaxed);
        let message = ClientMessage::decode(text)?;
        self.dispatch(message).await
    }

    pub async fn dispatch(&mut self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Join { card_id } => self.join(card_id).await,
            ClientMessage::Leave { card_id } => self.leave(card_id).await,
            ClientMessage::Update { card_id, update } => self.update(card_id, update).await,
            ClientMessage::Awareness { room, update } => self.awareness(room, update).await,
        }
    }

    async fn join(&mut self, card_id: String) -> Result<()> {
        let room_id = RoomId::for_card(&card_id);

        if let Some(joined) = self.rooms.get(&room_id) {
            let state = joined.room.lock().await.document.encode_state();
            log::debug!("Connection {} re-synced {room_id}", self.id);
            return self.send(&ServerMessage::Sync { state });
        }

        let room = match self.gateway.registry.acquire(&room_id).await {
            Ok(room) => room,
            Err(e) => {
                log::error!("Connection {} could not join {room_id}: {e}", self.id);
                self.send(&ServerMessage::Error {
                    card_id,
                    message: e.to_string(),
                })?;
                return Err(e);
            }
        };

        // Subscribe under the room lock: the snapshot and the subscription
        // then cut the relay stream at the same point.
        let snapshot = {
            let state = room.lock().await;
            let receiver = room.broadcast().subscribe();
            state
                .presence
                .encode_all()
                .map(|presence| (receiver, presence, state.document.encode_state()))
        };
        let (receiver, presence, state) = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.gateway.registry.release(&room).await;
                return Err(e);
            }
        };

        let sent = self
            .send(&ServerMessage::Awareness {
                room: room_id.clone(),
                update: presence,
            })
            .and_then(|()| self.send(&ServerMessage::Sync { state }));

        let forwarder = tokio::spawn(forward_relays(
            receiver,
            self.id,
            self.relays.clone(),
            room.clone(),
            self.gateway.clone(),
        ));
        log::info!(
            "Connection {} joined {room_id} ({} clients)",
            self.id,
            room.client_count()
        );
        self.rooms.insert(
            room_id,
            JoinedRoom {
                room,
                forwarder,
                presence_ids: HashSet::new(),
            },
        );
        sent
    }

    async fn update(&mut self, card_id: String, update: Vec<u8>) -> Result<()> {
        let room_id = RoomId::for_card(&card_id);
        let Some(joined) = self.rooms.get(&room_id) else {
            log::error!(
                "Connection {} sent an update for {room_id} without joining it",
                self.id
            );
            return Err(CollabError::RoomNotJoined(room_id.to_string()));
        };
        let room = joined.room.clone();

        let (seq, snapshot, content) = {
            let mut state = room.lock().await;
            if let Err(e) = state.document.apply_update(&update) {
                log::warn!("Dropped undecodable update for {room_id}: {e}");
                return Err(e);
            }
            let frame = ServerMessage::Update {
                card_id: card_id.clone(),
                update,
            }
            .to_frame()?;
            room.broadcast().send(self.id, frame);
            (
                state.next_seq(),
                state.document.encode_state(),
                state.document.to_structured(),
            )
        };

        if let Err(e) = room
            .persist(self.gateway.registry.store(), seq, snapshot)
            .await
        {
            log::error!("Failed to persist snapshot for {room_id}: {e}");
        }
        self.gateway
            .debouncer
            .schedule(&card_id, content, self.actor.clone());
        Ok(())
    }

    async fn awareness(&mut self, room_id: RoomId, update: Vec<u8>) -> Result<()> {
        let Some(joined) = self.rooms.get_mut(&room_id) else {
            log::error!(
                "Connection {} sent presence for {room_id} without joining it",
                self.id
            );
            return Err(CollabError::RoomNotJoined(room_id.to_string()));
        };

        // Only ids the tracker accepted from this connection are owned by it.
        let change = {
            let room = &joined.room;
            let mut state = room.lock().await;
            let change = match state.presence.apply_remote_update(&update, self.id) {
                Ok(change) => change,
                Err(e) => {
                    log::warn!("Dropped undecodable presence update for {room_id}: {e}");
                    return Err(e);
                }
            };
            let frame = ServerMessage::Awareness {
                room: room_id.clone(),
                update,
            }
            .to_frame()?;
            room.broadcast().send(self.id, frame);
            change
        };

        joined
            .presence_ids
            .extend(change.added.iter().chain(&change.updated).copied());
        for id in &change.removed {
            joined.presence_ids.remove(id);
        }
        Ok(())
    }

    async fn leave(&mut self, card_id: String) -> Result<()> {
        let room_id = RoomId::for_card(&card_id);
        match self.rooms.remove(&room_id) {
            Some(joined) => self.detach(&room_id, joined).await,
            None => {
                log::debug!("Connection {} left {room_id} without joining it", self.id);
                Ok(())
            }
        }
    }

    /// Leave every joined room. Equivalent to `card:leave` for each.
    pub async fn close(mut self) {
        let rooms: Vec<(RoomId, JoinedRoom)> = self.rooms.drain().collect();
        for (room_id, joined) in rooms {
            if let Err(e) = self.detach(&room_id, joined).await {
                log::warn!("Connection {} cleanup of {room_id} failed: {e}", self.id);
            }
        }
        self.gateway.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    async fn detach(&self, room_id: &RoomId, joined: JoinedRoom) -> Result<()> {
        joined.forwarder.abort();
        let ids: Vec<ClientId> = joined.presence_ids.into_iter().collect();

        let removal = {
            let mut state = joined.room.lock().await;
            match state.presence.remove_clients(&ids) {
                Ok(Some(update)) => ServerMessage::Awareness {
                    room: room_id.clone(),
                    update,
                }
                .to_frame()
                .map(|frame| {
                    joined.room.broadcast().send(self.id, frame);
                }),
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            }
        };

        let evicted = self.gateway.registry.release(&joined.room).await;
        if evicted {
            log::info!("Connection {} left {room_id} (room evicted)", self.id);
        } else {
            log::info!(
                "Connection {} left {room_id} ({} listeners remain)",
                self.id,
                joined.room.broadcast().subscriber_count()
            );
        }
        removal
    }

    fn send(&self, message: &ServerMessage) -> Result<()> {
        let frame = message.to_frame()?;
        self.replies
            .send(frame)
            .map_err(|_| CollabError::ConnectionClosed)
    }
}

/// Copy a room's relays into one connection's relay queue.
async fn forward_relays(
    mut receiver: broadcast::Receiver<Arc<Relay>>,
    conn_id: ConnId,
    relays: mpsc::Sender<Frame>,
    room: Arc<Room>,
    gateway: Arc<Gateway>,
) {
    loop {
        match receiver.recv().await {
            Ok(relay) => {
                if relay.origin == conn_id {
                    continue;
                }
                match relays.try_send(relay.frame.clone()) {
                    Ok(()) => continue,
                    Err(TrySendError::Closed(_)) => break,
                    Err(TrySendError::Full(_)) => log::warn!(
                        "Connection {conn_id} has {} relays queued in {}, resyncing",
                        relays.max_capacity(),
                        room.id()
                    ),
                }
            }
            Err(RecvError::Lagged(skipped)) => log::warn!(
                "Connection {conn_id} lagged {skipped} relays behind in {}, resyncing",
                room.id()
            ),
            Err(RecvError::Closed) => break,
        }

        gateway.resyncs.fetch_add(1, Ordering::Relaxed);
        match resync(&room, &relays).await {
            Ok(Some(fresh)) => receiver = fresh,
            Ok(None) => break,
            Err(e) => log::error!("Resync of {} failed: {e}", room.id()),
        }
    }
}

/// Queue the room's full presence and state for a peer that fell behind.
///
/// Waits until the peer's queue has room for both frames, then snapshots and
/// resubscribes under the room lock, so the relays that follow start exactly
/// where the snapshot ends. Returns `None` once the peer is gone.
async fn resync(
    room: &Room,
    relays: &mpsc::Sender<Frame>,
) -> Result<Option<broadcast::Receiver<Arc<Relay>>>> {
    let Ok(permits) = relays.reserve_many(2).await else {
        return Ok(None);
    };
    let state = room.lock().await;
    let receiver = room.broadcast().subscribe();
    let presence = ServerMessage::Awareness {
        room: room.id().clone(),
        update: state.presence.encode_all()?,
    }
    .to_frame()?;
    let sync = ServerMessage::Sync {
        state: state.document.encode_state(),
    }
    .to_frame()?;
    for (permit, frame) in permits.zip([presence, sync]) {
        permit.send(frame);
    }
    Ok(Some(receiver))
}
