//! Collaboration session registry: room id → live document + presence.
//!
//! ```text
//! SessionRegistry
//!   rooms: Mutex<HashMap<RoomId, Arc<RoomSlot>>>
//!                                   │
//!                                   └── OnceCell<Arc<Room>>   (single-flight load)
//!                                              │
//!                                              ├── Mutex<RoomState>  document + presence
//!                                              ├── BroadcastGroup    fan-out
//!                                              └── save gate         serialized store writes
//! ```
//!
//! Concurrent first joiners of one room share a slot, so exactly one of them
//! loads from the store and all of them end up with the same `Room`. The map
//! lock is never held while the store is read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, OnceCell};

use crate::broadcast::BroadcastGroup;
use crate::document::CollabDocument;
use crate::error::Result;
use crate::presence::{PresenceTracker, SERVER_ORIGIN};
use crate::protocol::RoomId;
use crate::store::DocumentStore;

/// Mutable per-room state. Only touched with the room lock held.
pub struct RoomState {
    pub document: CollabDocument,
    pub presence: PresenceTracker,
    seq: u64,
}

impl RoomState {
    fn new(document: CollabDocument) -> Self {
        Self {
            document,
            presence: PresenceTracker::new(SERVER_ORIGIN),
            seq: 0,
        }
    }

    /// Sequence number for the snapshot about to be taken.
    pub fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// One collaboration room.
pub struct Room {
    id: RoomId,
    state: Mutex<RoomState>,
    broadcast: BroadcastGroup,
    clients: AtomicUsize,
    /// Highest snapshot sequence handed to the store.
    save_gate: Mutex<u64>,
    /// Whether the most recent save attempt succeeded.
    persisted: AtomicBool,
}

impl Room {
    fn new(id: RoomId, document: CollabDocument, broadcast_capacity: usize) -> Self {
        Self {
            id,
            state: Mutex::new(RoomState::new(document)),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            clients: AtomicUsize::new(0),
            save_gate: Mutex::new(0),
            persisted: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// Enter the room's critical section.
    pub async fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().await
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted.load(Ordering::SeqCst)
    }

    /// Write a full-state snapshot taken at `seq`.
    ///
    /// Writes are serialized per room; a snapshot older than one already
    /// handed to the store is skipped. Returns whether a write happened.
    pub async fn persist(&self, store: &DocumentStore, seq: u64, state: Vec<u8>) -> Result<bool> {
        let mut gate = self.save_gate.lock().await;
        if seq <= *gate {
            return Ok(false);
        }
        *gate = seq;
        match store.save_state(&self.id, state).await {
            Ok(()) => {
                self.persisted.store(true, Ordering::SeqCst);
                Ok(true)
            }
            Err(e) => {
                self.persisted.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

#[derive(Default)]
struct RoomSlot {
    room: OnceCell<Arc<Room>>,
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub broadcast_capacity: usize,
    /// Drop rooms once the last client leaves and the last save succeeded.
    pub evict_idle_rooms: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            evict_idle_rooms: true,
        }
    }
}

/// Process-wide room table, constructed at startup and shared by the gateway.
pub struct SessionRegistry {
    rooms: Mutex<HashMap<RoomId, Arc<RoomSlot>>>,
    store: DocumentStore,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(store: DocumentStore, config: RegistryConfig) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            store,
            config,
        }
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// Get or create a room and attach one client to it.
    ///
    /// Every successful call must be paired with [`release`](Self::release).
    pub async fn acquire(&self, id: &RoomId) -> Result<Arc<Room>> {
        loop {
            let slot = {
                let mut rooms = self.rooms.lock().await;
                rooms.entry(id.clone()).or_default().clone()
            };

            let room = slot
                .room
                .get_or_try_init(|| self.open_room(id))
                .await?
                .clone();

            // Attach under the map lock so eviction cannot interleave.
            let rooms = self.rooms.lock().await;
            match rooms.get(id) {
                Some(current) if Arc::ptr_eq(current, &slot) => {
                    room.clients.fetch_add(1, Ordering::SeqCst);
                    return Ok(room);
                }
                // Evicted between load and attach; start over with a fresh slot.
                _ => continue,
            }
        }
    }

    /// Detach one client. Returns `true` if the room was evicted.
    pub async fn release(&self, room: &Arc<Room>) -> bool {
        let mut rooms = self.rooms.lock().await;
        let remaining = room
            .clients
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .map(|prev| prev.saturating_sub(1))
            .unwrap_or(0);

        if remaining > 0 || !self.config.evict_idle_rooms {
            return false;
        }
        if !room.is_persisted() {
            log::warn!("Keeping idle room {} in memory: last snapshot save failed", room.id);
            return false;
        }

        let is_current = rooms
            .get(&room.id)
            .and_then(|slot| slot.room.get())
            .is_some_and(|current| Arc::ptr_eq(current, room));
        if is_current {
            rooms.remove(&room.id);
            log::info!("Room {} evicted (no clients)", room.id);
        }
        is_current
    }

    /// Live room, if loaded.
    pub async fn get(&self, id: &RoomId) -> Option<Arc<Room>> {
        let rooms = self.rooms.lock().await;
        rooms.get(id).and_then(|slot| slot.room.get().cloned())
    }

    /// Number of loaded rooms.
    pub async fn room_count(&self) -> usize {
        let rooms = self.rooms.lock().await;
        rooms.values().filter(|slot| slot.room.initialized()).count()
    }

    pub async fn room_ids(&self) -> Vec<RoomId> {
        let rooms = self.rooms.lock().await;
        let mut ids: Vec<RoomId> = rooms
            .iter()
            .filter(|(_, slot)| slot.room.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    async fn open_room(&self, id: &RoomId) -> Result<Arc<Room>> {
        let document = match self.store.load(id).await {
            Ok(Some(document)) => {
                log::info!("Loaded persisted snapshot for {id}");
                document
            }
            Ok(None) => {
                log::debug!("No snapshot for {id}, starting empty");
                CollabDocument::new()
            }
            Err(e) => {
                log::error!("Failed to load snapshot for {id}: {e}");
                return Err(e);
            }
        };
        Ok(Arc::new(Room::new(
            id.clone(),
            document,
            self.config.broadcast_capacity,
        )))
    }
}
