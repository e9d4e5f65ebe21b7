//! Presence protocol for live cursors and "who is here" awareness.
//!
//! Each participant owns one [`PresenceState`] keyed by its [`ClientId`]
//! (the Yrs client id of its local document). States travel as
//! [`PresenceUpdate`] deltas:
//!
//! ```text
//! set_local_state()           remove_clients()
//!       │                            │
//!       ▼                            ▼
//! PresenceUpdate { entries: [(client_id, clock, Some(state) | None)] }
//!       │  (bincode, base64 on the wire)
//!       ▼
//! apply_remote_update()  ── clock newer? ──► overwrite / remove
//! ```
//!
//! Conflict rule is last-write-wins per client id: a state is replaced only by
//! an entry with a strictly greater clock, or removed by an entry with an
//! equal-or-greater clock. A client that was removed comes back with an
//! announcement at the removal's clock or later, which is what a reconnecting
//! provider sends after the server bumped its clock on departure. Nothing
//! here is persisted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{CollabError, Result};

/// Presence identity of one participant.
pub type ClientId = u64;

/// Reserved origin used by the server when it emits removal deltas.
pub const SERVER_ORIGIN: ClientId = 0;

/// Cursor palette; a user's color is picked by hashing the display name.
const CURSOR_PALETTE: &[&str] = &[
    "#958DF1", "#F98181", "#FBBC88", "#FAF594", "#70CFF8", "#94FADB", "#B9F18D", "#C3E2C2",
    "#EAECCC", "#AFC8AD", "#EEC759", "#9BB8CD",
];

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Display identity announced with presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub name: String,
    /// CSS hex color for the caret and selection highlight.
    pub color: String,
}

impl PresenceUser {
    /// User with a color derived from the name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let color = color_for_name(&name).to_string();
        Self { name, color }
    }
}

/// Caret and selection as encoded relative positions.
///
/// Anchor and head are opaque to the server; the editor binding encodes them
/// from Yrs sticky indexes so they survive concurrent edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorSelection {
    pub anchor: Vec<u8>,
    pub head: Vec<u8>,
}

/// Everything one participant announces about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub user: PresenceUser,
    pub cursor: Option<CursorSelection>,
}

impl PresenceState {
    pub fn new(user: PresenceUser) -> Self {
        Self { user, cursor: None }
    }
}

/// One client's slot inside an update. `state: None` means removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub client_id: ClientId,
    pub clock: u32,
    pub state: Option<PresenceState>,
}

/// Encoded unit exchanged over `awareness:update`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub entries: Vec<PresenceEntry>,
}

impl PresenceUpdate {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CollabError::Decode(e.to_string()))?;
        Ok(update)
    }

    /// Client ids that this update removes.
    pub fn removed(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.entries
            .iter()
            .filter(|e| e.state.is_none())
            .map(|e| e.client_id)
    }
}

/// What an applied update changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceChange {
    pub origin: ClientId,
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl PresenceChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Per-room presence table.
///
/// The server keeps one per room with [`SERVER_ORIGIN`] as its own id; each
/// client provider keeps one keyed by its document's client id.
#[derive(Debug)]
pub struct PresenceTracker {
    local_id: ClientId,
    states: HashMap<ClientId, PresenceState>,
    /// Last clock seen per client, kept after removal to reject stale entries.
    clocks: HashMap<ClientId, u32>,
}

impl PresenceTracker {
    pub fn new(local_id: ClientId) -> Self {
        Self {
            local_id,
            states: HashMap::new(),
            clocks: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> ClientId {
        self.local_id
    }

    /// Announce (`Some`) or clear (`None`) the local participant's state.
    ///
    /// Returns the encoded delta to send upstream.
    pub fn set_local_state(&mut self, state: Option<PresenceState>) -> Result<Vec<u8>> {
        let id = self.local_id;
        let clock = self.bump_clock(id);
        match &state {
            Some(s) => {
                self.states.insert(id, s.clone());
            }
            None => {
                self.states.remove(&id);
            }
        }
        PresenceUpdate {
            entries: vec![PresenceEntry {
                client_id: id,
                clock,
                state,
            }],
        }
        .encode()
    }

    /// Local participant's current state.
    pub fn local_state(&self) -> Option<&PresenceState> {
        self.states.get(&self.local_id)
    }

    /// Merge a remote delta.
    ///
    /// Updates whose origin is this tracker's own id are dropped, as are
    /// entries describing the local participant.
    pub fn apply_remote_update(&mut self, encoded: &[u8], origin: ClientId) -> Result<PresenceChange> {
        let update = PresenceUpdate::decode(encoded)?;
        let mut change = PresenceChange {
            origin,
            ..PresenceChange::default()
        };
        if origin == self.local_id {
            return Ok(change);
        }

        for entry in update.entries {
            if entry.client_id == self.local_id {
                continue;
            }
            let current = self.clocks.get(&entry.client_id).copied();
            let known = self.states.contains_key(&entry.client_id);
            match entry.state {
                Some(state) => {
                    // Equal clocks only re-add a client whose state is gone.
                    if current.is_some_and(|c| entry.clock < c || (entry.clock == c && known)) {
                        continue;
                    }
                    self.clocks.insert(entry.client_id, entry.clock);
                    let previous = self.states.insert(entry.client_id, state.clone());
                    match previous {
                        None => change.added.push(entry.client_id),
                        Some(prev) if prev != state => change.updated.push(entry.client_id),
                        Some(_) => {}
                    }
                }
                None => {
                    if current.is_some_and(|c| entry.clock < c) {
                        continue;
                    }
                    self.clocks.insert(entry.client_id, entry.clock);
                    if known {
                        self.states.remove(&entry.client_id);
                        change.removed.push(entry.client_id);
                    }
                }
            }
        }
        Ok(change)
    }

    /// Purge state for departing clients and return the removal delta.
    ///
    /// Ids without a live state are skipped; an empty list yields `None`.
    pub fn remove_clients(&mut self, client_ids: &[ClientId]) -> Result<Option<Vec<u8>>> {
        let mut entries = Vec::new();
        for &id in client_ids {
            if self.states.remove(&id).is_none() {
                continue;
            }
            let clock = self.bump_clock(id);
            entries.push(PresenceEntry {
                client_id: id,
                clock,
                state: None,
            });
        }
        if entries.is_empty() {
            return Ok(None);
        }
        PresenceUpdate { entries }.encode().map(Some)
    }

    /// Encode every live state (sent to a joining client).
    pub fn encode_all(&self) -> Result<Vec<u8>> {
        let mut entries: Vec<PresenceEntry> = self
            .states
            .iter()
            .map(|(id, state)| PresenceEntry {
                client_id: *id,
                clock: self.clocks.get(id).copied().unwrap_or_default(),
                state: Some(state.clone()),
            })
            .collect();
        entries.sort_unstable_by_key(|e| e.client_id);
        PresenceUpdate { entries }.encode()
    }

    /// Drop all remote states, keeping the local one.
    pub fn clear_remote(&mut self) -> Vec<ClientId> {
        let local = self.local_id;
        let removed: Vec<ClientId> = self
            .states
            .keys()
            .copied()
            .filter(|id| *id != local)
            .collect();
        for id in &removed {
            self.states.remove(id);
        }
        removed
    }

    pub fn get(&self, client_id: ClientId) -> Option<&PresenceState> {
        self.states.get(&client_id)
    }

    /// Live states other than the local one, ordered by client id.
    pub fn remote_states(&self) -> Vec<(ClientId, PresenceState)> {
        let mut remote: Vec<(ClientId, PresenceState)> = self
            .states
            .iter()
            .filter(|(id, _)| **id != self.local_id)
            .map(|(id, s)| (*id, s.clone()))
            .collect();
        remote.sort_unstable_by_key(|(id, _)| *id);
        remote
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.states.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn bump_clock(&mut self, id: ClientId) -> u32 {
        let clock = self.clocks.entry(id).or_insert(0);
        *clock += 1;
        *clock
    }
}

/// Stable cursor color for a display name.
pub fn color_for_name(name: &str) -> &'static str {
    let hash = name
        .chars()
        .fold(0u32, |acc, c| acc.wrapping_mul(31).wrapping_add(c as u32));
    CURSOR_PALETTE[(hash as usize) % CURSOR_PALETTE.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(name: &str) -> PresenceState {
        PresenceState::new(PresenceUser::new(name))
    }

    #[test]
    fn test_color_for_name_stable() {
        assert_eq!(color_for_name("Alice"), color_for_name("Alice"));
        assert!(CURSOR_PALETTE.contains(&color_for_name("Bob")));
        assert!(CURSOR_PALETTE.contains(&color_for_name("")));
    }

    #[test]
    fn test_local_state_reaches_remote() {
        let mut alice = PresenceTracker::new(11);
        let mut server = PresenceTracker::new(SERVER_ORIGIN);

        let update = alice.set_local_state(Some(state("Alice"))).unwrap();
        let change = server.apply_remote_update(&update, 11).unwrap();

        assert_eq!(change.added, vec![11]);
        assert_eq!(server.get(11).unwrap().user.name, "Alice");
    }

    #[test]
    fn test_self_origin_ignored() {
        let mut alice = PresenceTracker::new(11);
        let update = alice.set_local_state(Some(state("Alice"))).unwrap();

        let change = alice.apply_remote_update(&update, 11).unwrap();
        assert!(change.is_empty());
        assert_eq!(alice.len(), 1);
    }

    #[test]
    fn test_entries_about_local_client_ignored() {
        let mut alice = PresenceTracker::new(11);
        alice.set_local_state(Some(state("Alice"))).unwrap();

        // Server relays a stale copy of Alice's own state.
        let echoed = PresenceUpdate {
            entries: vec![PresenceEntry {
                client_id: 11,
                clock: 99,
                state: None,
            }],
        }
        .encode()
        .unwrap();
        let change = alice.apply_remote_update(&echoed, SERVER_ORIGIN).unwrap();

        assert!(change.is_empty());
        assert_eq!(alice.local_state().unwrap().user.name, "Alice");
    }

    #[test]
    fn test_last_write_wins_per_client() {
        let mut bob = PresenceTracker::new(22);
        let mut server = PresenceTracker::new(SERVER_ORIGIN);

        let first = bob.set_local_state(Some(state("Bob"))).unwrap();
        let mut renamed = state("Robert");
        renamed.cursor = Some(CursorSelection {
            anchor: vec![1],
            head: vec![2],
        });
        let second = bob.set_local_state(Some(renamed.clone())).unwrap();

        // Newer arrives first; the older one must not win.
        server.apply_remote_update(&second, 22).unwrap();
        let change = server.apply_remote_update(&first, 22).unwrap();

        assert!(change.is_empty());
        assert_eq!(server.get(22), Some(&renamed));
    }

    #[test]
    fn test_remove_clients_broadcast_delta() {
        let mut server = PresenceTracker::new(SERVER_ORIGIN);
        let mut alice = PresenceTracker::new(11);
        let mut carol = PresenceTracker::new(33);

        let a = alice.set_local_state(Some(state("Alice"))).unwrap();
        let c = carol.set_local_state(Some(state("Carol"))).unwrap();
        server.apply_remote_update(&a, 11).unwrap();
        server.apply_remote_update(&c, 33).unwrap();
        carol.apply_remote_update(&a, SERVER_ORIGIN).unwrap();

        let removal = server.remove_clients(&[11]).unwrap().unwrap();
        assert_eq!(server.client_ids(), vec![33]);

        let change = carol.apply_remote_update(&removal, SERVER_ORIGIN).unwrap();
        assert_eq!(change.removed, vec![11]);
        assert!(carol.remote_states().is_empty());

        // A replayed join from before the removal stays rejected.
        let change = server.apply_remote_update(&a, 11).unwrap();
        assert!(change.is_empty());
    }

    #[test]
    fn test_reannounce_after_removal_restores_client() {
        let mut server = PresenceTracker::new(SERVER_ORIGIN);
        let mut peer = PresenceTracker::new(33);
        let mut alice = PresenceTracker::new(11);

        let first = alice.set_local_state(Some(state("Alice"))).unwrap();
        server.apply_remote_update(&first, 11).unwrap();
        peer.apply_remote_update(&first, SERVER_ORIGIN).unwrap();

        // Alice drops; the server bumps her clock past what her tracker holds.
        let removal = server.remove_clients(&[11]).unwrap().unwrap();
        peer.apply_remote_update(&removal, SERVER_ORIGIN).unwrap();

        // She reconnects and announces again from the same tracker.
        let again = alice.set_local_state(Some(state("Alice"))).unwrap();
        let change = server.apply_remote_update(&again, 11).unwrap();
        assert_eq!(change.added, vec![11]);
        assert_eq!(server.client_ids(), vec![11]);

        let change = peer.apply_remote_update(&again, SERVER_ORIGIN).unwrap();
        assert_eq!(change.added, vec![11]);

        // The same announcement a second time is not a change.
        assert!(server.apply_remote_update(&again, 11).unwrap().is_empty());
    }

    #[test]
    fn test_remove_unknown_client_is_noop() {
        let mut server = PresenceTracker::new(SERVER_ORIGIN);
        assert!(server.remove_clients(&[404]).unwrap().is_none());
    }

    #[test]
    fn test_encode_all_for_late_joiner() {
        let mut server = PresenceTracker::new(SERVER_ORIGIN);
        for (id, name) in [(1u64, "A"), (2, "B")] {
            let mut t = PresenceTracker::new(id);
            let u = t.set_local_state(Some(state(name))).unwrap();
            server.apply_remote_update(&u, id).unwrap();
        }

        let snapshot = server.encode_all().unwrap();
        let mut late = PresenceTracker::new(3);
        let change = late.apply_remote_update(&snapshot, SERVER_ORIGIN).unwrap();

        assert_eq!(change.added, vec![1, 2]);
        assert_eq!(late.remote_states().len(), 2);
    }

    #[test]
    fn test_clear_remote_keeps_local() {
        let mut alice = PresenceTracker::new(11);
        alice.set_local_state(Some(state("Alice"))).unwrap();
        let mut bob = PresenceTracker::new(22);
        let b = bob.set_local_state(Some(state("Bob"))).unwrap();
        alice.apply_remote_update(&b, SERVER_ORIGIN).unwrap();

        assert_eq!(alice.clear_remote(), vec![22]);
        assert_eq!(alice.client_ids(), vec![11]);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let mut server = PresenceTracker::new(SERVER_ORIGIN);
        assert!(server.apply_remote_update(&[0xFF, 0xFE, 0xFD], 5).is_err());
    }
}
