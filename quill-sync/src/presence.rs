//! Presence: who else is looking at this document.
//!
//! ## Architecture
//!
//! ```text
//! Awareness frame (per-connection states)
//!       │
//!       ▼
//! AwarenessMap::apply()          (per-client clocks, stale entries dropped)
//!       │
//!       ▼
//! PresenceTracker::update()      (exclude self, dedupe by name+hue)
//!       │  only when the visible peer set changed
//!       ▼
//! SessionSink::on_peers()
//! ```
//!
//! Awareness fires on every cursor movement of every peer. The tracker
//! compares names and hues only, so cursor traffic never reaches the UI.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::sink::SessionSink;

/// Connection id assigned by the relay. Monotonically increasing.
pub type ClientId = u64;

/// Published peer set, keyed by the winning connection id.
pub type PeerMap = BTreeMap<ClientId, PeerInfo>;

// ───────────────────────────────────────────────────────────────────
// Wire types
// ───────────────────────────────────────────────────────────────────

/// One human participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    /// Color hue in degrees, 0–359.
    pub hue: u16,
}

impl PeerInfo {
    pub const MAX_HUE: u16 = 359;

    /// Create a peer identity. Hues wrap into 0–359.
    pub fn new(name: impl Into<String>, hue: u16) -> Self {
        Self {
            name: name.into(),
            hue: hue % (Self::MAX_HUE + 1),
        }
    }

    /// Create a peer identity with a random hue.
    pub fn with_random_hue(name: impl Into<String>) -> Self {
        Self::with_hue_from(name, Uuid::new_v4())
    }

    /// Stable hue derived from an id.
    pub fn with_hue_from(name: impl Into<String>, id: Uuid) -> Self {
        let hue = (id.as_u128() % (Self::MAX_HUE as u128 + 1)) as u16;
        Self::new(name, hue)
    }

    /// Entries failing this are treated as "no presence".
    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty() && self.hue <= Self::MAX_HUE
    }
}

/// Editor selection, in UTF-16 offsets of `content`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

/// Everything a connection broadcasts about itself.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PresenceState {
    pub user: Option<PeerInfo>,
    pub cursor: Option<CursorRange>,
}

impl PresenceState {
    /// The identity this state publishes, if well-formed.
    pub fn peer(&self) -> Option<&PeerInfo> {
        self.user.as_ref().filter(|u| u.is_valid())
    }
}

/// A single connection's awareness change. `state: None` clears it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub clock: u32,
    pub state: Option<PresenceState>,
}

/// Payload of an awareness frame.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn single(entry: AwarenessEntry) -> Self {
        Self { entries: vec![entry] }
    }

    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Decode(e.to_string()))?;
        Ok(update)
    }
}

// ───────────────────────────────────────────────────────────────────
// Raw awareness states
// ───────────────────────────────────────────────────────────────────

/// Raw per-connection awareness states as seen on the broadcast channel.
///
/// Clocks survive removal so a delayed state from a connection that already
/// cleared itself cannot resurrect it.
#[derive(Debug, Default)]
pub struct AwarenessMap {
    states: HashMap<ClientId, PresenceState>,
    clocks: HashMap<ClientId, u32>,
}

impl AwarenessMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one entry. Returns `true` if the map changed.
    pub fn apply(&mut self, entry: &AwarenessEntry) -> bool {
        let newer = match self.clocks.get(&entry.client_id) {
            None => true,
            Some(&clock) => {
                entry.clock > clock
                    || (entry.clock == clock
                        && entry.state.is_none()
                        && self.states.contains_key(&entry.client_id))
            }
        };
        if !newer {
            return false;
        }

        self.clocks.insert(entry.client_id, entry.clock);
        match &entry.state {
            Some(state) => self.states.insert(entry.client_id, state.clone()).as_ref() != Some(state),
            None => self.states.remove(&entry.client_id).is_some(),
        }
    }

    /// Apply a whole frame. Returns `true` if anything changed.
    pub fn apply_update(&mut self, update: &AwarenessUpdate) -> bool {
        update
            .entries
            .iter()
            .fold(false, |changed, entry| self.apply(entry) || changed)
    }

    /// Drop a connection that went away without clearing itself, returning
    /// the removal entry to broadcast.
    pub fn remove(&mut self, client_id: ClientId) -> Option<AwarenessEntry> {
        self.states.remove(&client_id)?;
        let clock = self.clocks.entry(client_id).or_insert(0);
        *clock = clock.saturating_add(1);
        Some(AwarenessEntry {
            client_id,
            clock: *clock,
            state: None,
        })
    }

    /// Forget every state and clock.
    pub fn clear(&mut self) {
        self.states.clear();
        self.clocks.clear();
    }

    /// Full current state, for a connection that just joined.
    pub fn snapshot(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            entries: self
                .states
                .iter()
                .map(|(&client_id, state)| AwarenessEntry {
                    client_id,
                    clock: self.clocks.get(&client_id).copied().unwrap_or(0),
                    state: Some(state.clone()),
                })
                .collect(),
        }
    }

    pub fn get(&self, client_id: ClientId) -> Option<&PresenceState> {
        self.states.get(&client_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, &PresenceState)> {
        self.states.iter().map(|(&id, state)| (id, state))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Local presence
// ───────────────────────────────────────────────────────────────────

/// The local connection's own awareness state.
#[derive(Debug, Clone)]
pub struct LocalPresence {
    user: PeerInfo,
    cursor: Option<CursorRange>,
    /// Shared with the connection lease so the final clear is newer than
    /// anything already sent.
    clock: Arc<AtomicU32>,
}

impl LocalPresence {
    pub fn new(user: PeerInfo) -> Self {
        Self {
            user,
            cursor: None,
            clock: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn user(&self) -> &PeerInfo {
        &self.user
    }

    pub fn cursor(&self) -> Option<CursorRange> {
        self.cursor
    }

    /// Move the local cursor and return the entry to broadcast.
    pub fn set_cursor(&mut self, client_id: ClientId, cursor: Option<CursorRange>) -> AwarenessEntry {
        self.cursor = cursor;
        self.clock.fetch_add(1, Ordering::SeqCst);
        self.entry(client_id)
    }

    /// Current state as an entry for `client_id`.
    pub fn entry(&self, client_id: ClientId) -> AwarenessEntry {
        AwarenessEntry {
            client_id,
            clock: self.clock.load(Ordering::SeqCst),
            state: Some(PresenceState {
                user: Some(self.user.clone()),
                cursor: self.cursor,
            }),
        }
    }

    /// Entry that clears `client_id` from every peer's view.
    pub fn clear_entry(&self, client_id: ClientId) -> AwarenessEntry {
        let clock = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        AwarenessEntry {
            client_id,
            clock,
            state: None,
        }
    }

    /// Reset the clock for a fresh connection id.
    pub fn reset_clock(&self) {
        self.clock.store(0, Ordering::SeqCst);
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Collapse raw states into one entry per `(name, hue)`, excluding `local`.
///
/// Among duplicates the larger connection id wins.
pub fn dedupe_peers<'a, I>(states: I, local: Option<ClientId>) -> PeerMap
where
    I: IntoIterator<Item = (ClientId, &'a PresenceState)>,
{
    let mut winners: HashMap<&'a PeerInfo, ClientId> = HashMap::new();
    for (client_id, state) in states {
        if Some(client_id) == local {
            continue;
        }
        let Some(peer) = state.peer() else {
            continue;
        };
        winners
            .entry(peer)
            .and_modify(|winner| *winner = (*winner).max(client_id))
            .or_insert(client_id);
    }
    winners
        .into_iter()
        .map(|(peer, client_id)| (client_id, peer.clone()))
        .collect()
}

fn same_peer_set(a: &PeerMap, b: &PeerMap) -> bool {
    a.len() == b.len() && a.values().collect::<BTreeSet<_>>() == b.values().collect::<BTreeSet<_>>()
}

/// Publishes the deduplicated peer set to the sink, only on change.
pub struct PresenceTracker {
    local_client: Option<ClientId>,
    published: PeerMap,
    sink: Arc<dyn SessionSink>,
}

impl PresenceTracker {
    pub fn new(sink: Arc<dyn SessionSink>) -> Self {
        Self {
            local_client: None,
            published: PeerMap::new(),
            sink,
        }
    }

    /// Set the connection id to exclude. Changes on every reconnect.
    pub fn set_local_client(&mut self, client_id: Option<ClientId>) {
        self.local_client = client_id;
    }

    pub fn local_client(&self) -> Option<ClientId> {
        self.local_client
    }

    /// Recompute from raw states. Returns `true` if a new set was published.
    pub fn update(&mut self, states: &AwarenessMap) -> bool {
        let next = dedupe_peers(states.iter(), self.local_client);
        if same_peer_set(&self.published, &next) {
            return false;
        }
        log::debug!("Peer set changed: {} -> {} peers", self.published.len(), next.len());
        self.published = next;
        self.sink.on_peers(&self.published);
        true
    }

    /// Last published set.
    pub fn peers(&self) -> &PeerMap {
        &self.published
    }
}

// ===================================================================
// Tests
// ===================================================================
