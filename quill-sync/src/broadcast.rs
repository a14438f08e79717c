//! Fan-out of relay frames to every member of a document room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each member gets an independent receiver that buffers up to `capacity`
//! frames; a member that falls further behind observes `Lagged` and must be
//! resynchronized by the caller.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::error::SyncResult;
use crate::presence::ClientId;
use crate::protocol::SyncMessage;

/// One pre-encoded frame and the connection it came from.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Originating connection; 0 for frames produced by the relay itself
    pub from: ClientId,
    pub bytes: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_lagged: u64,
    pub active_members: usize,
}

/// Lock-free counters for the hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_lagged: AtomicU64,
}

/// Broadcast group for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    members: RwLock<BTreeSet<ClientId>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a member may fall behind before it
    /// starts missing them.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(BTreeSet::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Add a member and return its receiver.
    pub async fn join(&self, client_id: ClientId) -> broadcast::Receiver<Frame> {
        self.members.write().await.insert(client_id);
        self.sender.subscribe()
    }

    /// Remove a member. Returns `false` if it was not present.
    pub async fn leave(&self, client_id: ClientId) -> bool {
        self.members.write().await.remove(&client_id)
    }

    /// Encode and fan out `msg`. Returns the number of receivers reached,
    /// the sender's own included (receivers skip their own frames).
    pub fn broadcast(&self, from: ClientId, msg: &SyncMessage) -> SyncResult<usize> {
        Ok(self.broadcast_raw(from, Arc::new(msg.encode()?)))
    }

    /// Fan out pre-encoded bytes.
    pub fn broadcast_raw(&self, from: ClientId, bytes: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Frame { from, bytes }).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record that a member skipped `missed` frames.
    pub fn record_lag(&self, missed: u64) {
        self.stats.frames_lagged.fetch_add(missed, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Member ids in join order (ids are monotonic).
    pub async fn members(&self) -> Vec<ClientId> {
        self.members.read().await.iter().copied().collect()
    }

    pub async fn has_member(&self, client_id: ClientId) -> bool {
        self.members.read().await.contains(&client_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_lagged: self.stats.frames_lagged.load(Ordering::Relaxed),
            active_members: self.member_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
