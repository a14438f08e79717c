//! First-content reconciliation.
//!
//! Two sources can claim authority over a document's initial content: live
//! peers already in the room (content arrives through CRDT sync) and the
//! backend snapshot of a previously saved file. Loading the snapshot
//! unconditionally duplicates text when a second participant joins; waiting
//! for sync unconditionally leaves the first participant staring at an empty
//! buffer.
//!
//! ```text
//!                 first Connected
//!                        │
//!               room already occupied?
//!              ┌─────────┴──────────┐
//!             yes                 no / unknown
//!              │                    │
//!   poll content every `poll`   fetch snapshot
//!   for at most `wait`              │
//!              │          lock replica; still empty?
//!              │            ┌───────┴───────┐
//!              │           yes              no
//!              │         insert        discard snapshot
//!              └──────────┬─────────────────┘
//!                 language still empty?
//!                 snapshot language, else editor language
//! ```
//!
//! The emptiness check and the insert happen under one replica lock, so a
//! remote update applied during the fetch always wins.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tokio::time::Instant;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::content::ContentSource;
use crate::document::SharedReplica;
use crate::engine::CrdtEngine;
use crate::error::SyncError;

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const RESOLVED: u8 = 2;

/// What a reconciliation run ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A previous or concurrent run owns the latch.
    AlreadyResolved,
    /// Occupied room; content arrived through sync.
    RemoteContent,
    /// Occupied room; no content within the wait. Tolerated.
    WaitTimedOut,
    /// Backend snapshot inserted.
    Seeded,
    /// Remote content arrived first; snapshot dropped.
    SnapshotDiscarded,
    /// Backend had nothing to insert.
    EmptySnapshot,
    /// Fetch failed; document stays empty.
    FetchFailed,
    /// Snapshot fetched but the engine refused it; document stays empty.
    SeedFailed,
    /// The session went away mid-run.
    Disposed,
}

/// Sets the latch on every exit path.
struct ResolveLatch<'a>(&'a AtomicU8);

impl Drop for ResolveLatch<'_> {
    fn drop(&mut self) {
        self.0.store(RESOLVED, Ordering::Release);
    }
}

/// One-shot reconciliation controller for a single replica.
pub struct Reconciler {
    doc_id: Uuid,
    config: SessionConfig,
    state: AtomicU8,
}

impl Reconciler {
    pub fn new(doc_id: Uuid, config: SessionConfig) -> Self {
        Self {
            doc_id,
            config,
            state: AtomicU8::new(PENDING),
        }
    }

    /// Whether a run has completed.
    pub fn is_resolved(&self) -> bool {
        self.state.load(Ordering::Acquire) == RESOLVED
    }

    /// Entry point. Idempotent: only the first call does any work.
    ///
    /// `room_hint` is the transport's own view of room occupancy, used when
    /// the content source cannot answer.
    pub async fn resolve<E, S>(
        &self,
        replica: &SharedReplica<E>,
        source: &S,
        room_hint: Option<bool>,
        disposed: &AtomicBool,
    ) -> ReconcileOutcome
    where
        E: CrdtEngine,
        S: ContentSource,
    {
        if self
            .state
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return ReconcileOutcome::AlreadyResolved;
        }
        let _latch = ResolveLatch(&self.state);

        let occupied = match source.room_exists(self.doc_id).await {
            Some(occupied) => occupied,
            None => room_hint.unwrap_or(false),
        };

        let mut snapshot_language = None;
        let outcome = if occupied {
            self.wait_for_remote_content(replica).await
        } else {
            match source.fetch_initial_content(self.doc_id).await {
                Ok(snapshot) => {
                    snapshot_language = snapshot.language;
                    self.seed(replica, &snapshot.content, disposed).await
                }
                Err(e) => {
                    log::warn!("Initial content fetch for {} failed: {e}", self.doc_id);
                    ReconcileOutcome::FetchFailed
                }
            }
        };

        if outcome != ReconcileOutcome::Disposed {
            self.fill_language(replica, snapshot_language, disposed).await;
        }

        log::info!("Reconciled document {}: {outcome:?}", self.doc_id);
        outcome
    }

    async fn wait_for_remote_content<E: CrdtEngine>(&self, replica: &SharedReplica<E>) -> ReconcileOutcome {
        let deadline = Instant::now() + self.config.reconcile_wait;
        loop {
            match replica.lock().await.content_len() {
                Ok(0) => {}
                Ok(_) => return ReconcileOutcome::RemoteContent,
                Err(_) => return ReconcileOutcome::Disposed,
            }
            let now = Instant::now();
            if now >= deadline {
                log::debug!("No remote content for {} within {:?}", self.doc_id, self.config.reconcile_wait);
                return ReconcileOutcome::WaitTimedOut;
            }
            tokio::time::sleep(self.config.reconcile_poll.min(deadline - now)).await;
        }
    }

    async fn seed<E: CrdtEngine>(
        &self,
        replica: &SharedReplica<E>,
        content: &str,
        disposed: &AtomicBool,
    ) -> ReconcileOutcome {
        if disposed.load(Ordering::Acquire) {
            log::debug!("Discarding snapshot for {}: session disposed", self.doc_id);
            return ReconcileOutcome::Disposed;
        }
        if content.is_empty() {
            return ReconcileOutcome::EmptySnapshot;
        }

        let mut replica = replica.lock().await;
        // Disposal may have started while we waited for the lock
        if disposed.load(Ordering::Acquire) {
            log::debug!("Discarding snapshot for {}: session disposed", self.doc_id);
            return ReconcileOutcome::Disposed;
        }
        match replica.seed_content_if_empty(content) {
            Ok(true) => ReconcileOutcome::Seeded,
            Ok(false) => {
                log::debug!("Remote content won for {}, snapshot discarded", self.doc_id);
                ReconcileOutcome::SnapshotDiscarded
            }
            Err(SyncError::Disposed) => ReconcileOutcome::Disposed,
            Err(e) => {
                log::warn!("Seeding {} failed: {e}", self.doc_id);
                ReconcileOutcome::SeedFailed
            }
        }
    }

    async fn fill_language<E: CrdtEngine>(
        &self,
        replica: &SharedReplica<E>,
        snapshot_language: Option<String>,
        disposed: &AtomicBool,
    ) {
        let mut replica = replica.lock().await;
        if disposed.load(Ordering::Acquire) {
            return;
        }
        match replica.snapshot_language() {
            Ok(current) if current.is_empty() => {}
            _ => return,
        }

        let candidate = snapshot_language
            .filter(|language| !language.trim().is_empty())
            .or_else(|| {
                self.config
                    .editor_language_is_specific()
                    .then(|| self.config.editor_language.clone())
            });

        if let Some(language) = candidate {
            if let Err(e) = replica.set_language(&language) {
                log::debug!("Could not set initial language for {}: {e}", self.doc_id);
            }
        }
    }
}
