//! The replicated document: a `content` register and a `language` register
//! held by one [`CrdtEngine`], plus the observer list the editor binding and
//! the session hang off.
//!
//! Every mutation follows the same path:
//!
//! ```text
//! apply_remote_update / local_edit / set_language / seed_content_if_empty
//!       │
//!       ├── engine mutation (one transaction)
//!       ├── local mutations: encoded update ──► outbound channel
//!       └── observers of changed registers, in registration order
//! ```
//!
//! Observers have all run by the time the call returns, so the session never
//! interleaves the effects of two inbound frames.

use std::ops::Range;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::engine::{CrdtEngine, Register, YrsEngine};
use crate::error::{SyncError, SyncResult};

/// Replica handle shared between the session driver, the reconciliation
/// task and the public session API.
pub type SharedReplica<E = YrsEngine> = Arc<Mutex<DocumentReplica<E>>>;

/// Receiver of encoded local updates waiting to go out on the wire.
pub type OutboundUpdates = mpsc::UnboundedReceiver<Vec<u8>>;

type ObserverFn = Box<dyn Fn(&str) + Send + Sync>;

/// Handle returned by `observe_*`, used to detach the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Observer {
    id: ObserverId,
    register: Register,
    callback: ObserverFn,
}

/// One participant's copy of the shared document.
pub struct DocumentReplica<E: CrdtEngine = YrsEngine> {
    /// `None` once disposed
    engine: Option<E>,
    observers: Vec<Observer>,
    next_observer: u64,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Last state delivered to observers
    content: String,
    language: String,
}

impl DocumentReplica<YrsEngine> {
    /// Create an empty replica backed by `yrs`.
    pub fn new() -> (Self, OutboundUpdates) {
        Self::with_engine(YrsEngine::new())
    }
}

impl<E: CrdtEngine> DocumentReplica<E> {
    /// Wrap an engine. The receiver yields one encoded update per local
    /// mutation.
    pub fn with_engine(engine: E) -> (Self, OutboundUpdates) {
        let (tx, rx) = mpsc::unbounded_channel();
        let content = engine.text(Register::Content);
        let language = engine.text(Register::Language);
        let replica = Self {
            engine: Some(engine),
            observers: Vec::new(),
            next_observer: 0,
            outbound: Some(tx),
            content,
            language,
        };
        (replica, rx)
    }

    /// Wrap into the shared handle used by the session.
    pub fn into_shared(self) -> SharedReplica<E> {
        Arc::new(Mutex::new(self))
    }

    fn engine(&self) -> SyncResult<&E> {
        self.engine.as_ref().ok_or(SyncError::Disposed)
    }

    fn engine_mut(&mut self) -> SyncResult<&mut E> {
        self.engine.as_mut().ok_or(SyncError::Disposed)
    }

    /// Merge an update received from the network.
    pub fn apply_remote_update(&mut self, update: &[u8]) -> SyncResult<()> {
        self.engine_mut()?.apply_update(update)?;
        self.publish_changes()
    }

    /// Replace `range` of `content` with `text` and queue the update.
    pub fn local_edit(&mut self, range: Range<u32>, text: &str) -> SyncResult<()> {
        let engine = self.engine_mut()?;
        let len = engine.len(Register::Content);
        if range.start > range.end || range.end > len {
            return Err(SyncError::InvalidRange {
                start: range.start,
                end: range.end,
                len,
            });
        }
        if range.is_empty() && text.is_empty() {
            return Ok(());
        }
        let update = engine.splice(Register::Content, range, text)?;
        self.schedule(update);
        self.publish_changes()
    }

    /// Overwrite `language` (clear then insert, never merged).
    pub fn set_language(&mut self, language: &str) -> SyncResult<()> {
        let update = self.engine_mut()?.replace(Register::Language, language);
        self.schedule(update);
        self.publish_changes()
    }

    /// Insert `text` as the whole content, but only if `content` is still
    /// empty at this instant. Returns whether the insert happened.
    pub fn seed_content_if_empty(&mut self, text: &str) -> SyncResult<bool> {
        let engine = self.engine_mut()?;
        if engine.len(Register::Content) > 0 || text.is_empty() {
            return Ok(false);
        }
        let update = engine.splice(Register::Content, 0..0, text)?;
        self.schedule(update);
        self.publish_changes()?;
        Ok(true)
    }

    /// Register a callback for every converged change of `content`.
    pub fn observe_content<F>(&mut self, callback: F) -> SyncResult<ObserverId>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.observe(Register::Content, Box::new(callback))
    }

    /// Register a callback for every converged change of `language`.
    pub fn observe_language<F>(&mut self, callback: F) -> SyncResult<ObserverId>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.observe(Register::Language, Box::new(callback))
    }

    fn observe(&mut self, register: Register, callback: ObserverFn) -> SyncResult<ObserverId> {
        self.engine()?;
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push(Observer { id, register, callback });
        Ok(id)
    }

    /// Detach an observer. Returns `false` if it was not registered.
    pub fn unobserve(&mut self, id: ObserverId) -> SyncResult<bool> {
        self.engine()?;
        let before = self.observers.len();
        self.observers.retain(|o| o.id != id);
        Ok(self.observers.len() != before)
    }

    pub fn snapshot_text(&self) -> SyncResult<String> {
        Ok(self.engine()?.text(Register::Content))
    }

    pub fn snapshot_language(&self) -> SyncResult<String> {
        Ok(self.engine()?.text(Register::Language))
    }

    /// Length of `content` in UTF-16 code units.
    pub fn content_len(&self) -> SyncResult<u32> {
        Ok(self.engine()?.len(Register::Content))
    }

    pub fn state_vector(&self) -> SyncResult<Vec<u8>> {
        Ok(self.engine()?.state_vector())
    }

    pub fn diff_since(&self, state_vector: &[u8]) -> SyncResult<Vec<u8>> {
        self.engine()?.diff_since(state_vector)
    }

    pub fn is_disposed(&self) -> bool {
        self.engine.is_none()
    }

    /// Detach all observers and release CRDT state. Idempotent; every other
    /// call fails with [`SyncError::Disposed`] afterwards.
    pub fn dispose(&mut self) {
        if self.engine.take().is_some() {
            log::debug!("Disposing replica ({} observers)", self.observers.len());
        }
        self.observers.clear();
        self.outbound = None;
        self.content.clear();
        self.language.clear();
    }

    fn schedule(&self, update: Vec<u8>) {
        if let Some(tx) = &self.outbound {
            if tx.send(update).is_err() {
                log::debug!("Outbound channel closed, local update not queued");
            }
        }
    }

    fn publish_changes(&mut self) -> SyncResult<()> {
        let (content, language) = {
            let engine = self.engine()?;
            (engine.text(Register::Content), engine.text(Register::Language))
        };
        let content_changed = content != self.content;
        let language_changed = language != self.language;
        self.content = content;
        self.language = language;

        for observer in &self.observers {
            match observer.register {
                Register::Content if content_changed => (observer.callback)(&self.content),
                Register::Language if language_changed => (observer.callback)(&self.language),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recorder() -> (Arc<StdMutex<Vec<String>>>, impl Fn(&str) + Send + Sync + 'static) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |s: &str| sink.lock().unwrap().push(s.to_string()))
    }

    #[test]
    fn test_local_edit_queues_update() {
        let (mut replica, mut outbound) = DocumentReplica::new();
        replica.local_edit(0..0, "hello").unwrap();

        let update = outbound.try_recv().unwrap();
        let (mut other, _rx) = DocumentReplica::new();
        other.apply_remote_update(&update).unwrap();
        assert_eq!(other.snapshot_text().unwrap(), "hello");
    }

    #[test]
    fn test_noop_edit_is_not_queued() {
        let (mut replica, mut outbound) = DocumentReplica::new();
        replica.local_edit(0..0, "").unwrap();
        assert!(outbound.try_recv().is_err());
    }

    #[test]
    #[allow(clippy::reversed_empty_ranges)]
    fn test_bad_range_rejected_even_without_text() {
        let (mut replica, mut outbound) = DocumentReplica::new();
        replica.local_edit(0..0, "abc").unwrap();
        outbound.try_recv().unwrap();

        assert_eq!(
            replica.local_edit(100..100, ""),
            Err(SyncError::InvalidRange { start: 100, end: 100, len: 3 })
        );
        assert_eq!(
            replica.local_edit(3..1, ""),
            Err(SyncError::InvalidRange { start: 3, end: 1, len: 3 })
        );
        assert!(replica.local_edit(4..4, "x").is_err());
        assert!(outbound.try_recv().is_err());
        assert_eq!(replica.snapshot_text().unwrap(), "abc");
    }

    #[test]
    fn test_remote_update_does_not_echo() {
        let (mut a, _a_out) = DocumentReplica::new();
        let (mut b, mut b_out) = DocumentReplica::new();
        a.local_edit(0..0, "x").unwrap();
        let diff = a.diff_since(&b.state_vector().unwrap()).unwrap();
        b.apply_remote_update(&diff).unwrap();
        assert!(b_out.try_recv().is_err());
    }

    #[test]
    fn test_observers_see_remote_and_local_changes() {
        let (mut a, mut a_out) = DocumentReplica::new();
        let (mut b, _b_out) = DocumentReplica::new();
        let (seen, cb) = recorder();
        b.observe_content(cb).unwrap();

        a.local_edit(0..0, "abc").unwrap();
        b.apply_remote_update(&a_out.try_recv().unwrap()).unwrap();
        b.local_edit(3..3, "d").unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["abc", "abcd"]);
    }

    #[test]
    fn test_language_observer_only_fires_on_language_change() {
        let (mut replica, _out) = DocumentReplica::new();
        let (seen, cb) = recorder();
        replica.observe_language(cb).unwrap();

        replica.local_edit(0..0, "fn main() {}").unwrap();
        replica.set_language("rust").unwrap();
        replica.set_language("rust").unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["rust"]);
    }

    #[test]
    fn test_observers_share_one_sequence() {
        let (mut replica, _out) = DocumentReplica::new();
        let (first, cb1) = recorder();
        let (second, cb2) = recorder();
        replica.observe_content(cb1).unwrap();
        replica.observe_content(cb2).unwrap();

        replica.local_edit(0..0, "a").unwrap();
        replica.local_edit(1..1, "b").unwrap();

        assert_eq!(*first.lock().unwrap(), *second.lock().unwrap());
    }

    #[test]
    fn test_unobserve() {
        let (mut replica, _out) = DocumentReplica::new();
        let (seen, cb) = recorder();
        let id = replica.observe_content(cb).unwrap();
        assert!(replica.unobserve(id).unwrap());
        assert!(!replica.unobserve(id).unwrap());

        replica.local_edit(0..0, "quiet").unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_seed_only_into_empty_content() {
        let (mut replica, _out) = DocumentReplica::new();
        assert!(replica.seed_content_if_empty("from backend").unwrap());
        assert!(!replica.seed_content_if_empty("again").unwrap());
        assert_eq!(replica.snapshot_text().unwrap(), "from backend");
    }

    #[test]
    fn test_seed_skipped_when_remote_content_present() {
        let (mut remote, mut remote_out) = DocumentReplica::new();
        remote.local_edit(0..0, "R").unwrap();

        let (mut replica, _out) = DocumentReplica::new();
        replica.apply_remote_update(&remote_out.try_recv().unwrap()).unwrap();
        assert!(!replica.seed_content_if_empty("B").unwrap());
        assert_eq!(replica.snapshot_text().unwrap(), "R");
    }

    #[test]
    fn test_use_after_dispose() {
        let (mut replica, mut outbound) = DocumentReplica::new();
        let (seen, cb) = recorder();
        replica.observe_content(cb).unwrap();
        replica.dispose();
        replica.dispose();

        assert!(replica.is_disposed());
        assert_eq!(replica.local_edit(0..0, "x"), Err(SyncError::Disposed));
        assert_eq!(replica.apply_remote_update(&[0]), Err(SyncError::Disposed));
        assert_eq!(replica.snapshot_text(), Err(SyncError::Disposed));
        assert_eq!(replica.snapshot_language(), Err(SyncError::Disposed));
        assert!(replica.observe_language(|_| {}).is_err());
        assert!(seen.lock().unwrap().is_empty());
        // Sender dropped on dispose.
        assert!(matches!(
            outbound.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
