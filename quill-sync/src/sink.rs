//! Outward-facing notifications: connection status, peer list, language.
//!
//! The surrounding application owns rendering. It implements
//! [`SessionSink`] directly, or takes a [`ChannelSink`] and consumes
//! [`SessionEvent`]s from a channel.

use tokio::sync::{mpsc, watch};

use crate::presence::PeerMap;

/// Connection status of a session.
///
/// `Disconnected → Connected → Disconnected | Desynchronized`.
/// `Desynchronized` is terminal for the session instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Disconnected,
    Connected,
    Desynchronized,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        self == SessionStatus::Desynchronized
    }
}

/// Receiver of session notifications. All methods default to no-ops.
pub trait SessionSink: Send + Sync + 'static {
    fn on_status(&self, _status: SessionStatus) {}

    /// Deduplicated remote peers, published only when the set changes.
    fn on_peers(&self, _peers: &PeerMap) {}

    fn on_language(&self, _language: &str) {}
}

/// Sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl SessionSink for NullSink {}

/// Events emitted by a [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Status(SessionStatus),
    Peers(PeerMap),
    Language(String),
}

/// Sink forwarding every notification into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: SessionEvent) {
        // Receiver gone means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

impl SessionSink for ChannelSink {
    fn on_status(&self, status: SessionStatus) {
        self.emit(SessionEvent::Status(status));
    }

    fn on_peers(&self, peers: &PeerMap) {
        self.emit(SessionEvent::Peers(peers.clone()));
    }

    fn on_language(&self, language: &str) {
        self.emit(SessionEvent::Language(language.to_string()));
    }
}

/// Status holder enforcing the state machine.
///
/// Transitions to the current status are swallowed, and nothing leaves
/// `Desynchronized`.
#[derive(Debug)]
pub(crate) struct StatusCell {
    tx: watch::Sender<SessionStatus>,
}

impl StatusCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionStatus::Disconnected);
        Self { tx }
    }

    pub(crate) fn get(&self) -> SessionStatus {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.tx.subscribe()
    }

    /// Apply a transition. Returns `true` if the status changed.
    pub(crate) fn transition(&self, next: SessionStatus) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            *current = next;
            true
        })
    }
}
