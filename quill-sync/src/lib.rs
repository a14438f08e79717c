//! # quill-sync - Real-time collaborative document sync
//!
//! Keeps one text document (plus its language tag) in sync between every
//! participant editing it, shows who else is present, and decides where a
//! freshly opened document's first content comes from.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      WebSocket       ┌──────────────┐
//! │ Session      │ ◄──────────────────► │ SyncServer   │
//! │ (per user)   │    Binary Proto      │ (relay)      │
//! └──────┬───────┘                      └──────┬───────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌──────────────┐  ┌───────────────┐   ┌──────────────┐
//! │ Document     │  │ Reconciler    │   │ YrsEngine    │
//! │ Replica      │◄─┤ (first fill)  │   │ (authority)  │
//! └──────┬───────┘  └───────┬───────┘   └──────┬───────┘
//!        │                  │                  │
//!        ▼                  ▼                  ▼
//!   editor binding    ContentSource     BroadcastGroup
//!   (observers)       (backend)         (fan-out)
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: CRDT boundary, `yrs`-backed
//! - [`document`]: Replicated document with observers and disposal
//! - [`presence`]: Awareness states, peer dedup and change detection
//! - [`protocol`]: Binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`transport`]: `Connector` seam and the WebSocket implementation
//! - [`reconcile`]: One-shot choice between live peers and the backend
//! - [`session`]: Connection lifecycle tying everything together
//! - [`sink`]: Status, peer and language notifications
//! - [`broadcast`] / [`server`]: Reference relay

pub mod broadcast;
pub mod config;
pub mod content;
pub mod document;
pub mod engine;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod server;
pub mod session;
pub mod sink;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use config::{SessionConfig, GENERIC_LANGUAGE};
pub use content::{ContentSource, InitialContent, NoContent};
pub use document::{DocumentReplica, ObserverId, OutboundUpdates, SharedReplica};
pub use engine::{CrdtEngine, Register, YrsEngine};
pub use error::{SyncError, SyncResult};
pub use presence::{
    dedupe_peers, AwarenessEntry, AwarenessMap, AwarenessUpdate, ClientId, CursorRange, LocalPresence, PeerInfo,
    PeerMap, PresenceState, PresenceTracker,
};
pub use protocol::{MessageType, SyncMessage, Welcome};
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::Session;
pub use sink::{ChannelSink, NullSink, SessionEvent, SessionSink, SessionStatus};
pub use transport::{Connection, Connector, ReconnectPolicy, WsConnector};
