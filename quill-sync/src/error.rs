//! Error type shared by every layer of the sync core.

use thiserror::Error;

/// Errors surfaced by the replica, the transport and the session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// The replica or session was used after `dispose()`.
    #[error("document replica used after dispose")]
    Disposed,

    #[error("serialization error: {0}")]
    Encode(String),

    #[error("deserialization error: {0}")]
    Decode(String),

    /// The CRDT engine refused an update.
    #[error("crdt error: {0}")]
    Crdt(String),

    #[error("edit range {start}..{end} out of bounds (len {len})")]
    InvalidRange { start: u32, end: u32, len: u32 },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The backend could not produce an initial snapshot.
    #[error("initial content fetch failed: {0}")]
    Fetch(String),
}

impl From<yrs::encoding::read::Error> for SyncError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
