//! Binary protocol spoken between sessions and the relay.
//!
//! Wire format (bincode-encoded, one message per binary WebSocket frame):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ client_id │ doc_id   │ payload  │
//! │ 1 byte   │ varint    │ 16 bytes │ variable │
//! └──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! Handshake:
//! ```text
//! client                         relay
//!   │── Join ─────────────────────►│
//!   │◄──────────── Welcome{id,n} ──│
//!   │◄──────────── SyncStep1(sv) ──│
//!   │◄──────── Awareness(all) ─────│
//!   │── SyncStep1(sv) ────────────►│
//!   │◄──────────── SyncStep2(diff) │
//!   │── SyncStep2(diff) ──────────►│
//!   │── Awareness(self) ──────────►│
//!   │◄────── Update / Awareness ───│  (steady state, both ways)
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::presence::{AwarenessUpdate, ClientId};

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// CRDT state vector, asks the other side for what we lack
    SyncStep1 = 1,
    /// CRDT diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental CRDT update
    Update = 3,
    /// Presence states
    Awareness = 4,
    /// Client asks to enter a document room
    Join = 5,
    /// Relay assigns the connection id
    Welcome = 6,
    /// Relay refuses to keep this connection in sync
    Reject = 7,
    Ping = 8,
    Pong = 9,
}

/// Payload of a `Welcome` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub client_id: ClientId,
    /// Other connections already in the room when this one joined.
    pub peers: u32,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Sender's connection id (0 for the relay and for pre-welcome frames)
    pub client_id: ClientId,
    pub doc_id: Uuid,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, client_id: ClientId, doc_id: Uuid, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            client_id,
            doc_id,
            payload,
        }
    }

    /// Ask to join the room for `doc_id`.
    pub fn join(doc_id: Uuid) -> Self {
        Self::new(MessageType::Join, 0, doc_id, Vec::new())
    }

    pub fn welcome(doc_id: Uuid, welcome: Welcome) -> SyncResult<Self> {
        Ok(Self::new(MessageType::Welcome, 0, doc_id, encode_payload(&welcome)?))
    }

    pub fn sync_step1(client_id: ClientId, doc_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, client_id, doc_id, state_vector)
    }

    pub fn sync_step2(client_id: ClientId, doc_id: Uuid, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, client_id, doc_id, diff)
    }

    pub fn update(client_id: ClientId, doc_id: Uuid, update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, client_id, doc_id, update)
    }

    pub fn awareness(client_id: ClientId, doc_id: Uuid, update: &AwarenessUpdate) -> SyncResult<Self> {
        Ok(Self::new(MessageType::Awareness, client_id, doc_id, update.encode()?))
    }

    pub fn reject(doc_id: Uuid, reason: &str) -> Self {
        Self::new(MessageType::Reject, 0, doc_id, reason.as_bytes().to_vec())
    }

    pub fn ping(client_id: ClientId) -> Self {
        Self::new(MessageType::Ping, client_id, Uuid::nil(), Vec::new())
    }

    pub fn pong(client_id: ClientId) -> Self {
        Self::new(MessageType::Pong, client_id, Uuid::nil(), Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        encode_payload(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        decode_payload(bytes)
    }

    /// Parse a `Welcome` payload.
    pub fn welcome_info(&self) -> SyncResult<Welcome> {
        self.expect(MessageType::Welcome)?;
        decode_payload(&self.payload)
    }

    /// Parse an `Awareness` payload.
    pub fn awareness_update(&self) -> SyncResult<AwarenessUpdate> {
        self.expect(MessageType::Awareness)?;
        AwarenessUpdate::decode(&self.payload)
    }

    /// Human-readable reason carried by a `Reject`.
    pub fn reject_reason(&self) -> SyncResult<String> {
        self.expect(MessageType::Reject)?;
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }

    fn expect(&self, msg_type: MessageType) -> SyncResult<()> {
        if self.msg_type != msg_type {
            return Err(SyncError::Decode(format!(
                "expected {msg_type:?} frame, got {:?}",
                self.msg_type
            )));
        }
        Ok(())
    }
}

fn encode_payload<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| SyncError::Encode(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> SyncResult<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| SyncError::Decode(e.to_string()))?;
    Ok(value)
}
