//! CRDT engine boundary.
//!
//! The sync core never looks inside the merge algorithm. It needs three
//! capabilities: apply a remote update, produce an update for a local edit,
//! and read the converged state. [`CrdtEngine`] is that boundary;
//! [`YrsEngine`] is the implementation shipped with the crate.
//!
//! ```text
//!   remote bytes ──► apply_update ──┐
//!                                   ▼
//!                          ┌──────────────────┐
//!                          │ Doc              │
//!                          │  ├─ "content"    │──► text(Content)
//!                          │  └─ "language"   │──► text(Language)
//!                          └──────────────────┘
//!                                   ▲
//!   local edit ──► splice/replace ──┴──► encoded update (outbound)
//! ```
//!
//! Offsets are UTF-16 code units, the unit browser editor widgets use.

use std::ops::Range;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use crate::error::{SyncError, SyncResult};

/// The two registers held by every replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// Document body.
    Content,
    /// Language tag, written with full-replace semantics.
    Language,
}

impl Register {
    /// Root type name on the shared document.
    pub const fn name(self) -> &'static str {
        match self {
            Register::Content => "content",
            Register::Language => "language",
        }
    }
}

/// Capabilities the sync core requires from a CRDT text engine.
pub trait CrdtEngine: Send + 'static {
    /// Merge a remote update (v1 encoding).
    fn apply_update(&mut self, update: &[u8]) -> SyncResult<()>;

    /// Replace `range` of `register` with `text`, returning the encoded update.
    fn splice(&mut self, register: Register, range: Range<u32>, text: &str) -> SyncResult<Vec<u8>>;

    /// Clear `register` and insert `text` in a single transaction.
    fn replace(&mut self, register: Register, text: &str) -> Vec<u8>;

    fn text(&self, register: Register) -> String;

    fn len(&self, register: Register) -> u32;

    /// Encoded state vector for the sync handshake.
    fn state_vector(&self) -> Vec<u8>;

    /// Everything the holder of `state_vector` is missing.
    fn diff_since(&self, state_vector: &[u8]) -> SyncResult<Vec<u8>>;
}

/// [`CrdtEngine`] backed by a `yrs` document.
pub struct YrsEngine {
    doc: Doc,
    content: TextRef,
    language: TextRef,
}

impl YrsEngine {
    pub fn new() -> Self {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Utf16,
            ..Options::default()
        });
        let content = doc.get_or_insert_text(Register::Content.name());
        let language = doc.get_or_insert_text(Register::Language.name());
        Self { doc, content, language }
    }

    /// The underlying `yrs` document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    fn register(&self, register: Register) -> &TextRef {
        match register {
            Register::Content => &self.content,
            Register::Language => &self.language,
        }
    }
}

impl Default for YrsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CrdtEngine for YrsEngine {
    fn apply_update(&mut self, update: &[u8]) -> SyncResult<()> {
        let update = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| SyncError::Crdt(e.to_string()))
    }

    fn splice(&mut self, register: Register, range: Range<u32>, text: &str) -> SyncResult<Vec<u8>> {
        let target = self.register(register);
        let mut txn = self.doc.transact_mut();
        let len = target.len(&txn);
        if range.start > range.end || range.end > len {
            return Err(SyncError::InvalidRange {
                start: range.start,
                end: range.end,
                len,
            });
        }
        if range.end > range.start {
            target.remove_range(&mut txn, range.start, range.end - range.start);
        }
        if !text.is_empty() {
            target.insert(&mut txn, range.start, text);
        }
        Ok(txn.encode_update_v1())
    }

    fn replace(&mut self, register: Register, text: &str) -> Vec<u8> {
        let target = self.register(register);
        let mut txn = self.doc.transact_mut();
        let len = target.len(&txn);
        if len > 0 {
            target.remove_range(&mut txn, 0, len);
        }
        if !text.is_empty() {
            target.insert(&mut txn, 0, text);
        }
        txn.encode_update_v1()
    }

    fn text(&self, register: Register) -> String {
        let txn = self.doc.transact();
        self.register(register).get_string(&txn)
    }

    fn len(&self, register: Register) -> u32 {
        let txn = self.doc.transact();
        self.register(register).len(&txn)
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn diff_since(&self, state_vector: &[u8]) -> SyncResult<Vec<u8>> {
        let sv = StateVector::decode_v1(state_vector)?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }
}
