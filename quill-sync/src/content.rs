//! Backend content source used to seed brand-new documents.

use std::future::Future;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncResult;

/// Snapshot returned by the backend for a saved document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InitialContent {
    pub content: String,
    #[serde(default)]
    pub language: Option<String>,
}

impl InitialContent {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            language: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// Where initial content comes from when nobody else is in the room.
pub trait ContentSource: Send + Sync + 'static {
    /// Fetch the persisted snapshot of `doc_id`.
    fn fetch_initial_content(&self, doc_id: Uuid) -> impl Future<Output = SyncResult<InitialContent>> + Send;

    /// Whether the room already has participants. `None` when this source
    /// cannot tell.
    fn room_exists(&self, _doc_id: Uuid) -> impl Future<Output = Option<bool>> + Send {
        async { None }
    }
}

/// Source with nothing to offer: every document starts empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContent;

impl ContentSource for NoContent {
    async fn fetch_initial_content(&self, _doc_id: Uuid) -> SyncResult<InitialContent> {
        Ok(InitialContent::default())
    }
}
