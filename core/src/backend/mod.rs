//! Backend contract the messaging core talks to.
//!
//! A backend is a relational store reachable through query / insert / update
//! calls plus a row-level change feed. The feed is not assumed to support
//! server-side filtering; subscribers filter on their side (see `crate::feed`).

pub mod sled_store;

use crate::error::Result;
use crate::models::{ChangeEvent, ConversationRow, Message, NewMessage, Profile, ThreadKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

pub use sled_store::SledBackend;

/// Filter for the viewer's conversation summaries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationQuery {
    pub viewer_id: String,
    pub scope_id: Option<String>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Messages between the key's two users (either direction), scope-filtered when
    /// the key is scoped, ordered by creation time ascending.
    async fn fetch_thread(&self, key: &ThreadKey) -> Result<Vec<Message>>;

    /// Persist one message; returns the stored row with its permanent id and timestamps.
    async fn insert_message(&self, message: NewMessage) -> Result<Message>;

    /// Set `read_at` on every listed message addressed to `reader_id`, in one update.
    /// Returns the rows that changed.
    async fn mark_read(
        &self,
        ids: &[String],
        reader_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<Vec<Message>>;

    /// Batch profile lookup. Unknown ids are simply absent from the result.
    async fn fetch_profiles(&self, ids: &[String]) -> Result<Vec<Profile>>;

    /// Summaries where the viewer is either participant, newest activity first.
    async fn fetch_conversations(&self, query: &ConversationQuery) -> Result<Vec<ConversationRow>>;

    fn subscribe_messages(&self) -> Result<broadcast::Receiver<ChangeEvent<Message>>>;

    fn subscribe_conversations(&self) -> Result<broadcast::Receiver<ChangeEvent<ConversationRow>>>;
}
