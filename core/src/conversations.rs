//! The viewer's inbox: one row per counterpart (and scope).
//!
//! Rows are backend-maintained summaries, re-fetched rather than derived. Feed
//! events touching the viewer schedule a refresh through a debounced scheduler
//! so a burst of activity costs one query per window.

use crate::backend::{Backend, ConversationQuery};
use crate::debounce::DebouncedRefresh;
use crate::error::{MessagingError, Result};
use crate::feed::{self, FeedHandler, Subscription};
use crate::identity::Identity;
use crate::models::{Conversation, ConversationRow, SessionStatus};
use crate::profile_cache::ProfileCache;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Default)]
struct ListState {
    status: SessionStatus,
    conversations: Vec<Conversation>,
    /// Ticket of the newest fetch that finished, successfully or not
    applied_ticket: u64,
}

struct ListInner {
    backend: Arc<dyn Backend>,
    identity: Arc<dyn Identity>,
    profiles: ProfileCache,
    scope_id: Option<String>,
    debounce: Duration,
    state: RwLock<ListState>,
    subscription: Mutex<Option<Subscription>>,
    refresher: Mutex<Option<DebouncedRefresh>>,
    tickets: AtomicU64,
    completed_fetches: AtomicU64,
}

/// Live inbox of the signed-in viewer. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConversationList {
    inner: Arc<ListInner>,
}

impl ConversationList {
    pub fn new(
        backend: Arc<dyn Backend>,
        identity: Arc<dyn Identity>,
        scope_id: Option<String>,
        debounce: Duration,
    ) -> Self {
        let profiles = ProfileCache::new(backend.clone());
        Self {
            inner: Arc::new(ListInner {
                backend,
                identity,
                profiles,
                scope_id,
                debounce,
                state: RwLock::new(ListState::default()),
                subscription: Mutex::new(None),
                refresher: Mutex::new(None),
                tickets: AtomicU64::new(0),
                completed_fetches: AtomicU64::new(0),
            }),
        }
    }

    pub fn profiles(&self) -> &ProfileCache {
        &self.inner.profiles
    }

    /// Load the inbox and start following summary changes
    pub async fn start(&self) -> Result<()> {
        let Some(viewer) = self.inner.identity.current_user_id() else {
            self.close().await;
            return Ok(());
        };

        {
            let mut slot = self.inner.refresher.lock().await;
            if slot.is_none() {
                let weak = Arc::downgrade(&self.inner);
                *slot = Some(DebouncedRefresh::spawn(self.inner.debounce, move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            if let Err(e) = inner.fetch_all().await {
                                warn!("Debounced inbox refresh failed: {}", e);
                            }
                        }
                    }
                }));
            }
        }

        {
            let mut slot = self.inner.subscription.lock().await;
            if let Some(old) = slot.take() {
                old.unsubscribe();
            }
            let handler = InboxFeed {
                inner: Arc::downgrade(&self.inner),
            };
            match feed::subscribe_conversations(
                self.inner.backend.as_ref(),
                viewer.clone(),
                handler,
            ) {
                Ok(sub) => *slot = Some(sub),
                Err(e) => warn!("Live inbox updates unavailable for {}: {}", viewer, e),
            }
        }

        info!("Inbox started for {}", viewer);
        self.fetch_all().await
    }

    /// Query all summaries for the viewer
    pub async fn fetch_all(&self) -> Result<()> {
        self.inner.fetch_all().await
    }

    /// Manual re-fetch, e.g. after marking messages read
    pub async fn refresh(&self) -> Result<()> {
        self.inner.fetch_all().await
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.inner.state.read().await.conversations.clone()
    }

    pub async fn status(&self) -> SessionStatus {
        self.inner.state.read().await.status.clone()
    }

    /// Sum of the viewer's unread counters
    pub async fn total_unread(&self) -> u32 {
        self.inner
            .state
            .read()
            .await
            .conversations
            .iter()
            .map(|c| c.unread_count)
            .sum()
    }

    pub async fn find_with(&self, other_user_id: &str, scope_id: Option<&str>) -> Option<Conversation> {
        self.inner
            .state
            .read()
            .await
            .conversations
            .iter()
            .find(|c| c.other_user_id == other_user_id && c.scope_id.as_deref() == scope_id)
            .cloned()
    }

    /// Completed fetches since creation
    pub fn fetch_count(&self) -> u64 {
        self.inner.completed_fetches.load(Ordering::SeqCst)
    }

    pub async fn is_subscribed(&self) -> bool {
        self.inner
            .subscription
            .lock()
            .await
            .as_ref()
            .map(Subscription::is_active)
            .unwrap_or(false)
    }

    /// Stop following changes and clear the list
    pub async fn close(&self) {
        if let Some(sub) = self.inner.subscription.lock().await.take() {
            sub.unsubscribe();
        }
        if let Some(refresher) = self.inner.refresher.lock().await.take() {
            refresher.shutdown();
        }
        let mut state = self.inner.state.write().await;
        state.conversations.clear();
        state.status = SessionStatus::Idle;
    }
}

impl ListInner {
    async fn fetch_all(&self) -> Result<()> {
        let ticket = self.tickets.fetch_add(1, Ordering::SeqCst) + 1;

        let Some(viewer) = self.identity.current_user_id() else {
            let mut state = self.state.write().await;
            state.conversations.clear();
            state.status = SessionStatus::Idle;
            return Ok(());
        };

        self.state.write().await.status = SessionStatus::Loading;

        let loaded = self.load(&viewer).await;
        let mut state = self.state.write().await;
        if ticket < state.applied_ticket {
            debug!("Dropping stale inbox fetch #{}", ticket);
            return loaded.map(|_| ());
        }
        match loaded {
            Ok(conversations) => {
                debug!("Inbox for {}: {} conversations", viewer, conversations.len());
                state.conversations = conversations;
                state.status = SessionStatus::Ready;
                state.applied_ticket = ticket;
                self.completed_fetches.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                // A failed fetch still supersedes every older one
                state.status = SessionStatus::Error(e.to_string());
                state.applied_ticket = ticket;
                Err(e)
            }
        }
    }

    async fn load(&self, viewer: &str) -> Result<Vec<Conversation>> {
        let rows = self
            .backend
            .fetch_conversations(&ConversationQuery {
                viewer_id: viewer.to_string(),
                scope_id: self.scope_id.clone(),
            })
            .await
            .map_err(MessagingError::backend)?;

        let mut conversations: Vec<Conversation> = rows
            .into_iter()
            .filter_map(|row| Conversation::from_row(row, viewer))
            .collect();

        self.profiles
            .ensure_many(conversations.iter().map(|c| c.other_user_id.as_str()))
            .await?;
        for c in &mut conversations {
            c.other_profile = self.profiles.get(&c.other_user_id);
        }

        // Newest activity first; rows without a message yet go last
        conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(conversations)
    }

    async fn schedule_refresh(&self) {
        if let Some(refresher) = self.refresher.lock().await.as_ref() {
            refresher.signal();
        }
    }
}

struct InboxFeed {
    inner: Weak<ListInner>,
}

#[async_trait]
impl FeedHandler<ConversationRow> for InboxFeed {
    async fn on_insert(&self, _record: ConversationRow) {
        if let Some(inner) = self.inner.upgrade() {
            inner.schedule_refresh().await;
        }
    }

    async fn on_update(&self, _record: ConversationRow) {
        if let Some(inner) = self.inner.upgrade() {
            inner.schedule_refresh().await;
        }
    }

    async fn on_delete(&self, _old_record: ConversationRow) {
        if let Some(inner) = self.inner.upgrade() {
            inner.schedule_refresh().await;
        }
    }

    async fn on_lagged(&self, _missed: u64) {
        if let Some(inner) = self.inner.upgrade() {
            inner.schedule_refresh().await;
        }
    }
}
