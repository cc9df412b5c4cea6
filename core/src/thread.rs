//! One direct-message thread as seen by the signed-in viewer.
//!
//! The session owns the visible message list for (viewer, counterpart, scope):
//! history fetch, optimistic send, reconciliation of temporary entries against
//! confirmed rows, read marking, and live updates from the change feed.
//!
//! Optimistic entries carry a `temp-` id until the backend confirms them. A
//! confirmed row is matched back to its entry by temp id, or by sender + body
//! when the feed delivered it first. Two identical bodies in flight at once
//! could be matched to the wrong entry. `send` therefore deliberately departs
//! from plain append-and-match: a second identical body is refused with
//! `MessagingError::Send` while the first is still pending, instead of being
//! shown as a second optimistic entry.

use crate::backend::Backend;
use crate::conversations::ConversationList;
use crate::error::{MessagingError, Result};
use crate::feed::{self, message_in_thread, FeedHandler, Subscription};
use crate::identity::Identity;
use crate::models::{
    ChangeEvent, Message, NewMessage, SessionStatus, ThreadKey, ThreadMessage, TEMP_ID_PREFIX,
};
use crate::profile_cache::ProfileCache;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Default)]
struct ThreadState {
    key: Option<ThreadKey>,
    /// Bumped on every open/close; events tagged with an older value are dropped
    generation: u64,
    status: SessionStatus,
    messages: Vec<ThreadMessage>,
}

struct ThreadInner {
    backend: Arc<dyn Backend>,
    identity: Arc<dyn Identity>,
    profiles: ProfileCache,
    state: RwLock<ThreadState>,
    subscription: Mutex<Option<Subscription>>,
    inbox: Mutex<Option<ConversationList>>,
}

/// Live view of one thread
#[derive(Clone)]
pub struct ThreadSession {
    inner: Arc<ThreadInner>,
}

impl ThreadSession {
    pub fn new(backend: Arc<dyn Backend>, identity: Arc<dyn Identity>) -> Self {
        let profiles = ProfileCache::new(backend.clone());
        Self {
            inner: Arc::new(ThreadInner {
                backend,
                identity,
                profiles,
                state: RwLock::new(ThreadState::default()),
                subscription: Mutex::new(None),
                inbox: Mutex::new(None),
            }),
        }
    }

    /// Refresh `inbox` after every successful read marking
    pub async fn attach_inbox(&self, inbox: ConversationList) {
        *self.inner.inbox.lock().await = Some(inbox);
    }

    pub fn profiles(&self) -> &ProfileCache {
        &self.inner.profiles
    }

    /// Point the session at `counterpart` (optionally scoped): drop the previous
    /// subscription, subscribe for the new pair, load its history.
    pub async fn open(&self, counterpart: &str, scope: Option<&str>) -> Result<()> {
        let Some(viewer) = self.inner.identity.current_user_id() else {
            self.close().await;
            return Err(MessagingError::Authentication);
        };
        let key = ThreadKey::new(viewer, counterpart, scope.map(str::to_string));

        let generation = {
            let mut state = self.inner.state.write().await;
            state.generation += 1;
            state.key = Some(key.clone());
            state.messages.clear();
            state.status = SessionStatus::Idle;
            state.generation
        };

        {
            let mut slot = self.inner.subscription.lock().await;
            if let Some(old) = slot.take() {
                old.unsubscribe();
            }
            // Subscribe before fetching so rows written during the fetch are not missed
            let handler = ThreadFeed {
                inner: Arc::downgrade(&self.inner),
                generation,
            };
            match feed::subscribe_messages(self.inner.backend.as_ref(), key.clone(), handler) {
                Ok(sub) => *slot = Some(sub),
                Err(e) => warn!("Live updates unavailable for {} <-> {}: {}", key.viewer_id, key.counterpart_id, e),
            }
        }

        info!("Opened thread {} <-> {}", key.viewer_id, key.counterpart_id);
        self.fetch_history().await
    }

    /// Load the full history of the open thread
    pub async fn fetch_history(&self) -> Result<()> {
        let Some(viewer) = self.inner.identity.current_user_id() else {
            let mut state = self.inner.state.write().await;
            state.messages.clear();
            state.status = SessionStatus::Idle;
            return Err(MessagingError::Authentication);
        };

        let (key, generation) = {
            let mut state = self.inner.state.write().await;
            let Some(key) = state.key.clone() else {
                return Ok(());
            };
            if key.viewer_id != viewer {
                state.messages.clear();
                state.status = SessionStatus::Idle;
                return Err(MessagingError::Authentication);
            }
            state.status = SessionStatus::Loading;
            (key, state.generation)
        };

        let fetched = match self.load(&key).await {
            Ok(entries) => entries,
            Err(e) => {
                let mut state = self.inner.state.write().await;
                if state.generation == generation {
                    state.status = SessionStatus::Error(e.to_string());
                }
                return Err(e);
            }
        };

        let mut state = self.inner.state.write().await;
        if state.generation != generation {
            debug!("Discarding history for superseded thread {}", key.counterpart_id);
            return Ok(());
        }
        let previous = std::mem::take(&mut state.messages);
        state.messages = merge_history(fetched, previous);
        state.status = SessionStatus::Ready;
        debug!(
            "Thread {} <-> {} ready with {} messages",
            key.viewer_id,
            key.counterpart_id,
            state.messages.len()
        );
        Ok(())
    }

    async fn load(&self, key: &ThreadKey) -> Result<Vec<ThreadMessage>> {
        let messages = self
            .inner
            .backend
            .fetch_thread(key)
            .await
            .map_err(MessagingError::backend)?;

        let participants: HashSet<&str> = messages
            .iter()
            .flat_map(|m| [m.sender_id.as_str(), m.recipient_id.as_str()])
            .collect();
        self.inner.profiles.ensure_many(participants).await?;

        Ok(messages
            .into_iter()
            .map(|m| self.inner.enrich(m))
            .collect())
    }

    /// Send `body` to `counterpart`. The message shows up in the list immediately
    /// and is swapped for the confirmed row once the backend accepts it.
    ///
    /// Deliberate deviation: while an optimistic entry with the same sender,
    /// recipient and body is pending, the call fails with `MessagingError::Send`
    /// and nothing is appended. The caller may retry once the first send settles.
    pub async fn send(&self, body: &str, counterpart: &str, scope: Option<&str>) -> Result<Message> {
        let viewer = self
            .inner
            .identity
            .current_user_id()
            .ok_or(MessagingError::Authentication)?;
        if body.trim().is_empty() {
            return Err(MessagingError::Send("message body is empty".to_string()));
        }
        if counterpart.is_empty() || counterpart == viewer {
            return Err(MessagingError::Send(
                "recipient must be another user".to_string(),
            ));
        }

        let now = Utc::now();
        let temp_id = format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4());
        let optimistic = Message {
            id: temp_id.clone(),
            sender_id: viewer.clone(),
            recipient_id: counterpart.to_string(),
            scope_id: scope.map(str::to_string),
            body: body.to_string(),
            created_at: now,
            updated_at: now,
            read_at: None,
        };

        {
            let mut state = self.inner.state.write().await;
            let shown = state
                .key
                .as_ref()
                .map(|k| message_in_thread(k, &optimistic))
                .unwrap_or(false);
            if shown {
                let pending_twin = state.messages.iter().any(|e| {
                    e.is_optimistic()
                        && e.message.sender_id == optimistic.sender_id
                        && e.message.recipient_id == optimistic.recipient_id
                        && e.message.body == optimistic.body
                });
                if pending_twin {
                    return Err(MessagingError::Send(
                        "an identical message is still being sent".to_string(),
                    ));
                }
                let entry = self.inner.enrich(optimistic.clone());
                state.messages.push(entry);
            }
        }

        let result = self
            .inner
            .backend
            .insert_message(NewMessage {
                sender_id: viewer,
                recipient_id: optimistic.recipient_id.clone(),
                body: optimistic.body.clone(),
                scope_id: optimistic.scope_id.clone(),
            })
            .await;

        match result {
            Ok(confirmed) => {
                let entry = self.inner.enrich(confirmed.clone());
                let mut state = self.inner.state.write().await;
                let admits = state
                    .key
                    .as_ref()
                    .map(|k| message_in_thread(k, &confirmed))
                    .unwrap_or(false);
                confirm_send(&mut state.messages, &temp_id, entry, admits);
                info!("Message {} confirmed (was {})", confirmed.id, temp_id);
                Ok(confirmed)
            }
            Err(e) => {
                let mut state = self.inner.state.write().await;
                state.messages.retain(|m| m.id() != temp_id);
                warn!("Send to {} failed, rolled back {}: {}", counterpart, temp_id, e);
                Err(MessagingError::Send(e.to_string()))
            }
        }
    }

    pub async fn mark_read(&self, message_id: &str) -> Result<()> {
        self.mark_read_batch(&[message_id.to_string()]).await
    }

    /// Mark the given messages read with a single backend update. Only confirmed,
    /// unread messages of this thread addressed to the viewer are sent.
    pub async fn mark_read_batch(&self, message_ids: &[String]) -> Result<()> {
        let Some(viewer) = self.inner.identity.current_user_id() else {
            return Ok(());
        };

        let mut targets: Vec<String> = Vec::new();
        {
            let state = self.inner.state.read().await;
            for id in message_ids {
                if targets.contains(id) {
                    continue;
                }
                let eligible = state.messages.iter().any(|e| {
                    e.id() == id.as_str()
                        && !e.is_optimistic()
                        && e.message.recipient_id == viewer
                        && e.message.is_unread()
                });
                if eligible {
                    targets.push(id.clone());
                }
            }
        }
        if targets.is_empty() {
            return Ok(());
        }

        let updated = self
            .inner
            .backend
            .mark_read(&targets, &viewer, Utc::now())
            .await
            .map_err(MessagingError::backend)?;
        debug!("Marked {} messages read", updated.len());

        {
            let mut state = self.inner.state.write().await;
            for record in updated {
                apply_update(&mut state.messages, record);
            }
        }

        let inbox = self.inner.inbox.lock().await.clone();
        if let Some(inbox) = inbox {
            if let Err(e) = inbox.refresh().await {
                warn!("Inbox refresh after read marking failed: {}", e);
            }
        }
        Ok(())
    }

    /// Mark every unread message addressed to the viewer as read
    pub async fn mark_thread_read(&self) -> Result<()> {
        let Some(viewer) = self.inner.identity.current_user_id() else {
            return Ok(());
        };
        let ids: Vec<String> = {
            let state = self.inner.state.read().await;
            state
                .messages
                .iter()
                .filter(|e| {
                    !e.is_optimistic() && e.message.recipient_id == viewer && e.message.is_unread()
                })
                .map(|e| e.id().to_string())
                .collect()
        };
        self.mark_read_batch(&ids).await
    }

    /// Apply a change event as if it came from the feed
    pub async fn apply_event(&self, event: ChangeEvent<Message>) {
        let generation = self.inner.state.read().await.generation;
        self.inner.apply_event(generation, event).await;
    }

    pub async fn messages(&self) -> Vec<ThreadMessage> {
        self.inner.state.read().await.messages.clone()
    }

    pub async fn status(&self) -> SessionStatus {
        self.inner.state.read().await.status.clone()
    }

    pub async fn key(&self) -> Option<ThreadKey> {
        self.inner.state.read().await.key.clone()
    }

    /// Unread messages addressed to the viewer
    pub async fn unread_count(&self) -> usize {
        let state = self.inner.state.read().await;
        let Some(key) = &state.key else {
            return 0;
        };
        state
            .messages
            .iter()
            .filter(|e| e.message.recipient_id == key.viewer_id && e.message.is_unread())
            .count()
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

    /// Tear down: stop live updates and forget the open thread
    pub async fn close(&self) {
        if let Some(sub) = self.inner.subscription.lock().await.take() {
            sub.unsubscribe();
        }
        let mut state = self.inner.state.write().await;
        state.generation += 1;
        state.key = None;
        state.messages.clear();
        state.status = SessionStatus::Idle;
    }
}

impl ThreadInner {
    /// Attach whatever profiles are already cached
    fn enrich(&self, message: Message) -> ThreadMessage {
        let sender = self.profiles.get(&message.sender_id);
        let recipient = self.profiles.get(&message.recipient_id);
        ThreadMessage {
            message,
            sender,
            recipient,
        }
    }

    async fn apply_event(&self, generation: u64, event: ChangeEvent<Message>) {
        {
            let state = self.state.read().await;
            let admitted = state.generation == generation
                && state
                    .key
                    .as_ref()
                    .map(|k| message_in_thread(k, event.row()))
                    .unwrap_or(false);
            if !admitted {
                return;
            }
        }

        match event {
            ChangeEvent::Insert { record } => {
                // Enrichment never blocks delivery: failures become placeholders
                let sender = self.profiles.profile_or_placeholder(&record.sender_id).await;
                let recipient = self.profiles.profile_or_placeholder(&record.recipient_id).await;
                let entry = ThreadMessage {
                    message: record,
                    sender: Some(sender),
                    recipient: Some(recipient),
                };
                let mut state = self.state.write().await;
                if state.generation == generation {
                    merge_incoming(&mut state.messages, entry);
                }
            }
            ChangeEvent::Update { record } => {
                let mut state = self.state.write().await;
                if state.generation == generation {
                    apply_update(&mut state.messages, record);
                }
            }
            ChangeEvent::Delete { old_record } => {
                let mut state = self.state.write().await;
                if state.generation == generation {
                    state.messages.retain(|m| m.id() != old_record.id);
                }
            }
        }
    }
}

struct ThreadFeed {
    inner: Weak<ThreadInner>,
    generation: u64,
}

#[async_trait]
impl FeedHandler<Message> for ThreadFeed {
    async fn on_insert(&self, record: Message) {
        if let Some(inner) = self.inner.upgrade() {
            inner.apply_event(self.generation, ChangeEvent::Insert { record }).await;
        }
    }

    async fn on_update(&self, record: Message) {
        if let Some(inner) = self.inner.upgrade() {
            inner.apply_event(self.generation, ChangeEvent::Update { record }).await;
        }
    }

    async fn on_delete(&self, old_record: Message) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .apply_event(self.generation, ChangeEvent::Delete { old_record })
                .await;
        }
    }

    async fn on_lagged(&self, missed: u64) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if inner.state.read().await.generation != self.generation {
            return;
        }
        debug!("Thread feed missed {} events, reloading history", missed);
        let session = ThreadSession { inner };
        if let Err(e) = session.fetch_history().await {
            warn!("History reload after feed lag failed: {}", e);
        }
    }
}

fn sort_thread(list: &mut [ThreadMessage]) {
    list.sort_by(|a, b| a.message.created_at.cmp(&b.message.created_at));
}

/// Keep cached profiles when the replacement carries none
fn replace_entry(slot: &mut ThreadMessage, mut entry: ThreadMessage) {
    if entry.sender.is_none() {
        entry.sender = slot.sender.take();
    }
    if entry.recipient.is_none() {
        entry.recipient = slot.recipient.take();
    }
    *slot = entry;
}

/// Fold a feed-delivered row into the list.
///
/// Known id: refresh in place. Pending optimistic twin (same sender, recipient
/// and body): take its place. Otherwise append in creation order.
fn merge_incoming(list: &mut Vec<ThreadMessage>, entry: ThreadMessage) {
    if let Some(slot) = list.iter_mut().find(|m| m.id() == entry.id()) {
        replace_entry(slot, entry);
        return;
    }
    let twin = list.iter_mut().find(|m| {
        m.is_optimistic()
            && m.message.sender_id == entry.message.sender_id
            && m.message.recipient_id == entry.message.recipient_id
            && m.message.body == entry.message.body
    });
    match twin {
        Some(slot) => replace_entry(slot, entry),
        None => list.push(entry),
    }
    sort_thread(list);
}

/// Swap the optimistic entry `temp_id` for its confirmed row.
///
/// If the feed got there first the temp entry is already gone (or the confirmed
/// id is already listed); either way exactly one entry remains.
fn confirm_send(list: &mut Vec<ThreadMessage>, temp_id: &str, confirmed: ThreadMessage, admits: bool) {
    let already_listed = list.iter().any(|m| m.id() == confirmed.id());
    match list.iter().position(|m| m.id() == temp_id) {
        Some(pos) if already_listed => {
            list.remove(pos);
        }
        Some(pos) => replace_entry(&mut list[pos], confirmed),
        None if !already_listed && admits => list.push(confirmed),
        None => return,
    }
    sort_thread(list);
}

fn apply_update(list: &mut [ThreadMessage], record: Message) {
    if let Some(slot) = list.iter_mut().find(|m| m.id() == record.id) {
        slot.message = record;
    }
}

/// Fetched history wins; pending optimistic entries and rows the feed delivered
/// after the query ran are carried over.
fn merge_history(fetched: Vec<ThreadMessage>, previous: Vec<ThreadMessage>) -> Vec<ThreadMessage> {
    let mut list = fetched;
    for entry in previous {
        if list.iter().any(|m| m.id() == entry.id()) {
            continue;
        }
        if entry.is_optimistic() {
            let confirmed = list.iter().any(|m| {
                !m.is_optimistic()
                    && m.message.sender_id == entry.message.sender_id
                    && m.message.recipient_id == entry.message.recipient_id
                    && m.message.body == entry.message.body
                    && m.message.created_at >= entry.message.created_at
            });
            if confirmed {
                continue;
            }
        }
        list.push(entry);
    }
    sort_thread(&mut list);
    list
}
