//! Change-feed subscriptions.
//!
//! The backend feed carries every row change of a table. A subscription opens
//! one receiver, runs one pump task, and drops every event its scope does not
//! admit before dispatching to the handler.

use crate::backend::Backend;
use crate::error::Result;
use crate::models::{ChangeEvent, ConversationRow, Message, ThreadKey};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a subscription listens for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedScope {
    /// Messages of one thread
    Thread(ThreadKey),
    /// Conversation summaries the viewer participates in
    Viewer(String),
}

impl fmt::Display for FeedScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedScope::Thread(key) => write!(
                f,
                "thread {}<->{}{}",
                key.viewer_id,
                key.counterpart_id,
                key.scope_id
                    .as_deref()
                    .map(|s| format!(" [{}]", s))
                    .unwrap_or_default()
            ),
            FeedScope::Viewer(viewer) => write!(f, "conversations of {}", viewer),
        }
    }
}

/// True if `message` belongs to the thread described by `key`.
///
/// The pair must match in either direction. A scoped key also requires the
/// same scope; an unscoped key admits every scope.
pub fn message_in_thread(key: &ThreadKey, message: &Message) -> bool {
    if !message.is_between(&key.viewer_id, &key.counterpart_id) {
        return false;
    }
    match &key.scope_id {
        Some(scope) => message.scope_id.as_deref() == Some(scope.as_str()),
        None => true,
    }
}

/// True if `viewer` is one of the row's participants
pub fn conversation_touches(viewer: &str, row: &ConversationRow) -> bool {
    row.involves(viewer)
}

/// Typed callbacks for one subscription
#[async_trait]
pub trait FeedHandler<T>: Send + Sync {
    async fn on_insert(&self, record: T);
    async fn on_update(&self, record: T);
    async fn on_delete(&self, old_record: T);

    /// The receiver fell behind and `missed` events were dropped. Handlers that
    /// mirror state should resynchronise from the backend.
    async fn on_lagged(&self, _missed: u64) {}
}

/// Handle to a running subscription. Tears down on `unsubscribe` or drop.
pub struct Subscription {
    scope: FeedScope,
    active: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    /// Stop receiving events. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.task.abort();
            info!("Unsubscribed from {}", self.scope);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Subscribe to the messages of one thread
pub fn subscribe_messages<H>(backend: &dyn Backend, key: ThreadKey, handler: H) -> Result<Subscription>
where
    H: FeedHandler<Message> + 'static,
{
    let rx = backend.subscribe_messages()?;
    let filter = key.clone();
    Ok(spawn_pump(FeedScope::Thread(key), rx, handler, move |m: &Message| {
        message_in_thread(&filter, m)
    }))
}

/// Subscribe to conversation-summary rows `viewer` participates in
pub fn subscribe_conversations<H>(
    backend: &dyn Backend,
    viewer: String,
    handler: H,
) -> Result<Subscription>
where
    H: FeedHandler<ConversationRow> + 'static,
{
    let rx = backend.subscribe_conversations()?;
    let filter = viewer.clone();
    Ok(spawn_pump(FeedScope::Viewer(viewer), rx, handler, move |row: &ConversationRow| {
        conversation_touches(&filter, row)
    }))
}

fn spawn_pump<T, H, F>(
    scope: FeedScope,
    mut rx: broadcast::Receiver<ChangeEvent<T>>,
    handler: H,
    admits: F,
) -> Subscription
where
    T: Clone + Send + 'static,
    H: FeedHandler<T> + 'static,
    F: Fn(&T) -> bool + Send + 'static,
{
    let active = Arc::new(AtomicBool::new(true));
    let flag = active.clone();
    let label = scope.to_string();
    info!("Subscribed to {}", label);

    let task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    warn!("Feed for {} lagged {} events, resyncing", label, n);
                    if flag.load(Ordering::SeqCst) {
                        handler.on_lagged(n).await;
                    }
                    continue;
                }
                Err(RecvError::Closed) => {
                    warn!("Feed for {} closed; live updates stopped", label);
                    break;
                }
            };

            if !flag.load(Ordering::SeqCst) {
                break;
            }
            if !admits(event.row()) {
                continue;
            }

            debug!("Feed {} event for {}", event.kind(), label);
            match event {
                ChangeEvent::Insert { record } => handler.on_insert(record).await,
                ChangeEvent::Update { record } => handler.on_update(record).await,
                ChangeEvent::Delete { old_record } => handler.on_delete(old_record).await,
            }
        }
        flag.store(false, Ordering::SeqCst);
    });

    Subscription { scope, active, task }
}
