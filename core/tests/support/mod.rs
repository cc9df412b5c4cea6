//! Shared fixtures for the messaging integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use messaging_core::backend::ConversationQuery;
use messaging_core::models::{
    ChangeEvent, Conversation, ConversationRow, Message, NewMessage, Profile, ThreadKey, ThreadMessage,
};
use messaging_core::{
    Backend, ConversationList, MessagingError, Result, SessionIdentity, SledBackend, ThreadSession,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Sled-backed store with call recording and fault injection
pub struct TestBackend {
    pub store: SledBackend,
    pub mark_read_calls: Mutex<Vec<Vec<String>>>,
    pub thread_fetches: AtomicU64,
    pub conversation_fetches: AtomicU64,
    pub fail_inserts: AtomicBool,
    pub fail_thread_fetch: AtomicBool,
    pub fail_conversation_fetch: AtomicBool,
    /// Held before a thread query reads the store
    pub fetch_delay_ms: AtomicU64,
    /// Held before a conversation query reads the store
    pub conversation_delay_ms: AtomicU64,
    /// Held after the row is stored (and the feed notified) but before returning,
    /// so the feed wins the race against the send confirmation
    pub insert_delay_ms: AtomicU64,
}

impl TestBackend {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(256)
    }

    /// Store whose change feeds buffer only `capacity` events per receiver
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            store: SledBackend::temporary(capacity).unwrap(),
            mark_read_calls: Mutex::new(Vec::new()),
            thread_fetches: AtomicU64::new(0),
            conversation_fetches: AtomicU64::new(0),
            fail_inserts: AtomicBool::new(false),
            fail_thread_fetch: AtomicBool::new(false),
            fail_conversation_fetch: AtomicBool::new(false),
            fetch_delay_ms: AtomicU64::new(0),
            conversation_delay_ms: AtomicU64::new(0),
            insert_delay_ms: AtomicU64::new(0),
        })
    }

    pub fn with_profiles(ids: &[&str]) -> Arc<Self> {
        Self::new().add_profiles(ids)
    }

    pub fn add_profiles(self: Arc<Self>, ids: &[&str]) -> Arc<Self> {
        let backend = self;
        for id in ids {
            backend
                .store
                .put_profile(&Profile {
                    first_name: Some(id.to_uppercase()),
                    username: Some(id.to_string()),
                    ..Profile::unknown(id)
                })
                .unwrap();
        }
        backend
    }

    pub fn mark_read_calls(&self) -> Vec<Vec<String>> {
        self.mark_read_calls.lock().unwrap().clone()
    }

    /// Write a message straight into the store, as another client would
    pub async fn deliver(&self, from: &str, to: &str, body: &str, scope: Option<&str>) -> Message {
        self.store
            .insert_message(NewMessage {
                sender_id: from.to_string(),
                recipient_id: to.to_string(),
                body: body.to_string(),
                scope_id: scope.map(str::to_string),
            })
            .await
            .unwrap()
    }
}

#[async_trait]
impl Backend for TestBackend {
    async fn fetch_thread(&self, key: &ThreadKey) -> Result<Vec<Message>> {
        self.thread_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = self.fetch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_thread_fetch.load(Ordering::SeqCst) {
            return Err(MessagingError::Storage("thread query failed".to_string()));
        }
        self.store.fetch_thread(key).await
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message> {
        let delay = Duration::from_millis(self.insert_delay_ms.load(Ordering::SeqCst));
        if self.fail_inserts.load(Ordering::SeqCst) {
            tokio::time::sleep(delay).await;
            return Err(MessagingError::Storage("insert rejected".to_string()));
        }
        let stored = self.store.insert_message(message).await?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(stored)
    }

    async fn mark_read(&self, ids: &[String], reader_id: &str, read_at: DateTime<Utc>) -> Result<Vec<Message>> {
        self.mark_read_calls.lock().unwrap().push(ids.to_vec());
        self.store.mark_read(ids, reader_id, read_at).await
    }

    async fn fetch_profiles(&self, ids: &[String]) -> Result<Vec<Profile>> {
        self.store.fetch_profiles(ids).await
    }

    async fn fetch_conversations(&self, query: &ConversationQuery) -> Result<Vec<ConversationRow>> {
        self.conversation_fetches.fetch_add(1, Ordering::SeqCst);
        // Outcome is decided when the call starts, so a slow call and a later
        // failing one can overlap
        let fail = self.fail_conversation_fetch.load(Ordering::SeqCst);
        let delay = self.conversation_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if fail {
            return Err(MessagingError::Storage("conversation query failed".to_string()));
        }
        self.store.fetch_conversations(query).await
    }

    fn subscribe_messages(&self) -> Result<broadcast::Receiver<ChangeEvent<Message>>> {
        self.store.subscribe_messages()
    }

    fn subscribe_conversations(&self) -> Result<broadcast::Receiver<ChangeEvent<ConversationRow>>> {
        self.store.subscribe_conversations()
    }
}

pub fn signed_in(user: &str) -> Arc<SessionIdentity> {
    Arc::new(SessionIdentity::signed_in(user))
}

/// Poll the thread until `check` holds or two seconds pass
pub async fn wait_for_thread<F>(thread: &ThreadSession, check: F) -> bool
where
    F: Fn(&[ThreadMessage]) -> bool,
{
    for _ in 0..200 {
        if check(&thread.messages().await) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll the inbox until `check` holds or two seconds pass
pub async fn wait_for_inbox<F>(inbox: &ConversationList, check: F) -> bool
where
    F: Fn(&[Conversation]) -> bool,
{
    for _ in 0..200 {
        if check(&inbox.conversations().await) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
