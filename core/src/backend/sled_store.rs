/// Local backend persisted in sled, with an in-process change feed.
///
/// Maintains conversation summaries itself: an insert bumps the summary's last
/// message and the recipient's unread counter, read-marking and deletion
/// recompute the summary from the stored messages. Message rows and the
/// summary rows they affect are committed in one sled transaction.
use super::{Backend, ConversationQuery};
use crate::error::{MessagingError, Result};
use crate::feed::message_in_thread;
use crate::models::{ChangeEvent, ConversationRow, Message, NewMessage, Profile, ThreadKey};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::Transactional;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct SledBackend {
    db: sled::Db,
    messages: sled::Tree,
    profiles: sled::Tree,
    conversations: sled::Tree,
    message_feed: broadcast::Sender<ChangeEvent<Message>>,
    conversation_feed: broadcast::Sender<ChangeEvent<ConversationRow>>,
    /// Serializes writers; also guards the monotonic clock
    write_lock: Mutex<Option<DateTime<Utc>>>,
}

/// Canonical (user1, user2, scope) triple of a conversation summary
struct SummaryKey {
    user1_id: String,
    user2_id: String,
    scope_id: Option<String>,
}

impl SummaryKey {
    fn new(a: &str, b: &str, scope_id: Option<&str>) -> Self {
        let (user1_id, user2_id) = if a <= b { (a, b) } else { (b, a) };
        Self {
            user1_id: user1_id.to_string(),
            user2_id: user2_id.to_string(),
            scope_id: scope_id.map(str::to_string),
        }
    }

    fn for_message(m: &Message) -> Self {
        Self::new(&m.sender_id, &m.recipient_id, m.scope_id.as_deref())
    }

    /// JSON-encoded triple: distinct triples never share a key, whatever
    /// characters the ids contain, and `None` stays apart from `Some("")`
    fn storage_key(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&(&self.user1_id, &self.user2_id, &self.scope_id))
            .map_err(MessagingError::Serialization)
    }

    fn matches(&self, m: &Message) -> bool {
        m.is_between(&self.user1_id, &self.user2_id) && m.scope_id == self.scope_id
    }
}

/// Writes applied atomically by `SledBackend::commit`
#[derive(Default)]
struct Batch {
    put: Vec<Message>,
    remove: Vec<String>,
    summaries: Vec<(Vec<u8>, ConversationRow)>,
}

impl SledBackend {
    /// Open (or create) the store under `data_dir`
    pub fn new(data_dir: &Path, feed_capacity: usize) -> Result<Self> {
        let db_path = data_dir.join("messaging.db");
        debug!("Opening messaging store at {:?}", db_path);
        let db = sled::open(&db_path)
            .map_err(|e| MessagingError::Storage(format!("Failed to open messaging DB: {}", e)))?;
        info!("Messaging store initialized at {:?}", db_path);
        Self::from_db(db, feed_capacity)
    }

    /// Throwaway store, removed when dropped
    pub fn temporary(feed_capacity: usize) -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| MessagingError::Storage(format!("Failed to open temporary DB: {}", e)))?;
        Self::from_db(db, feed_capacity)
    }

    fn from_db(db: sled::Db, feed_capacity: usize) -> Result<Self> {
        let open_tree = |name: &str| {
            db.open_tree(name)
                .map_err(|e| MessagingError::Storage(format!("Failed to open tree {}: {}", name, e)))
        };
        let messages = open_tree("messages")?;
        let profiles = open_tree("profiles")?;
        let conversations = open_tree("conversations")?;
        let capacity = feed_capacity.max(1);
        let (message_feed, _) = broadcast::channel(capacity);
        let (conversation_feed, _) = broadcast::channel(capacity);

        Ok(Self {
            db,
            messages,
            profiles,
            conversations,
            message_feed,
            conversation_feed,
            write_lock: Mutex::new(None),
        })
    }

    /// Create or replace a profile
    pub fn put_profile(&self, profile: &Profile) -> Result<()> {
        let value = serde_json::to_vec(profile).map_err(MessagingError::Serialization)?;
        self.profiles
            .insert(profile.id.as_bytes(), value)
            .map_err(|e| MessagingError::Storage(format!("put_profile: {}", e)))?;
        Ok(())
    }

    /// Remove a message and re-derive its conversation summary.
    /// Returns whether anything was removed.
    pub async fn delete_message(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(old) = self.get_message(id)? else {
            return Ok(false);
        };

        let key = SummaryKey::for_message(&old);
        let remaining: Vec<Message> = self
            .all_messages()?
            .into_iter()
            .filter(|m| m.id != old.id)
            .collect();
        let mut batch = Batch {
            remove: vec![old.id.clone()],
            ..Batch::default()
        };
        if let Some(row) = self.get_summary(&key)? {
            batch
                .summaries
                .push((key.storage_key()?, recompute_row(row, &key, &remaining)));
        }
        self.commit(&batch)?;

        self.emit_message(ChangeEvent::Delete { old_record: old });
        for (_, row) in batch.summaries {
            self.emit_conversation(ChangeEvent::Update { record: row });
        }
        Ok(true)
    }

    /// Number of stored messages
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Apply every write of `batch` in one transaction over the message and
    /// summary trees, then flush. Either all rows land or none do.
    fn commit(&self, batch: &Batch) -> Result<()> {
        let mut puts = Vec::with_capacity(batch.put.len());
        for message in &batch.put {
            let value = serde_json::to_vec(message).map_err(MessagingError::Serialization)?;
            puts.push((message.id.as_bytes().to_vec(), value));
        }
        let mut summaries = Vec::with_capacity(batch.summaries.len());
        for (key, row) in &batch.summaries {
            let value = serde_json::to_vec(row).map_err(MessagingError::Serialization)?;
            summaries.push((key.clone(), value));
        }

        (&self.messages, &self.conversations)
            .transaction(|(messages, conversations)| -> ConflictableTransactionResult<()> {
                for (key, value) in &puts {
                    messages.insert(key.as_slice(), value.as_slice())?;
                }
                for id in &batch.remove {
                    messages.remove(id.as_bytes())?;
                }
                for (key, value) in &summaries {
                    conversations.insert(key.as_slice(), value.as_slice())?;
                }
                Ok(())
            })
            .map_err(|e| match e {
                TransactionError::Abort(()) => MessagingError::Storage("commit aborted".to_string()),
                TransactionError::Storage(e) => MessagingError::Storage(format!("commit: {}", e)),
            })?;

        // Committed rows are already visible; a failed flush only delays durability
        if let Err(e) = self.db.flush() {
            warn!("Failed to flush messaging DB: {}", e);
        }
        Ok(())
    }

    fn emit_message(&self, event: ChangeEvent<Message>) {
        // No receivers is fine: nobody is listening
        let _ = self.message_feed.send(event);
    }

    fn emit_conversation(&self, event: ChangeEvent<ConversationRow>) {
        let _ = self.conversation_feed.send(event);
    }

    fn all_messages(&self) -> Result<Vec<Message>> {
        let mut out = Vec::new();
        for entry in self.messages.iter() {
            let (_, value) =
                entry.map_err(|e| MessagingError::Storage(format!("scan messages: {}", e)))?;
            out.push(serde_json::from_slice::<Message>(&value).map_err(MessagingError::Serialization)?);
        }
        Ok(out)
    }

    fn get_message(&self, id: &str) -> Result<Option<Message>> {
        match self
            .messages
            .get(id.as_bytes())
            .map_err(|e| MessagingError::Storage(format!("get_message: {}", e)))?
        {
            Some(raw) => Ok(Some(
                serde_json::from_slice(&raw).map_err(MessagingError::Serialization)?,
            )),
            None => Ok(None),
        }
    }

    fn get_summary(&self, key: &SummaryKey) -> Result<Option<ConversationRow>> {
        match self
            .conversations
            .get(key.storage_key()?)
            .map_err(|e| MessagingError::Storage(format!("get_conversation: {}", e)))?
        {
            Some(raw) => Ok(Some(
                serde_json::from_slice(&raw).map_err(MessagingError::Serialization)?,
            )),
            None => Ok(None),
        }
    }
}

/// Fold a freshly inserted message into its summary row
fn bump_row(existing: Option<ConversationRow>, key: &SummaryKey, message: &Message) -> ChangeEvent<ConversationRow> {
    let is_new = existing.is_none();
    let mut row = existing.unwrap_or_else(|| ConversationRow {
        id: Uuid::new_v4().to_string(),
        user1_id: key.user1_id.clone(),
        user2_id: key.user2_id.clone(),
        scope_id: key.scope_id.clone(),
        last_message: None,
        last_message_at: None,
        last_sender_id: None,
        user1_unread_count: 0,
        user2_unread_count: 0,
        created_at: message.created_at,
        updated_at: message.created_at,
    });

    row.last_message = Some(message.body.clone());
    row.last_message_at = Some(message.created_at);
    row.last_sender_id = Some(message.sender_id.clone());
    if message.recipient_id == row.user1_id {
        row.user1_unread_count += 1;
    } else {
        row.user2_unread_count += 1;
    }
    row.updated_at = message.created_at;

    if is_new {
        ChangeEvent::Insert { record: row }
    } else {
        ChangeEvent::Update { record: row }
    }
}

/// Re-derive last message and unread counters from `messages`
fn recompute_row(mut row: ConversationRow, key: &SummaryKey, messages: &[Message]) -> ConversationRow {
    let mut thread: Vec<&Message> = messages.iter().filter(|m| key.matches(m)).collect();
    thread.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let unread = |user: &str| {
        thread
            .iter()
            .filter(|m| m.recipient_id == user && m.is_unread())
            .count() as u32
    };
    row.user1_unread_count = unread(&row.user1_id);
    row.user2_unread_count = unread(&row.user2_id);

    let last = thread.last();
    row.last_message = last.map(|m| m.body.clone());
    row.last_message_at = last.map(|m| m.created_at);
    row.last_sender_id = last.map(|m| m.sender_id.clone());
    row.updated_at = Utc::now();
    row
}

/// Strictly increasing timestamps so creation order is total even for
/// inserts within the same clock tick.
fn next_timestamp(last: &mut Option<DateTime<Utc>>) -> DateTime<Utc> {
    let mut now = Utc::now();
    if let Some(prev) = *last {
        if now <= prev {
            now = prev + ChronoDuration::microseconds(1);
        }
    }
    *last = Some(now);
    now
}

#[async_trait]
impl Backend for SledBackend {
    async fn fetch_thread(&self, key: &ThreadKey) -> Result<Vec<Message>> {
        let mut thread: Vec<Message> = self
            .all_messages()?
            .into_iter()
            .filter(|m| message_in_thread(key, m))
            .collect();
        thread.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        debug!(
            "fetch_thread {} <-> {}: {} messages",
            key.viewer_id,
            key.counterpart_id,
            thread.len()
        );
        Ok(thread)
    }

    async fn insert_message(&self, new: NewMessage) -> Result<Message> {
        if new.sender_id.is_empty() || new.recipient_id.is_empty() {
            return Err(MessagingError::Backend(
                "sender and recipient are required".to_string(),
            ));
        }
        if new.sender_id == new.recipient_id {
            return Err(MessagingError::Backend(
                "sender and recipient must differ".to_string(),
            ));
        }

        let mut clock = self.write_lock.lock().await;
        let now = next_timestamp(&mut clock);
        let message = Message {
            id: Uuid::new_v4().to_string(),
            sender_id: new.sender_id,
            recipient_id: new.recipient_id,
            scope_id: new.scope_id,
            body: new.body,
            created_at: now,
            updated_at: now,
            read_at: None,
        };
        let key = SummaryKey::for_message(&message);
        let summary_event = bump_row(self.get_summary(&key)?, &key, &message);
        self.commit(&Batch {
            put: vec![message.clone()],
            remove: Vec::new(),
            summaries: vec![(key.storage_key()?, summary_event.row().clone())],
        })?;
        drop(clock);

        debug!("Stored message {} from {}", message.id, message.sender_id);
        self.emit_message(ChangeEvent::Insert {
            record: message.clone(),
        });
        self.emit_conversation(summary_event);
        Ok(message)
    }

    async fn mark_read(
        &self,
        ids: &[String],
        reader_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let _guard = self.write_lock.lock().await;
        let mut seen = HashSet::new();
        let mut updated = Vec::new();
        let mut touched: HashMap<Vec<u8>, SummaryKey> = HashMap::new();

        for id in ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            let Some(mut message) = self.get_message(id)? else {
                continue;
            };
            if message.recipient_id != reader_id || message.read_at.is_some() {
                continue;
            }
            message.read_at = Some(read_at);
            message.updated_at = read_at;
            let key = SummaryKey::for_message(&message);
            touched.insert(key.storage_key()?, key);
            updated.push(message);
        }

        let mut batch = Batch::default();
        if !updated.is_empty() {
            // Summaries are derived from the messages as they will be after commit
            let mut current = self.all_messages()?;
            for stored in current.iter_mut() {
                if let Some(read) = updated.iter().find(|m| m.id == stored.id) {
                    *stored = read.clone();
                }
            }
            for (storage_key, key) in touched {
                if let Some(row) = self.get_summary(&key)? {
                    batch.summaries.push((storage_key, recompute_row(row, &key, &current)));
                }
            }
            batch.put = updated.clone();
            self.commit(&batch)?;
        }

        debug!("mark_read by {}: {} of {} ids updated", reader_id, updated.len(), ids.len());
        for message in &updated {
            self.emit_message(ChangeEvent::Update {
                record: message.clone(),
            });
        }
        for (_, row) in batch.summaries {
            self.emit_conversation(ChangeEvent::Update { record: row });
        }
        Ok(updated)
    }

    async fn fetch_profiles(&self, ids: &[String]) -> Result<Vec<Profile>> {
        let mut out = Vec::new();
        for id in ids {
            let found = self
                .profiles
                .get(id.as_bytes())
                .map_err(|e| MessagingError::Storage(format!("get_profile: {}", e)))?;
            if let Some(raw) = found {
                out.push(serde_json::from_slice::<Profile>(&raw).map_err(MessagingError::Serialization)?);
            }
        }
        Ok(out)
    }

    async fn fetch_conversations(&self, query: &ConversationQuery) -> Result<Vec<ConversationRow>> {
        let mut rows = Vec::new();
        for entry in self.conversations.iter() {
            let (_, value) =
                entry.map_err(|e| MessagingError::Storage(format!("scan conversations: {}", e)))?;
            let row: ConversationRow =
                serde_json::from_slice(&value).map_err(MessagingError::Serialization)?;
            if !row.involves(&query.viewer_id) {
                continue;
            }
            if query.scope_id.is_some() && row.scope_id != query.scope_id {
                continue;
            }
            rows.push(row);
        }
        rows.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(rows)
    }

    fn subscribe_messages(&self) -> Result<broadcast::Receiver<ChangeEvent<Message>>> {
        Ok(self.message_feed.subscribe())
    }

    fn subscribe_conversations(&self) -> Result<broadcast::Receiver<ChangeEvent<ConversationRow>>> {
        Ok(self.conversation_feed.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_message(from: &str, to: &str, body: &str, scope: Option<&str>) -> NewMessage {
        NewMessage {
            sender_id: from.to_string(),
            recipient_id: to.to_string(),
            body: body.to_string(),
            scope_id: scope.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_insert_maintains_summary() {
        let store = SledBackend::temporary(16).unwrap();
        store.insert_message(new_message("bob", "alice", "one", None)).await.unwrap();
        store.insert_message(new_message("bob", "alice", "two", None)).await.unwrap();

        let rows = store
            .fetch_conversations(&ConversationQuery {
                viewer_id: "alice".to_string(),
                scope_id: None,
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].unread_for("alice"), 2);
        assert_eq!(rows[0].unread_for("bob"), 0);
        assert_eq!(rows[0].last_message.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_mark_read_only_touches_reader_messages() {
        let store = SledBackend::temporary(16).unwrap();
        let to_alice = store.insert_message(new_message("bob", "alice", "hi", None)).await.unwrap();
        let to_bob = store.insert_message(new_message("alice", "bob", "yo", None)).await.unwrap();

        let updated = store
            .mark_read(&[to_alice.id.clone(), to_bob.id.clone()], "alice", Utc::now())
            .await
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].id, to_alice.id);

        let key = ThreadKey::new("alice", "bob", None);
        let thread = store.fetch_thread(&key).await.unwrap();
        assert!(thread.iter().find(|m| m.id == to_bob.id).unwrap().is_unread());
    }

    #[tokio::test]
    async fn test_scoped_summaries_are_separate() {
        let store = SledBackend::temporary(16).unwrap();
        store.insert_message(new_message("bob", "alice", "a", Some("c1"))).await.unwrap();
        store.insert_message(new_message("bob", "alice", "b", Some("c2"))).await.unwrap();

        let scoped = store
            .fetch_conversations(&ConversationQuery {
                viewer_id: "alice".to_string(),
                scope_id: Some("c1".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].last_message.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_self_message_rejected() {
        let store = SledBackend::temporary(16).unwrap();
        let result = store.insert_message(new_message("alice", "alice", "me", None)).await;
        assert!(result.is_err());
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = SledBackend::new(dir.path(), 16).unwrap();
            store
                .put_profile(&Profile {
                    username: Some("ada".to_string()),
                    ..Profile::unknown("alice")
                })
                .unwrap();
            store.insert_message(new_message("bob", "alice", "kept", None)).await.unwrap();
        }

        let store = SledBackend::new(dir.path(), 16).unwrap();
        assert_eq!(store.message_count(), 1);
        let profiles = store.fetch_profiles(&["alice".to_string()]).await.unwrap();
        assert_eq!(profiles[0].username.as_deref(), Some("ada"));
    }

    #[tokio::test]
    async fn test_delete_emits_event_and_recomputes_summary() {
        let store = SledBackend::temporary(16).unwrap();
        let mut feed = store.subscribe_messages().unwrap();
        let first = store.insert_message(new_message("bob", "alice", "first", None)).await.unwrap();
        let second = store.insert_message(new_message("bob", "alice", "second", None)).await.unwrap();

        assert!(store.delete_message(&second.id).await.unwrap());
        assert!(!store.delete_message(&second.id).await.unwrap());

        let mut kinds = Vec::new();
        while let Ok(event) = feed.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(kinds, vec!["insert", "insert", "delete"]);

        let rows = store
            .fetch_conversations(&ConversationQuery {
                viewer_id: "alice".to_string(),
                scope_id: None,
            })
            .await
            .unwrap();
        assert_eq!(rows[0].last_message.as_deref(), Some(first.body.as_str()));
        assert_eq!(rows[0].unread_for("alice"), 1);
    }

    fn viewer(id: &str) -> ConversationQuery {
        ConversationQuery {
            viewer_id: id.to_string(),
            scope_id: None,
        }
    }

    #[tokio::test]
    async fn test_ids_with_separators_get_their_own_summaries() {
        let store = SledBackend::temporary(16).unwrap();
        store.insert_message(new_message("c", "a|b", "one", None)).await.unwrap();
        store.insert_message(new_message("c", "a", "two", None)).await.unwrap();
        store.insert_message(new_message("b|c", "a", "three", None)).await.unwrap();

        let rows = store.fetch_conversations(&viewer("b|c")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].other_user("b|c"), Some("a"));
        assert_eq!(rows[0].last_message.as_deref(), Some("three"));

        let rows = store.fetch_conversations(&viewer("a")).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.unread_for("a") == 1));

        let rows = store.fetch_conversations(&viewer("a|b")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].last_message.as_deref(), Some("one"));
    }

    #[tokio::test]
    async fn test_empty_scope_is_not_the_unscoped_thread() {
        let store = SledBackend::temporary(16).unwrap();
        store.insert_message(new_message("c", "v", "plain", None)).await.unwrap();
        store.insert_message(new_message("c", "v", "empty", Some(""))).await.unwrap();

        let rows = store.fetch_conversations(&viewer("v")).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.unread_for("v") == 1));
    }

    #[tokio::test]
    async fn test_failed_summary_update_stores_no_message() {
        let store = SledBackend::temporary(16).unwrap();
        let key = SummaryKey::new("alice", "bob", None).storage_key().unwrap();
        store.conversations.insert(key.clone(), b"not json".to_vec()).unwrap();

        let result = store.insert_message(new_message("bob", "alice", "hi", None)).await;
        assert!(result.is_err());
        assert_eq!(store.message_count(), 0);

        store.conversations.remove(key).unwrap();
        store.insert_message(new_message("bob", "alice", "hi", None)).await.unwrap();
        assert_eq!(store.message_count(), 1);
        let rows = store.fetch_conversations(&viewer("alice")).await.unwrap();
        assert_eq!(rows[0].unread_for("alice"), 1);
    }

    #[tokio::test]
    async fn test_mark_read_commits_messages_and_summary_together() {
        let store = SledBackend::temporary(16).unwrap();
        let first = store.insert_message(new_message("bob", "alice", "one", None)).await.unwrap();
        let second = store.insert_message(new_message("bob", "alice", "two", None)).await.unwrap();

        let updated = store
            .mark_read(&[first.id.clone(), second.id.clone()], "alice", Utc::now())
            .await
            .unwrap();
        assert_eq!(updated.len(), 2);

        let rows = store.fetch_conversations(&viewer("alice")).await.unwrap();
        assert_eq!(rows[0].unread_for("alice"), 0);
        let thread = store.fetch_thread(&ThreadKey::new("alice", "bob", None)).await.unwrap();
        assert!(thread.iter().all(|m| !m.is_unread()));
    }
}
