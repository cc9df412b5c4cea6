/// Shared types for the messaging layer
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix carried by ids of messages that have not been confirmed by the backend yet
pub const TEMP_ID_PREFIX: &str = "temp-";

/// One direct message row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    /// Optional context narrowing the thread (e.g. a course)
    pub scope_id: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `None` while unread
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_optimistic(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }

    pub fn is_unread(&self) -> bool {
        self.read_at.is_none()
    }

    /// True if the message was exchanged between `a` and `b`, in either direction.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender_id == a && self.recipient_id == b)
            || (self.sender_id == b && self.recipient_id == a)
    }
}

/// Insert payload for a new message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: String,
    pub recipient_id: String,
    pub body: String,
    pub scope_id: Option<String>,
}

/// Public profile of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Option<String>,
    pub username: Option<String>,
}

impl Profile {
    /// Placeholder used when a lookup fails
    pub fn unknown(id: &str) -> Self {
        Self {
            id: id.to_string(),
            first_name: None,
            last_name: None,
            role: None,
            username: None,
        }
    }

    pub fn display_name(&self) -> String {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .collect();
        if !parts.is_empty() {
            return parts.join(" ");
        }
        match &self.username {
            Some(u) if !u.is_empty() => u.clone(),
            _ => self.id.clone(),
        }
    }
}

/// Backend-maintained summary of one thread.
///
/// `user1_id` / `user2_id` are stored in canonical order (`user1_id < user2_id`);
/// callers should go through the viewer-relative accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: String,
    pub user1_id: String,
    pub user2_id: String,
    pub scope_id: Option<String>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_sender_id: Option<String>,
    pub user1_unread_count: u32,
    pub user2_unread_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationRow {
    pub fn involves(&self, user_id: &str) -> bool {
        self.user1_id == user_id || self.user2_id == user_id
    }

    /// The participant that is not `viewer`, or `None` if the viewer is not a participant
    pub fn other_user(&self, viewer: &str) -> Option<&str> {
        if self.user1_id == viewer {
            Some(&self.user2_id)
        } else if self.user2_id == viewer {
            Some(&self.user1_id)
        } else {
            None
        }
    }

    pub fn unread_for(&self, viewer: &str) -> u32 {
        if self.user1_id == viewer {
            self.user1_unread_count
        } else if self.user2_id == viewer {
            self.user2_unread_count
        } else {
            0
        }
    }
}

/// Inbox row as seen by one viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub other_user_id: String,
    pub other_profile: Option<Profile>,
    pub scope_id: Option<String>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_sender_id: Option<String>,
    pub unread_count: u32,
}

impl Conversation {
    /// Project a summary row onto `viewer`. Returns `None` if the viewer is not a participant.
    pub fn from_row(row: ConversationRow, viewer: &str) -> Option<Self> {
        let other_user_id = row.other_user(viewer)?.to_string();
        let unread_count = row.unread_for(viewer);
        Some(Self {
            id: row.id,
            other_user_id,
            other_profile: None,
            scope_id: row.scope_id,
            last_message: row.last_message,
            last_message_at: row.last_message_at,
            last_sender_id: row.last_sender_id,
            unread_count,
        })
    }
}

/// Identifies one thread: (viewer, counterpart, optional scope)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadKey {
    pub viewer_id: String,
    pub counterpart_id: String,
    pub scope_id: Option<String>,
}

impl ThreadKey {
    pub fn new(viewer_id: impl Into<String>, counterpart_id: impl Into<String>, scope_id: Option<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            counterpart_id: counterpart_id.into(),
            scope_id,
        }
    }
}

/// A thread entry: the message plus whatever participant profiles were resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMessage {
    #[serde(flatten)]
    pub message: Message,
    pub sender: Option<Profile>,
    pub recipient: Option<Profile>,
}

impl ThreadMessage {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            sender: None,
            recipient: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub fn is_optimistic(&self) -> bool {
        self.message.is_optimistic()
    }
}

/// Row-level change notification from the backend feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent<T> {
    Insert { record: T },
    Update { record: T },
    Delete { old_record: T },
}

impl<T> ChangeEvent<T> {
    /// The row the event is about (new state for insert/update, old state for delete)
    pub fn row(&self) -> &T {
        match self {
            ChangeEvent::Insert { record } | ChangeEvent::Update { record } => record,
            ChangeEvent::Delete { old_record } => old_record,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Insert { .. } => "insert",
            ChangeEvent::Update { .. } => "update",
            ChangeEvent::Delete { .. } => "delete",
        }
    }
}

/// Loading state shared by the thread and conversation-list sessions
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Idle,
    Loading,
    Ready,
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(user1: &str, user2: &str) -> ConversationRow {
        let now = Utc::now();
        ConversationRow {
            id: "c1".to_string(),
            user1_id: user1.to_string(),
            user2_id: user2.to_string(),
            scope_id: None,
            last_message: Some("hey".to_string()),
            last_message_at: Some(now),
            last_sender_id: Some(user1.to_string()),
            user1_unread_count: 1,
            user2_unread_count: 4,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_conversation_is_viewer_relative() {
        let r = row("alice", "bob");

        let for_alice = Conversation::from_row(r.clone(), "alice").unwrap();
        assert_eq!(for_alice.other_user_id, "bob");
        assert_eq!(for_alice.unread_count, 1);

        let for_bob = Conversation::from_row(r.clone(), "bob").unwrap();
        assert_eq!(for_bob.other_user_id, "alice");
        assert_eq!(for_bob.unread_count, 4);

        assert!(Conversation::from_row(r, "carol").is_none());
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut p = Profile::unknown("u1");
        assert_eq!(p.display_name(), "u1");

        p.username = Some("ada".to_string());
        assert_eq!(p.display_name(), "ada");

        p.first_name = Some("Ada".to_string());
        p.last_name = Some("Lovelace".to_string());
        assert_eq!(p.display_name(), "Ada Lovelace");
    }

    #[test]
    fn test_change_event_wire_shape() {
        let event = ChangeEvent::Delete {
            old_record: Profile::unknown("u1"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "delete");
        assert_eq!(json["old_record"]["id"], "u1");
    }
}
