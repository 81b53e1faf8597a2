use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MAX_GROUP_PARTICIPANTS: usize = 300;
pub const MAX_BODY_CHARS: usize = 10_000;
pub const MAX_EMOJI_CHARS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Away,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Owner,
    Admin,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub presence: String,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Conversation {
    pub id: Uuid,
    pub kind: String,
    pub name: Option<String>,
    pub slug: Option<String>,
    pub owner_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Participant {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub last_read_message_id: Option<Uuid>,
    pub unread_count: i32,
}

impl Participant {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub body: String,
    pub kind: String,
    pub metadata: serde_json::Value,
    pub reply_to_id: Option<Uuid>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Body as visible to a reader: soft-deleted messages show a placeholder.
    pub fn visible_body(&self) -> &str {
        if self.is_deleted {
            "[deleted]"
        } else {
            &self.body
        }
    }
}

/// Serializes `body` through [`Message::visible_body`] so a soft-deleted
/// message's original content never reaches a client — over HTTP responses
/// or the `message.new`/`message.edited` broadcast payloads alike.
impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("Message", 12)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("conversation_id", &self.conversation_id)?;
        state.serialize_field("sender_id", &self.sender_id)?;
        state.serialize_field("body", self.visible_body())?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("metadata", &self.metadata)?;
        state.serialize_field("reply_to_id", &self.reply_to_id)?;
        state.serialize_field("is_edited", &self.is_edited)?;
        state.serialize_field("edited_at", &self.edited_at)?;
        state.serialize_field("is_deleted", &self.is_deleted)?;
        state.serialize_field("deleted_at", &self.deleted_at)?;
        state.serialize_field("created_at", &self.created_at)?;
        state.end()
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct EditHistoryEntry {
    pub id: Uuid,
    pub message_id: Uuid,
    pub prior_body: String,
    pub prior_metadata: serde_json::Value,
    pub edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Reaction {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct DeliveryRecord {
    pub message_id: Uuid,
    pub recipient_id: Uuid,
    pub status: String,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn status_rank(&self) -> u8 {
        match self.status.as_str() {
            "sent" => 0,
            "delivered" => 1,
            "read" => 2,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_fingerprint: String,
    pub socket_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
}

impl Session {
    pub fn is_logged_in(&self) -> bool {
        self.is_active && self.expires_at > Utc::now()
    }
}

/// A conversation row joined with the viewer's unread count and last
/// message digest, as returned by `Store::get_user_conversations`.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub unread_count: i32,
    pub last_message_body: Option<String>,
}

/// `^[A-Za-z0-9_]{3,50}$`
pub fn validate_username(username: &str) -> bool {
    let len = username.chars().count();
    (3..=50).contains(&len) && username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn validate_body(body: &str) -> bool {
    !body.is_empty() && body.chars().count() <= MAX_BODY_CHARS
}

pub fn validate_emoji(emoji: &str) -> bool {
    !emoji.is_empty() && emoji.chars().count() <= MAX_EMOJI_CHARS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_validator_accepts_boundary_cases() {
        assert!(validate_username("abc"));
        assert!(validate_username("a_1"));
        assert!(validate_username(&"A".repeat(50)));
    }

    #[test]
    fn username_validator_rejects_boundary_cases() {
        assert!(!validate_username("ab"));
        assert!(!validate_username(&"A".repeat(51)));
        assert!(!validate_username("user-name"));
        assert!(!validate_username("user name"));
        assert!(!validate_username(""));
    }

    #[test]
    fn body_validator_enforces_10000_char_boundary() {
        assert!(validate_body(&"a".repeat(10_000)));
        assert!(!validate_body(&"a".repeat(10_001)));
        assert!(!validate_body(""));
    }

    #[test]
    fn delivery_status_rank_is_monotonic() {
        let sent = DeliveryStatus::Sent;
        let delivered = DeliveryStatus::Delivered;
        let read = DeliveryStatus::Read;
        assert!(sent < delivered);
        assert!(delivered < read);
    }
}
