//! Shared data models for chat messages and the REST collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server-assigned message id. Locally originated messages carry a negative
/// id until the server acknowledges them.
pub type MessageId = i64;

/// Opaque user identifier as used by the broker and the REST backend.
pub type UserId = String;

// --- Messaging ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    Broadcast,
    Direct,
}

impl MessageKind {
    pub fn for_receiver(receiver: Option<&str>) -> Self {
        match receiver {
            Some(_) => MessageKind::Direct,
            None => MessageKind::Broadcast,
        }
    }
}

/// A chat message as held in the conversation state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    pub sender_id: UserId,
    /// Absent for broadcast messages.
    pub receiver_id: Option<UserId>,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    /// Present iff the message has been edited.
    pub last_edited_at: Option<DateTime<Utc>>,
    /// Tombstone flag. Identity, sender and timestamp are kept.
    pub deleted: bool,
}

impl Message {
    /// Build a message that has not been edited or deleted.
    pub fn new(
        id: MessageId,
        sender_id: impl Into<UserId>,
        receiver_id: Option<UserId>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let kind = MessageKind::for_receiver(receiver_id.as_deref());
        Self {
            id,
            content: content.into(),
            sender_id: sender_id.into(),
            receiver_id,
            kind,
            timestamp,
            last_edited_at: None,
            deleted: false,
        }
    }

    /// True while the message only exists locally under a temporary id.
    pub fn is_provisional(&self) -> bool {
        self.id < 0
    }

    /// Total order of the conversation: `(timestamp, id)` ascending.
    pub fn ordering_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.timestamp, self.id)
    }
}

/// Message representation used by the REST backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: MessageId,
    pub content: String,
    pub sender: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<UserId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub last_edited: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        let kind = MessageKind::for_receiver(record.receiver.as_deref());
        Self {
            id: record.id,
            content: record.content,
            sender_id: record.sender,
            receiver_id: record.receiver,
            kind,
            timestamp: record.timestamp,
            last_edited_at: record.last_edited,
            deleted: record.deleted,
        }
    }
}

impl From<&Message> for MessageRecord {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            content: message.content.clone(),
            sender: message.sender_id.clone(),
            receiver: message.receiver_id.clone(),
            timestamp: message.timestamp,
            last_edited: message.last_edited_at,
            deleted: message.deleted,
        }
    }
}

// --- Requests ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageRequest {
    pub content: String,
    pub sender: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<UserId>,
    /// Client-side creation time of the provisional entry.
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EditMessageRequest {
    pub content: String,
    pub acting_user_id: UserId,
}

// --- Users ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl UserProfile {
    /// Name to render for this user, falling back to the raw id.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.id)
    }
}
