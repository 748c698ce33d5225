//! Realtime payloads exchanged over broker destinations.
//!
//! Every inbound body is a JSON object carrying a `type` discriminator.
//! Unknown types decode to `RealtimeEvent::Unknown` and are ignored by views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ConversationId, MessageId, NotificationId, UserId};

/// A chat message as shown in a conversation view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default)]
    pub sender_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    /// Idempotency key chosen by the sending client, echoed by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<Uuid>,
    /// Optimistic entry not yet confirmed by the server
    #[serde(skip)]
    pub local_only: bool,
}

impl ChatMessage {
    /// Whether this is an unconfirmed optimistic placeholder
    pub fn is_placeholder(&self) -> bool {
        self.local_only
    }
}

/// A user notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    #[serde(default)]
    pub actor_id: Option<UserId>,
    #[serde(default)]
    pub actor_name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

/// Someone read a conversation up to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: ConversationId,
    pub reader_id: UserId,
    pub last_read_message_id: MessageId,
}

/// Someone started or stopped typing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    #[serde(default)]
    pub user_name: String,
    pub typing: bool,
}

/// Inbound realtime events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RealtimeEvent {
    ChatMessage(ChatMessage),
    MessageRead(ReadReceipt),
    Typing(TypingEvent),
    Notification(Notification),
    UnreadCount {
        count: i64,
    },
    #[serde(other)]
    Unknown,
}

impl RealtimeEvent {
    /// Decode an event from a message body
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// Body of `/app/chat.sendMessage/{id}` and of the HTTP send call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub conversation_id: ConversationId,
    pub content: String,
    pub client_key: Uuid,
}

/// Body of `/app/chat.markRead/{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    pub conversation_id: ConversationId,
    pub last_read_message_id: MessageId,
}

/// Body of `/app/chat.typing/{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingRequest {
    pub conversation_id: ConversationId,
    pub typing: bool,
}
