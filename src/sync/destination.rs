//! Broker destination names.

use super::{ConversationId, UserId};

/// New messages in a conversation
pub fn chat_topic(conversation_id: ConversationId) -> String {
    format!("/topic/chat/{}", conversation_id)
}

/// Read receipts in a conversation
pub fn chat_read_topic(conversation_id: ConversationId) -> String {
    format!("/topic/chat/{}/read", conversation_id)
}

/// Typing indicators in a conversation
pub fn chat_typing_topic(conversation_id: ConversationId) -> String {
    format!("/topic/chat/{}/typing", conversation_id)
}

/// Per-user notification queue
pub fn notification_queue(user_id: UserId) -> String {
    format!("/user/{}/queue/notifications", user_id)
}

pub fn send_message(conversation_id: ConversationId) -> String {
    format!("/app/chat.sendMessage/{}", conversation_id)
}

pub fn mark_read(conversation_id: ConversationId) -> String {
    format!("/app/chat.markRead/{}", conversation_id)
}

pub fn typing(conversation_id: ConversationId) -> String {
    format!("/app/chat.typing/{}", conversation_id)
}
