//! Request/response backend API.
//!
//! Views use the `Backend` trait for initial state, fallback polling and as
//! the send path when the realtime connection is unavailable.

mod http;

pub use http::HttpBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::protocol::{ChatMessage, Notification, OutgoingMessage};
use crate::sync::{ConversationId, MessageId, NotificationId, UserId};

/// The authenticated user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl UserIdentity {
    /// Name to show for this user
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

/// Result type for API calls
pub type ApiResult<T> = Result<T, ApiError>;

/// HTTP API errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Backend request/response operations
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Resolve the authenticated user
    async fn current_user(&self) -> ApiResult<UserIdentity>;

    /// Full message history of a conversation, oldest first
    async fn conversation_messages(
        &self,
        conversation_id: ConversationId,
    ) -> ApiResult<Vec<ChatMessage>>;

    /// Send a message; returns the server-confirmed copy
    async fn send_message(&self, message: &OutgoingMessage) -> ApiResult<ChatMessage>;

    /// Mark a conversation read up to a message
    async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        last_read_message_id: MessageId,
    ) -> ApiResult<()>;

    /// Notifications, newest first
    async fn notifications(&self) -> ApiResult<Vec<Notification>>;

    async fn unread_notification_count(&self) -> ApiResult<u32>;

    async fn mark_notification_read(&self, notification_id: NotificationId) -> ApiResult<()>;

    async fn mark_all_notifications_read(&self) -> ApiResult<()>;
}
