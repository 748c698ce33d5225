//! Realtime synchronization of conversation and notification views.
//!
//! This module keeps client-side view state in step with the backend. It
//! provides:
//! - A single shared broker connection with debounced activation
//! - A dependency-injected context that gates connections on identity
//! - Topic subscribers for conversations and notifications
//! - Fallback pollers that keep views correct without realtime delivery
//! - Idempotent merge rules for realtime, optimistic and polled updates

pub mod connection;
pub mod context;
pub mod conversation;
pub mod destination;
pub mod notifications;
pub mod poller;
pub mod protocol;
pub mod subscriber;
pub mod timeline;

pub use connection::{ConnectionManager, ConnectionState, InboundMessage, Subscription};
pub use context::{Notice, RealtimeContext};
pub use conversation::ConversationView;
pub use notifications::NotificationsView;
pub use poller::{FallbackPoller, PollTarget};

/// Server-assigned conversation identifier
pub type ConversationId = i64;

/// Message identifier; negative for unconfirmed local placeholders
pub type MessageId = i64;

/// User identifier
pub type UserId = i64;

/// Notification identifier
pub type NotificationId = i64;
