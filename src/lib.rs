//! Realtime messaging and notification sync for a social-network client.
//!
//! Views stay current through a STOMP-over-WebSocket broker connection,
//! with HTTP request/response as the initial-load, fallback-send and
//! polling path.

pub mod api;
pub mod config;
pub mod error;
pub mod sync;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{Backend, HttpBackend, UserIdentity};
pub use config::RealtimeConfig;
pub use error::{RealtimeError, RealtimeResult};
pub use sync::{ConversationView, Notice, NotificationsView, RealtimeContext};
pub use transport::{Connector, WsConnector};
