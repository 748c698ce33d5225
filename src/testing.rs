//! In-process test doubles: a scripted broker connector and an in-memory backend.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

use crate::api::{ApiError, ApiResult, Backend, UserIdentity};
use crate::config::RealtimeConfig;
use crate::sync::context::RealtimeContext;
use crate::sync::protocol::{ChatMessage, Notification, OutgoingMessage};
use crate::sync::{ConversationId, MessageId, NotificationId, UserId};
use crate::transport::{Command, Connector, Endpoint, Frame, Link, LinkPeer, TransportError};

pub const ME: UserId = 1;
pub const OTHER: UserId = 2;

pub fn test_config() -> RealtimeConfig {
    RealtimeConfig::new("http://localhost:8080")
}

/// Let spawned tasks run to their next suspension point
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Accept,
    Refuse,
    Hang,
}

/// Connector whose outcome is chosen by the test
pub struct ScriptedConnector {
    mode: Mutex<ConnectMode>,
    gate: Mutex<Option<Arc<Notify>>>,
    attempts: AtomicUsize,
    remotes: Mutex<Vec<Remote>>,
}

impl ScriptedConnector {
    pub fn new(mode: ConnectMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            gate: Mutex::new(None),
            attempts: AtomicUsize::new(0),
            remotes: Mutex::new(Vec::new()),
        })
    }

    pub fn set_mode(&self, mode: ConnectMode) {
        *self.mode.lock() = mode;
    }

    /// Hold every handshake until the returned gate is notified
    pub fn gate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    /// Release held handshakes and stop gating new ones
    pub fn ungate(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.notify_waiters();
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Take the broker side of the most recent connection
    pub fn take_remote(&self) -> Option<Remote> {
        self.remotes.lock().pop()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _endpoint: &Endpoint) -> Result<Link, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mode = *self.mode.lock();
        match mode {
            ConnectMode::Accept => {
                let (link, peer) = Link::pair();
                self.remotes.lock().push(Remote::new(peer));
                Ok(link)
            }
            ConnectMode::Refuse => Err(TransportError::Rejected("refused".to_string())),
            ConnectMode::Hang => std::future::pending().await,
        }
    }
}

/// Broker side of a scripted connection
pub struct Remote {
    inbound_tx: mpsc::UnboundedSender<Frame>,
    outbound_rx: mpsc::UnboundedReceiver<Frame>,
    sent: Vec<Frame>,
    next_message: u64,
}

impl Remote {
    fn new(peer: LinkPeer) -> Self {
        Self {
            inbound_tx: peer.inbound_tx,
            outbound_rx: peer.outbound_rx,
            sent: Vec::new(),
            next_message: 0,
        }
    }

    /// Every frame the client has sent so far
    pub fn pump(&mut self) -> &[Frame] {
        while let Ok(frame) = self.outbound_rx.try_recv() {
            self.sent.push(frame);
        }
        &self.sent
    }

    /// SEND frames addressed to a destination
    pub fn sent_to(&mut self, destination: &str) -> Vec<Frame> {
        self.pump()
            .iter()
            .filter(|f| f.command == Command::Send && f.header("destination") == Some(destination))
            .cloned()
            .collect()
    }

    /// Id of the newest live subscription to a destination
    pub fn subscription_id(&mut self, destination: &str) -> Option<String> {
        self.live_subscriptions(destination).pop()
    }

    /// Subscriptions to a destination not yet unsubscribed, oldest first
    pub fn live_subscriptions(&mut self, destination: &str) -> Vec<String> {
        let mut live: Vec<String> = Vec::new();
        for frame in self.pump() {
            match frame.command {
                Command::Subscribe if frame.header("destination") == Some(destination) => {
                    if let Some(id) = frame.header("id") {
                        live.push(id.to_string());
                    }
                }
                Command::Unsubscribe => {
                    if let Some(id) = frame.header("id") {
                        live.retain(|l| l != id);
                    }
                }
                _ => {}
            }
        }
        live
    }

    pub fn deliver_to(&mut self, subscription: &str, destination: &str, body: &str) {
        self.next_message += 1;
        let frame = Frame::new(Command::Message)
            .with_header("destination", destination)
            .with_header("subscription", subscription)
            .with_header("message-id", self.next_message.to_string())
            .with_header("content-type", "application/json")
            .with_body(body.to_string());
        let _ = self.inbound_tx.send(frame);
    }

    /// Deliver a JSON body to the live subscription of a destination
    pub fn deliver(&mut self, destination: &str, body: serde_json::Value) -> bool {
        match self.subscription_id(destination) {
            Some(id) => {
                self.deliver_to(&id, destination, &body.to_string());
                true
            }
            None => false,
        }
    }
}

/// In-memory backend recording every call
pub struct MemoryBackend {
    user: Mutex<Option<UserIdentity>>,
    messages: Mutex<HashMap<ConversationId, Vec<ChatMessage>>>,
    notifications: Mutex<Vec<Notification>>,
    unread: Mutex<u32>,
    calls: Mutex<Vec<String>>,
    failing: AtomicBool,
    next_id: AtomicI64,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            user: Mutex::new(Some(UserIdentity {
                id: ME,
                username: "alice".to_string(),
                display_name: Some("Alice".to_string()),
            })),
            messages: Mutex::new(HashMap::new()),
            notifications: Mutex::new(Vec::new()),
            unread: Mutex::new(0),
            calls: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            next_id: AtomicI64::new(1000),
        })
    }

    pub fn anonymous() -> Arc<Self> {
        let backend = Self::new();
        *backend.user.lock() = None;
        backend
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn seed_messages(&self, conversation_id: ConversationId, messages: Vec<ChatMessage>) {
        self.messages.lock().insert(conversation_id, messages);
    }

    pub fn push_message(&self, message: ChatMessage) {
        self.messages
            .lock()
            .entry(message.conversation_id)
            .or_default()
            .push(message);
    }

    pub fn seed_notifications(&self, notifications: Vec<Notification>, unread: u32) {
        *self.notifications.lock() = notifications;
        *self.unread.lock() = unread;
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) -> ApiResult<()> {
        self.calls.lock().push(call);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ApiError::Unavailable("backend offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn current_user(&self) -> ApiResult<UserIdentity> {
        self.record("current_user".to_string())?;
        self.user.lock().clone().ok_or(ApiError::Unauthorized)
    }

    async fn conversation_messages(
        &self,
        conversation_id: ConversationId,
    ) -> ApiResult<Vec<ChatMessage>> {
        self.record(format!("messages:{}", conversation_id))?;
        Ok(self
            .messages
            .lock()
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(&self, message: &OutgoingMessage) -> ApiResult<ChatMessage> {
        self.record(format!("send:{}", message.conversation_id))?;
        let confirmed = ChatMessage {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            conversation_id: message.conversation_id,
            sender_id: ME,
            sender_name: "Alice".to_string(),
            content: message.content.clone(),
            created_at: Utc::now(),
            read: false,
            client_key: Some(message.client_key),
            local_only: false,
        };
        self.push_message(confirmed.clone());
        Ok(confirmed)
    }

    async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        last_read_message_id: MessageId,
    ) -> ApiResult<()> {
        self.record(format!("read:{}:{}", conversation_id, last_read_message_id))
    }

    async fn notifications(&self) -> ApiResult<Vec<Notification>> {
        self.record("notifications".to_string())?;
        Ok(self.notifications.lock().clone())
    }

    async fn unread_notification_count(&self) -> ApiResult<u32> {
        self.record("unread_count".to_string())?;
        Ok(*self.unread.lock())
    }

    async fn mark_notification_read(&self, notification_id: NotificationId) -> ApiResult<()> {
        self.record(format!("notification_read:{}", notification_id))
    }

    async fn mark_all_notifications_read(&self) -> ApiResult<()> {
        self.record("notification_read_all".to_string())
    }
}

pub fn chat_message(id: MessageId, sender_id: UserId, content: &str) -> ChatMessage {
    ChatMessage {
        id,
        conversation_id: 7,
        sender_id,
        sender_name: if sender_id == ME { "Alice" } else { "Bob" }.to_string(),
        content: content.to_string(),
        created_at: Utc::now(),
        read: false,
        client_key: None,
        local_only: false,
    }
}

pub fn notification(id: NotificationId, read: bool) -> Notification {
    Notification {
        id,
        actor_id: Some(OTHER),
        actor_name: "Bob".to_string(),
        kind: "COMMENT".to_string(),
        content: "commented on your post".to_string(),
        created_at: Utc::now(),
        read,
    }
}

/// Context over the given doubles, with the user already resolved
pub async fn context(
    backend: &Arc<MemoryBackend>,
    connector: &Arc<ScriptedConnector>,
) -> Arc<RealtimeContext> {
    context_with(test_config(), backend, connector).await
}

pub async fn context_with(
    config: RealtimeConfig,
    backend: &Arc<MemoryBackend>,
    connector: &Arc<ScriptedConnector>,
) -> Arc<RealtimeContext> {
    let ctx = RealtimeContext::new(config, backend.clone(), connector.clone())
        .expect("test config is valid");
    let _ = ctx.initialize().await;
    ctx
}
