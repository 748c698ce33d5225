//! Conversation view.
//!
//! Bridges `/topic/chat/{id}`, `/topic/chat/{id}/read` and
//! `/topic/chat/{id}/typing` to a message timeline, with a 5s fallback
//! poller. Sends go over the broker when connected and over HTTP otherwise.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::InboundMessage;
use super::context::RealtimeContext;
use super::destination;
use super::poller::{needs_poll, FallbackPoller, PollTarget};
use super::protocol::{
    ChatMessage, OutgoingMessage, ReadReceipt, ReadRequest, RealtimeEvent, TypingEvent,
    TypingRequest,
};
use super::subscriber::{SubscriberLifecycle, TopicBinding, TopicHandler};
use super::timeline::{InsertOutcome, MessageTimeline};
use super::{ConversationId, MessageId, UserId};
use crate::error::{RealtimeError, RealtimeResult};

struct ConversationState {
    timeline: MessageTimeline,
    typing: HashMap<UserId, (String, Instant)>,
    /// Highest id a read receipt was sent for
    last_receipt: MessageId,
    last_update: Option<Instant>,
}

pub struct ConversationView {
    ctx: Arc<RealtimeContext>,
    conversation_id: ConversationId,
    lifecycle: SubscriberLifecycle,
    state: Mutex<ConversationState>,
    poller: Mutex<Option<FallbackPoller>>,
}

impl ConversationView {
    pub fn new(ctx: Arc<RealtimeContext>, conversation_id: ConversationId) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            conversation_id,
            lifecycle: SubscriberLifecycle::new("conversation"),
            state: Mutex::new(ConversationState {
                timeline: MessageTimeline::new(),
                typing: HashMap::new(),
                last_receipt: 0,
                last_update: None,
            }),
            poller: Mutex::new(None),
        })
    }

    /// Create and mount a view
    pub async fn open(ctx: Arc<RealtimeContext>, conversation_id: ConversationId) -> Arc<Self> {
        let view = Self::new(ctx, conversation_id);
        view.mount().await;
        view
    }

    /// Load history, mark it read, subscribe once and start polling
    pub async fn mount(self: &Arc<Self>) {
        self.lifecycle.mount();
        info!("Opening conversation {}", self.conversation_id);

        match self.ctx.backend().conversation_messages(self.conversation_id).await {
            Ok(history) => {
                if !self.lifecycle.is_mounted() {
                    return;
                }
                let receipt = {
                    let mut state = self.state.lock();
                    state.timeline.replace_if_newer(history);
                    state.last_update = Some(Instant::now());
                    self.take_receipt(&mut state)
                };
                if let Some(id) = receipt {
                    self.send_read_receipt(id);
                }
            }
            Err(e) => warn!(
                "Failed to load conversation {}: {}",
                self.conversation_id, e
            ),
        }

        self.start_poller();

        let handler = self.inbound_handler();
        let bindings = vec![
            TopicBinding::new(destination::chat_topic(self.conversation_id), handler.clone()),
            TopicBinding::new(destination::chat_read_topic(self.conversation_id), handler.clone()),
            TopicBinding::new(destination::chat_typing_topic(self.conversation_id), handler),
        ];
        self.lifecycle.attach(&self.ctx, bindings).await;
    }

    fn start_poller(self: &Arc<Self>) {
        let mut poller = self.poller.lock();
        if poller.is_none() && self.lifecycle.is_mounted() {
            let interval = self.ctx.config().conversation_poll.interval;
            *poller = Some(FallbackPoller::start(Arc::downgrade(self), interval));
        }
    }

    fn inbound_handler(self: &Arc<Self>) -> TopicHandler {
        let view = Arc::downgrade(self);
        Arc::new(move |message: InboundMessage| {
            if let Some(view) = view.upgrade() {
                view.handle_inbound(&message);
            }
        })
    }

    fn handle_inbound(self: &Arc<Self>, message: &InboundMessage) {
        if !self.lifecycle.is_mounted() {
            return;
        }
        match RealtimeEvent::from_slice(&message.body) {
            Ok(event) => self.apply_event(event),
            Err(e) => warn!(
                "Dropping malformed payload on {}: {}",
                message.destination, e
            ),
        }
    }

    fn apply_event(self: &Arc<Self>, event: RealtimeEvent) {
        if !self.lifecycle.is_mounted() {
            return;
        }
        match event {
            RealtimeEvent::ChatMessage(message) => self.apply_message(message),
            RealtimeEvent::MessageRead(receipt) => self.apply_receipt(receipt),
            RealtimeEvent::Typing(typing) => self.apply_typing(typing),
            other => debug!(
                "Conversation {} ignoring {:?}",
                self.conversation_id, other
            ),
        }
    }

    fn apply_message(self: &Arc<Self>, message: ChatMessage) {
        if message.conversation_id != self.conversation_id {
            return;
        }

        let receipt = {
            let mut state = self.state.lock();
            let sender_id = message.sender_id;
            match state.timeline.insert_confirmed(message) {
                InsertOutcome::Duplicate => return,
                InsertOutcome::ReplacedPlaceholder => debug!("Placeholder confirmed"),
                InsertOutcome::Appended => {}
            }
            state.last_update = Some(Instant::now());
            state.typing.remove(&sender_id);
            self.take_receipt(&mut state)
        };

        if let Some(id) = receipt {
            self.send_read_receipt(id);
        }
    }

    /// Mark others' messages read locally; returns the id to acknowledge, once
    fn take_receipt(&self, state: &mut ConversationState) -> Option<MessageId> {
        let me = self.ctx.user_id()?;
        let latest = state.timeline.latest_unread_from_others(me)?;
        if latest <= state.last_receipt {
            return None;
        }
        state.last_receipt = latest;
        state.timeline.mark_read_through(me, latest);
        Some(latest)
    }

    fn send_read_receipt(&self, last_read_message_id: MessageId) {
        let request = ReadRequest {
            conversation_id: self.conversation_id,
            last_read_message_id,
        };
        if self.ctx.is_connected()
            && self
                .ctx
                .manager()
                .publish(&destination::mark_read(self.conversation_id), &request)
        {
            debug!("Read receipt {} published", last_read_message_id);
            return;
        }

        let backend = self.ctx.backend();
        let conversation_id = self.conversation_id;
        tokio::spawn(async move {
            if let Err(e) = backend
                .mark_conversation_read(conversation_id, last_read_message_id)
                .await
            {
                warn!("Failed to mark conversation {} read: {}", conversation_id, e);
            }
        });
    }

    fn apply_receipt(&self, receipt: ReadReceipt) {
        if receipt.conversation_id != self.conversation_id
            || Some(receipt.reader_id) == self.ctx.user_id()
        {
            return;
        }
        self.state
            .lock()
            .timeline
            .mark_read_through(receipt.reader_id, receipt.last_read_message_id);
    }

    fn apply_typing(&self, typing: TypingEvent) {
        if typing.conversation_id != self.conversation_id
            || Some(typing.user_id) == self.ctx.user_id()
        {
            return;
        }
        let mut state = self.state.lock();
        if typing.typing {
            state
                .typing
                .insert(typing.user_id, (typing.user_name, Instant::now()));
        } else {
            state.typing.remove(&typing.user_id);
        }
    }

    /// Send a message.
    ///
    /// A placeholder appears immediately. Returns the placeholder when the
    /// message went over the broker, or the confirmed copy when it went over
    /// HTTP.
    pub async fn send_message(&self, content: &str) -> RealtimeResult<ChatMessage> {
        let content = content.trim();
        if content.is_empty() {
            return Err(RealtimeError::InvalidMessage("empty content".to_string()));
        }
        if !self.lifecycle.is_mounted() {
            return Err(RealtimeError::Unmounted);
        }
        let user = self.ctx.user().ok_or(RealtimeError::NotAuthenticated)?;

        let client_key = Uuid::new_v4();
        let placeholder = self.state.lock().timeline.push_placeholder(
            self.conversation_id,
            user.id,
            user.name(),
            content,
            client_key,
            Instant::now(),
        );
        let outgoing = OutgoingMessage {
            conversation_id: self.conversation_id,
            content: content.to_string(),
            client_key,
        };

        if self.ctx.is_connected()
            && self
                .ctx
                .manager()
                .publish(&destination::send_message(self.conversation_id), &outgoing)
        {
            return Ok(placeholder);
        }

        debug!("Sending message to conversation {} over HTTP", self.conversation_id);
        let confirmed = match self.ctx.backend().send_message(&outgoing).await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                self.state.lock().timeline.discard_placeholder(client_key);
                return Err(e.into());
            }
        };
        if self.lifecycle.is_mounted() {
            let mut state = self.state.lock();
            state.timeline.insert_confirmed(confirmed.clone());
            state.last_update = Some(Instant::now());
        }
        Ok(confirmed)
    }

    /// Publish a typing indicator; skipped when not connected
    pub fn set_typing(&self, typing: bool) -> bool {
        if !self.ctx.is_connected() {
            return false;
        }
        let request = TypingRequest {
            conversation_id: self.conversation_id,
            typing,
        };
        self.ctx
            .manager()
            .publish(&destination::typing(self.conversation_id), &request)
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.state.lock().timeline.messages().to_vec()
    }

    pub fn latest_id(&self) -> MessageId {
        self.state.lock().timeline.latest_id()
    }

    /// Names of participants currently typing
    pub fn typing_users(&self) -> Vec<String> {
        let ttl = self.ctx.config().typing_ttl;
        let now = Instant::now();
        let mut names: Vec<String> = self
            .state
            .lock()
            .typing
            .values()
            .filter(|(_, at)| now.saturating_duration_since(*at) < ttl)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn is_mounted(&self) -> bool {
        self.lifecycle.is_mounted()
    }

    pub fn subscription_count(&self) -> usize {
        self.lifecycle.handle_count()
    }

    /// Stop polling and release this view's subscriptions
    pub fn unmount(&self) {
        let released = self.lifecycle.detach(self.ctx.manager());
        if let Some(mut poller) = self.poller.lock().take() {
            poller.stop();
        }
        info!(
            "Closed conversation {} ({} subscriptions released)",
            self.conversation_id, released
        );
    }
}

impl Drop for ConversationView {
    fn drop(&mut self) {
        self.lifecycle.detach(self.ctx.manager());
    }
}

#[async_trait]
impl PollTarget for ConversationView {
    fn label(&self) -> &str {
        "conversation"
    }

    fn before_poll(&self, now: Instant) {
        let ttl = self.ctx.config().optimistic_ttl;
        let typing_ttl = self.ctx.config().typing_ttl;
        let mut state = self.state.lock();
        let expired = state.timeline.expire_placeholders(now, ttl);
        if expired > 0 {
            warn!("{} unconfirmed messages expired", expired);
        }
        state
            .typing
            .retain(|_, (_, at)| now.saturating_duration_since(*at) < typing_ttl);
    }

    fn should_poll(&self, now: Instant) -> bool {
        if !self.lifecycle.is_mounted() {
            return false;
        }
        let stale_after = self.ctx.config().conversation_poll.stale_after;
        let last_update = self.state.lock().last_update;
        needs_poll(self.ctx.is_connected(), last_update, stale_after, now)
    }

    async fn poll(&self) -> RealtimeResult<()> {
        let history = self
            .ctx
            .backend()
            .conversation_messages(self.conversation_id)
            .await?;
        if !self.lifecycle.is_mounted() {
            return Ok(());
        }

        let receipt = {
            let mut state = self.state.lock();
            if state.timeline.replace_if_newer(history) {
                debug!(
                    "Conversation {} refreshed to {}",
                    self.conversation_id,
                    state.timeline.latest_id()
                );
            }
            state.last_update = Some(Instant::now());
            self.take_receipt(&mut state)
        };
        if let Some(id) = receipt {
            self.send_read_receipt(id);
        }
        Ok(())
    }
}
