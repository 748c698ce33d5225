//! Notifications view.
//!
//! Bridges `/user/{id}/queue/notifications` to a notification feed with an
//! unread counter, with a 15s fallback poller whose count is authoritative.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::InboundMessage;
use super::context::RealtimeContext;
use super::destination;
use super::poller::{needs_poll, FallbackPoller, PollTarget};
use super::protocol::{Notification, RealtimeEvent};
use super::subscriber::{SubscriberLifecycle, TopicBinding, TopicHandler};
use super::timeline::NotificationFeed;
use super::NotificationId;
use crate::error::RealtimeResult;

struct NotificationsState {
    feed: NotificationFeed,
    last_update: Option<Instant>,
}

pub struct NotificationsView {
    ctx: Arc<RealtimeContext>,
    lifecycle: SubscriberLifecycle,
    state: Mutex<NotificationsState>,
    poller: Mutex<Option<FallbackPoller>>,
}

impl NotificationsView {
    pub fn new(ctx: Arc<RealtimeContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            lifecycle: SubscriberLifecycle::new("notifications"),
            state: Mutex::new(NotificationsState {
                feed: NotificationFeed::new(),
                last_update: None,
            }),
            poller: Mutex::new(None),
        })
    }

    pub async fn open(ctx: Arc<RealtimeContext>) -> Arc<Self> {
        let view = Self::new(ctx);
        view.mount().await;
        view
    }

    /// Load notifications, subscribe once and start polling
    pub async fn mount(self: &Arc<Self>) {
        self.lifecycle.mount();

        if let Err(e) = self.refresh().await {
            warn!("Failed to load notifications: {}", e);
        }

        {
            let mut poller = self.poller.lock();
            if poller.is_none() && self.lifecycle.is_mounted() {
                let interval = self.ctx.config().notification_poll.interval;
                *poller = Some(FallbackPoller::start(Arc::downgrade(self), interval));
            }
        }

        let bindings = match self.ctx.user_id() {
            Some(user_id) => vec![TopicBinding::new(
                destination::notification_queue(user_id),
                self.inbound_handler(),
            )],
            None => Vec::new(),
        };
        self.lifecycle.attach(&self.ctx, bindings).await;
    }

    fn inbound_handler(self: &Arc<Self>) -> TopicHandler {
        let view = Arc::downgrade(self);
        Arc::new(move |message: InboundMessage| {
            if let Some(view) = view.upgrade() {
                view.handle_inbound(&message);
            }
        })
    }

    fn handle_inbound(&self, message: &InboundMessage) {
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

    fn apply_event(&self, event: RealtimeEvent) {
        if !self.lifecycle.is_mounted() {
            return;
        }
        let mut state = self.state.lock();
        match event {
            RealtimeEvent::Notification(notification) => {
                if state.feed.insert(notification) {
                    state.last_update = Some(Instant::now());
                }
            }
            RealtimeEvent::UnreadCount { count } => {
                state.feed.set_unread(count);
                state.last_update = Some(Instant::now());
            }
            other => debug!("Notifications ignoring {:?}", other),
        }
    }

    /// Fetch list and count; the fetched count replaces the local one
    async fn refresh(&self) -> RealtimeResult<()> {
        let backend = self.ctx.backend();
        let notifications = backend.notifications().await?;
        let unread = backend.unread_notification_count().await?;
        if !self.lifecycle.is_mounted() {
            return Ok(());
        }

        let mut state = self.state.lock();
        state.feed.reconcile(notifications, unread);
        state.last_update = Some(Instant::now());
        Ok(())
    }

    pub async fn mark_read(&self, id: NotificationId) -> RealtimeResult<()> {
        if !self.state.lock().feed.mark_read(id) {
            return Ok(());
        }
        self.ctx.backend().mark_notification_read(id).await?;
        Ok(())
    }

    pub async fn mark_all_read(&self) -> RealtimeResult<()> {
        self.state.lock().feed.mark_all_read();
        self.ctx.backend().mark_all_notifications_read().await?;
        Ok(())
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.state.lock().feed.items().to_vec()
    }

    pub fn unread_count(&self) -> u32 {
        self.state.lock().feed.unread()
    }

    pub fn is_mounted(&self) -> bool {
        self.lifecycle.is_mounted()
    }

    pub fn subscription_count(&self) -> usize {
        self.lifecycle.handle_count()
    }

    pub fn unmount(&self) {
        let released = self.lifecycle.detach(self.ctx.manager());
        if let Some(mut poller) = self.poller.lock().take() {
            poller.stop();
        }
        info!("Closed notifications ({} subscriptions released)", released);
    }
}

impl Drop for NotificationsView {
    fn drop(&mut self) {
        self.lifecycle.detach(self.ctx.manager());
    }
}

#[async_trait]
impl PollTarget for NotificationsView {
    fn label(&self) -> &str {
        "notifications"
    }

    fn should_poll(&self, now: Instant) -> bool {
        if !self.lifecycle.is_mounted() {
            return false;
        }
        let stale_after = self.ctx.config().notification_poll.stale_after;
        let last_update = self.state.lock().last_update;
        needs_poll(self.ctx.is_connected(), last_update, stale_after, now)
    }

    async fn poll(&self) -> RealtimeResult<()> {
        self.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, notification, settle, ConnectMode, MemoryBackend, ScriptedConnector};
    use serde_json::json;
    use std::time::Duration;

    fn pushed(id: i64) -> serde_json::Value {
        json!({
            "type": "NOTIFICATION",
            "id": id,
            "actorId": 2,
            "actorName": "Bob",
            "kind": "LIKE",
            "content": "liked your post",
            "createdAt": "2024-05-01T10:00:00Z"
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_prepends_and_counts() {
        let backend = MemoryBackend::new();
        backend.seed_notifications(vec![notification(1, false)], 1);
        let connector = ScriptedConnector::new(ConnectMode::Accept);
        let ctx = context(&backend, &connector).await;
        let view = NotificationsView::open(ctx).await;
        assert_eq!(view.unread_count(), 1);
        assert_eq!(view.subscription_count(), 1);

        let mut remote = connector.take_remote().unwrap();
        let queue = "/user/1/queue/notifications";
        assert!(remote.deliver(queue, pushed(2)));
        assert!(remote.deliver(queue, pushed(2)));
        settle().await;

        let ids: Vec<_> = view.notifications().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(view.unread_count(), 2);

        remote.deliver(queue, json!({"type": "UNREAD_COUNT", "count": 7}));
        settle().await;
        assert_eq!(view.unread_count(), 7);

        remote.deliver(queue, json!({"type": "UNREAD_COUNT", "count": -3}));
        settle().await;
        assert_eq!(view.unread_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_read_saturates() {
        let backend = MemoryBackend::new();
        backend.seed_notifications(vec![notification(1, false), notification(2, true)], 0);
        let connector = ScriptedConnector::new(ConnectMode::Refuse);
        let ctx = context(&backend, &connector).await;
        let view = NotificationsView::open(ctx).await;
        assert_eq!(view.unread_count(), 0);

        view.mark_read(1).await.unwrap();
        view.mark_read(1).await.unwrap();
        assert_eq!(view.unread_count(), 0);
        assert_eq!(backend.count_calls("notification_read:1"), 1);

        view.mark_all_read().await.unwrap();
        assert_eq!(backend.count_calls("notification_read_all"), 1);
        assert!(view.notifications().iter().all(|n| n.read));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_count_is_authoritative() {
        let backend = MemoryBackend::new();
        backend.seed_notifications(vec![notification(1, false)], 5);
        let connector = ScriptedConnector::new(ConnectMode::Refuse);
        let ctx = context(&backend, &connector).await;
        let view = NotificationsView::open(ctx).await;
        assert_eq!(view.unread_count(), 5);

        backend.seed_notifications(vec![notification(1, true)], 0);
        tokio::time::sleep(Duration::from_millis(15_500)).await;
        settle().await;
        assert_eq!(view.unread_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_drops_items_the_server_no_longer_lists() {
        let backend = MemoryBackend::new();
        backend.seed_notifications(vec![notification(2, false), notification(1, false)], 2);
        let connector = ScriptedConnector::new(ConnectMode::Refuse);
        let ctx = context(&backend, &connector).await;
        let view = NotificationsView::open(ctx).await;
        assert_eq!(view.notifications().len(), 2);

        backend.seed_notifications(Vec::new(), 0);
        tokio::time::sleep(Duration::from_millis(15_500)).await;
        settle().await;
        assert!(view.notifications().is_empty());
        assert_eq!(view.unread_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_mutation_after_unmount() {
        let backend = MemoryBackend::new();
        let connector = ScriptedConnector::new(ConnectMode::Accept);
        let ctx = context(&backend, &connector).await;
        let view = NotificationsView::open(ctx.clone()).await;

        view.unmount();
        assert_eq!(ctx.manager().stats().active_subscriptions, 0);

        view.apply_event(RealtimeEvent::Notification(notification(4, false)));
        view.apply_event(RealtimeEvent::UnreadCount { count: 3 });
        assert!(view.notifications().is_empty());
        assert_eq!(view.unread_count(), 0);

        backend.seed_notifications(vec![notification(5, false)], 1);
        tokio::time::sleep(Duration::from_secs(40)).await;
        settle().await;
        assert!(view.notifications().is_empty());
    }
}
