//! Subscription lifecycle shared by topic-backed views.
//!
//! A view attaches its topics once per mount. Attaching abandons the attempt
//! (no retry) when there is no user or the connection cannot be activated;
//! polling covers that case. Every mount and detach starts a new generation;
//! an attach checks its own generation right before every subscribe and
//! again, under the handle lock, right after it resolves, so a view that
//! unmounted (or remounted) mid-activation never keeps a stale subscription.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::connection::{ConnectionManager, InboundMessage, Subscription};
use super::context::RealtimeContext;

pub type TopicHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// A destination and the handler for its messages
#[derive(Clone)]
pub struct TopicBinding {
    pub destination: String,
    pub handler: TopicHandler,
}

impl TopicBinding {
    pub fn new(destination: impl Into<String>, handler: TopicHandler) -> Self {
        Self {
            destination: destination.into(),
            handler,
        }
    }
}

pub struct SubscriberLifecycle {
    label: &'static str,
    mounted: AtomicBool,
    attempted: AtomicBool,
    /// Bumped on every mount and detach
    generation: AtomicU64,
    handles: Mutex<Vec<Subscription>>,
}

impl SubscriberLifecycle {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            mounted: AtomicBool::new(false),
            attempted: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Mark mounted; a fresh mount may attach once more
    pub fn mount(&self) {
        let _handles = self.handles.lock();
        if !self.mounted.swap(true, Ordering::SeqCst) {
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.attempted.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// Still mounted by the same mount that started an attach
    fn is_current(&self, generation: u64) -> bool {
        self.is_mounted() && self.generation.load(Ordering::SeqCst) == generation
    }

    pub fn has_attempted(&self) -> bool {
        self.attempted.load(Ordering::SeqCst)
    }

    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Subscribe every binding, at most once per mount.
    ///
    /// Returns how many subscriptions this call installed.
    pub async fn attach(&self, ctx: &Arc<RealtimeContext>, bindings: Vec<TopicBinding>) -> usize {
        let generation = {
            let _handles = self.handles.lock();
            if !self.is_mounted() || self.attempted.swap(true, Ordering::SeqCst) {
                return 0;
            }
            self.generation.load(Ordering::SeqCst)
        };

        if ctx.user_id().is_none() {
            info!("{}: no authenticated user, realtime skipped", self.label);
            return 0;
        }
        if !ctx.is_connected() && !ctx.activate_connection_with_promise().await {
            info!("{}: realtime unavailable, relying on polling", self.label);
            return 0;
        }

        let manager = ctx.manager();
        let mut installed = 0;
        for binding in bindings {
            if !self.is_current(generation) {
                debug!("{}: unmounted before subscribing", self.label);
                break;
            }

            let handler = binding.handler;
            let subscription = manager
                .subscribe(&binding.destination, move |msg| handler(msg))
                .await;
            let Some(subscription) = subscription else {
                warn!("{}: subscribe to {} failed", self.label, binding.destination);
                continue;
            };

            let orphan = {
                let mut handles = self.handles.lock();
                if self.is_current(generation) {
                    handles.push(subscription);
                    None
                } else {
                    Some(subscription)
                }
            };
            match orphan {
                Some(subscription) => {
                    debug!("{}: unmounted while subscribing, releasing", self.label);
                    manager.unsubscribe(subscription);
                    break;
                }
                None => installed += 1,
            }
        }

        if installed > 0 {
            info!("{}: {} realtime subscriptions active", self.label, installed);
        }
        installed
    }

    /// Mark unmounted and release this instance's subscriptions
    pub fn detach(&self, manager: &ConnectionManager) -> usize {
        let handles = {
            let mut handles = self.handles.lock();
            self.mounted.store(false, Ordering::SeqCst);
            self.generation.fetch_add(1, Ordering::SeqCst);
            std::mem::take(&mut *handles)
        };

        let count = handles.len();
        for subscription in handles {
            manager.unsubscribe(subscription);
        }
        count
    }
}
