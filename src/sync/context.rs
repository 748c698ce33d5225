//! Connection context shared by every view.
//!
//! `RealtimeContext` is built once at application start and passed around as
//! an `Arc`. It owns:
//! - The single `ConnectionManager`
//! - The authenticated user, resolved before any connection is opened
//! - A one-time "realtime unavailable" notice for the UI
//! - A background loop that corrects drift between the cached and live
//!   connection flags without ever reconnecting

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::{ConnectionManager, ConnectionState};
use super::UserId;
use crate::api::{Backend, UserIdentity};
use crate::config::RealtimeConfig;
use crate::error::RealtimeResult;
use crate::transport::Connector;

/// User-facing notices
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Realtime updates could not be enabled; reloading may help
    RealtimeUnavailable,
}

/// Cached snapshot of the manager's flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionFlags {
    pub active: bool,
    pub connected: bool,
}

pub struct RealtimeContext {
    config: RealtimeConfig,
    backend: Arc<dyn Backend>,
    manager: Arc<ConnectionManager>,
    user: RwLock<Option<UserIdentity>>,
    cached: Mutex<ConnectionFlags>,
    last_fire: Mutex<Option<Instant>>,
    unavailable_noticed: AtomicBool,
    notice_tx: broadcast::Sender<Notice>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RealtimeContext {
    /// Build the context; rejects a configuration that fails validation
    pub fn new(
        config: RealtimeConfig,
        backend: Arc<dyn Backend>,
        connector: Arc<dyn Connector>,
    ) -> RealtimeResult<Arc<Self>> {
        config.validate()?;
        let manager = ConnectionManager::new(config.clone(), connector);
        let (notice_tx, _) = broadcast::channel(16);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Arc::new(Self {
            config,
            backend,
            manager,
            user: RwLock::new(None),
            cached: Mutex::new(ConnectionFlags::default()),
            last_fire: Mutex::new(None),
            unavailable_noticed: AtomicBool::new(false),
            notice_tx,
            shutdown_tx,
        }))
    }

    /// Resolve the current user. Activation is refused until this succeeds.
    pub async fn initialize(&self) -> RealtimeResult<UserIdentity> {
        let user = self.backend.current_user().await?;
        info!("Signed in as {} ({})", user.username, user.id);
        *self.user.write() = Some(user.clone());
        Ok(user)
    }

    pub fn user(&self) -> Option<UserIdentity> {
        self.user.read().clone()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user.read().as_ref().map(|u| u.id)
    }

    /// Fire-and-forget activation; returns whether an attempt was spawned
    pub fn activate_connection(self: &Arc<Self>) -> bool {
        if self.user_id().is_none() || self.manager.is_connected() {
            return false;
        }

        {
            let mut last_fire = self.last_fire.lock();
            let now = Instant::now();
            if let Some(last) = *last_fire {
                if now.saturating_duration_since(last) < self.config.activation_debounce {
                    return false;
                }
            }
            *last_fire = Some(now);
        }

        let ctx = self.clone();
        tokio::spawn(async move {
            ctx.activate_connection_with_promise().await;
        });
        true
    }

    /// Await activation of the shared connection.
    ///
    /// Safe to call concurrently; the manager debounces handshakes.
    pub async fn activate_connection_with_promise(self: &Arc<Self>) -> bool {
        if self.user_id().is_none() {
            debug!("Activation refused: no authenticated user");
            return false;
        }

        let connected = self.manager.activate().await;
        *self.cached.lock() = ConnectionFlags {
            active: self.manager.is_active(),
            connected,
        };

        if !connected && !self.manager.is_active() {
            self.notice_unavailable();
        }
        connected
    }

    fn notice_unavailable(&self) {
        if self.unavailable_noticed.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("Realtime updates unavailable, falling back to polling; reload to retry");
        let _ = self.notice_tx.send(Notice::RealtimeUnavailable);
    }

    pub fn is_client_active(&self) -> bool {
        self.manager.is_active()
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    /// Flags as last observed by the context
    pub fn cached_flags(&self) -> ConnectionFlags {
        *self.cached.lock()
    }

    /// Align the cached flags with the manager; returns whether they drifted
    pub fn reconcile(&self) -> bool {
        let live = ConnectionFlags {
            active: self.manager.is_active(),
            connected: self.manager.is_connected(),
        };

        let mut cached = self.cached.lock();
        if *cached == live {
            return false;
        }
        info!(
            "Connection state drift corrected: active {} -> {}, connected {} -> {}",
            cached.active, live.active, cached.connected, live.connected
        );
        *cached = live;
        true
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.manager.state_changes()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notice_tx.subscribe()
    }

    /// Start the periodic flag reconciliation
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let ctx = self.clone();
        let reconcile_interval = ctx.config.context_reconcile_interval;

        let reconcile_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(reconcile_interval);
            let mut shutdown = ctx.shutdown_tx.subscribe();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        ctx.reconcile();
                    }
                    _ = shutdown.recv() => {
                        info!("Reconcile task shutting down");
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            reconcile_task: reconcile_handle,
        }
    }

    /// Stop background tasks and close the connection
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.manager.deactivate();
    }
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub reconcile_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = self.reconcile_task.await;
    }
}
