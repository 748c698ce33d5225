//! Shared broker connection.
//!
//! `ConnectionManager` owns at most one live STOMP session and provides:
//! - Debounced, timeout-bounded activation with a single in-flight handshake
//! - Fire-and-forget publishing (nothing is queued while disconnected)
//! - Subscriptions routed by subscription id through a DashMap
//! - A watch channel carrying `ConnectionState` to observers
//!
//! A dropped connection leaves the manager idle. Only when the reconnect
//! policy is enabled does it retry with bounded backoff and re-send the
//! SUBSCRIBE frames of every registered route.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::RealtimeConfig;
use crate::transport::{Command, Connector, Endpoint, Frame, Link};

/// Lifecycle phase of the shared connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Connected,
}

/// Observable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    pub connecting: bool,
    pub last_activation_attempt: Option<Instant>,
}

impl ConnectionState {
    fn from_inner(inner: &Inner) -> Self {
        Self {
            connected: inner.phase == ConnectionPhase::Connected,
            connecting: inner.phase == ConnectionPhase::Connecting,
            last_activation_attempt: inner.last_attempt,
        }
    }
}

/// Handle to an active subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: String,
    destination: String,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }
}

/// A MESSAGE frame delivered to a subscription
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub destination: String,
    pub subscription: String,
    pub message_id: Option<String>,
    pub body: Bytes,
}

type Handler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

struct Route {
    destination: String,
    handler: Handler,
}

struct Inner {
    phase: ConnectionPhase,
    last_attempt: Option<Instant>,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    /// Bumped on every attempt and on deactivate; stale tasks compare against it
    generation: u64,
    /// Set while a dropped connection is being re-established
    reconnecting: bool,
}

/// Connection statistics
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub connected: bool,
    pub active_subscriptions: usize,
    pub handshake_attempts: u64,
    pub uptime_seconds: u64,
}

enum Step {
    Done(bool),
    Wait,
    Attempt(u64),
}

/// The single shared broker connection
pub struct ConnectionManager {
    config: RealtimeConfig,
    connector: Arc<dyn Connector>,
    endpoint: Mutex<Option<Endpoint>>,
    inner: Mutex<Inner>,
    /// Routes by subscription id
    routes: DashMap<String, Route>,
    state_tx: watch::Sender<ConnectionState>,
    next_subscription: AtomicU64,
    handshakes: AtomicU64,
    started_at: Instant,
}

impl ConnectionManager {
    pub fn new(config: RealtimeConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let inner = Inner {
            phase: ConnectionPhase::Idle,
            last_attempt: None,
            outbound: None,
            generation: 0,
            reconnecting: false,
        };
        let (state_tx, _) = watch::channel(ConnectionState::from_inner(&inner));

        Arc::new(Self {
            config,
            connector,
            endpoint: Mutex::new(None),
            inner: Mutex::new(inner),
            routes: DashMap::new(),
            state_tx,
            next_subscription: AtomicU64::new(0),
            handshakes: AtomicU64::new(0),
            started_at: Instant::now(),
        })
    }

    /// Resolve the broker endpoint once; returns whether one exists.
    ///
    /// Opens nothing.
    pub fn ensure_client(&self) -> bool {
        let mut endpoint = self.endpoint.lock();
        if endpoint.is_some() {
            return true;
        }

        match self.config.resolve_ws_url() {
            Ok(url) => {
                debug!("Realtime endpoint resolved: {}", url);
                *endpoint = Some(Endpoint::from_url(&url).with_token(self.config.api_token.clone()));
                true
            }
            Err(e) => {
                warn!("Cannot resolve realtime endpoint: {}", e);
                false
            }
        }
    }

    /// Bring the connection up.
    ///
    /// Resolves `true` when connected. Resolves `false` without retrying when
    /// an attempt started within the debounce window, and `false` when the
    /// handshake fails or times out. Callers arriving while an older attempt
    /// is still in flight wait for its outcome.
    pub async fn activate(self: &Arc<Self>) -> bool {
        if !self.ensure_client() {
            return false;
        }

        let step = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let debounced = inner
                .last_attempt
                .map_or(false, |t| now.saturating_duration_since(t) < self.config.activation_debounce);

            match inner.phase {
                ConnectionPhase::Connected => Step::Done(true),
                _ if debounced => Step::Done(false),
                ConnectionPhase::Connecting => Step::Wait,
                ConnectionPhase::Idle => Step::Attempt(self.begin_attempt(&mut inner, now)),
            }
        };

        match step {
            Step::Done(result) => {
                if !result {
                    debug!("Activation skipped: attempted within the last {:?}", self.config.activation_debounce);
                }
                result
            }
            Step::Wait => self.wait_for_attempt().await,
            Step::Attempt(generation) => self.attempt(generation).await,
        }
    }

    fn begin_attempt(&self, inner: &mut Inner, now: Instant) -> u64 {
        inner.phase = ConnectionPhase::Connecting;
        inner.last_attempt = Some(now);
        inner.generation += 1;
        self.state_tx.send_replace(ConnectionState::from_inner(inner));
        inner.generation
    }

    async fn wait_for_attempt(&self) -> bool {
        let mut rx = self.state_tx.subscribe();
        let outcome = tokio::time::timeout(
            self.config.activation_timeout,
            rx.wait_for(|state| !state.connecting),
        )
        .await;

        match outcome {
            Ok(Ok(state)) => state.connected,
            _ => false,
        }
    }

    async fn attempt(self: &Arc<Self>, generation: u64) -> bool {
        let endpoint = self.endpoint.lock().clone();
        let endpoint = match endpoint {
            Some(endpoint) => endpoint,
            None => {
                self.fail_attempt(generation);
                return false;
            }
        };

        let attempt = self.handshakes.fetch_add(1, Ordering::Relaxed) + 1;
        info!("Connecting to realtime broker {} (attempt {})", endpoint.url, attempt);

        let result = tokio::time::timeout(
            self.config.activation_timeout,
            self.connector.connect(&endpoint),
        )
        .await;

        match result {
            Ok(Ok(link)) => self.install(link, generation),
            Ok(Err(e)) => {
                warn!("Realtime connection failed: {}", e);
                self.fail_attempt(generation);
                false
            }
            Err(_) => {
                warn!(
                    "Realtime connection timed out after {:?}",
                    self.config.activation_timeout
                );
                self.fail_attempt(generation);
                false
            }
        }
    }

    fn fail_attempt(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation && inner.phase == ConnectionPhase::Connecting {
            inner.phase = ConnectionPhase::Idle;
            self.state_tx.send_replace(ConnectionState::from_inner(&inner));
        }
    }

    /// Adopt a freshly opened link and start reading from it
    fn install(self: &Arc<Self>, link: Link, generation: u64) -> bool {
        let Link {
            outbound,
            mut inbound,
        } = link;

        {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.phase != ConnectionPhase::Connecting {
                debug!("Discarding superseded connection");
                let _ = outbound.send(Frame::disconnect());
                return false;
            }

            for route in self.routes.iter() {
                let _ = outbound.send(Frame::subscribe(route.key(), &route.destination));
            }
            if !self.routes.is_empty() {
                info!("Re-sent {} subscriptions", self.routes.len());
            }

            inner.phase = ConnectionPhase::Connected;
            inner.outbound = Some(outbound);
            inner.reconnecting = false;
            self.state_tx.send_replace(ConnectionState::from_inner(&inner));
        }
        info!("Realtime connection established");

        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                match manager.upgrade() {
                    Some(manager) => manager.dispatch(frame),
                    None => return,
                }
            }
            if let Some(manager) = manager.upgrade() {
                manager.handle_link_closed(generation);
            }
        });

        true
    }

    fn dispatch(&self, frame: Frame) {
        match frame.command {
            Command::Message => {
                let Some(subscription) = frame.header("subscription") else {
                    debug!("MESSAGE without subscription header dropped");
                    return;
                };

                // Clone the handler so no map guard is held while it runs
                let handler = match self.routes.get(subscription) {
                    Some(route) => route.handler.clone(),
                    None => {
                        debug!("No route for subscription {}", subscription);
                        return;
                    }
                };

                let message = InboundMessage {
                    destination: frame.header("destination").unwrap_or_default().to_string(),
                    subscription: subscription.to_string(),
                    message_id: frame.header("message-id").map(str::to_string),
                    body: frame.body.clone(),
                };
                let destination = message.destination.clone();

                if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                    error!("Subscription handler for {} panicked", destination);
                }
            }
            Command::Error => {
                warn!(
                    "Broker error: {}",
                    frame.header("message").unwrap_or("unspecified")
                );
            }
            Command::Receipt => {
                debug!("Receipt {}", frame.header("receipt-id").unwrap_or_default());
            }
            other => debug!("Ignoring {} frame", other),
        }
    }

    fn handle_link_closed(self: &Arc<Self>, generation: u64) {
        let reconnect = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.phase = ConnectionPhase::Idle;
            inner.outbound = None;
            inner.reconnecting = self.config.reconnect.enabled;
            self.state_tx.send_replace(ConnectionState::from_inner(&inner));
            inner.reconnecting
        };

        if reconnect {
            warn!("Realtime connection lost, reconnecting");
            self.spawn_reconnect();
        } else {
            let dropped = self.routes.len();
            self.routes.clear();
            warn!(
                "Realtime connection lost, not reconnecting automatically ({} subscriptions dropped)",
                dropped
            );
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let policy = self.config.reconnect.clone();
        let manager = Arc::downgrade(self);

        tokio::spawn(async move {
            for attempt in 1..=policy.max_attempts {
                tokio::time::sleep(policy.jittered_delay(attempt)).await;

                let Some(manager) = manager.upgrade() else {
                    return;
                };
                // None while a manual activation is in flight
                let generation = {
                    let mut inner = manager.inner.lock();
                    if !inner.reconnecting {
                        return;
                    }
                    match inner.phase {
                        ConnectionPhase::Connected => return,
                        ConnectionPhase::Connecting => None,
                        ConnectionPhase::Idle => Some(manager.begin_attempt(&mut inner, Instant::now())),
                    }
                };

                let connected = match generation {
                    Some(generation) => {
                        info!("Reconnect attempt {}/{}", attempt, policy.max_attempts);
                        manager.attempt(generation).await
                    }
                    None => {
                        debug!("Reconnect attempt {} deferring to the attempt in flight", attempt);
                        manager.wait_for_attempt().await
                    }
                };
                if connected {
                    return;
                }
            }

            if let Some(manager) = manager.upgrade() {
                manager.give_up_reconnect();
            }
        });
    }

    fn give_up_reconnect(&self) {
        {
            let mut inner = self.inner.lock();
            if !inner.reconnecting || inner.phase != ConnectionPhase::Idle {
                return;
            }
            inner.reconnecting = false;
        }
        let dropped = self.routes.len();
        self.routes.clear();
        warn!(
            "Giving up on realtime reconnection ({} subscriptions dropped)",
            dropped
        );
    }

    /// Send a JSON payload; `false` when not connected. Nothing is queued.
    pub fn publish<T: Serialize + ?Sized>(&self, destination: &str, payload: &T) -> bool {
        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!("Cannot serialize payload for {}: {}", destination, e);
                return false;
            }
        };

        let inner = self.inner.lock();
        match (inner.phase, &inner.outbound) {
            (ConnectionPhase::Connected, Some(tx)) => {
                tx.send(Frame::send_json(destination, body)).is_ok()
            }
            _ => {
                warn!("Not connected, dropping publish to {}", destination);
                false
            }
        }
    }

    /// Subscribe to a destination.
    ///
    /// Performs one activation when not connected. Resolves to a handle only
    /// after the SUBSCRIBE frame was sent, or `None` if the connection could
    /// not be made.
    pub async fn subscribe<F>(self: &Arc<Self>, destination: &str, on_message: F) -> Option<Subscription>
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        if !self.is_connected() && !self.activate().await {
            warn!("Cannot subscribe to {}: not connected", destination);
            return None;
        }

        let id = format!("sub-{}", self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let route = Route {
            destination: destination.to_string(),
            handler: Arc::new(on_message),
        };

        let sent = {
            let inner = self.inner.lock();
            match (inner.phase, &inner.outbound) {
                (ConnectionPhase::Connected, Some(tx)) => {
                    self.routes.insert(id.clone(), route);
                    let sent = tx.send(Frame::subscribe(&id, destination)).is_ok();
                    if !sent {
                        self.routes.remove(&id);
                    }
                    sent
                }
                _ => false,
            }
        };

        if !sent {
            warn!("Cannot subscribe to {}: connection closed", destination);
            return None;
        }

        debug!("Subscribed to {} ({})", destination, id);
        Some(Subscription {
            id,
            destination: destination.to_string(),
        })
    }

    /// Release a subscription; tolerates `None` and already released handles
    pub fn unsubscribe(&self, subscription: impl Into<Option<Subscription>>) -> bool {
        let Some(subscription) = subscription.into() else {
            return false;
        };
        if self.routes.remove(&subscription.id).is_none() {
            debug!("Subscription {} already released", subscription.id);
            return false;
        }

        let inner = self.inner.lock();
        if let (ConnectionPhase::Connected, Some(tx)) = (inner.phase, &inner.outbound) {
            let _ = tx.send(Frame::unsubscribe(&subscription.id));
        }
        debug!("Unsubscribed from {} ({})", subscription.destination, subscription.id);
        true
    }

    /// Close the connection cleanly and drop every route
    pub fn deactivate(&self) {
        let outbound = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.phase = ConnectionPhase::Idle;
            inner.reconnecting = false;
            self.state_tx.send_replace(ConnectionState::from_inner(&inner));
            inner.outbound.take()
        };

        if let Some(tx) = outbound {
            let _ = tx.send(Frame::disconnect());
            info!("Realtime connection closed");
        }
        self.routes.clear();
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_inner(&self.inner.lock())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().phase == ConnectionPhase::Connected
    }

    /// Connecting or connected
    pub fn is_active(&self) -> bool {
        self.inner.lock().phase != ConnectionPhase::Idle
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            connected: self.is_connected(),
            active_subscriptions: self.routes.len(),
            handshake_attempts: self.handshakes.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::testing::{settle, test_config, ConnectMode, ScriptedConnector};
    use std::time::Duration;

    fn manager(connector: &Arc<ScriptedConnector>) -> Arc<ConnectionManager> {
        ConnectionManager::new(test_config(), connector.clone())
    }

    fn collector() -> (Arc<Mutex<Vec<String>>>, impl Fn(InboundMessage) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = move |msg: InboundMessage| {
            sink.lock().push(String::from_utf8_lossy(&msg.body).to_string());
        };
        (seen, handler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_connects_once() {
        let connector = ScriptedConnector::new(ConnectMode::Accept);
        let manager = manager(&connector);

        assert!(manager.activate().await);
        assert!(manager.is_connected());
        assert!(manager.activate().await);
        assert_eq!(connector.attempts(), 1);

        let state = manager.state();
        assert!(state.connected && !state.connecting);
        assert!(state.last_activation_attempt.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activation_debounce() {
        let connector = ScriptedConnector::new(ConnectMode::Refuse);
        let manager = manager(&connector);

        let (first, second) = tokio::join!(manager.activate(), manager.activate());
        assert!(!first && !second);
        assert!(!manager.activate().await);
        assert_eq!(connector.attempts(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!manager.activate().await);
        assert_eq!(connector.attempts(), 2);
        assert!(!manager.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_caller_waits_for_inflight_attempt() {
        let connector = ScriptedConnector::new(ConnectMode::Accept);
        let gate = connector.gate();
        let manager = manager(&connector);

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.activate().await }
        });
        settle().await;
        assert!(manager.state().connecting);

        tokio::time::advance(Duration::from_secs(3)).await;
        let second = tokio::spawn({
            let manager = manager.clone();
            async move { manager.activate().await }
        });
        settle().await;

        gate.notify_one();
        assert!(first.await.unwrap());
        assert!(second.await.unwrap());
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activation_times_out() {
        let connector = ScriptedConnector::new(ConnectMode::Hang);
        let manager = manager(&connector);

        assert!(!manager.activate().await);
        let state = manager.state();
        assert!(!state.connected && !state.connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_endpoint_never_connects() {
        let connector = ScriptedConnector::new(ConnectMode::Accept);
        let config = RealtimeConfig::new("ftp://social.example.com");
        let manager = ConnectionManager::new(config, connector.clone());

        assert!(!manager.ensure_client());
        assert!(!manager.activate().await);
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_requires_connection() {
        let connector = ScriptedConnector::new(ConnectMode::Accept);
        let manager = manager(&connector);

        assert!(!manager.publish("/app/chat.typing/7", &serde_json::json!({"typing": true})));

        manager.activate().await;
        assert!(manager.publish("/app/chat.typing/7", &serde_json::json!({"typing": true})));

        let mut remote = connector.take_remote().unwrap();
        let sent = remote.sent_to("/app/chat.typing/7");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body_text().unwrap(), r#"{"typing":true}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriptions_are_independent() {
        let connector = ScriptedConnector::new(ConnectMode::Accept);
        let manager = manager(&connector);

        let (first_seen, first_handler) = collector();
        let (second_seen, second_handler) = collector();
        let first = manager.subscribe("/topic/chat/7", first_handler).await.unwrap();
        let second = manager.subscribe("/topic/chat/7", second_handler).await.unwrap();
        assert_ne!(first.id(), second.id());

        let mut remote = connector.take_remote().unwrap();
        remote.deliver_to(first.id(), "/topic/chat/7", r#"{"n":1}"#);
        remote.deliver_to(second.id(), "/topic/chat/7", r#"{"n":1}"#);
        settle().await;
        assert_eq!(first_seen.lock().len(), 1);
        assert_eq!(second_seen.lock().len(), 1);

        assert!(manager.unsubscribe(first.clone()));
        assert!(!manager.unsubscribe(first.clone()));
        assert!(!manager.unsubscribe(None));

        remote.deliver_to(first.id(), "/topic/chat/7", r#"{"n":2}"#);
        remote.deliver_to(second.id(), "/topic/chat/7", r#"{"n":2}"#);
        settle().await;
        assert_eq!(first_seen.lock().len(), 1);
        assert_eq!(second_seen.lock().len(), 2);

        let unsubscribes = remote
            .pump()
            .iter()
            .filter(|f| f.command == Command::Unsubscribe)
            .count();
        assert_eq!(unsubscribes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_without_connection() {
        let connector = ScriptedConnector::new(ConnectMode::Refuse);
        let manager = manager(&connector);

        let (_, handler) = collector();
        assert!(manager.subscribe("/topic/chat/7", handler).await.is_none());
        assert_eq!(manager.stats().active_subscriptions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_keeps_reader_alive() {
        let connector = ScriptedConnector::new(ConnectMode::Accept);
        let manager = manager(&connector);

        let bad = manager
            .subscribe("/topic/chat/1", |_msg: InboundMessage| panic!("boom"))
            .await
            .unwrap();
        let (seen, handler) = collector();
        let good = manager.subscribe("/topic/chat/2", handler).await.unwrap();

        let mut remote = connector.take_remote().unwrap();
        remote.deliver_to(bad.id(), "/topic/chat/1", "{}");
        remote.deliver_to(good.id(), "/topic/chat/2", "{}");
        settle().await;

        assert_eq!(seen.lock().len(), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_without_reconnect() {
        let connector = ScriptedConnector::new(ConnectMode::Accept);
        let manager = manager(&connector);

        let (_, handler) = collector();
        let sub = manager.subscribe("/topic/chat/7", handler).await.unwrap();
        drop(connector.take_remote());
        settle().await;

        assert!(!manager.is_active());
        assert_eq!(manager.stats().active_subscriptions, 0);
        assert!(!manager.unsubscribe(sub));

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resends_subscriptions() {
        let connector = ScriptedConnector::new(ConnectMode::Accept);
        let policy = ReconnectPolicy {
            enabled: true,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts: 3,
        };
        let manager = ConnectionManager::new(test_config().with_reconnect(policy), connector.clone());

        let (seen, handler) = collector();
        let sub = manager.subscribe("/topic/chat/7", handler).await.unwrap();
        drop(connector.take_remote());
        settle().await;
        assert!(!manager.is_connected());

        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        assert!(manager.is_connected());
        assert_eq!(connector.attempts(), 2);

        let mut remote = connector.take_remote().unwrap();
        assert_eq!(remote.subscription_id("/topic/chat/7").as_deref(), Some(sub.id()));
        remote.deliver_to(sub.id(), "/topic/chat/7", "{}");
        settle().await;
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let connector = ScriptedConnector::new(ConnectMode::Accept);
        let policy = ReconnectPolicy {
            enabled: true,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            max_attempts: 2,
        };
        let manager = ConnectionManager::new(test_config().with_reconnect(policy), connector.clone());

        let (_, handler) = collector();
        manager.subscribe("/topic/chat/7", handler).await.unwrap();
        connector.set_mode(ConnectMode::Refuse);
        drop(connector.take_remote());

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;

        assert!(!manager.is_active());
        assert_eq!(manager.stats().active_subscriptions, 0);
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_when_manual_attempt_fails() {
        let connector = ScriptedConnector::new(ConnectMode::Accept);
        let policy = ReconnectPolicy {
            enabled: true,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            max_attempts: 2,
        };
        let manager = ConnectionManager::new(test_config().with_reconnect(policy), connector.clone());

        let (_, handler) = collector();
        manager.subscribe("/topic/chat/7", handler).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        drop(connector.take_remote());
        settle().await;
        assert!(!manager.is_connected());

        // A manual activation lands in the first backoff window and fails
        connector.set_mode(ConnectMode::Refuse);
        connector.gate();
        let manual = tokio::spawn({
            let manager = manager.clone();
            async move { manager.activate().await }
        });
        settle().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        connector.ungate();
        assert!(!manual.await.unwrap());

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;

        assert!(!manager.is_active());
        assert_eq!(manager.stats().active_subscriptions, 0);
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_sends_disconnect() {
        let connector = ScriptedConnector::new(ConnectMode::Accept);
        let manager = manager(&connector);
        let mut states = manager.state_changes();

        manager.activate().await;
        assert!(states.borrow_and_update().connected);

        manager.deactivate();
        assert!(!manager.is_active());
        assert!(!states.borrow_and_update().connected);

        let mut remote = connector.take_remote().unwrap();
        assert_eq!(
            remote.pump().last().map(|f| f.command),
            Some(Command::Disconnect)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_during_handshake_discards_link() {
        let connector = ScriptedConnector::new(ConnectMode::Accept);
        let gate = connector.gate();
        let manager = manager(&connector);

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.activate().await }
        });
        settle().await;
        manager.deactivate();
        gate.notify_one();

        assert!(!pending.await.unwrap());
        assert!(!manager.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_never_connecting_and_connected() {
        let connector = ScriptedConnector::new(ConnectMode::Accept);
        let gate = connector.gate();
        let manager = manager(&connector);
        let mut states = manager.state_changes();

        let watcher = tokio::spawn(async move {
            let mut observed = Vec::new();
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                observed.push(state);
                if state.connected {
                    break;
                }
            }
            observed
        });

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.activate().await }
        });
        settle().await;
        gate.notify_one();
        assert!(pending.await.unwrap());

        let observed = watcher.await.unwrap();
        assert!(observed.iter().all(|s| !(s.connected && s.connecting)));
        assert!(observed.last().unwrap().connected);
    }
}
