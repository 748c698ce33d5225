//! Fallback polling.
//!
//! Keeps views correct when realtime delivery is absent or stale. Each tick
//! polls only if the connection is down or the target's last confirmed
//! update is older than its staleness threshold. Failures are logged; the
//! next tick is the only retry.

use async_trait::async_trait;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::RealtimeResult;

/// Something a `FallbackPoller` keeps fresh
#[async_trait]
pub trait PollTarget: Send + Sync + 'static {
    fn label(&self) -> &str;

    /// Runs on every tick, whether or not a poll follows
    fn before_poll(&self, _now: Instant) {}

    fn should_poll(&self, now: Instant) -> bool;

    async fn poll(&self) -> RealtimeResult<()>;
}

/// Whether a target with this freshness needs polling
pub fn needs_poll(
    connected: bool,
    last_update: Option<Instant>,
    stale_after: Duration,
    now: Instant,
) -> bool {
    if !connected {
        return true;
    }
    match last_update {
        Some(at) => now.saturating_duration_since(at) > stale_after,
        None => true,
    }
}

/// Interval task driving a `PollTarget`. Stops on `stop`, on drop, or once
/// the target is gone.
pub struct FallbackPoller {
    task: Option<JoinHandle<()>>,
}

impl FallbackPoller {
    pub fn start<T: PollTarget>(target: Weak<T>, interval: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let Some(target) = target.upgrade() else {
                    break;
                };

                let now = Instant::now();
                target.before_poll(now);
                if !target.should_poll(now) {
                    continue;
                }

                debug!("Polling {}", target.label());
                if let Err(e) = target.poll().await {
                    warn!("{} poll failed: {}", target.label(), e);
                }
            }
        });

        Self { task: Some(task) }
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |t| !t.is_finished())
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
