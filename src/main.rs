//! Headless realtime client.
//!
//! Signs in, keeps the notifications view (and optionally one conversation)
//! synchronized, and logs what arrives until Ctrl-C.

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};

use social_realtime::sync::{ConversationId, ConversationView, NotificationsView};
use social_realtime::{HttpBackend, RealtimeConfig, RealtimeContext, WsConnector};

// ============================================================================
// STATE LOGGING
// ============================================================================

fn spawn_state_logger(ctx: &Arc<RealtimeContext>) {
    let mut states = ctx.state_changes();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!(
                "Connection state: connected={}, connecting={}",
                state.connected, state.connecting
            );
        }
    });

    let mut notices = ctx.notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            warn!("Notice: {:?}", notice);
        }
    });
}

fn conversation_from_env() -> anyhow::Result<Option<ConversationId>> {
    match std::env::var("CONVERSATION_ID") {
        Ok(value) if !value.trim().is_empty() => {
            let id = value
                .trim()
                .parse()
                .with_context(|| format!("CONVERSATION_ID is not a number: {}", value))?;
            Ok(Some(id))
        }
        _ => Ok(None),
    }
}

// ============================================================================
// MAIN
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "social_realtime=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = RealtimeConfig::from_env().context("Invalid configuration")?;
    let conversation_id = conversation_from_env()?;
    let ws_url = config.resolve_ws_url()?;

    info!("social-realtime v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   API: {}", config.api_base_url);
    info!("   Broker: {}", ws_url);
    info!(
        "   Auto-reconnect: {}",
        if config.reconnect.enabled { "on" } else { "off" }
    );

    let backend = Arc::new(HttpBackend::new(&config)?);
    let ctx = RealtimeContext::new(config, backend, Arc::new(WsConnector::new()))?;
    ctx.initialize().await.context("Could not resolve the signed-in user")?;

    spawn_state_logger(&ctx);
    let background = ctx.clone().start_background_tasks();

    let notifications = NotificationsView::open(ctx.clone()).await;
    info!(
        "{} notifications, {} unread",
        notifications.notifications().len(),
        notifications.unread_count()
    );

    let conversation = match conversation_id {
        Some(id) => {
            let view = ConversationView::open(ctx.clone(), id).await;
            info!(
                "Conversation {}: {} messages",
                view.conversation_id(),
                view.messages().len()
            );
            Some(view)
        }
        None => None,
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    let stats = ctx.manager().stats();
    info!(
        "Shutting down (connected={}, {} subscriptions, {} handshakes, up {}s)",
        stats.connected, stats.active_subscriptions, stats.handshake_attempts, stats.uptime_seconds
    );

    if let Some(view) = conversation {
        view.unmount();
    }
    notifications.unmount();
    ctx.shutdown();
    background.wait().await;

    Ok(())
}
