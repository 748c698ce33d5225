//! Client configuration.
//!
//! Values come from the environment (optionally via a `.env` file loaded by
//! the binary) or are built programmatically with the `with_*` setters.

use reqwest::Url;
use std::time::Duration;
use thiserror::Error;

/// Minimum spacing between two activation attempts
pub const ACTIVATION_DEBOUNCE: Duration = Duration::from_secs(2);

/// How long a STOMP handshake may take before it is abandoned
pub const ACTIVATION_TIMEOUT: Duration = Duration::from_secs(15);

/// How often the context compares its cached flags with the live connection
pub const CONTEXT_RECONCILE_INTERVAL: Duration = Duration::from_secs(20);

/// Path of the STOMP endpoint when it is derived from the API origin
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Errors raised while loading or validating configuration
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Timer settings for one fallback poller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Tick interval
    pub interval: Duration,
    /// Poll even while connected once the last confirmed update is this old
    pub stale_after: Duration,
}

impl PollSettings {
    pub const fn new(interval: Duration, stale_after: Duration) -> Self {
        Self {
            interval,
            stale_after,
        }
    }

    /// Defaults for an open conversation
    pub const fn conversation() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(10))
    }

    /// Defaults for the notification counters
    pub const fn notifications() -> Self {
        Self::new(Duration::from_secs(15), Duration::from_secs(30))
    }
}

/// Bounded exponential backoff used after the connection drops.
///
/// Disabled by default: a dropped connection stays down until something
/// explicitly activates it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay: ACTIVATION_DEBOUNCE,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Default policy with reconnection switched on
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// `delay_for` plus up to 20% random jitter, still capped at `max_delay`
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let base = self.delay_for(attempt);
        let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..=0.2));
        (base + jitter).min(self.max_delay)
    }
}

/// Configuration for the realtime client
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Origin of the request/response API, e.g. `https://social.example.com`
    pub api_base_url: String,
    /// Explicit STOMP endpoint; derived from `api_base_url` when absent
    pub ws_url: Option<String>,
    /// Bearer token sent with HTTP requests and the STOMP CONNECT frame
    pub api_token: Option<String>,
    pub activation_debounce: Duration,
    pub activation_timeout: Duration,
    pub context_reconcile_interval: Duration,
    pub conversation_poll: PollSettings,
    pub notification_poll: PollSettings,
    /// Optimistic placeholders without a server echo are dropped after this
    pub optimistic_ttl: Duration,
    /// Typing indicators disappear after this long without a refresh
    pub typing_ttl: Duration,
    /// Timeout for each HTTP request
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            ws_url: None,
            api_token: None,
            activation_debounce: ACTIVATION_DEBOUNCE,
            activation_timeout: ACTIVATION_TIMEOUT,
            context_reconcile_interval: CONTEXT_RECONCILE_INTERVAL,
            conversation_poll: PollSettings::conversation(),
            notification_poll: PollSettings::notifications(),
            optimistic_ttl: Duration::from_secs(15),
            typing_ttl: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl RealtimeConfig {
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Default::default()
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_base_url = lookup("API_BASE_URL").ok_or(ConfigError::MissingVar("API_BASE_URL"))?;
        let mut config = Self::new(api_base_url);

        config.ws_url = lookup("WS_URL").filter(|v| !v.is_empty());
        config.api_token = lookup("API_TOKEN").filter(|v| !v.is_empty());

        if let Some(value) = lookup("REALTIME_AUTO_RECONNECT") {
            config.reconnect.enabled = parse_bool("REALTIME_AUTO_RECONNECT", &value)?;
        }
        if let Some(secs) = parse_secs(&lookup, "CONVERSATION_POLL_SECS")? {
            config.conversation_poll.interval = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "NOTIFICATION_POLL_SECS")? {
            config.notification_poll.interval = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "CONTEXT_RECONCILE_SECS")? {
            config.context_reconcile_interval = secs;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = Some(url.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_conversation_poll(mut self, settings: PollSettings) -> Self {
        self.conversation_poll = settings;
        self
    }

    pub fn with_notification_poll(mut self, settings: PollSettings) -> Self {
        self.notification_poll = settings;
        self
    }

    pub fn with_activation_timeout(mut self, timeout: Duration) -> Self {
        self.activation_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.is_empty() {
            return Err(ConfigError::Invalid("API base URL is empty".to_string()));
        }
        Url::parse(&self.api_base_url).map_err(|_| ConfigError::InvalidValue {
            name: "API_BASE_URL",
            value: self.api_base_url.clone(),
        })?;
        self.resolve_ws_url()?;

        let reconcile = self.context_reconcile_interval;
        if reconcile < Duration::from_secs(15) || reconcile > Duration::from_secs(30) {
            return Err(ConfigError::Invalid(format!(
                "context reconcile interval must be between 15s and 30s, got {:?}",
                reconcile
            )));
        }
        if self.conversation_poll.interval.is_zero() || self.notification_poll.interval.is_zero() {
            return Err(ConfigError::Invalid("poll interval must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Resolve the STOMP endpoint URL.
    ///
    /// An explicit `ws_url` wins; otherwise the API origin is reused with the
    /// scheme switched to `ws`/`wss` and the path set to `/ws`.
    pub fn resolve_ws_url(&self) -> Result<Url, ConfigError> {
        if let Some(explicit) = &self.ws_url {
            let url = Url::parse(explicit).map_err(|_| ConfigError::InvalidValue {
                name: "WS_URL",
                value: explicit.clone(),
            })?;
            return match url.scheme() {
                "ws" | "wss" => Ok(url),
                _ => Err(ConfigError::InvalidValue {
                    name: "WS_URL",
                    value: explicit.clone(),
                }),
            };
        }

        let invalid = || ConfigError::InvalidValue {
            name: "API_BASE_URL",
            value: self.api_base_url.clone(),
        };
        let mut url = Url::parse(&self.api_base_url).map_err(|_| invalid())?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            _ => return Err(invalid()),
        };
        url.set_scheme(scheme).map_err(|_| invalid())?;
        url.set_path(DEFAULT_WS_PATH);
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        }),
    }
}

fn parse_secs<F>(lookup: &F, name: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}
