//! Client configuration.
//!
//! Defaults point at a local development server. `from_env` layers the
//! `BAYMAX_*` environment variables on top.

use std::time::Duration;
use tracing::warn;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/api";
pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000";

pub const API_URL_ENV: &str = "BAYMAX_API_URL";
pub const WS_URL_ENV: &str = "BAYMAX_WS_URL";
pub const FRAME_INTERVAL_ENV: &str = "BAYMAX_FRAME_INTERVAL_MS";

/// How a supervised session retries a lost channel and buffers frames.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before giving up
    pub max_retries: u8,
    /// Upper bound for the exponential backoff
    pub max_backoff: Duration,
    /// Frames buffered while the channel is unavailable or behind; oldest
    /// dropped first
    pub queue_capacity: usize,
    /// A channel lost sooner than this after opening counts as a failed attempt
    pub min_uptime: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_backoff: Duration::from_secs(30),
            queue_capacity: 8,
            min_uptime: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based): 1s, 2s, 4s, ...
    /// capped at `max_backoff`.
    pub fn backoff(&self, attempt: u8) -> Duration {
        let exponent = u32::from(attempt.saturating_sub(1)).min(31);
        let secs = 1u64 << exponent;
        std::cmp::min(Duration::from_secs(secs), self.max_backoff)
    }
}

/// Endpoints and pacing for a client.
///
/// # Example
///
/// ```ignore
/// use baymax::config::ClientConfig;
///
/// let config = ClientConfig::default()
///     .with_api_url("https://analysis.example.com/api")
///     .with_ws_url("wss://analysis.example.com");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// REST base, including the `/api` prefix
    pub api_url: String,
    /// WebSocket origin; `/ws/analysis/...` is appended per session
    pub ws_url: String,
    /// Pause between frames in the demo stream loop
    pub frame_interval: Duration,
    pub http_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            frame_interval: Duration::from_millis(500),
            http_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Defaults overridden by `BAYMAX_API_URL`, `BAYMAX_WS_URL` and
    /// `BAYMAX_FRAME_INTERVAL_MS`. Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var(API_URL_ENV) {
            config.api_url = url;
        }

        if let Ok(url) = std::env::var(WS_URL_ENV) {
            config.ws_url = url;
        }

        if let Ok(raw) = std::env::var(FRAME_INTERVAL_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.frame_interval = Duration::from_millis(ms),
                _ => warn!("Ignoring invalid {}={:?}", FRAME_INTERVAL_ENV, raw),
            }
        }

        config
    }
}
