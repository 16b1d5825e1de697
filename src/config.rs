//! Real-time channel configuration
//!
//! The only required input is the REST API base URL. The broker endpoint is
//! derived from it: same host and port, `http` becomes `ws` (`https`
//! becomes `wss`) and the path is replaced by the broker path.

use anyhow::{anyhow, bail, Context, Result};
use rollcall_shared::{timing, HeartBeat};
use std::time::Duration;
use url::Url;

/// REST API base URL; unset or blank disables the real-time channel
pub const ENV_API_URL: &str = "ROLLCALL_API_URL";
/// Override for the broker path
pub const ENV_WS_PATH: &str = "ROLLCALL_WS_PATH";
/// Override for the reconnect delay in milliseconds
pub const ENV_RECONNECT_MS: &str = "ROLLCALL_RECONNECT_MS";

/// Configuration for the real-time channel
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// REST API base URL the broker URL is derived from
    pub api_base_url: Option<String>,
    /// Path of the broker endpoint on the API host
    pub broker_path: String,
    /// Fixed delay between reconnection attempts
    pub reconnect_delay: Duration,
    /// How often the client sends heart-beats
    pub heartbeat_outgoing: Duration,
    /// How often the client wants heart-beats from the broker
    pub heartbeat_incoming: Duration,
    /// Handshake timeout
    pub connect_timeout: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            broker_path: "/ws".into(),
            reconnect_delay: Duration::from_millis(timing::RECONNECT_DELAY_MS),
            heartbeat_outgoing: Duration::from_millis(timing::HEARTBEAT_OUTGOING_MS),
            heartbeat_incoming: Duration::from_millis(timing::HEARTBEAT_INCOMING_MS),
            connect_timeout: Duration::from_millis(timing::CONNECT_TIMEOUT_MS),
        }
    }
}

impl RealtimeConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self {
            api_base_url: lookup(ENV_API_URL),
            ..Self::default()
        };

        if let Some(path) = lookup(ENV_WS_PATH).filter(|p| !p.trim().is_empty()) {
            config.broker_path = path.trim().to_string();
        }

        if let Some(raw) = lookup(ENV_RECONNECT_MS) {
            let ms: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of milliseconds, got {:?}", ENV_RECONNECT_MS, raw))?;
            config.reconnect_delay = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Set the API base URL (builder style)
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    /// Heart-beat intervals offered in the CONNECT frame
    pub fn heart_beat(&self) -> HeartBeat {
        HeartBeat::new(
            self.heartbeat_outgoing.as_millis() as u64,
            self.heartbeat_incoming.as_millis() as u64,
        )
    }

    /// Broker URL derived from the API base URL.
    ///
    /// `Ok(None)` means the real-time channel is disabled.
    pub fn broker_url(&self) -> Result<Option<Url>> {
        let Some(raw) = self
            .api_base_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
        else {
            return Ok(None);
        };

        let mut url = Url::parse(raw).with_context(|| format!("Invalid API base URL: {}", raw))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => bail!("Unsupported API URL scheme: {}", other),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("Cannot switch {} to {}", raw, scheme))?;

        url.set_path(&self.broker_path);
        url.set_query(None);
        url.set_fragment(None);

        Ok(Some(url))
    }
}
