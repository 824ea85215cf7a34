//! Client configuration
//!
//! Defaults match the backend's public deployment. Every field can be
//! overridden from the environment (`from_env`) or a TOML file
//! (`from_toml_file`).

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_API_URL: &str = "http://localhost:3000";
pub const DEFAULT_WS_URL: &str = "ws://localhost:3000/ws";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the REST API, without trailing slash.
    pub api_url: String,
    /// Full URL of the live signal stream.
    pub ws_url: String,
    /// Bearer token sent on REST and stream requests.
    pub api_token: Option<String>,
    /// Page size of the polled signal list.
    pub signal_limit: usize,
    /// Signal poll interval while the stream is down.
    pub poll_fallback_secs: u64,
    /// Signal poll interval while the stream is up.
    pub poll_connected_secs: u64,
    pub stats_poll_secs: u64,
    /// Coalescing window for streamed signals.
    pub coalesce_ms: u64,
    /// Confidence at or above which an alert fires.
    pub high_confidence: f64,
    pub ping_interval_secs: u64,
    pub exclude_updown: bool,
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            api_token: None,
            signal_limit: 500,
            poll_fallback_secs: 5,
            poll_connected_secs: 60,
            stats_poll_secs: 30,
            coalesce_ms: 50,
            high_confidence: 0.90,
            ping_interval_secs: 15,
            exclude_updown: false,
            request_timeout_secs: 30,
        }
    }
}

impl ClientConfig {
    /// Load from environment (and `.env` if present) with defaults.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from a TOML file; missing keys take their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config.normalized())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("BETTERBOT_API_URL") {
            config.api_url = v;
        }
        if let Some(v) = lookup("BETTERBOT_WS_URL") {
            config.ws_url = v;
        }
        if let Some(v) = lookup("BETTERBOT_API_TOKEN") {
            config.api_token = Some(v).filter(|t| !t.trim().is_empty());
        }
        override_parsed(&lookup, "BETTERBOT_SIGNAL_LIMIT", &mut config.signal_limit);
        override_parsed(&lookup, "BETTERBOT_POLL_FALLBACK_SECS", &mut config.poll_fallback_secs);
        override_parsed(
            &lookup,
            "BETTERBOT_POLL_CONNECTED_SECS",
            &mut config.poll_connected_secs,
        );
        override_parsed(&lookup, "BETTERBOT_STATS_POLL_SECS", &mut config.stats_poll_secs);
        override_parsed(&lookup, "BETTERBOT_COALESCE_MS", &mut config.coalesce_ms);
        override_parsed(&lookup, "BETTERBOT_HIGH_CONFIDENCE", &mut config.high_confidence);
        override_parsed(&lookup, "BETTERBOT_EXCLUDE_UPDOWN", &mut config.exclude_updown);
        override_parsed(&lookup, "BETTERBOT_PING_INTERVAL_SECS", &mut config.ping_interval_secs);
        override_parsed(
            &lookup,
            "BETTERBOT_REQUEST_TIMEOUT_SECS",
            &mut config.request_timeout_secs,
        );

        config.normalized()
    }

    fn normalized(mut self) -> Self {
        while self.api_url.ends_with('/') {
            self.api_url.pop();
        }
        if !(0.0..=1.0).contains(&self.high_confidence) {
            warn!(
                value = self.high_confidence,
                "high_confidence outside [0, 1], using default"
            );
            self.high_confidence = Self::default().high_confidence;
        }
        if self.signal_limit == 0 {
            self.signal_limit = Self::default().signal_limit;
        }
        self
    }

    pub fn poll_fallback_interval(&self) -> Duration {
        Duration::from_secs(self.poll_fallback_secs.max(1))
    }

    pub fn poll_connected_interval(&self) -> Duration {
        Duration::from_secs(self.poll_connected_secs.max(1))
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_poll_secs.max(1))
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => *slot = v,
        Err(_) => warn!(key, value = %raw, "invalid config value, keeping default"),
    }
}
