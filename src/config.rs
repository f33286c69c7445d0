use crate::utils::trim_trailing_slash;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const ENV_WS_URL: &str = "XIOT_WS_URL";
pub const ENV_PI_URL: &str = "XIOT_PI_URL";
pub const ENV_API_URL: &str = "XIOT_API_URL";
pub const ENV_API_TOKEN: &str = "XIOT_API_TOKEN";

pub const DEFAULT_WS_URL: &str = "ws://localhost:8000/ws/sensors/";
pub const DEFAULT_PI_URL: &str = "http://192.168.137.110:8080";
pub const DEFAULT_API_URL: &str = "http://localhost:8000/api";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Telemetry stream settings. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub url: String,
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub max_reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// `None` disables the periodic ping.
    pub heartbeat_interval_ms: Option<u64>,
    pub stale_timeout_ms: i64,
    pub eviction_grace_ms: i64,
    /// `None` disables the background staleness sweep.
    pub sweep_interval_ms: Option<u64>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            reconnect_base_delay_ms: 1000,
            max_reconnect_attempts: 5,
            max_reconnect_delay_ms: 30_000,
            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: Some(30_000),
            stale_timeout_ms: 5000,
            eviction_grace_ms: 60_000,
            sweep_interval_ms: Some(1000),
        }
    }
}

impl TelemetryConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Edge multimedia server settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub base_url: String,
    pub probe_interval_ms: u64,
    pub probe_backoff_interval_ms: u64,
    pub probe_failure_threshold: u32,
    pub probe_timeout_ms: u64,
    pub push_open_timeout_ms: u64,
    pub push_chunk_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_PI_URL.to_string(),
            probe_interval_ms: 10_000,
            probe_backoff_interval_ms: 30_000,
            probe_failure_threshold: 3,
            probe_timeout_ms: 3000,
            push_open_timeout_ms: 5000,
            push_chunk_ms: 100,
        }
    }
}

impl MediaConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn push_open_timeout(&self) -> Duration {
        Duration::from_millis(self.push_open_timeout_ms)
    }

    pub fn push_chunk(&self) -> Duration {
        Duration::from_millis(self.push_chunk_ms)
    }
}

/// Display command endpoint settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub api_url: String,
    pub token: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token: None,
            request_timeout_ms: 5000,
        }
    }
}

impl DisplayConfig {
    pub fn command_url(&self) -> String {
        format!("{}/lcd/command/", trim_trailing_slash(&self.api_url))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub telemetry: TelemetryConfig,
    pub media: MediaConfig,
    pub display: DisplayConfig,
}

impl ClientConfig {
    /// Defaults overridden by the `XIOT_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Reads a JSON config file; missing sections keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Applies endpoint overrides from `lookup`, which maps a variable name to
    /// its value. Empty values are ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_WS_URL) {
            self.telemetry.url = url;
        }
        if let Some(url) = get(ENV_PI_URL) {
            self.media.base_url = trim_trailing_slash(&url).to_string();
        }
        if let Some(url) = get(ENV_API_URL) {
            self.display.api_url = trim_trailing_slash(&url).to_string();
        }
        if let Some(token) = get(ENV_API_TOKEN) {
            self.display.token = Some(token);
        }
        self
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
