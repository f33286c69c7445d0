use crate::config::TelemetryConfig;
use std::time::Duration;

/// Attempt-scaled reconnect backoff.
///
/// Attempt `n` waits `base_delay * n`; once `n` exceeds `max_attempts` there
/// is no further delay and the connection gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&TelemetryConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
            max_attempts: config.max_reconnect_attempts,
            max_delay: Duration::from_millis(config.max_reconnect_delay_ms),
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based), or `None` once the
    /// attempt budget is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        Some(self.base_delay.saturating_mul(attempt).min(self.max_delay))
    }
}
