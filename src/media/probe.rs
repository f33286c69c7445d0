use crate::config::MediaConfig;
use std::time::Duration;

/// Adaptive health-check schedule.
///
/// Probes run at the normal interval until `failure_threshold` consecutive
/// failures, then at the backoff interval. One success restores the normal
/// interval.
#[derive(Debug, Clone)]
pub struct ReachabilityProbe {
    consecutive_failures: u32,
    interval: Duration,
    backoff_interval: Duration,
    failure_threshold: u32,
}

impl ReachabilityProbe {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            consecutive_failures: 0,
            interval: Duration::from_millis(config.probe_interval_ms),
            backoff_interval: Duration::from_millis(config.probe_backoff_interval_ms),
            failure_threshold: config.probe_failure_threshold,
        }
    }

    /// Records one probe outcome and returns the delay until the next probe.
    pub fn record(&mut self, success: bool) -> Duration {
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
        self.next_interval()
    }

    pub fn next_interval(&self) -> Duration {
        if self.consecutive_failures >= self.failure_threshold {
            self.backoff_interval
        } else {
            self.interval
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
