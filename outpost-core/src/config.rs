use std::time::Duration;

use crate::retry::RetryPolicy;

/// Engine configuration: probe cadence, drain cadence and queue limits
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a reachability probe result is reused
    pub probe_cache_window: Duration,

    /// Interval of the background reachability probe
    pub probe_interval: Duration,

    /// Upper bound on a single reachability probe
    pub probe_timeout: Duration,

    /// Maximum drift between the remote `updated_at` and the base timestamp of
    /// a queued update before the update is treated as conflicting
    pub update_conflict_tolerance: Duration,

    /// Artificial latency added to reads served locally while offline
    pub offline_latency: Duration,

    /// Interval of the background queue drain
    pub drain_interval: Duration,

    /// Maximum number of pending mutations
    pub max_queue_size: usize,

    /// Backoff policy for entries that fail with a transient error
    pub retry_policy: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            probe_cache_window: Duration::from_secs(5),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(3),
            update_conflict_tolerance: Duration::from_secs(1),
            offline_latency: Duration::ZERO,
            drain_interval: Duration::from_secs(30),
            max_queue_size: 10_000,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe_cache_window(mut self, window: Duration) -> Self {
        self.probe_cache_window = window;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_update_conflict_tolerance(mut self, tolerance: Duration) -> Self {
        self.update_conflict_tolerance = tolerance;
        self
    }

    pub fn with_offline_latency(mut self, latency: Duration) -> Self {
        self.offline_latency = latency;
        self
    }

    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.probe_timeout.is_zero() {
            return Err("probe_timeout must be greater than 0".to_string());
        }

        if self.probe_interval.is_zero() {
            return Err("probe_interval must be greater than 0".to_string());
        }

        if self.drain_interval.is_zero() {
            return Err("drain_interval must be greater than 0".to_string());
        }

        if self.max_queue_size == 0 {
            return Err("max_queue_size must be greater than 0".to_string());
        }

        if self.retry_policy.max_attempts == 0 {
            return Err("retry_policy.max_attempts must be greater than 0".to_string());
        }

        if self.retry_policy.backoff_multiplier < 1.0 {
            return Err("retry_policy.backoff_multiplier must be at least 1.0".to_string());
        }

        Ok(())
    }
}
