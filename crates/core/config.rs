//! Configuration types for queue workers, locks and cron.

use std::time::Duration;

/// Configuration for a [`QueueWorker`](crate::QueueWorker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// How often the in-flight job's claim timestamp is refreshed.
    pub heartbeat_interval: Duration,
    /// Minimum time between two reconciliation sweeps.
    pub retry_interval: Duration,
    /// Age after which a claimed job is considered stuck and re-queued.
    pub retry_timeout: Duration,
    /// Pause after a store error in the consumer loop.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(60),
            retry_timeout: Duration::from_secs(180),
            error_backoff: Duration::from_secs(2),
        }
    }
}

impl WorkerConfig {
    /// Create a new builder.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::new()
    }
}

/// Builder for WorkerConfig.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set the minimum interval between reconciliation sweeps.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    /// Set the staleness timeout for claimed jobs.
    pub fn retry_timeout(mut self, timeout: Duration) -> Self {
        self.config.retry_timeout = timeout;
        self
    }

    /// Set the back-off applied after consumer loop errors.
    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.config.error_backoff = backoff;
        self
    }

    /// Build the WorkerConfig.
    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

/// Lease and polling settings for blocking lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Lease length written with the lock key.
    pub lease: Duration,
    /// Sleep between failed acquisition attempts in `start`.
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl LockOptions {
    /// Options with the given lease and the default poll interval.
    pub fn with_lease(lease: Duration) -> Self {
        Self {
            lease,
            ..Default::default()
        }
    }

    /// Set the poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Configuration for the cron driver loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronConfig {
    /// How often `Cron::run_until` evaluates the registered schedules.
    pub tick_interval: Duration,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.retry_interval, Duration::from_secs(60));
        assert_eq!(config.retry_timeout, Duration::from_secs(180));
        assert_eq!(config.error_backoff, Duration::from_secs(2));
    }

    #[test]
    fn test_worker_config_builder_fluent_chain() {
        let config = WorkerConfig::builder()
            .heartbeat_interval(Duration::from_secs(1))
            .retry_interval(Duration::from_secs(5))
            .retry_timeout(Duration::from_secs(30))
            .error_backoff(Duration::from_millis(100))
            .build();

        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.retry_interval, Duration::from_secs(5));
        assert_eq!(config.retry_timeout, Duration::from_secs(30));
        assert_eq!(config.error_backoff, Duration::from_millis(100));
    }

    #[test]
    fn test_worker_config_builder_defaults() {
        assert_eq!(WorkerConfigBuilder::new().build(), WorkerConfig::default());
    }

    #[test]
    fn test_lock_options() {
        let options = LockOptions::default();
        assert_eq!(options.lease, Duration::from_millis(2000));
        assert_eq!(options.poll_interval, Duration::from_millis(200));

        let options = LockOptions::with_lease(Duration::from_secs(5))
            .poll_interval(Duration::from_millis(50));
        assert_eq!(options.lease, Duration::from_secs(5));
        assert_eq!(options.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_cron_config_default() {
        assert_eq!(CronConfig::default().tick_interval, Duration::from_secs(1));
    }
}
