use std::time::Duration;

use localnet_health::MonitorConfig;
use localnet_process::{DEFAULT_STARTUP_GRACE, OutputMode};

/// Retry policy for transient spawn failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnRetry {
    /// Retries after the first attempt.
    pub retries: u32,

    /// Delay before the first retry; doubled for each further one.
    pub initial_backoff: Duration,
}

impl Default for SpawnRetry {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

impl SpawnRetry {
    /// Sets the retry count.
    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the initial backoff.
    #[must_use]
    pub const fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Delay before retry number `retry` (zero based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Supervisor and network manager settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_timeout: Duration,

    /// How long `start` waits for the instance to become ready.
    pub readiness_timeout: Duration,

    /// Window during which an exit counts as a startup failure.
    pub startup_grace: Duration,

    /// Transient spawn failure policy.
    pub retry: SpawnRetry,

    /// Health monitor settings.
    pub monitor: MonitorConfig,

    /// Node output capture.
    pub output: OutputMode,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
            readiness_timeout: Duration::from_secs(30),
            startup_grace: DEFAULT_STARTUP_GRACE,
            retry: SpawnRetry::default(),
            monitor: MonitorConfig::default(),
            output: OutputMode::default(),
        }
    }
}

impl SupervisorConfig {
    /// Sets the stop timeout.
    #[must_use]
    pub const fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Sets the readiness timeout.
    #[must_use]
    pub const fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    /// Sets the startup grace window.
    #[must_use]
    pub const fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: SpawnRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the monitor settings.
    #[must_use]
    pub const fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Sets how node output is captured.
    #[must_use]
    pub const fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }
}
