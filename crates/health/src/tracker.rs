use localnet_topology::HealthStatus;

/// Per-node health state machine.
///
/// `Unknown` moves to `Healthy` on success or `Unhealthy` on failure;
/// `threshold` consecutive failures make the node `Unreachable`; any success
/// makes it `Healthy` again.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    consecutive_failures: u32,
    status: HealthStatus,
    threshold: u32,
}

impl HealthTracker {
    /// Creates a tracker in `Unknown`. A zero threshold is treated as one.
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            status: HealthStatus::Unknown,
            threshold: threshold.max(1),
        }
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> HealthStatus {
        self.status
    }

    /// Failures since the last success.
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Records one poll outcome and returns the new status.
    pub fn observe(&mut self, success: bool) -> HealthStatus {
        if success {
            self.consecutive_failures = 0;
            self.status = HealthStatus::Healthy;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.status = if self.consecutive_failures >= self.threshold {
                HealthStatus::Unreachable
            } else {
                HealthStatus::Unhealthy
            };
        }
        self.status
    }

    /// Jumps straight to `Unreachable`, e.g. when the process exited.
    pub fn force_unreachable(&mut self) -> HealthStatus {
        self.consecutive_failures = self.consecutive_failures.max(self.threshold);
        self.status = HealthStatus::Unreachable;
        self.status
    }

    /// Forgets everything, e.g. after a respawn.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.status = HealthStatus::Unknown;
    }
}
