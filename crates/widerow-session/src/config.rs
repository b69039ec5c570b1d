//! Configuration for the session manager.

use std::time::Duration;

/// Default idle timeout for sessions (30 minutes).
pub const DEFAULT_MAX_INACTIVE_INTERVAL: Option<Duration> = Some(Duration::from_secs(30 * 60));

/// Configuration for the session manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Idle timeout applied to new sessions.
    /// Sessions whose stored last-accessed time is older than this are expired.
    pub max_inactive_interval: Option<Duration>,

    /// Whether `start` should track every session already present in storage.
    pub load_on_start: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_inactive_interval: DEFAULT_MAX_INACTIVE_INTERVAL,
            load_on_start: false,
        }
    }
}

impl ManagerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the idle timeout.
    pub fn with_max_inactive_interval(mut self, interval: Duration) -> Self {
        self.max_inactive_interval = Some(interval);
        self
    }

    /// Sessions never go idle.
    pub fn without_idle_timeout(mut self) -> Self {
        self.max_inactive_interval = None;
        self
    }

    /// Track persisted sessions on start.
    pub fn with_load_on_start(mut self, enabled: bool) -> Self {
        self.load_on_start = enabled;
        self
    }
}
