//! Consecutive-timeout tracking for the cluster connection.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{ClusterError, ClusterResult};

#[derive(Debug, Default)]
struct HealthState {
    consecutive_timeouts: u32,
    unhealthy_since: Option<Instant>,
}

/// Marks the cluster unhealthy after too many consecutive timeouts.
///
/// While unhealthy, [`check`](Self::check) fails fast. Once the cooldown has
/// passed, calls are let through again; the first success clears the state,
/// another timeout restarts the cooldown.
#[derive(Debug)]
pub struct HostHealth {
    max_timeouts: u32,
    cooldown: Duration,
    state: Mutex<HealthState>,
}

impl HostHealth {
    pub fn new(max_timeouts: u32, cooldown: Duration) -> Self {
        Self {
            max_timeouts: max_timeouts.max(1),
            cooldown,
            state: Mutex::new(HealthState::default()),
        }
    }

    /// Fail fast while unhealthy and still cooling down.
    pub fn check(&self) -> ClusterResult<()> {
        let state = self.state.lock();
        match state.unhealthy_since {
            Some(since) if since.elapsed() < self.cooldown => {
                Err(ClusterError::Unhealthy(state.consecutive_timeouts))
            }
            _ => Ok(()),
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_timeouts = 0;
        state.unhealthy_since = None;
    }

    pub fn record_timeout(&self) {
        let mut state = self.state.lock();
        state.consecutive_timeouts = state.consecutive_timeouts.saturating_add(1);
        if state.consecutive_timeouts >= self.max_timeouts {
            if state.unhealthy_since.is_none() {
                warn!(
                    consecutive_timeouts = state.consecutive_timeouts,
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "Cluster marked unhealthy"
                );
            }
            state.unhealthy_since = Some(Instant::now());
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state.lock().unhealthy_since.is_none()
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.state.lock().consecutive_timeouts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_threshold_marks_unhealthy() {
        let health = HostHealth::new(3, Duration::from_secs(60));
        health.record_timeout();
        health.record_timeout();
        assert!(health.check().is_ok());

        health.record_timeout();
        assert!(!health.is_healthy());
        assert!(matches!(health.check(), Err(ClusterError::Unhealthy(3))));
    }

    #[test]
    fn test_success_resets() {
        let health = HostHealth::new(2, Duration::from_secs(60));
        health.record_timeout();
        health.record_success();
        health.record_timeout();

        assert!(health.is_healthy());
        assert_eq!(health.consecutive_timeouts(), 1);
    }

    #[test]
    fn test_cooldown_lets_one_call_through() {
        let health = HostHealth::new(1, Duration::from_millis(20));
        health.record_timeout();
        assert!(health.check().is_err());

        thread::sleep(Duration::from_millis(40));
        assert!(health.check().is_ok());

        health.record_success();
        assert!(health.is_healthy());
    }
}
