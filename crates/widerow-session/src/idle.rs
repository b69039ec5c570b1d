//! Idle-timeout evaluation against stored last-accessed timestamps.

use std::time::Duration;

use crate::operations::MISSING_TIME;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Decides whether a session has been idle for too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdlePolicy {
    /// Idle timeout (None means sessions never go idle).
    timeout: Option<Duration>,
}

impl IdlePolicy {
    /// Create a policy. A zero timeout is treated like no timeout.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout: timeout.filter(|t| !t.is_zero()),
        }
    }

    /// A policy under which nothing expires.
    pub fn never() -> Self {
        Self { timeout: None }
    }

    /// The configured timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whole seconds between `last_accessed` and `now` (both epoch millis).
    pub fn idle_secs(last_accessed: i64, now: i64) -> i64 {
        (now - last_accessed) / 1000
    }

    /// Whether a session last accessed at `last_accessed` has expired at `now`.
    ///
    /// A missing timestamp always counts as expired, whatever the timeout.
    pub fn is_expired(&self, last_accessed: i64, now: i64) -> bool {
        if last_accessed <= MISSING_TIME {
            return true;
        }
        match self.timeout {
            None => false,
            Some(timeout) => {
                let limit = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
                now - last_accessed >= limit
            }
        }
    }
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self::never()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// For whole-second timeouts, expiry flips when the whole idle seconds reach the timeout.
        #[test]
        fn expiry_matches_whole_idle_seconds(
            timeout_secs in 1u64..86_400,
            idle_ms in 0i64..172_800_000,
        ) {
            let now = 1_700_000_000_000;
            let policy = IdlePolicy::new(Some(Duration::from_secs(timeout_secs)));
            let expired = policy.is_expired(now - idle_ms, now);
            prop_assert_eq!(expired, idle_ms / 1000 >= timeout_secs as i64);
        }
    }
}
