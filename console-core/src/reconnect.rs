//! Exponential backoff for console reopen attempts.
//!
//! When a console's transport fails to open (or closes unexpectedly), the
//! engine doesn't retry immediately — a serial adapter that was just
//! unplugged won't reappear in a tight loop, and a misconfigured reset
//! program would otherwise be re-spawned as fast as the CPU allows. This
//! tracks the same doubling-backoff shape the teacher crate used for
//! socket reconnects, parameterized directly on the two durations instead
//! of a socket options bag this crate has no use for.

use std::time::Duration;

/// Backoff state tracker for one console's reopen attempts.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    base_interval: Duration,
    max_interval: Duration,
    attempt: u32,
    current_interval: Duration,
}

impl ReconnectState {
    #[must_use]
    pub const fn new(base_interval: Duration, max_interval: Duration) -> Self {
        Self {
            base_interval,
            max_interval,
            attempt: 0,
            current_interval: base_interval,
        }
    }

    /// Delay before the next reopen attempt; doubles on each call up to
    /// `max_interval`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_interval;

        self.attempt += 1;
        self.current_interval = self.base_interval * (1_u32 << self.attempt.min(10));
        if self.current_interval > self.max_interval {
            self.current_interval = self.max_interval;
        }

        delay
    }

    /// Reset after a successful open.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_interval = self.base_interval;
    }

    #[inline]
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    #[inline]
    #[must_use]
    pub const fn base_interval(&self) -> Duration {
        self.base_interval
    }

    #[inline]
    #[must_use]
    pub const fn max_interval(&self) -> Duration {
        self.max_interval
    }

    #[inline]
    #[must_use]
    pub const fn current_interval(&self) -> Duration {
        self.current_interval
    }
}

impl Default for ReconnectState {
    /// 1 second doubling up to 60 seconds, the daemon's default console
    /// reopen policy.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_each_attempt() {
        let mut state = ReconnectState::new(Duration::from_millis(100), Duration::from_secs(10));
        assert_eq!(state.next_delay(), Duration::from_millis(100));
        assert_eq!(state.attempt(), 1);
        assert_eq!(state.next_delay(), Duration::from_millis(200));
        assert_eq!(state.next_delay(), Duration::from_millis(400));
        assert_eq!(state.next_delay(), Duration::from_millis(800));
    }

    #[test]
    fn caps_at_max_interval() {
        let mut state = ReconnectState::new(Duration::from_millis(100), Duration::from_millis(500));
        state.next_delay();
        state.next_delay();
        state.next_delay();
        assert_eq!(state.next_delay(), Duration::from_millis(500));
        assert_eq!(state.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn reset_returns_to_base() {
        let mut state = ReconnectState::new(Duration::from_millis(100), Duration::from_secs(10));
        state.next_delay();
        state.next_delay();
        state.reset();
        assert_eq!(state.attempt(), 0);
        assert_eq!(state.next_delay(), Duration::from_millis(100));
    }
}
