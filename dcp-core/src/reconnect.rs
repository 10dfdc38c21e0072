//! Exponential backoff bookkeeping shared by channel reconnects, per-partition
//! stream retries, and the Fixer's backlog.

use std::time::Duration;

/// Tracks reconnection/retry attempts and calculates the next exponential
/// backoff delay.
///
/// # Example
///
/// ```rust
/// use dcp_core::reconnect::ReconnectState;
/// use std::time::Duration;
///
/// let mut backoff = ReconnectState::new(Duration::from_secs(1), Duration::from_secs(64));
///
/// assert_eq!(backoff.next_delay(), Duration::from_secs(1));
/// assert_eq!(backoff.next_delay(), Duration::from_secs(2));
/// assert_eq!(backoff.next_delay(), Duration::from_secs(4));
///
/// backoff.reset();
/// assert_eq!(backoff.next_delay(), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectState {
    base_interval: Duration,
    max_interval: Duration,
    attempt: u32,
    current_interval: Duration,
}

impl ReconnectState {
    /// Build a new backoff tracker. `base_interval` is the delay returned by
    /// the first `next_delay()` call; `max_interval` caps all later calls.
    pub const fn new(base_interval: Duration, max_interval: Duration) -> Self {
        Self {
            base_interval,
            max_interval,
            attempt: 0,
            current_interval: base_interval,
        }
    }

    /// Build a tracker using the 1s base / 64s cap schedule partition-state
    /// backoff uses.
    pub const fn partition_default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(64))
    }

    /// Delay for the next attempt. Doubles the internal interval (capped at
    /// `max_interval`) on every call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_interval;

        self.attempt += 1;
        self.current_interval = self.base_interval * (1_u32 << self.attempt.min(10));
        if self.current_interval > self.max_interval {
            self.current_interval = self.max_interval;
        }

        delay
    }

    /// Reset after a success: next `next_delay()` call returns `base_interval` again.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_interval = self.base_interval;
    }

    /// Number of attempts made since construction or the last `reset()`.
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

/// Error type surfaced when a retrying operation gives up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectError {
    /// The configured attempt budget was exhausted.
    MaxAttemptsReached { attempts: u32 },
    /// The underlying connection attempt failed.
    ConnectionFailed { message: String },
    /// The retry loop was cancelled (e.g. conductor shutdown).
    Cancelled,
}

impl std::fmt::Display for ReconnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxAttemptsReached { attempts } => {
                write!(f, "maximum reconnection attempts reached: {attempts}")
            }
            Self::ConnectionFailed { message } => {
                write!(f, "connection failed: {message}")
            }
            Self::Cancelled => write!(f, "reconnection cancelled"),
        }
    }
}

impl std::error::Error for ReconnectError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let mut state = ReconnectState::new(Duration::from_secs(1), Duration::from_secs(64));

        assert_eq!(state.next_delay(), Duration::from_secs(1));
        assert_eq!(state.next_delay(), Duration::from_secs(2));
        assert_eq!(state.next_delay(), Duration::from_secs(4));
        assert_eq!(state.next_delay(), Duration::from_secs(8));
        assert_eq!(state.next_delay(), Duration::from_secs(16));
        assert_eq!(state.next_delay(), Duration::from_secs(32));
        assert_eq!(state.next_delay(), Duration::from_secs(64));
        // stays capped
        assert_eq!(state.next_delay(), Duration::from_secs(64));
    }

    #[test]
    fn max_interval_cap_with_small_base() {
        let mut state = ReconnectState::new(Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(state.next_delay(), Duration::from_millis(100));
        assert_eq!(state.next_delay(), Duration::from_millis(200));
        assert_eq!(state.next_delay(), Duration::from_millis(400));
        assert_eq!(state.next_delay(), Duration::from_millis(500));
        assert_eq!(state.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn reset_restores_base_interval() {
        let mut state = ReconnectState::new(Duration::from_secs(1), Duration::from_secs(64));

        state.next_delay();
        state.next_delay();
        state.next_delay();
        assert_eq!(state.attempt(), 3);

        state.reset();
        assert_eq!(state.attempt(), 0);
        assert_eq!(state.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn partition_default_matches_spec_schedule() {
        let mut state = ReconnectState::partition_default();
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(state.next_delay());
        }
        assert_eq!(
            seen,
            vec![1, 2, 4, 8, 16, 32, 64, 64]
                .into_iter()
                .map(Duration::from_secs)
                .collect::<Vec<_>>()
        );
    }
}
