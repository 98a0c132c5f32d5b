//! Tracking of an in-progress connection attempt sequence.

use super::state::ConnectionState;
use crate::error::ErrorInfo;
use std::time::{Duration, Instant};

/// One failed stop within an attempt sequence.
#[derive(Debug, Clone)]
pub struct AttemptFailedState {
    pub state: ConnectionState,
    pub error: Option<ErrorInfo>,
}

/// A connection attempt sequence: everything from the first Connecting until
/// the connection is established or abandoned.
///
/// The sequence accumulates each failed stop in order, and its age decides
/// when retries give up on the fast path and the connection suspends.
#[derive(Debug)]
pub struct ConnectionAttempt {
    started: Instant,
    failed_states: Vec<AttemptFailedState>,
}

impl ConnectionAttempt {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            failed_states: Vec::new(),
        }
    }

    /// Record a failed stop. Order of recording is preserved.
    pub fn record_failure(&mut self, state: ConnectionState, error: Option<ErrorInfo>) {
        self.failed_states.push(AttemptFailedState { state, error });
    }

    /// Time since this attempt sequence began.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether the sequence has run longer than the suspension window.
    pub fn should_suspend(&self, suspend_after: Duration) -> bool {
        self.elapsed() >= suspend_after
    }

    pub fn failed_states(&self) -> &[AttemptFailedState] {
        &self.failed_states
    }

    pub fn failure_count(&self) -> usize {
        self.failed_states.len()
    }

    /// The most recent failure's error, if any was recorded.
    pub fn last_error(&self) -> Option<&ErrorInfo> {
        self.failed_states.iter().rev().find_map(|f| f.error.as_ref())
    }
}

impl Default for ConnectionAttempt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_preserve_order() {
        let mut attempt = ConnectionAttempt::new();
        attempt.record_failure(ConnectionState::Disconnected, Some(ErrorInfo::disconnected("net down")));
        attempt.record_failure(ConnectionState::Disconnected, None);
        attempt.record_failure(ConnectionState::Suspended, Some(ErrorInfo::suspended("gave up")));

        assert_eq!(attempt.failure_count(), 3);
        let states: Vec<_> = attempt.failed_states().iter().map(|f| f.state).collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Disconnected,
                ConnectionState::Disconnected,
                ConnectionState::Suspended,
            ]
        );
    }

    #[test]
    fn test_last_error_skips_bare_failures() {
        let mut attempt = ConnectionAttempt::new();
        attempt.record_failure(ConnectionState::Disconnected, Some(ErrorInfo::disconnected("first")));
        attempt.record_failure(ConnectionState::Disconnected, None);

        assert_eq!(attempt.last_error().map(|e| e.message.as_str()), Some("first"));
    }

    #[test]
    fn test_should_suspend() {
        let attempt = ConnectionAttempt::new();
        assert!(!attempt.should_suspend(Duration::from_secs(120)));
        assert!(attempt.should_suspend(Duration::ZERO));
    }
}
