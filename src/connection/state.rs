//! Connection state management.

use crate::error::ErrorInfo;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Initial state, before the first connection attempt
    Initialized,
    /// A connection attempt is in progress
    Connecting,
    /// Connection has been fully established
    Connected,
    /// Connection dropped; a retry is scheduled
    Disconnected,
    /// Retries have run past the suspension window; retrying at a slower cadence
    Suspended,
    /// A deliberate close is in progress
    Closing,
    /// Connection deliberately closed
    Closed,
    /// Unrecoverable failure; no further retries
    Failed,
}

impl ConnectionState {
    /// Check if currently connecting or connected
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Whether publishes may be queued for later delivery in this state.
    /// Suspended is deliberately excluded until queueing is re-enabled by
    /// an explicit reconnect.
    pub fn can_queue_messages(&self) -> bool {
        matches!(self, Self::Initialized | Self::Connecting | Self::Disconnected)
    }

    /// Whether a retry timer may be armed from this state
    pub fn is_retrying(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Suspended)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Initialized
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialized => write!(f, "initialized"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Suspended => write!(f, "suspended"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Notification delivered to connection state listeners.
#[derive(Debug, Clone)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    /// Why the transition happened, when an error drove it
    pub reason: Option<ErrorInfo>,
    /// Delay until the next automatic retry, when one is scheduled
    pub retry_in: Option<Duration>,
}

impl ConnectionStateChange {
    pub fn new(previous: ConnectionState, current: ConnectionState) -> Self {
        Self {
            previous,
            current,
            reason: None,
            retry_in: None,
        }
    }

    pub fn with_reason(mut self, reason: ErrorInfo) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_retry_in(mut self, retry_in: Duration) -> Self {
        self.retry_in = Some(retry_in);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_queue_messages() {
        assert!(ConnectionState::Initialized.can_queue_messages());
        assert!(ConnectionState::Connecting.can_queue_messages());
        assert!(ConnectionState::Disconnected.can_queue_messages());

        assert!(!ConnectionState::Connected.can_queue_messages());
        assert!(!ConnectionState::Suspended.can_queue_messages());
        assert!(!ConnectionState::Closing.can_queue_messages());
        assert!(!ConnectionState::Closed.can_queue_messages());
        assert!(!ConnectionState::Failed.can_queue_messages());
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::Failed.is_terminal());
        assert!(!ConnectionState::Suspended.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Suspended.to_string(), "suspended");
    }
}
