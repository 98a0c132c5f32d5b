//! Error types for the Millrace client library.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for Millrace operations
pub type Result<T> = std::result::Result<T, MillraceError>;

/// Well-known service error codes.
///
/// The 40140..40150 range is reserved for token errors; 80xxx codes describe
/// connection-level conditions and 90xxx codes channel-level ones. Locally
/// synthesized errors reuse these codes so callers can treat a client-side
/// timeout the same way as a server-reported one.
pub mod codes {
    /// Generic bad request
    pub const BAD_REQUEST: u32 = 40000;
    /// Authentication rejected
    pub const UNAUTHORIZED: u32 = 40100;
    /// First code of the token-error range (inclusive)
    pub const TOKEN_ERROR_START: u32 = 40140;
    /// End of the token-error range (exclusive)
    pub const TOKEN_ERROR_END: u32 = 40150;
    /// Token expired
    pub const TOKEN_EXPIRED: u32 = 40142;
    /// Operation timed out locally
    pub const OPERATION_TIMEOUT: u32 = 50003;
    /// Connection failed
    pub const CONNECTION_FAILED: u32 = 80000;
    /// Connection suspended after exhausting the retry window
    pub const CONNECTION_SUSPENDED: u32 = 80002;
    /// Connection disconnected
    pub const DISCONNECTED: u32 = 80003;
    /// Connection closed
    pub const CONNECTION_CLOSED: u32 = 80005;
    /// Channel operation failed
    pub const CHANNEL_OPERATION_FAILED: u32 = 90000;
}

/// Structured error reported by the service or synthesized locally.
///
/// Carried on ERROR/DISCONNECTED/CLOSED protocol frames and attached to
/// state-change notifications as the `reason`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Service-specific error code
    pub code: u32,
    /// HTTP status code, when one applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Human-readable description
    #[serde(default)]
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: u32, status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
        }
    }

    /// Connection-level failure synthesized on the client
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(codes::CONNECTION_FAILED, Some(503), message)
    }

    /// Disconnection synthesized on the client (transport drop, network down)
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(codes::DISCONNECTED, Some(503), message)
    }

    /// Connection suspended after the cumulative retry window elapsed
    pub fn suspended(message: impl Into<String>) -> Self {
        Self::new(codes::CONNECTION_SUSPENDED, Some(503), message)
    }

    /// Connection deliberately closed; pending operations are failed with this
    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(codes::CONNECTION_CLOSED, None, message)
    }

    /// Local operation timeout
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(codes::OPERATION_TIMEOUT, Some(504), message)
    }

    /// Channel-level failure
    pub fn channel(message: impl Into<String>) -> Self {
        Self::new(codes::CHANNEL_OPERATION_FAILED, None, message)
    }

    /// True for errors in the token range; a renewable token source may
    /// request a fresh token and retry once before surfacing this.
    pub fn is_token_error(&self) -> bool {
        (codes::TOKEN_ERROR_START..codes::TOKEN_ERROR_END).contains(&self.code)
    }

    /// True when the service rejected our credentials outright.
    pub fn is_unauthorized(&self) -> bool {
        self.status_code == Some(401) || self.code == codes::UNAUTHORIZED
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "[{}:{}] {}", self.code, status, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

/// Main error type for the Millrace client
#[derive(Error, Debug, Clone)]
pub enum MillraceError {
    #[error("Connection error: {message}")]
    ConnectionError { message: String },

    #[error("Authentication error: {message}")]
    AuthError { message: String },

    #[error("Channel error: {message}")]
    ChannelError { message: String },

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Timeout error: {message}")]
    TimeoutError { message: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Transport error: {message}")]
    TransportError { message: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Serialization error: {message}")]
    SerializationError { message: String },

    #[error("Service error: {info}")]
    ServiceError { info: ErrorInfo },
}

impl MillraceError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: msg.into(),
        }
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::AuthError {
            message: msg.into(),
        }
    }

    pub fn channel(msg: impl Into<String>) -> Self {
        Self::ChannelError {
            message: msg.into(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError {
            message: msg.into(),
        }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::TimeoutError {
            message: msg.into(),
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState {
            message: msg.into(),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportError {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: msg.into(),
        }
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::SerializationError {
            message: msg.into(),
        }
    }

    /// The service-reported error attached to this failure, if any.
    pub fn error_info(&self) -> Option<&ErrorInfo> {
        match self {
            Self::ServiceError { info } => Some(info),
            _ => None,
        }
    }
}

impl From<ErrorInfo> for MillraceError {
    fn from(info: ErrorInfo) -> Self {
        Self::ServiceError { info }
    }
}

impl From<serde_json::Error> for MillraceError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<url::ParseError> for MillraceError {
    fn from(err: url::ParseError) -> Self {
        Self::config(format!("Invalid URL: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MillraceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::transport(format!("{:?}", err))
    }
}

impl From<reqwest::Error> for MillraceError {
    fn from(err: reqwest::Error) -> Self {
        Self::auth(format!("Token request failed: {}", err))
    }
}
