use std::fmt;

use thiserror::Error;

/// Coarse failure classes used to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Timeouts, resets, throttling responses. Retried with backoff.
    TransientNetwork,
    /// Malformed or unexpected framing. The offending message is dropped.
    Protocol,
    /// Invalid session token or negotiation value. Triggers a credential refresh.
    Auth,
    /// Unusable input (bad job link, missing detail fields). Skipped, not retried.
    Structural,
    /// Missing configuration or collaborator. Stops the affected component.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Auth => "auth",
            ErrorKind::Structural => "structural",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Application-wide error types for jobpilot.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed before a status was received.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Platform responded with a non-success status.
    #[error("HTTP {status}: {message}")]
    HttpStatus {
        status: u16,
        message: String,
        retryable: bool,
    },

    /// LLM API call failed.
    #[error("LLM error (HTTP {status_code}): {message}")]
    LlmError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Malformed or unexpected wire data.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Credentials were rejected by the backend.
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// The login session itself is no longer valid; refreshing the
    /// negotiation token will not help until new cookies arrive.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Job link does not carry the identifiers the platform APIs need.
    #[error("Invalid job link: {0}")]
    InvalidJobLink(String),

    /// Required field missing from a platform response.
    #[error("Missing field: {0}")]
    MissingField(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A queue or signal peer went away.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// A batch was submitted while the previous one was still in flight.
    #[error("Batch {pending} is still in flight")]
    BatchInFlight { pending: u64 },

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Classifies the error into the recovery taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => ErrorKind::TransientNetwork,
            AppError::HttpStatus { retryable, .. } | AppError::LlmError { retryable, .. } => {
                if *retryable {
                    ErrorKind::TransientNetwork
                } else {
                    ErrorKind::Fatal
                }
            }
            AppError::HttpError(msg) => {
                if msg.contains("timeout") || msg.contains("connect") || msg.contains("reset") {
                    ErrorKind::TransientNetwork
                } else {
                    ErrorKind::Protocol
                }
            }
            AppError::ProtocolError(_) | AppError::SerializationError(_) => ErrorKind::Protocol,
            AppError::AuthError(_) | AppError::SessionExpired(_) => ErrorKind::Auth,
            AppError::InvalidJobLink(_) | AppError::MissingField(_) => ErrorKind::Structural,
            AppError::ConfigError(_)
            | AppError::ChannelClosed(_)
            | AppError::BatchInFlight { .. }
            | AppError::Generic(_) => ErrorKind::Fatal,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientNetwork
    }

    /// Maps a non-success HTTP status onto an error. 403 is what the
    /// platform answers when it throttles a client, so it is retryable.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        AppError::HttpStatus {
            status,
            message: message.into(),
            retryable: status == 403 || status == 429 || status >= 500,
        }
    }
}
