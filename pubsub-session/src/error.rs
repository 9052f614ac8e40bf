//! Error taxonomy for the client, the transport boundary, and publishing.

/// Errors returned by client construction and configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure of a single subscribe poll.
///
/// These never reach the caller directly; the session loop turns them into
/// status events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Credentials were rejected. Fatal: the session halts.
    #[error("access denied (status {status}): {message}")]
    Auth { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    /// The broker answered with something that could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl TransportError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Auth { .. })
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_decode() {
            TransportError::Malformed(e.to_string())
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

/// Failure of a publish request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("network error: {0}")]
    Network(String),

    #[error("publish timed out")]
    Timeout,

    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("payload encode error: {0}")]
    Encode(String),

    /// The client was shut down before the publish completed.
    #[error("publish cancelled by client shutdown")]
    Cancelled,
}

impl PublishError {
    /// Only transient failures may be resent unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Network(_) | PublishError::Timeout)
    }
}

impl From<reqwest::Error> for PublishError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PublishError::Timeout
        } else {
            PublishError::Network(e.to_string())
        }
    }
}
