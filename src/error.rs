//! Error types for node, player and cache operations.

use thiserror::Error;

/// Main error type for the library.
#[derive(Debug, Error)]
pub enum Error {
    /// The node rejected our credential (401/403). Fatal for that node.
    #[error("authorization rejected by node {0}")]
    Authorization(String),

    /// No connected node is available for selection. Callers may retry.
    #[error("no available node")]
    NodeUnavailable,

    /// The node exhausted its reconnect budget or was removed.
    #[error("node {0} has failed")]
    NodeFailed(String),

    /// Command issued to a player in a state that does not allow it.
    #[error("invalid player state: {0}")]
    InvalidState(String),

    /// The node did not answer within the configured limit.
    #[error("timed out: {0}")]
    Timeout(String),

    /// REST call failed.
    #[error("request failed: {0}")]
    Request(String),

    /// Malformed frame or payload.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The node answered a track load with an error result.
    #[error("track load failed: {message}")]
    LoadFailed {
        message: String,
        severity: crate::sources::Severity,
    },

    /// Filter kind that is not part of the catalog.
    #[error("unknown filter kind: {0}")]
    UnknownFilter(String),

    /// Filter parameters out of range.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Encoded track blob could not be decoded.
    #[error("track decode error: {0}")]
    Decode(String),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the failure is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Request(_) | Error::Timeout(_) | Error::WebSocket(_) | Error::NodeUnavailable => true,
            _ => false,
        }
    }

    /// Owned copy for callers sharing one failure. Wrapped library errors
    /// are flattened to their message.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::Authorization(s) => Error::Authorization(s.clone()),
            Error::NodeUnavailable => Error::NodeUnavailable,
            Error::NodeFailed(s) => Error::NodeFailed(s.clone()),
            Error::InvalidState(s) => Error::InvalidState(s.clone()),
            Error::Timeout(s) => Error::Timeout(s.clone()),
            Error::Request(s) => Error::Request(s.clone()),
            Error::InvalidData(s) => Error::InvalidData(s.clone()),
            Error::LoadFailed { message, severity } => Error::LoadFailed {
                message: message.clone(),
                severity: *severity,
            },
            Error::UnknownFilter(s) => Error::UnknownFilter(s.clone()),
            Error::InvalidFilter(s) => Error::InvalidFilter(s.clone()),
            Error::Decode(s) => Error::Decode(s.clone()),
            Error::WebSocket(e) => Error::Request(e.to_string()),
            Error::Http(e) => Error::Request(e.to_string()),
            Error::Json(e) => Error::InvalidData(e.to_string()),
        }
    }
}
