//! Custom error types for the backup agent.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Remote endpoint unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Remote protocol error: {0}")]
    RemoteProtocol(String),

    #[error("Changed-block tracking unavailable: {0}")]
    TrackingUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Worker fault: {0}")]
    WorkerFault(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    /// Errors worth issuing the same call again after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::RemoteUnavailable(_) | AgentError::Connection(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::NotFound(_) => ErrorKind::NotFound,
            AgentError::AccessDenied(_) => ErrorKind::AccessDenied,
            AgentError::RemoteUnavailable(_) => ErrorKind::RemoteUnavailable,
            AgentError::Connection(_) => ErrorKind::Connection,
            AgentError::RemoteProtocol(_) => ErrorKind::RemoteProtocol,
            AgentError::TrackingUnavailable(_) => ErrorKind::TrackingUnavailable,
            AgentError::Storage(_) => ErrorKind::Storage,
            AgentError::Cancelled => ErrorKind::Cancelled,
            AgentError::WorkerFault(_) => ErrorKind::WorkerFault,
            AgentError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            AgentError::Config(_) => ErrorKind::Config,
            AgentError::Io(_) => ErrorKind::Io,
            AgentError::Http(_) => ErrorKind::Http,
            AgentError::Serialization(_) => ErrorKind::Serialization,
        }
    }
}

/// Serializable classification of an [`AgentError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AccessDenied,
    RemoteUnavailable,
    Connection,
    RemoteProtocol,
    TrackingUnavailable,
    Storage,
    Cancelled,
    WorkerFault,
    InvalidTransition,
    Config,
    Io,
    Http,
    Serialization,
}

impl ErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::RemoteUnavailable | ErrorKind::Connection)
    }
}

/// Error carried inside block outcomes and reports. Cloneable, unlike the
/// error it was taken from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&AgentError> for ErrorDetail {
    fn from(err: &AgentError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(AgentError::RemoteUnavailable("503".into()).is_transient());
        assert!(AgentError::Connection("reset".into()).is_transient());
        assert!(!AgentError::AccessDenied("nope".into()).is_transient());
        assert!(!AgentError::Storage("disk full".into()).is_transient());
        assert!(!AgentError::TrackingUnavailable("off".into()).is_transient());
    }

    #[test]
    fn test_error_detail_keeps_kind_and_message() {
        let err = AgentError::Storage("disk full".into());
        let detail = ErrorDetail::from(&err);
        assert_eq!(detail.kind, ErrorKind::Storage);
        assert_eq!(detail.message, "Storage error: disk full");
        assert!(!detail.kind.is_transient());

        let json = serde_json::to_string(&detail).unwrap();
        assert!(json.contains("\"storage\""));
    }
}
