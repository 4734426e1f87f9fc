use replistate_common::{ErrorKind, ProtocolError, RemoteError};
use thiserror::Error;

use crate::transport::TransportError;

/// Errors that can occur in the replication node library
#[derive(Error, Debug)]
pub enum SyncError {
    /// A replica attempted to mutate a client read-only state
    #[error("Access denied: state '{0}' is read-only for replicas")]
    AccessDenied(String),

    /// Inbound action name has no handler
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// Addressed state does not exist
    #[error("State not found: {0}")]
    NotFound(String),

    /// RPC or broadcast channel failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Bounded wait elapsed
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Replica could not mirror the authority at startup
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    /// Wire encoding error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Value (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias using SyncError
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Classify this error for a failure reply
    pub fn to_remote(&self) -> RemoteError {
        let kind = match self {
            SyncError::AccessDenied(_) => ErrorKind::AccessDenied,
            SyncError::UnknownAction(_) => ErrorKind::UnknownAction,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::Protocol(_) | SyncError::Serialization(_) => ErrorKind::Malformed,
            _ => ErrorKind::Internal,
        };
        let message = match self {
            SyncError::AccessDenied(id) | SyncError::NotFound(id) => id.clone(),
            SyncError::UnknownAction(name) => name.clone(),
            other => other.to_string(),
        };
        RemoteError::new(kind, message)
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err.kind {
            ErrorKind::AccessDenied => SyncError::AccessDenied(err.message),
            ErrorKind::UnknownAction => SyncError::UnknownAction(err.message),
            ErrorKind::NotFound => SyncError::NotFound(err.message),
            ErrorKind::Malformed => SyncError::Protocol(err.message),
            ErrorKind::Internal => SyncError::Other(err.message),
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownAction(name) => SyncError::UnknownAction(name),
            other => SyncError::Protocol(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<String> for SyncError {
    fn from(s: String) -> Self {
        SyncError::Other(s)
    }
}

impl From<&str> for SyncError {
    fn from(s: &str) -> Self {
        SyncError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::AccessDenied("Config".to_string());
        assert_eq!(
            err.to_string(),
            "Access denied: state 'Config' is read-only for replicas"
        );
    }

    #[test]
    fn test_error_from_string() {
        let err: SyncError = "test error".into();
        assert!(matches!(err, SyncError::Other(_)));
    }

    #[test]
    fn test_remote_round_trip_keeps_taxonomy() {
        let denied = SyncError::AccessDenied("Config".into()).to_remote();
        assert_eq!(denied.kind, ErrorKind::AccessDenied);
        assert!(matches!(SyncError::from(denied), SyncError::AccessDenied(id) if id == "Config"));

        let unknown = SyncError::from(ProtocolError::UnknownAction("_bogus".into()));
        assert_eq!(unknown.to_remote().kind, ErrorKind::UnknownAction);
    }

    #[test]
    fn test_transport_error_is_internal_remotely() {
        let err: SyncError = TransportError::Closed.into();
        assert_eq!(err.to_remote().kind, ErrorKind::Internal);
    }
}
