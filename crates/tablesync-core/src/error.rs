//! Error types for tablesync

use thiserror::Error;

use crate::types::PeerId;

/// Main error type for tablesync operations
///
/// Only application-level failures surface here. Peer loss is a status
/// transition (see [`crate::sync::PeerStatus`]) and a failed send on an
/// already-open link is logged, never returned.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The preferred rendezvous identity is already claimed by another process
    #[error("Identity unavailable: {0}")]
    IdentityUnavailable(PeerId),

    /// The remote never answered, could not be dialed, or the link closed mid-handshake
    #[error("Connection unreachable: {0}")]
    ConnectionUnreachable(String),

    /// The host explicitly declined the join request (reason shown verbatim)
    #[error("Connection rejected: {0}")]
    ConnectionRejected(String),

    /// No pending join request with this id (already resolved or never seen)
    #[error("Join request not found: {0}")]
    JoinRequestNotFound(String),

    /// Operation is only valid while acting as host
    #[error("Operation requires the host role")]
    NotHost,

    /// List item or token was not found in the document
    #[error("Item not found: {0}")]
    ItemNotFound(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Automerge document error
    #[error("Automerge error: {0}")]
    Automerge(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// Transport binding or link error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The session event loop has stopped
    #[error("Session closed")]
    SessionClosed,
}

impl SyncError {
    /// Whether retrying the same call without new input can succeed
    ///
    /// A rejected join needs a new decision from the host, so it is not
    /// retryable. Unreachable peers and taken identities are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionUnreachable(_)
                | SyncError::IdentityUnavailable(_)
                | SyncError::Network(_)
        )
    }
}

impl From<automerge::AutomergeError> for SyncError {
    fn from(err: automerge::AutomergeError) -> Self {
        SyncError::Automerge(err.to_string())
    }
}

impl From<postcard::Error> for SyncError {
    fn from(err: postcard::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::ConnectionRejected("table is full".to_string());
        assert_eq!(format!("{}", err), "Connection rejected: table is full");

        let err = SyncError::IdentityUnavailable(PeerId::from("room-1"));
        assert_eq!(format!("{}", err), "Identity unavailable: room-1");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let sync_err: SyncError = io_err.into();
        assert!(matches!(sync_err, SyncError::Io(_)));
    }

    #[test]
    fn test_rejection_is_not_retryable() {
        assert!(!SyncError::ConnectionRejected("no".into()).is_retryable());
        assert!(SyncError::ConnectionUnreachable("timeout".into()).is_retryable());
        assert!(SyncError::IdentityUnavailable(PeerId::from("x")).is_retryable());
    }
}
