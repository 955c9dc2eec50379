//! Error taxonomy shared by the coordinator, the relay and the wire protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::delta::DeltaError;
use crate::graph::GraphError;
use crate::protocol::ProtocolError;

/// Machine-readable error codes carried in `error` events and `refErrors`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// Malformed or unsupported protocol usage.
    BadRequest,
    /// Authentication failed or missing.
    Unauthorized,
    /// A commit references a parent the store does not know.
    UnknownRef,
    /// The backend failed to persist a commit.
    StorageFailure,
    /// A batch references a commit before defining it.
    OutOfOrder,
    /// Transport-level failure.
    Network,
    /// The peer went away.
    Disconnected,
    /// Unexpected fault.
    Internal,
}

impl ErrorCode {
    /// Per-commit codes never terminate a connection.
    pub fn is_per_commit(&self) -> bool {
        matches!(
            self,
            ErrorCode::UnknownRef | ErrorCode::StorageFailure | ErrorCode::OutOfOrder
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "bad-request",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::UnknownRef => "unknown-ref",
            ErrorCode::StorageFailure => "storage-failure",
            ErrorCode::OutOfOrder => "out-of-order",
            ErrorCode::Network => "network",
            ErrorCode::Disconnected => "disconnected",
            ErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the client side of the engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("coordinator is shut down")]
    Closed,
    #[error("no tokio runtime available")]
    NoRuntime,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Delta(#[from] DeltaError),
    #[error("repository error: {0}")]
    Repository(String),
    #[error("remote error ({code}): {message}")]
    Remote { code: ErrorCode, message: String },
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Closed => ErrorCode::Disconnected,
            SyncError::NoRuntime => ErrorCode::Internal,
            SyncError::Protocol(_) => ErrorCode::BadRequest,
            SyncError::Graph(GraphError::OutOfOrder(_)) => ErrorCode::OutOfOrder,
            SyncError::Graph(GraphError::UnknownRef { .. }) => ErrorCode::UnknownRef,
            SyncError::Graph(_) | SyncError::Delta(_) => ErrorCode::Internal,
            SyncError::Repository(_) => ErrorCode::StorageFailure,
            SyncError::Remote { code, .. } => *code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_names() {
        let json = serde_json::to_string(&ErrorCode::UnknownRef).unwrap();
        assert_eq!(json, "\"unknown-ref\"");
        let parsed: ErrorCode = serde_json::from_str("\"storage-failure\"").unwrap();
        assert_eq!(parsed, ErrorCode::StorageFailure);
        assert_eq!(ErrorCode::OutOfOrder.to_string(), "out-of-order");
    }

    #[test]
    fn test_per_commit_codes() {
        assert!(ErrorCode::UnknownRef.is_per_commit());
        assert!(ErrorCode::StorageFailure.is_per_commit());
        assert!(!ErrorCode::Unauthorized.is_per_commit());
        assert!(!ErrorCode::BadRequest.is_per_commit());
    }

    #[test]
    fn test_sync_error_codes() {
        assert_eq!(SyncError::Closed.code(), ErrorCode::Disconnected);
        let err = SyncError::Graph(GraphError::OutOfOrder("a".into()));
        assert_eq!(err.code(), ErrorCode::OutOfOrder);
        assert!(err.to_string().contains("a"));
    }
}
