//! Concord Error - Unified Error Types
//!
//! Error handling for the synchronization kernel. Protocol-expected outcomes
//! (rejected votes, refused appends, unreachable peers) are not errors and
//! never appear here; this type carries configuration, decode, persistence and
//! service failures that callers must see.
//!
//! Key Features:
//! - Domain-specific variants for CRDT, consensus and gossip failures
//! - Retryable and fatal error classification
//! - Transport failures kept in their own type so call sites can absorb them
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::types::NodeId;
use thiserror::Error;

// =============================================================================
// Transport Errors
// =============================================================================

/// Failures reported by a transport when delivering a request to a peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(NodeId),

    #[error("request timed out")]
    Timeout,

    #[error("transport closed")]
    Closed,

    #[error("peer dropped the request without replying")]
    NoResponse,
}

// =============================================================================
// Error Types
// =============================================================================

/// Unified error type for Concord operations.
#[derive(Error, Debug)]
pub enum SyncError {
    // CRDT errors
    #[error("unknown CRDT type: {0}")]
    UnknownCrdtType(String),

    #[error("CRDT type mismatch for '{id}': local {local}, remote {remote}")]
    CrdtTypeMismatch {
        id: String,
        local: String,
        remote: String,
    },

    #[error("CRDT not found: {0}")]
    CrdtNotFound(String),

    // Wire errors
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("decode error: {0}")]
    Decode(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    // Persistence errors
    #[error("persistence error: {0}")]
    Persistence(String),

    // Consensus errors
    #[error("state machine error: {0}")]
    StateMachine(String),

    #[error("not the leader (leader: {})", leader_label(.leader))]
    NotLeader { leader: Option<NodeId> },

    #[error("proposal at index {0} was superseded before commit")]
    ProposalDropped(u64),

    // Runtime errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("service stopped: {0}")]
    ServiceStopped(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn leader_label(leader: &Option<NodeId>) -> &str {
    leader.as_ref().map(NodeId::as_str).unwrap_or("unknown")
}

// =============================================================================
// Type Aliases
// =============================================================================

/// Result type alias for Concord operations.
pub type Result<T> = std::result::Result<T, SyncError>;

// =============================================================================
// Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}

// =============================================================================
// Error Classification
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be safely retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::NotLeader { .. }
                | SyncError::ProposalDropped(_)
                | SyncError::Transport(_)
                | SyncError::Persistence(_)
        )
    }

    /// Returns true for configuration and decode failures that must never be
    /// papered over with a default.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::UnknownCrdtType(_)
                | SyncError::CrdtTypeMismatch { .. }
                | SyncError::UnknownMessageType(_)
                | SyncError::Decode(_)
                | SyncError::Configuration(_)
        )
    }

    /// Leader hint carried by a `NotLeader` rejection.
    pub fn leader_hint(&self) -> Option<&NodeId> {
        match self {
            SyncError::NotLeader { leader } => leader.as_ref(),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SyncError::UnknownCrdtType("x".into()).is_fatal());
        assert!(!SyncError::UnknownCrdtType("x".into()).is_retryable());
        assert!(SyncError::Transport(TransportError::Timeout).is_retryable());
        assert!(SyncError::NotLeader { leader: None }.is_retryable());
    }

    #[test]
    fn test_json_errors_become_decode_errors() {
        let err: SyncError = serde_json::from_str::<u64>("not json").unwrap_err().into();
        assert!(matches!(err, SyncError::Decode(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_not_leader_display_and_hint() {
        let err = SyncError::NotLeader {
            leader: Some(NodeId::new("n2")),
        };
        assert_eq!(err.to_string(), "not the leader (leader: n2)");
        assert_eq!(err.leader_hint(), Some(&NodeId::new("n2")));

        let err = SyncError::NotLeader { leader: None };
        assert_eq!(err.to_string(), "not the leader (leader: unknown)");
    }
}
