//! Allocation engine errors

use routing::{Decisions, RoutingError};
use thiserror::Error;

/// Errors surfaced by allocation passes and cluster-state changes.
///
/// Decider rejections during automatic allocation are routing outcomes, not
/// errors; only explicit commands turn a NO into `CommandRejected`.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// Command refers to something that does not exist or cannot apply
    #[error("Invalid allocation command: {0}")]
    InvalidCommand(String),

    #[error("Allocation command [{command}] rejected: {decisions}")]
    CommandRejected { command: String, decisions: Decisions },

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid index settings: {0}")]
    InvalidSettings(String),

    #[error(transparent)]
    Routing(#[from] RoutingError),
}

impl AllocationError {
    /// Programmer error detected while building the next routing table
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, AllocationError::Routing(RoutingError::InvariantViolation(_)))
    }

    /// Rejected because of caller input rather than cluster state
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            AllocationError::InvalidCommand(_)
                | AllocationError::CommandRejected { .. }
                | AllocationError::IndexNotFound(_)
                | AllocationError::IndexAlreadyExists(_)
                | AllocationError::NodeNotFound(_)
                | AllocationError::InvalidSettings(_)
        )
    }
}
