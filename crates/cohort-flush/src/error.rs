//! Error types for the flush protocol.

use cohort_membership::{MembershipError, WireError};
use thiserror::Error;

/// Errors raised by flush operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlushError {
    #[error("Flush to membership {0} is in progress")]
    FlushInProgress(u64),

    #[error("Local node is not the coordinator of the membership")]
    NotCoordinator,

    #[error("No membership installed")]
    NoMembership,

    #[error("Invalid membership: {0}")]
    InvalidMembership(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
}

pub type Result<T> = std::result::Result<T, FlushError>;
