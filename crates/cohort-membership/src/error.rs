//! Error types for membership and wire encoding.

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by membership operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MembershipError {
    #[error("Invalid group options: {0}")]
    InvalidGroupOptions(String),

    #[error("Membership id mismatch: expected {expected}, got {actual}")]
    MembershipIdMismatch { expected: u64, actual: u64 },

    #[error("Membership belongs to group {actual}, expected {expected}")]
    GroupMismatch { expected: Uuid, actual: Uuid },

    #[error("Node {0} is not a member")]
    UnknownNode(Uuid),

    #[error("Membership cannot be derived by a delta: {0}")]
    NotDerivable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised while decoding wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Invalid UUID presence tag: {0}")]
    InvalidUuidTag(u8),

    #[error("Invalid varint encoding")]
    InvalidVarint,

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Invalid {kind} ordinal: {value}")]
    InvalidOrdinal { kind: &'static str, value: u64 },

    #[error("Invalid membership payload: {0}")]
    InvalidMembershipPayload(String),

    #[error("Unknown message part type: {0}")]
    UnknownPart(Uuid),

    #[error("Invalid data: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, MembershipError>;

pub type WireResult<T> = std::result::Result<T, WireError>;
