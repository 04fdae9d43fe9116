//! Top-level error type.

use cohort_compartment::CompartmentError;
use cohort_flush::FlushError;
use cohort_membership::MembershipError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CohortError {
    #[error("Compartment error: {0}")]
    Compartment(#[from] CompartmentError),

    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),

    #[error("Flush error: {0}")]
    Flush(#[from] FlushError),
}

pub type Result<T> = std::result::Result<T, CohortError>;
