//! Unified error types for the kernel core

use thiserror::Error;

/// Errors surfaced by the executive and the page subsystem.
///
/// Invariant violations and stack-sentinel corruption are not errors;
/// they panic. Swap exhaustion also panics at the point where a slot is
/// needed (this is a teaching kernel); the `SwapExhausted` variant exists
/// for the swap table's own allocation API.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernError {
    #[error("out of memory")]
    AllocationFailure,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("mapping already present")]
    AlreadyMapped,

    #[error("no mapping present")]
    NotMapped,

    #[error("swap space exhausted")]
    SwapExhausted,

    #[error("device i/o failed")]
    IoFailure,

    #[error("kernel stack overflow detected")]
    StackOverflowDetected,

    #[error("operation invalid in this interrupt context")]
    WrongInterruptContext,
}

pub type Result<T> = core::result::Result<T, KernError>;
