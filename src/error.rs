//! Error types for the booking escrow lifecycle
//!
//! The taxonomy distinguishes caller mistakes, state-precondition failures,
//! ledger rejections, unobserved chain outcomes, and cross-system consistency
//! faults, because each demands a different reaction from the caller.

use thiserror::Error;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Bad parameters; never retried, returned to the caller as-is
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// State precondition not met; caller must refresh and retry deliberately
    #[error("Conflict: {attempted} not allowed from {current}: {reason}")]
    Conflict {
        current: String,
        attempted: String,
        reason: String,
    },

    /// Chain call rejected or reverted; the booking is unchanged
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Chain call outcome unknown within the confirmation window; the caller
    /// must reconcile, not assume failure
    #[error("Confirmation pending: {0}")]
    PendingConfirmation(String),

    /// Off-chain and on-chain records disagree on something immutable;
    /// automated transitions on the booking halt until manually reconciled
    #[error("Consistency fault: {0}")]
    ConsistencyFault(String),

    /// Referenced booking or escrow record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Booking store errors
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Create an invalid-input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>>(current: S, attempted: S, reason: S) -> Self {
        Self::Conflict {
            current: current.into(),
            attempted: attempted.into(),
            reason: reason.into(),
        }
    }

    /// Create a ledger error
    pub fn ledger<S: Into<String>>(msg: S) -> Self {
        Self::Ledger(msg.into())
    }

    /// Create a pending-confirmation error
    pub fn pending_confirmation<S: Into<String>>(msg: S) -> Self {
        Self::PendingConfirmation(msg.into())
    }

    /// Create a consistency fault
    pub fn consistency_fault<S: Into<String>>(msg: S) -> Self {
        Self::ConsistencyFault(msg.into())
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a store error
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// True if the error means the chain outcome is unknown and the booking
    /// should be reconciled before any further attempt
    pub fn needs_reconcile(&self) -> bool {
        matches!(self, Self::PendingConfirmation(_))
    }
}
