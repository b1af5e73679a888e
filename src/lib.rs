//! Booking escrow lifecycle engine
//!
//! This crate coordinates a two-party booking payment across two systems of
//! record: an off-chain booking store and an on-chain escrow contract. It
//! implements:
//! - The booking state machine (pending -> confirmed -> completed/cancelled)
//!   with explicit in-flight markers for crash recovery
//! - A confirmation-awaiting ledger client for the escrow contract
//! - A feedback/timeout auto-release policy and background sweep
//! - Reconciliation that treats the ledger as authoritative

pub mod directory;
pub mod error;
pub mod ledger;
pub mod models;
pub mod node;
pub mod notifier;
pub mod orchestrator;
pub mod policy;
pub mod settings;
pub mod store;
pub mod sweep;

use error::EscrowError;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
