//! Core data models for the booking escrow lifecycle
//!
//! This module contains the booking record, its status state machine, the
//! supported settlement tokens, and the read-only mirror of on-chain escrow
//! state.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::EscrowError, EscrowResult};

/// Booking status state machine enum
///
/// The in-flight variants mark a chain call that has been submitted but not
/// yet finalized off-chain. A crash mid-call leaves the marker behind, so
/// recovery goes through reconciliation instead of guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    /// Booking requested, no funds moved
    Pending,
    /// Escrow create submitted to the ledger, outcome not yet recorded
    ConfirmingPayment,
    /// Funds deposited into escrow
    Confirmed,
    /// Release submitted to the ledger, outcome not yet recorded
    Releasing,
    /// Refund submitted to the ledger, outcome not yet recorded
    Refunding,
    /// Funds released to the seller
    Completed,
    /// Funds refunded to the buyer (or cancelled before any deposit)
    Cancelled,
}

impl BookingStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Check if a chain call is in flight for this booking
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::ConfirmingPayment | Self::Releasing | Self::Refunding
        )
    }

    /// Check if escrow funds are currently held for this booking
    pub fn funds_locked(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Releasing | Self::Refunding)
    }

    /// Check if this state allows submitting payment
    pub fn can_confirm(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Check if this state allows feedback submission
    pub fn can_submit_feedback(&self) -> bool {
        matches!(self, Self::Confirmed)
    }

    /// Check if this state allows releasing funds
    pub fn can_release(&self) -> bool {
        matches!(self, Self::Confirmed)
    }

    /// Check if this state allows refunding funds
    pub fn can_refund(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }

    /// Check if this state allows raising a dispute
    pub fn can_dispute(&self) -> bool {
        matches!(self, Self::Confirmed)
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::ConfirmingPayment => "confirming_payment",
            Self::Confirmed => "confirmed",
            Self::Releasing => "releasing",
            Self::Refunding => "refunding",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Supported settlement tokens
///
/// Token decimals are resolved here, once. Everything that crosses the ledger
/// boundary is an integer minor-unit quantity derived through this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    TokenA,
    TokenB,
}

impl Currency {
    /// Number of decimal places in this token's minor unit
    pub fn decimals(&self) -> u32 {
        match self {
            Self::TokenA => 7,
            Self::TokenB => 6,
        }
    }

    /// Get currency as string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenA => "TOKEN_A",
            Self::TokenB => "TOKEN_B",
        }
    }

    /// Parse currency from string
    pub fn parse(s: &str) -> EscrowResult<Self> {
        match s {
            "TOKEN_A" => Ok(Self::TokenA),
            "TOKEN_B" => Ok(Self::TokenB),
            other => Err(EscrowError::invalid_input(format!(
                "Unsupported currency: {other}"
            ))),
        }
    }

    /// Convert a decimal amount to integer minor units
    ///
    /// Rejects non-positive amounts and amounts with more fractional digits
    /// than the token carries; rounding here would make the off-chain record
    /// disagree with the on-chain deposit.
    pub fn to_minor_units(&self, amount: Decimal) -> EscrowResult<i128> {
        if amount <= Decimal::ZERO {
            return Err(EscrowError::invalid_input(
                "Amount must be greater than 0",
            ));
        }

        let scaled = amount * Decimal::from(10i64.pow(self.decimals()));
        if scaled.fract() != Decimal::ZERO {
            return Err(EscrowError::invalid_input(format!(
                "Amount {} has more than {} decimal places for {}",
                amount,
                self.decimals(),
                self.as_str()
            )));
        }

        scaled
            .trunc()
            .to_i128()
            .ok_or_else(|| EscrowError::invalid_input(format!("Amount {amount} out of range")))
    }

    /// Convert integer minor units back to a decimal amount
    pub fn from_minor_units(&self, minor: i128) -> Decimal {
        Decimal::from_i128_with_scale(minor, self.decimals())
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Party role for feedback submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedbackRole {
    Buyer,
    Seller,
}

/// Reason attached to a refund request
///
/// `NoShow` and `Expired` are adjudicated by an external collaborator and are
/// the only reasons allowed to refund after feedback has been recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundReason {
    BuyerCancelled,
    SellerCancelled,
    NoShow,
    Expired,
    DisputeResolved,
}

impl RefundReason {
    /// Check if this reason comes from external adjudication
    pub fn is_adjudicated(&self) -> bool {
        matches!(self, Self::NoShow | Self::Expired | Self::DisputeResolved)
    }
}

/// Outcome of external dispute adjudication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeResolution {
    ReleaseToSeller,
    RefundToBuyer,
}

/// On-chain escrow status, as reported by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowStatus {
    /// Funds held by the contract
    Deposited,
    /// Funds transferred to the seller
    Released,
    /// Funds returned to the buyer
    Refunded,
    /// Frozen pending adjudication
    Disputed,
}

impl EscrowStatus {
    /// The booking status this ledger status maps to
    ///
    /// The ledger is authoritative: reconciliation repairs the booking toward
    /// this value whenever the two records have drifted.
    pub fn expected_booking_status(&self) -> BookingStatus {
        match self {
            Self::Deposited | Self::Disputed => BookingStatus::Confirmed,
            Self::Released => BookingStatus::Completed,
            Self::Refunded => BookingStatus::Cancelled,
        }
    }
}

/// Mirror of on-chain escrow state, read-only to the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowRecord {
    /// Opaque reference into the ledger, assigned when the escrow is created
    pub escrow_id: String,
    pub booking_id: Uuid,
    pub buyer: String,
    pub seller: String,
    pub token: Currency,
    pub amount_minor: i128,
    pub status: EscrowStatus,
    pub buyer_feedback: bool,
    pub seller_feedback: bool,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Booking record, owned by the booking store
///
/// Created by a buyer-initiated request, mutated only through orchestrator
/// transitions, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,

    // Parties (identities arrive already verified)
    pub buyer_id: String,
    pub seller_id: String,

    // Amounts; immutable once escrow funds are committed on-chain
    pub amount: Decimal,
    pub currency: Currency,

    // Session schedule from the external scheduling collaborator;
    // mutable until funds are locked
    pub scheduled_at: Option<DateTime<Utc>>,
    pub external_event_ref: Option<String>,

    // Lifecycle
    pub status: BookingStatus,
    pub on_chain_escrow_id: Option<String>,
    pub buyer_feedback_submitted: bool,
    pub seller_feedback_submitted: bool,
    pub disputed: bool,
    pub cancelled_reason: Option<RefundReason>,

    // Set when invariant checking finds an irreconcilable divergence;
    // blocks every automated transition until cleared manually
    pub consistency_fault: Option<String>,

    pub notes: Option<String>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub status_updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Booking {
    /// Create a new pending booking
    pub fn new(
        buyer_id: String,
        seller_id: String,
        amount: Decimal,
        currency: Currency,
        notes: Option<String>,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            buyer_id,
            seller_id,
            amount,
            currency,
            scheduled_at,
            external_event_ref: None,
            status: BookingStatus::Pending,
            on_chain_escrow_id: None,
            buyer_feedback_submitted: false,
            seller_feedback_submitted: false,
            disputed: false,
            cancelled_reason: None,
            consistency_fault: None,
            notes,
            created_at: now,
            status_updated_at: now,
            completed_at: None,
        }
    }

    /// Amount in integer minor units, as deposited on-chain
    pub fn amount_minor(&self) -> EscrowResult<i128> {
        self.currency.to_minor_units(self.amount)
    }

    /// Check whether the given role's feedback flag is set
    pub fn feedback_submitted(&self, role: FeedbackRole) -> bool {
        match role {
            FeedbackRole::Buyer => self.buyer_feedback_submitted,
            FeedbackRole::Seller => self.seller_feedback_submitted,
        }
    }

    /// Set the given role's feedback flag; flags are monotonic
    pub fn record_feedback(&mut self, role: FeedbackRole) {
        match role {
            FeedbackRole::Buyer => self.buyer_feedback_submitted = true,
            FeedbackRole::Seller => self.seller_feedback_submitted = true,
        }
    }

    /// Check whether both parties have submitted feedback
    pub fn both_feedback_submitted(&self) -> bool {
        self.buyer_feedback_submitted && self.seller_feedback_submitted
    }

    /// Check whether any feedback flag is set
    pub fn any_feedback_submitted(&self) -> bool {
        self.buyer_feedback_submitted || self.seller_feedback_submitted
    }

    /// Validate a state transition, without applying it
    pub fn validate_transition(&self, to: BookingStatus) -> EscrowResult<()> {
        let valid = match (self.status, to) {
            (BookingStatus::Pending, BookingStatus::ConfirmingPayment) => true,
            (BookingStatus::Pending, BookingStatus::Cancelled) => true,
            (BookingStatus::ConfirmingPayment, BookingStatus::Confirmed) => true,
            // Revert after a ledger rejection
            (BookingStatus::ConfirmingPayment, BookingStatus::Pending) => true,
            (BookingStatus::Confirmed, BookingStatus::Releasing) => true,
            (BookingStatus::Confirmed, BookingStatus::Refunding) => true,
            (BookingStatus::Releasing, BookingStatus::Completed) => true,
            (BookingStatus::Releasing, BookingStatus::Confirmed) => true,
            (BookingStatus::Refunding, BookingStatus::Cancelled) => true,
            (BookingStatus::Refunding, BookingStatus::Confirmed) => true,
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(EscrowError::conflict(
                self.status.to_string(),
                to.to_string(),
                "invalid state transition".to_string(),
            ))
        }
    }

    /// Check the off-chain record against a ledger record
    ///
    /// Amount, token, and parties are immutable once deposited; any mismatch
    /// is a consistency fault, never silently accepted.
    pub fn check_ledger_identity(&self, record: &EscrowRecord) -> EscrowResult<()> {
        if record.token != self.currency {
            return Err(EscrowError::consistency_fault(format!(
                "Booking {} token mismatch: off-chain {}, on-chain {}",
                self.id,
                self.currency,
                record.token.as_str()
            )));
        }

        let expected_minor = self.amount_minor()?;
        if record.amount_minor != expected_minor {
            return Err(EscrowError::consistency_fault(format!(
                "Booking {} amount mismatch: off-chain {} minor units, on-chain {}",
                self.id, expected_minor, record.amount_minor
            )));
        }

        if record.buyer != self.buyer_id || record.seller != self.seller_id {
            return Err(EscrowError::consistency_fault(format!(
                "Booking {} party mismatch between records",
                self.id
            )));
        }

        Ok(())
    }
}
