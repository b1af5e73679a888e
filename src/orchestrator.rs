//! Escrow Orchestrator - the booking lifecycle state machine
//!
//! Coordinates the booking store and the ledger client so the off-chain
//! status and the on-chain escrow never diverge silently. Every risky
//! transition writes an in-flight marker before its chain call and finalizes
//! after, so a crash mid-call leaves a reconcilable trace instead of a stall.
//!
//! Locking discipline: the per-booking lock is held around decision-and-write
//! only, never across a chain round-trip. Chain calls can block for minutes;
//! the in-flight marker plus the store's guarded writes carry the exclusion
//! across that window. Once a chain call is submitted it is never abandoned:
//! an unobserved outcome surfaces as a pending-confirmation error and is
//! resolved through `reconcile`, with the contract's own idempotency (one
//! escrow per booking id, no transitions out of terminal states) as the
//! backstop against double spends.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    directory::PersonDirectory,
    error::EscrowError,
    ledger::{CreateEscrowParams, LedgerClient},
    models::{
        Booking, BookingStatus, Currency, DisputeResolution, EscrowStatus, FeedbackRole,
        RefundReason,
    },
    notifier::BookingNotifier,
    store::BookingStore,
    EscrowResult,
};

/// Configuration for the escrow orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum booking amount accepted at creation
    pub max_booking_amount: Decimal,
    /// Require the payer in the signer context to be the booking's buyer
    pub require_payer_match: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_booking_amount: Decimal::from(1_000_000),
            require_payer_match: true,
        }
    }
}

/// Booking creation request
#[derive(Debug, Clone)]
pub struct CreateBookingRequest {
    pub buyer_id: String,
    pub seller_id: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub notes: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub external_event_ref: Option<String>,
}

/// Signer context proving the buyer approved the token transfer
#[derive(Debug, Clone)]
pub struct PayerContext {
    pub payer_id: String,
    pub authorization: String,
}

/// Payment confirmation request
#[derive(Debug, Clone)]
pub struct ConfirmPaymentRequest {
    pub booking_id: Uuid,
    pub payer: PayerContext,
}

/// The booking lifecycle state machine
pub struct EscrowOrchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn BookingStore>,
    ledger: Arc<dyn LedgerClient>,
    directory: Arc<dyn PersonDirectory>,
    notifier: Arc<BookingNotifier>,
    /// Per-booking locks serializing decision-and-write sections
    locks: Arc<RwLock<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl EscrowOrchestrator {
    /// Create a new orchestrator over the given collaborators
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn BookingStore>,
        ledger: Arc<dyn LedgerClient>,
        directory: Arc<dyn PersonDirectory>,
        notifier: Arc<BookingNotifier>,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
            directory,
            notifier,
            locks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a new booking in `pending`; no funds move yet
    pub async fn create(&self, request: CreateBookingRequest) -> EscrowResult<Booking> {
        self.validate_create(&request)?;

        if !self.directory.is_seller_eligible(&request.seller_id).await? {
            return Err(EscrowError::invalid_input(format!(
                "Seller {} is not active",
                request.seller_id
            )));
        }

        let mut booking = Booking::new(
            request.buyer_id,
            request.seller_id,
            request.amount,
            request.currency,
            request.notes,
            request.scheduled_at,
        );
        booking.external_event_ref = request.external_event_ref;

        self.store.insert(booking.clone()).await?;

        info!(
            "Created booking {} for {} {}",
            booking.id, booking.amount, booking.currency
        );
        self.notifier.booking_created(&booking).await;

        Ok(booking)
    }

    /// Deposit the booking amount into escrow after the buyer approved the
    /// token transfer
    ///
    /// Safe to retry: the escrow contract keys deposits by booking id, so a
    /// retried call after an unknown outcome can never double-deposit.
    pub async fn confirm_payment(&self, request: ConfirmPaymentRequest) -> EscrowResult<Booking> {
        if request.payer.authorization.trim().is_empty() {
            return Err(EscrowError::invalid_input(
                "Payer authorization cannot be empty",
            ));
        }

        let booking_id = request.booking_id;
        let lock = self.booking_lock(booking_id).await;

        // A leftover in-flight marker means a prior attempt's outcome is
        // unknown; resolve it against the ledger before deciding anything
        let needs_repair = {
            let _guard = lock.lock().await;
            let booking = self.load(booking_id).await?;
            Self::ensure_no_fault(&booking)?;
            booking.status == BookingStatus::ConfirmingPayment
        };
        if needs_repair {
            let repaired = self.reconcile(booking_id).await?;
            if repaired.status == BookingStatus::Confirmed {
                return Ok(repaired);
            }
        }

        let (booking, params) = {
            let _guard = lock.lock().await;
            let booking = self.load(booking_id).await?;
            Self::ensure_no_fault(&booking)?;

            if self.config.require_payer_match && request.payer.payer_id != booking.buyer_id {
                return Err(EscrowError::invalid_input(format!(
                    "Payer {} is not the buyer on booking {}",
                    request.payer.payer_id, booking_id
                )));
            }

            if booking.status == BookingStatus::Confirmed {
                // Retried call; the escrow already exists
                return Ok(booking);
            }
            booking.validate_transition(BookingStatus::ConfirmingPayment)?;

            let params = CreateEscrowParams {
                booking_id,
                buyer: booking.buyer_id.clone(),
                seller: booking.seller_id.clone(),
                token: booking.currency,
                amount_minor: booking.amount_minor()?,
                scheduled_time: booking.scheduled_at,
                notes: booking.notes.clone(),
            };

            let mut marked = booking.clone();
            marked.status = BookingStatus::ConfirmingPayment;
            let marked = self
                .store
                .update_guarded(booking_id, BookingStatus::Pending, marked)
                .await?;
            (marked, params)
        };

        info!("Submitting escrow deposit for booking {}", booking_id);
        let record = match self.ledger.create_escrow(params).await {
            Ok(record) => record,
            Err(e) if e.needs_reconcile() => {
                warn!(
                    "Escrow deposit outcome unknown for booking {}; reconciliation required",
                    booking_id
                );
                return Err(e);
            }
            Err(e) => {
                // Rejected: no funds moved, the booking goes back to pending
                self.clear_in_flight(
                    &lock,
                    booking_id,
                    BookingStatus::ConfirmingPayment,
                    BookingStatus::Pending,
                )
                .await;
                return Err(e);
            }
        };

        // The deposit the ledger echoes back must be exactly what we sent
        if let Err(fault) = booking.check_ledger_identity(&record) {
            let detail = fault_detail(fault);
            let _guard = lock.lock().await;
            let current = self.load(booking_id).await?;
            return Err(self.mark_fault(current, detail).await);
        }

        let _guard = lock.lock().await;
        let mut current = self.load(booking_id).await?;
        match current.status {
            BookingStatus::ConfirmingPayment => {
                current.status = BookingStatus::Confirmed;
                current.on_chain_escrow_id = Some(record.escrow_id.clone());
                let saved = self
                    .store
                    .update_guarded(booking_id, BookingStatus::ConfirmingPayment, current)
                    .await?;
                info!(
                    "Booking {} confirmed with escrow {}",
                    booking_id, record.escrow_id
                );
                self.notifier.payment_confirmed(&saved).await;
                Ok(saved)
            }
            // Reconciliation finalized the deposit before we got back
            BookingStatus::Confirmed => Ok(current),
            other => Err(EscrowError::conflict(
                other.to_string(),
                BookingStatus::Confirmed.to_string(),
                "booking moved during payment confirmation".to_string(),
            )),
        }
    }

    /// Record one party's feedback; re-submission by the same role is a no-op
    ///
    /// When both flags become true the release is triggered immediately;
    /// a failed trigger is left for the background sweep to retry.
    pub async fn submit_feedback(
        &self,
        booking_id: Uuid,
        role: FeedbackRole,
    ) -> EscrowResult<Booking> {
        let lock = self.booking_lock(booking_id).await;

        {
            let _guard = lock.lock().await;
            let booking = self.load(booking_id).await?;
            Self::ensure_no_fault(&booking)?;

            if booking.feedback_submitted(role) {
                return Ok(booking);
            }
            if !booking.status.can_submit_feedback() {
                return Err(EscrowError::conflict(
                    booking.status.to_string(),
                    "feedback".to_string(),
                    "feedback is only accepted while confirmed".to_string(),
                ));
            }
        }

        self.ledger.submit_feedback(booking_id, role).await?;

        let saved = {
            let _guard = lock.lock().await;
            let mut fresh = self.load(booking_id).await?;
            fresh.record_feedback(role);
            let expected = fresh.status;
            let saved = self.store.update_guarded(booking_id, expected, fresh).await?;
            self.notifier.feedback_recorded(&saved, role).await;
            saved
        };

        info!("Recorded {:?} feedback on booking {}", role, booking_id);

        if saved.both_feedback_submitted()
            && !saved.disputed
            && saved.status == BookingStatus::Confirmed
        {
            match self.release(booking_id).await {
                Ok(_) => {}
                Err(EscrowError::Conflict { .. }) => {
                    debug!("Release of booking {} already handled elsewhere", booking_id);
                }
                Err(e) => {
                    warn!(
                        "Auto-release of booking {} failed after feedback: {}; sweep will retry",
                        booking_id, e
                    );
                }
            }
        }

        self.load(booking_id).await
    }

    /// Release escrowed funds to the seller
    ///
    /// Idempotent: a completed booking, or an escrow the ledger already shows
    /// as released, returns success without a second chain call.
    pub async fn release(&self, booking_id: Uuid) -> EscrowResult<Booking> {
        let lock = self.booking_lock(booking_id).await;

        {
            let guard = lock.lock().await;
            let booking = self.load(booking_id).await?;
            Self::ensure_no_fault(&booking)?;

            match booking.status {
                BookingStatus::Completed => return Ok(booking),
                BookingStatus::Releasing => {
                    return Err(EscrowError::conflict(
                        booking.status.to_string(),
                        BookingStatus::Releasing.to_string(),
                        "release already in flight".to_string(),
                    ))
                }
                BookingStatus::Confirmed => {}
                other => {
                    return Err(EscrowError::conflict(
                        other.to_string(),
                        BookingStatus::Releasing.to_string(),
                        "only confirmed bookings can release".to_string(),
                    ))
                }
            }
            if booking.disputed {
                return Err(EscrowError::conflict(
                    booking.status.to_string(),
                    BookingStatus::Releasing.to_string(),
                    "dispute pending adjudication".to_string(),
                ));
            }

            // Ledger truth first: a release that already happened on-chain
            // must finalize here without a second transfer
            let record = match self.ledger.get_booking(booking_id).await? {
                Some(record) => record,
                None => {
                    let detail = format!(
                        "Booking {booking_id} is confirmed but the ledger has no escrow record"
                    );
                    return Err(self.mark_fault(booking, detail).await);
                }
            };
            if let Err(fault) = booking.check_ledger_identity(&record) {
                let detail = fault_detail(fault);
                return Err(self.mark_fault(booking, detail).await);
            }

            match record.status {
                EscrowStatus::Released => {
                    let mut done = booking.clone();
                    done.status = BookingStatus::Completed;
                    done.completed_at = Some(Utc::now());
                    let saved = self
                        .store
                        .update_guarded(booking_id, BookingStatus::Confirmed, done)
                        .await?;
                    info!("Booking {} already released on-chain; finalized", booking_id);
                    self.notifier.released(&saved).await;
                    return Ok(saved);
                }
                EscrowStatus::Refunded => {
                    drop(guard);
                    let repaired = self.reconcile(booking_id).await?;
                    return Err(EscrowError::conflict(
                        repaired.status.to_string(),
                        BookingStatus::Releasing.to_string(),
                        "escrow was already refunded".to_string(),
                    ));
                }
                // Reached only through the adjudication hook, which clears
                // the local dispute flag before routing here
                EscrowStatus::Disputed | EscrowStatus::Deposited => {}
            }

            let mut marked = booking.clone();
            marked.status = BookingStatus::Releasing;
            self.store
                .update_guarded(booking_id, BookingStatus::Confirmed, marked)
                .await?;
        }

        info!("Submitting escrow release for booking {}", booking_id);
        match self.ledger.auto_release_funds(booking_id).await {
            Ok(()) => {}
            Err(e) if e.needs_reconcile() => {
                warn!(
                    "Escrow release outcome unknown for booking {}; reconciliation required",
                    booking_id
                );
                return Err(e);
            }
            Err(e) => {
                self.clear_in_flight(
                    &lock,
                    booking_id,
                    BookingStatus::Releasing,
                    BookingStatus::Confirmed,
                )
                .await;
                return Err(e);
            }
        }

        let _guard = lock.lock().await;
        let mut current = self.load(booking_id).await?;
        match current.status {
            BookingStatus::Releasing => {
                current.status = BookingStatus::Completed;
                current.completed_at = Some(Utc::now());
                let saved = self
                    .store
                    .update_guarded(booking_id, BookingStatus::Releasing, current)
                    .await?;
                info!("Booking {} completed; funds released to seller", booking_id);
                self.notifier.released(&saved).await;
                Ok(saved)
            }
            BookingStatus::Completed => Ok(current),
            other => Err(EscrowError::conflict(
                other.to_string(),
                BookingStatus::Completed.to_string(),
                "booking moved during release".to_string(),
            )),
        }
    }

    /// Refund escrowed funds to the buyer, or cancel an unfunded booking
    ///
    /// After funds are locked, a refund is allowed only before any feedback
    /// exists, unless the reason is externally adjudicated (no-show, expiry,
    /// dispute resolution).
    pub async fn refund(&self, booking_id: Uuid, reason: RefundReason) -> EscrowResult<Booking> {
        let lock = self.booking_lock(booking_id).await;

        {
            let guard = lock.lock().await;
            let booking = self.load(booking_id).await?;
            Self::ensure_no_fault(&booking)?;

            match booking.status {
                BookingStatus::Cancelled => return Ok(booking),
                BookingStatus::Pending => {
                    // No funds moved yet: a pure store transition
                    let mut cancelled = booking.clone();
                    cancelled.status = BookingStatus::Cancelled;
                    cancelled.cancelled_reason = Some(reason);
                    let saved = self
                        .store
                        .update_guarded(booking_id, BookingStatus::Pending, cancelled)
                        .await?;
                    info!("Booking {} cancelled before deposit", booking_id);
                    self.notifier.refunded(&saved, reason).await;
                    return Ok(saved);
                }
                BookingStatus::Refunding => {
                    return Err(EscrowError::conflict(
                        booking.status.to_string(),
                        BookingStatus::Refunding.to_string(),
                        "refund already in flight".to_string(),
                    ))
                }
                BookingStatus::Confirmed => {}
                other => {
                    return Err(EscrowError::conflict(
                        other.to_string(),
                        BookingStatus::Refunding.to_string(),
                        "booking cannot refund from this state".to_string(),
                    ))
                }
            }

            if booking.disputed {
                return Err(EscrowError::conflict(
                    booking.status.to_string(),
                    BookingStatus::Refunding.to_string(),
                    "dispute pending adjudication".to_string(),
                ));
            }
            if booking.any_feedback_submitted() && !reason.is_adjudicated() {
                return Err(EscrowError::conflict(
                    booking.status.to_string(),
                    BookingStatus::Refunding.to_string(),
                    "feedback already submitted".to_string(),
                ));
            }

            let record = match self.ledger.get_booking(booking_id).await? {
                Some(record) => record,
                None => {
                    let detail = format!(
                        "Booking {booking_id} is confirmed but the ledger has no escrow record"
                    );
                    return Err(self.mark_fault(booking, detail).await);
                }
            };
            if let Err(fault) = booking.check_ledger_identity(&record) {
                let detail = fault_detail(fault);
                return Err(self.mark_fault(booking, detail).await);
            }

            match record.status {
                EscrowStatus::Refunded => {
                    let mut done = booking.clone();
                    done.status = BookingStatus::Cancelled;
                    done.cancelled_reason = Some(reason);
                    let saved = self
                        .store
                        .update_guarded(booking_id, BookingStatus::Confirmed, done)
                        .await?;
                    info!("Booking {} already refunded on-chain; finalized", booking_id);
                    self.notifier.refunded(&saved, reason).await;
                    return Ok(saved);
                }
                EscrowStatus::Released => {
                    drop(guard);
                    let repaired = self.reconcile(booking_id).await?;
                    return Err(EscrowError::conflict(
                        repaired.status.to_string(),
                        BookingStatus::Refunding.to_string(),
                        "escrow was already released".to_string(),
                    ));
                }
                EscrowStatus::Disputed | EscrowStatus::Deposited => {}
            }

            let mut marked = booking.clone();
            marked.status = BookingStatus::Refunding;
            self.store
                .update_guarded(booking_id, BookingStatus::Confirmed, marked)
                .await?;
        }

        info!("Submitting escrow refund for booking {}", booking_id);
        match self.ledger.refund_funds(booking_id).await {
            Ok(()) => {}
            Err(e) if e.needs_reconcile() => {
                warn!(
                    "Escrow refund outcome unknown for booking {}; reconciliation required",
                    booking_id
                );
                return Err(e);
            }
            Err(e) => {
                self.clear_in_flight(
                    &lock,
                    booking_id,
                    BookingStatus::Refunding,
                    BookingStatus::Confirmed,
                )
                .await;
                return Err(e);
            }
        }

        let _guard = lock.lock().await;
        let mut current = self.load(booking_id).await?;
        match current.status {
            BookingStatus::Refunding => {
                current.status = BookingStatus::Cancelled;
                current.cancelled_reason = Some(reason);
                let saved = self
                    .store
                    .update_guarded(booking_id, BookingStatus::Refunding, current)
                    .await?;
                info!("Booking {} cancelled; funds refunded to buyer", booking_id);
                self.notifier.refunded(&saved, reason).await;
                Ok(saved)
            }
            BookingStatus::Cancelled => Ok(current),
            other => Err(EscrowError::conflict(
                other.to_string(),
                BookingStatus::Cancelled.to_string(),
                "booking moved during refund".to_string(),
            )),
        }
    }

    /// Raise a dispute, freezing release and refund until adjudication
    pub async fn dispute(&self, booking_id: Uuid, initiator: &str) -> EscrowResult<Booking> {
        let lock = self.booking_lock(booking_id).await;

        {
            let _guard = lock.lock().await;
            let booking = self.load(booking_id).await?;
            Self::ensure_no_fault(&booking)?;

            if initiator != booking.buyer_id && initiator != booking.seller_id {
                return Err(EscrowError::invalid_input(format!(
                    "{initiator} is not a party to booking {booking_id}"
                )));
            }
            if booking.disputed {
                return Ok(booking);
            }
            if !booking.status.can_dispute() {
                return Err(EscrowError::conflict(
                    booking.status.to_string(),
                    "disputed".to_string(),
                    "disputes are only accepted while confirmed".to_string(),
                ));
            }
        }

        self.ledger.initiate_dispute(booking_id).await?;

        let _guard = lock.lock().await;
        let mut fresh = self.load(booking_id).await?;
        fresh.disputed = true;
        let expected = fresh.status;
        let saved = self.store.update_guarded(booking_id, expected, fresh).await?;

        warn!(
            "Booking {} disputed by {}; automatic transitions frozen",
            booking_id, initiator
        );
        self.notifier.disputed(&saved, initiator).await;
        Ok(saved)
    }

    /// External adjudication hook: clear the dispute and settle the escrow
    pub async fn resolve_dispute(
        &self,
        booking_id: Uuid,
        resolution: DisputeResolution,
    ) -> EscrowResult<Booking> {
        let lock = self.booking_lock(booking_id).await;

        {
            let _guard = lock.lock().await;
            let mut booking = self.load(booking_id).await?;
            Self::ensure_no_fault(&booking)?;

            if !booking.disputed {
                return Err(EscrowError::conflict(
                    booking.status.to_string(),
                    "resolve_dispute".to_string(),
                    "no dispute is pending".to_string(),
                ));
            }

            booking.disputed = false;
            let expected = booking.status;
            let saved = self.store.update_guarded(booking_id, expected, booking).await?;
            info!(
                "Dispute on booking {} adjudicated: {:?}",
                booking_id, resolution
            );
            self.notifier.dispute_resolved(&saved, resolution).await;
        }

        match resolution {
            DisputeResolution::ReleaseToSeller => self.release(booking_id).await,
            DisputeResolution::RefundToBuyer => {
                self.refund(booking_id, RefundReason::DisputeResolved).await
            }
        }
    }

    /// Repair the booking's off-chain status to match ledger truth
    ///
    /// The recovery primitive: every mutating operation is safe to re-run
    /// through here after a partial failure. The ledger record is looked up
    /// by booking id, so a deposit that landed before a crash is found even
    /// when the on-chain id was never persisted.
    pub async fn reconcile(&self, booking_id: Uuid) -> EscrowResult<Booking> {
        let lock = self.booking_lock(booking_id).await;
        let _guard = lock.lock().await;

        let booking = self.load(booking_id).await?;
        let record = self.ledger.get_booking(booking_id).await?;

        let Some(record) = record else {
            return match booking.status {
                BookingStatus::ConfirmingPayment => {
                    // The create never landed; clear the marker
                    let mut revert = booking.clone();
                    revert.status = BookingStatus::Pending;
                    let saved = self
                        .store
                        .update_guarded(booking_id, BookingStatus::ConfirmingPayment, revert)
                        .await?;
                    info!(
                        "Booking {} reverted to pending; escrow create never landed",
                        booking_id
                    );
                    self.notifier
                        .reconciled(&saved, "escrow create never landed".to_string())
                        .await;
                    Ok(saved)
                }
                BookingStatus::Pending | BookingStatus::Cancelled => Ok(booking),
                other => {
                    let detail = format!(
                        "Booking {booking_id} is {other} but the ledger has no escrow record"
                    );
                    Err(self.mark_fault(booking, detail).await)
                }
            };
        };

        if let Err(fault) = booking.check_ledger_identity(&record) {
            let detail = fault_detail(fault);
            return Err(self.mark_fault(booking, detail).await);
        }

        let expected_status = record.status.expected_booking_status();

        // Two contradictory terminal outcomes cannot be repaired
        if booking.status.is_terminal() && booking.status != expected_status {
            let detail = format!(
                "Booking {} is {} but the ledger escrow is {:?}",
                booking_id, booking.status, record.status
            );
            return Err(self.mark_fault(booking, detail).await);
        }

        let mut repaired = booking.clone();
        repaired.status = expected_status;
        repaired.disputed = record.status == EscrowStatus::Disputed;
        repaired.buyer_feedback_submitted |= record.buyer_feedback;
        repaired.seller_feedback_submitted |= record.seller_feedback;
        if repaired.on_chain_escrow_id.is_none() {
            repaired.on_chain_escrow_id = Some(record.escrow_id.clone());
        }
        if expected_status == BookingStatus::Completed && repaired.completed_at.is_none() {
            repaired.completed_at = Some(Utc::now());
        }

        let changed = repaired.status != booking.status
            || repaired.disputed != booking.disputed
            || repaired.buyer_feedback_submitted != booking.buyer_feedback_submitted
            || repaired.seller_feedback_submitted != booking.seller_feedback_submitted
            || repaired.on_chain_escrow_id != booking.on_chain_escrow_id;
        if !changed {
            return Ok(booking);
        }

        let saved = self
            .store
            .update_guarded(booking_id, booking.status, repaired)
            .await?;
        info!(
            "Reconciled booking {}: {} -> {}",
            booking_id, booking.status, saved.status
        );
        self.notifier
            .reconciled(
                &saved,
                format!("repaired {} -> {}", booking.status, saved.status),
            )
            .await;
        Ok(saved)
    }

    /// Read a booking, repairing it first when the ledger contradicts it
    ///
    /// Once an escrow exists, a status the ledger disagrees with is never
    /// reported to users.
    pub async fn get_booking(&self, booking_id: Uuid) -> EscrowResult<Booking> {
        let booking = self.load(booking_id).await?;

        if booking.consistency_fault.is_some() {
            return Ok(booking);
        }

        if let Some(record) = self.ledger.get_booking(booking_id).await? {
            let expected = record.status.expected_booking_status();
            let stale = if booking.status.is_in_flight() {
                // In-flight markers are expected transients; only a chain
                // outcome that already went terminal forces a repair
                matches!(
                    record.status,
                    EscrowStatus::Released | EscrowStatus::Refunded
                )
            } else {
                booking.status != expected
                    || booking.disputed != (record.status == EscrowStatus::Disputed)
            };
            if stale {
                return self.reconcile(booking_id).await;
            }
        }

        Ok(booking)
    }

    /// All bookings a party participates in
    pub async fn bookings_for_user(&self, party: &str) -> EscrowResult<Vec<Booking>> {
        self.store.list_for_user(party).await
    }

    /// Update the session schedule; frozen once escrow funds are committed
    pub async fn update_schedule(
        &self,
        booking_id: Uuid,
        scheduled_at: Option<DateTime<Utc>>,
        external_event_ref: Option<String>,
    ) -> EscrowResult<Booking> {
        let lock = self.booking_lock(booking_id).await;
        let _guard = lock.lock().await;

        let mut booking = self.load(booking_id).await?;
        Self::ensure_no_fault(&booking)?;

        if booking.status != BookingStatus::Pending {
            return Err(EscrowError::conflict(
                booking.status.to_string(),
                "update_schedule".to_string(),
                "schedule is frozen once escrow funds are committed".to_string(),
            ));
        }

        booking.scheduled_at = scheduled_at;
        if external_event_ref.is_some() {
            booking.external_event_ref = external_event_ref;
        }
        self.store
            .update_guarded(booking_id, BookingStatus::Pending, booking)
            .await
    }

    /// Administrative hook: clear a recorded consistency fault after manual
    /// reconciliation, re-enabling automated transitions
    pub async fn clear_consistency_fault(&self, booking_id: Uuid) -> EscrowResult<Booking> {
        let lock = self.booking_lock(booking_id).await;
        let _guard = lock.lock().await;

        let mut booking = self.load(booking_id).await?;
        if booking.consistency_fault.is_none() {
            return Ok(booking);
        }

        booking.consistency_fault = None;
        let expected = booking.status;
        let saved = self.store.update_guarded(booking_id, expected, booking).await?;
        warn!(
            "Consistency fault on booking {} cleared administratively",
            booking_id
        );
        Ok(saved)
    }

    // -- internals ----------------------------------------------------------

    async fn booking_lock(&self, booking_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.write().await;
        locks
            .entry(booking_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load(&self, booking_id: Uuid) -> EscrowResult<Booking> {
        self.store
            .get(booking_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("Booking {booking_id}")))
    }

    fn ensure_no_fault(booking: &Booking) -> EscrowResult<()> {
        if let Some(detail) = &booking.consistency_fault {
            return Err(EscrowError::consistency_fault(format!(
                "Booking {} requires manual reconciliation: {}",
                booking.id, detail
            )));
        }
        Ok(())
    }

    /// Record an invariant violation on the booking and return the error to
    /// surface. The fault blocks every automated transition until cleared.
    async fn mark_fault(&self, booking: Booking, detail: String) -> EscrowError {
        error!("Consistency fault on booking {}: {}", booking.id, detail);

        let expected = booking.status;
        let mut faulted = booking;
        faulted.consistency_fault = Some(detail.clone());
        match self
            .store
            .update_guarded(faulted.id, expected, faulted.clone())
            .await
        {
            Ok(saved) => {
                self.notifier.consistency_fault(&saved, detail.clone()).await;
            }
            Err(e) => {
                error!(
                    "Failed to record consistency fault on booking {}: {}",
                    faulted.id, e
                );
            }
        }

        EscrowError::consistency_fault(detail)
    }

    /// Clear a leftover in-flight marker after a rejected chain call
    async fn clear_in_flight(
        &self,
        lock: &Arc<Mutex<()>>,
        booking_id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
    ) {
        let _guard = lock.lock().await;
        match self.load(booking_id).await {
            Ok(mut booking) if booking.status == from => {
                booking.status = to;
                if let Err(e) = self.store.update_guarded(booking_id, from, booking).await {
                    error!(
                        "Failed to clear {} marker on booking {}: {}",
                        from, booking_id, e
                    );
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(
                    "Failed to reload booking {} while clearing marker: {}",
                    booking_id, e
                );
            }
        }
    }

    fn validate_create(&self, request: &CreateBookingRequest) -> EscrowResult<()> {
        if request.buyer_id.trim().is_empty() {
            return Err(EscrowError::invalid_input("Buyer id cannot be empty"));
        }
        if request.seller_id.trim().is_empty() {
            return Err(EscrowError::invalid_input("Seller id cannot be empty"));
        }
        if request.buyer_id == request.seller_id {
            return Err(EscrowError::invalid_input(
                "Buyer and seller must be distinct",
            ));
        }

        // Positivity, precision, and range are all checked by the conversion
        request.currency.to_minor_units(request.amount)?;

        if request.amount > self.config.max_booking_amount {
            return Err(EscrowError::invalid_input(format!(
                "Amount {} exceeds maximum {}",
                request.amount, self.config.max_booking_amount
            )));
        }

        Ok(())
    }
}

fn fault_detail(e: EscrowError) -> String {
    match e {
        EscrowError::ConsistencyFault(detail) => detail,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        directory::StaticDirectory,
        ledger::{InjectedFailure, MemoryLedger},
        notifier::NotifierConfig,
        store::MemoryBookingStore,
    };
    use rust_decimal_macros::dec;

    struct Harness {
        orchestrator: Arc<EscrowOrchestrator>,
        ledger: Arc<MemoryLedger>,
        store: Arc<MemoryBookingStore>,
        directory: Arc<StaticDirectory>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryBookingStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let directory = Arc::new(StaticDirectory::new());
        let notifier = Arc::new(BookingNotifier::new(NotifierConfig::default()));
        let orchestrator = Arc::new(EscrowOrchestrator::new(
            OrchestratorConfig::default(),
            store.clone(),
            ledger.clone(),
            directory.clone(),
            notifier,
        ));
        Harness {
            orchestrator,
            ledger,
            store,
            directory,
        }
    }

    fn create_request(amount: Decimal, currency: Currency) -> CreateBookingRequest {
        CreateBookingRequest {
            buyer_id: "buyer".to_string(),
            seller_id: "seller".to_string(),
            amount,
            currency,
            notes: Some("session".to_string()),
            scheduled_at: None,
            external_event_ref: None,
        }
    }

    fn payment(booking_id: Uuid) -> ConfirmPaymentRequest {
        ConfirmPaymentRequest {
            booking_id,
            payer: PayerContext {
                payer_id: "buyer".to_string(),
                authorization: "approved-transfer".to_string(),
            },
        }
    }

    async fn confirmed_booking(h: &Harness) -> Booking {
        let booking = h
            .orchestrator
            .create(create_request(dec!(50), Currency::TokenB))
            .await
            .unwrap();
        h.orchestrator.confirm_payment(payment(booking.id)).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let h = harness();

        let err = h
            .orchestrator
            .create(create_request(dec!(0), Currency::TokenB))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidInput(_)));

        let mut same_party = create_request(dec!(10), Currency::TokenA);
        same_party.seller_id = "buyer".to_string();
        let err = h.orchestrator.create(same_party).await.unwrap_err();
        assert!(matches!(err, EscrowError::InvalidInput(_)));

        h.directory.suspend("seller").await;
        let err = h
            .orchestrator
            .create(create_request(dec!(10), Currency::TokenA))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_confirm_payment_deposits_and_freezes_amount() {
        let h = harness();
        let booking = h
            .orchestrator
            .create(create_request(dec!(12.345678), Currency::TokenB))
            .await
            .unwrap();

        let confirmed = h.orchestrator.confirm_payment(payment(booking.id)).await.unwrap();
        assert_eq!(confirmed.status, BookingStatus::Confirmed);
        assert!(confirmed.on_chain_escrow_id.is_some());
        assert_eq!(h.ledger.deposit_count(), 1);

        // What was deposited on-chain reads back as exactly what was stored
        let record = h.ledger.get_booking(booking.id).await.unwrap().unwrap();
        assert_eq!(record.amount_minor, 12_345_678);
        assert_eq!(record.token, Currency::TokenB);
        assert_eq!(
            record.token.from_minor_units(record.amount_minor),
            confirmed.amount
        );
    }

    #[tokio::test]
    async fn test_confirm_payment_round_trips_minimum_unit() {
        let h = harness();
        let booking = h
            .orchestrator
            .create(create_request(dec!(0.0000001), Currency::TokenA))
            .await
            .unwrap();

        h.orchestrator.confirm_payment(payment(booking.id)).await.unwrap();

        let record = h.ledger.get_booking(booking.id).await.unwrap().unwrap();
        assert_eq!(record.amount_minor, 1);
        assert_eq!(record.token.from_minor_units(1), booking.amount);
    }

    #[tokio::test]
    async fn test_confirm_payment_requires_matching_payer() {
        let h = harness();
        let booking = h
            .orchestrator
            .create(create_request(dec!(10), Currency::TokenA))
            .await
            .unwrap();

        let mut request = payment(booking.id);
        request.payer.payer_id = "someone-else".to_string();
        let err = h.orchestrator.confirm_payment(request).await.unwrap_err();
        assert!(matches!(err, EscrowError::InvalidInput(_)));
        assert_eq!(h.ledger.deposit_count(), 0);
    }

    #[tokio::test]
    async fn test_confirm_payment_retry_observes_confirmed() {
        let h = harness();
        let booking = h
            .orchestrator
            .create(create_request(dec!(10), Currency::TokenA))
            .await
            .unwrap();

        h.orchestrator.confirm_payment(payment(booking.id)).await.unwrap();
        let again = h.orchestrator.confirm_payment(payment(booking.id)).await.unwrap();
        assert_eq!(again.status, BookingStatus::Confirmed);
        assert_eq!(h.ledger.deposit_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_confirm_creates_one_escrow() {
        let h = harness();
        let booking = h
            .orchestrator
            .create(create_request(dec!(25), Currency::TokenB))
            .await
            .unwrap();

        let a = {
            let orchestrator = h.orchestrator.clone();
            let request = payment(booking.id);
            tokio::spawn(async move { orchestrator.confirm_payment(request).await })
        };
        let b = {
            let orchestrator = h.orchestrator.clone();
            let request = payment(booking.id);
            tokio::spawn(async move { orchestrator.confirm_payment(request).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        for result in results {
            match result {
                Ok(booking) => assert_eq!(booking.status, BookingStatus::Confirmed),
                Err(EscrowError::Conflict { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(h.ledger.deposit_count(), 1);
        let stored = h.store.get(booking.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_ledger_rejection_leaves_booking_pending() {
        let h = harness();
        let booking = h
            .orchestrator
            .create(create_request(dec!(10), Currency::TokenA))
            .await
            .unwrap();

        h.ledger.inject_failure(InjectedFailure::Reject).await;
        let err = h.orchestrator.confirm_payment(payment(booking.id)).await.unwrap_err();
        assert!(matches!(err, EscrowError::Ledger(_)));

        let stored = h.store.get(booking.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BookingStatus::Pending);

        // The retry path is safe and completes normally
        let confirmed = h.orchestrator.confirm_payment(payment(booking.id)).await.unwrap();
        assert_eq!(confirmed.status, BookingStatus::Confirmed);
        assert_eq!(h.ledger.deposit_count(), 1);
    }

    #[tokio::test]
    async fn test_unobserved_outcome_reconciles_to_confirmed() {
        let h = harness();
        let booking = h
            .orchestrator
            .create(create_request(dec!(10), Currency::TokenA))
            .await
            .unwrap();

        h.ledger
            .inject_failure(InjectedFailure::UnobservedOutcome)
            .await;
        let err = h.orchestrator.confirm_payment(payment(booking.id)).await.unwrap_err();
        assert!(err.needs_reconcile());

        // The marker stays behind; the deposit actually landed
        let stored = h.store.get(booking.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BookingStatus::ConfirmingPayment);

        let repaired = h.orchestrator.reconcile(booking.id).await.unwrap();
        assert_eq!(repaired.status, BookingStatus::Confirmed);
        assert!(repaired.on_chain_escrow_id.is_some());
        assert_eq!(h.ledger.deposit_count(), 1);
    }

    #[tokio::test]
    async fn test_release_unobserved_outcome_reconciles_to_completed() {
        let h = harness();
        let booking = confirmed_booking(&h).await;

        h.ledger
            .inject_failure(InjectedFailure::UnobservedOutcome)
            .await;
        let err = h.orchestrator.release(booking.id).await.unwrap_err();
        assert!(err.needs_reconcile());

        let stored = h.store.get(booking.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BookingStatus::Releasing);

        // The release actually landed; reconciliation finalizes it
        let repaired = h.orchestrator.reconcile(booking.id).await.unwrap();
        assert_eq!(repaired.status, BookingStatus::Completed);
        assert_eq!(h.ledger.release_calls(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_reverts_marker_when_create_never_landed() {
        let h = harness();
        let booking = h
            .orchestrator
            .create(create_request(dec!(10), Currency::TokenA))
            .await
            .unwrap();

        // Simulate a crash after the marker write, before the chain call
        let mut marked = booking.clone();
        marked.status = BookingStatus::ConfirmingPayment;
        h.store
            .update_guarded(booking.id, BookingStatus::Pending, marked)
            .await
            .unwrap();

        let repaired = h.orchestrator.reconcile(booking.id).await.unwrap();
        assert_eq!(repaired.status, BookingStatus::Pending);
    }

    #[tokio::test]
    async fn test_both_feedback_completes_booking_once() {
        let h = harness();
        let booking = confirmed_booking(&h).await;

        let after_buyer = h
            .orchestrator
            .submit_feedback(booking.id, FeedbackRole::Buyer)
            .await
            .unwrap();
        assert_eq!(after_buyer.status, BookingStatus::Confirmed);
        assert!(after_buyer.buyer_feedback_submitted);

        let after_seller = h
            .orchestrator
            .submit_feedback(booking.id, FeedbackRole::Seller)
            .await
            .unwrap();
        assert_eq!(after_seller.status, BookingStatus::Completed);

        let record = h.ledger.get_booking(booking.id).await.unwrap().unwrap();
        assert_eq!(record.status, EscrowStatus::Released);
        assert_eq!(h.ledger.release_calls(), 1);

        // Releasing again is a no-op success without another chain call
        let again = h.orchestrator.release(booking.id).await.unwrap();
        assert_eq!(again.status, BookingStatus::Completed);
        assert_eq!(h.ledger.release_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_feedback_releases_at_most_once() {
        let h = harness();
        let booking = confirmed_booking(&h).await;

        let buyer = {
            let orchestrator = h.orchestrator.clone();
            let id = booking.id;
            tokio::spawn(async move { orchestrator.submit_feedback(id, FeedbackRole::Buyer).await })
        };
        let seller = {
            let orchestrator = h.orchestrator.clone();
            let id = booking.id;
            tokio::spawn(async move { orchestrator.submit_feedback(id, FeedbackRole::Seller).await })
        };

        buyer.await.unwrap().unwrap();
        seller.await.unwrap().unwrap();

        let stored = h.store.get(booking.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BookingStatus::Completed);
        assert_eq!(h.ledger.release_calls(), 1);
    }

    #[tokio::test]
    async fn test_same_role_feedback_is_idempotent() {
        let h = harness();
        let booking = confirmed_booking(&h).await;

        h.orchestrator
            .submit_feedback(booking.id, FeedbackRole::Buyer)
            .await
            .unwrap();
        let again = h
            .orchestrator
            .submit_feedback(booking.id, FeedbackRole::Buyer)
            .await
            .unwrap();

        assert!(again.buyer_feedback_submitted);
        assert_eq!(again.status, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_feedback_requires_confirmed_booking() {
        let h = harness();
        let booking = h
            .orchestrator
            .create(create_request(dec!(10), Currency::TokenA))
            .await
            .unwrap();

        let err = h
            .orchestrator
            .submit_feedback(booking.id, FeedbackRole::Buyer)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_refund_before_deposit_skips_ledger() {
        let h = harness();
        let booking = h
            .orchestrator
            .create(create_request(dec!(10), Currency::TokenA))
            .await
            .unwrap();

        let cancelled = h
            .orchestrator
            .refund(booking.id, RefundReason::BuyerCancelled)
            .await
            .unwrap();
        assert_eq!(cancelled.status, BookingStatus::Cancelled);
        assert_eq!(cancelled.cancelled_reason, Some(RefundReason::BuyerCancelled));
        assert_eq!(h.ledger.refund_calls(), 0);
        assert_eq!(h.ledger.deposit_count(), 0);
    }

    #[tokio::test]
    async fn test_refund_rejected_once_feedback_exists() {
        let h = harness();
        let booking = confirmed_booking(&h).await;

        h.orchestrator
            .submit_feedback(booking.id, FeedbackRole::Buyer)
            .await
            .unwrap();

        let err = h
            .orchestrator
            .refund(booking.id, RefundReason::BuyerCancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Conflict { .. }));

        // Externally adjudicated no-show may still refund
        let cancelled = h
            .orchestrator
            .refund(booking.id, RefundReason::NoShow)
            .await
            .unwrap();
        assert_eq!(cancelled.status, BookingStatus::Cancelled);
        assert_eq!(h.ledger.refund_calls(), 1);

        let record = h.ledger.get_booking(booking.id).await.unwrap().unwrap();
        assert_eq!(record.status, EscrowStatus::Refunded);
    }

    #[tokio::test]
    async fn test_release_skips_chain_call_when_already_released() {
        let h = harness();
        let booking = confirmed_booking(&h).await;

        let mut record = h.ledger.get_booking(booking.id).await.unwrap().unwrap();
        record.status = EscrowStatus::Released;
        h.ledger.force_set(record).await;

        let completed = h.orchestrator.release(booking.id).await.unwrap();
        assert_eq!(completed.status, BookingStatus::Completed);
        assert_eq!(h.ledger.release_calls(), 0);
    }

    #[tokio::test]
    async fn test_dispute_freezes_release_and_refund() {
        let h = harness();
        let booking = confirmed_booking(&h).await;

        let disputed = h.orchestrator.dispute(booking.id, "buyer").await.unwrap();
        assert!(disputed.disputed);

        let err = h.orchestrator.release(booking.id).await.unwrap_err();
        assert!(matches!(err, EscrowError::Conflict { .. }));
        let err = h
            .orchestrator
            .refund(booking.id, RefundReason::BuyerCancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Conflict { .. }));

        let record = h.ledger.get_booking(booking.id).await.unwrap().unwrap();
        assert_eq!(record.status, EscrowStatus::Disputed);

        // External adjudication settles and unfreezes
        let resolved = h
            .orchestrator
            .resolve_dispute(booking.id, DisputeResolution::ReleaseToSeller)
            .await
            .unwrap();
        assert_eq!(resolved.status, BookingStatus::Completed);
        assert!(!resolved.disputed);

        let record = h.ledger.get_booking(booking.id).await.unwrap().unwrap();
        assert_eq!(record.status, EscrowStatus::Released);
    }

    #[tokio::test]
    async fn test_dispute_by_non_party_rejected() {
        let h = harness();
        let booking = confirmed_booking(&h).await;

        let err = h.orchestrator.dispute(booking.id, "stranger").await.unwrap_err();
        assert!(matches!(err, EscrowError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_amount_mismatch_faults_and_blocks() {
        let h = harness();
        let booking = confirmed_booking(&h).await;

        // Out-of-band divergence: the chain reports a different deposit
        let mut record = h.ledger.get_booking(booking.id).await.unwrap().unwrap();
        record.amount_minor += 1;
        h.ledger.force_set(record).await;

        let err = h.orchestrator.reconcile(booking.id).await.unwrap_err();
        assert!(matches!(err, EscrowError::ConsistencyFault(_)));

        // Every automated transition is now held for manual review
        let err = h
            .orchestrator
            .submit_feedback(booking.id, FeedbackRole::Buyer)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::ConsistencyFault(_)));
        let err = h.orchestrator.release(booking.id).await.unwrap_err();
        assert!(matches!(err, EscrowError::ConsistencyFault(_)));

        // Manual repair: fix the chain record, clear the fault, reconcile
        let mut record = h.ledger.get_booking(booking.id).await.unwrap().unwrap();
        record.amount_minor -= 1;
        h.ledger.force_set(record).await;
        h.orchestrator.clear_consistency_fault(booking.id).await.unwrap();
        let repaired = h.orchestrator.reconcile(booking.id).await.unwrap();
        assert_eq!(repaired.status, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_get_booking_never_contradicts_ledger() {
        let h = harness();
        let booking = confirmed_booking(&h).await;

        let mut record = h.ledger.get_booking(booking.id).await.unwrap().unwrap();
        record.status = EscrowStatus::Released;
        h.ledger.force_set(record).await;

        let view = h.orchestrator.get_booking(booking.id).await.unwrap();
        assert_eq!(view.status, BookingStatus::Completed);
    }

    #[tokio::test]
    async fn test_schedule_frozen_after_funds_locked() {
        let h = harness();
        let booking = h
            .orchestrator
            .create(create_request(dec!(10), Currency::TokenA))
            .await
            .unwrap();

        let when = Utc::now() + chrono::Duration::days(3);
        let updated = h
            .orchestrator
            .update_schedule(booking.id, Some(when), Some("cal-evt-1".to_string()))
            .await
            .unwrap();
        assert_eq!(updated.scheduled_at, Some(when));

        h.orchestrator.confirm_payment(payment(booking.id)).await.unwrap();
        let err = h
            .orchestrator
            .update_schedule(booking.id, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Conflict { .. }));
    }
}
