//! Booking escrow node - high-level API over the lifecycle components
//!
//! Wires the booking store, ledger client, person directory, notifier,
//! orchestrator, and release sweeper behind one configuration, and forwards
//! the lifecycle operations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::{
    directory::{PersonDirectory, StaticDirectory},
    ledger::{LedgerClient, LedgerConfig, RpcLedgerClient},
    models::{Booking, DisputeResolution, FeedbackRole, RefundReason},
    notifier::{BookingEvent, BookingNotifier, NotifierConfig},
    orchestrator::{
        ConfirmPaymentRequest, CreateBookingRequest, EscrowOrchestrator, OrchestratorConfig,
    },
    policy::{ReleasePolicy, ReleasePolicyConfig},
    store::{BookingStore, MemoryBookingStore},
    sweep::{ReleaseSweeper, SweeperConfig},
    EscrowResult,
};

/// Configuration for the escrow node
#[derive(Debug, Clone, Default)]
pub struct EscrowNodeConfig {
    /// Orchestrator configuration
    pub orchestrator: OrchestratorConfig,
    /// Ledger client configuration
    pub ledger: LedgerConfig,
    /// Release policy configuration
    pub policy: ReleasePolicyConfig,
    /// Notifier configuration
    pub notifier: NotifierConfig,
    /// Sweep configuration
    pub sweep: SweeperConfig,
}

/// Main escrow node coordinating all components
pub struct EscrowNode {
    orchestrator: Arc<EscrowOrchestrator>,
    notifier: Arc<BookingNotifier>,
    sweeper: Arc<ReleaseSweeper>,
}

impl std::fmt::Debug for EscrowNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowNode").finish_non_exhaustive()
    }
}

impl EscrowNode {
    /// Create a node against the configured chain RPC endpoint, with an
    /// in-memory booking store and a permissive person directory
    pub fn new(config: EscrowNodeConfig) -> EscrowResult<Self> {
        let ledger: Arc<dyn LedgerClient> = Arc::new(RpcLedgerClient::new(config.ledger.clone())?);
        let store: Arc<dyn BookingStore> = Arc::new(MemoryBookingStore::new());
        let directory: Arc<dyn PersonDirectory> = Arc::new(StaticDirectory::new());
        Ok(Self::with_components(config, store, ledger, directory))
    }

    /// Create a node over injected components
    pub fn with_components(
        config: EscrowNodeConfig,
        store: Arc<dyn BookingStore>,
        ledger: Arc<dyn LedgerClient>,
        directory: Arc<dyn PersonDirectory>,
    ) -> Self {
        let notifier = Arc::new(BookingNotifier::new(config.notifier));
        let orchestrator = Arc::new(EscrowOrchestrator::new(
            config.orchestrator,
            store.clone(),
            ledger,
            directory,
            notifier.clone(),
        ));
        let sweeper = Arc::new(ReleaseSweeper::new(
            config.sweep,
            store,
            orchestrator.clone(),
            ReleasePolicy::new(config.policy),
        ));

        info!("Escrow node initialized");
        Self {
            orchestrator,
            notifier,
            sweeper,
        }
    }

    /// Start the background auto-release sweep
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        self.sweeper.clone().start()
    }

    /// Subscribe to user-facing booking events
    pub fn subscribe(&self) -> broadcast::Receiver<BookingEvent> {
        self.notifier.subscribe()
    }

    /// Recent events for a booking
    pub async fn events_for(&self, booking_id: Uuid) -> Vec<BookingEvent> {
        self.notifier.events_for(booking_id).await
    }

    /// Create a booking
    pub async fn create_booking(&self, request: CreateBookingRequest) -> EscrowResult<Booking> {
        self.orchestrator.create(request).await
    }

    /// Confirm payment and deposit funds into escrow
    pub async fn confirm_payment(&self, request: ConfirmPaymentRequest) -> EscrowResult<Booking> {
        self.orchestrator.confirm_payment(request).await
    }

    /// Submit one party's feedback
    pub async fn submit_feedback(
        &self,
        booking_id: Uuid,
        role: FeedbackRole,
    ) -> EscrowResult<Booking> {
        self.orchestrator.submit_feedback(booking_id, role).await
    }

    /// Release escrowed funds to the seller
    pub async fn release(&self, booking_id: Uuid) -> EscrowResult<Booking> {
        self.orchestrator.release(booking_id).await
    }

    /// Refund escrowed funds to the buyer, or cancel an unfunded booking
    pub async fn refund(&self, booking_id: Uuid, reason: RefundReason) -> EscrowResult<Booking> {
        self.orchestrator.refund(booking_id, reason).await
    }

    /// Raise a dispute
    pub async fn dispute(&self, booking_id: Uuid, initiator: &str) -> EscrowResult<Booking> {
        self.orchestrator.dispute(booking_id, initiator).await
    }

    /// Settle a dispute per external adjudication
    pub async fn resolve_dispute(
        &self,
        booking_id: Uuid,
        resolution: DisputeResolution,
    ) -> EscrowResult<Booking> {
        self.orchestrator.resolve_dispute(booking_id, resolution).await
    }

    /// Repair a booking against ledger truth
    pub async fn reconcile(&self, booking_id: Uuid) -> EscrowResult<Booking> {
        self.orchestrator.reconcile(booking_id).await
    }

    /// Read a booking, never contradicting the ledger
    pub async fn get_booking(&self, booking_id: Uuid) -> EscrowResult<Booking> {
        self.orchestrator.get_booking(booking_id).await
    }

    /// All bookings a party participates in
    pub async fn bookings_for_user(&self, party: &str) -> EscrowResult<Vec<Booking>> {
        self.orchestrator.bookings_for_user(party).await
    }

    /// Update the session schedule while it is still mutable
    pub async fn update_schedule(
        &self,
        booking_id: Uuid,
        scheduled_at: Option<DateTime<Utc>>,
        external_event_ref: Option<String>,
    ) -> EscrowResult<Booking> {
        self.orchestrator
            .update_schedule(booking_id, scheduled_at, external_event_ref)
            .await
    }
}
