//! Notification/Reporting - user-facing status events
//!
//! Emits an event per lifecycle transition over a broadcast channel and keeps
//! a bounded buffer of recent events for reporting. This layer consumes
//! transitions; it never decides them, and a failed delivery never vetoes a
//! state change.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::models::{Booking, DisputeResolution, FeedbackRole, RefundReason};

/// Configuration for the booking notifier
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Broadcast channel capacity
    pub channel_capacity: usize,
    /// Number of recent events retained for reporting queries
    pub retained_events: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            retained_events: 1024,
        }
    }
}

/// Kinds of user-facing booking events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingEventKind {
    Created,
    PaymentConfirmed,
    FeedbackRecorded,
    Released,
    Refunded,
    Disputed,
    DisputeResolved,
    Reconciled,
    /// Booking requires manual review; automated transitions are halted
    ConsistencyFault,
}

/// A user-facing booking event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingEvent {
    pub kind: BookingEventKind,
    pub booking_id: Uuid,
    pub buyer_id: String,
    pub seller_id: String,
    pub status: String,
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl BookingEvent {
    fn from_booking(kind: BookingEventKind, booking: &Booking, detail: Option<String>) -> Self {
        Self {
            kind,
            booking_id: booking.id,
            buyer_id: booking.buyer_id.clone(),
            seller_id: booking.seller_id.clone(),
            status: booking.status.to_string(),
            detail,
            occurred_at: Utc::now(),
        }
    }
}

/// Publishes booking lifecycle events
pub struct BookingNotifier {
    config: NotifierConfig,
    sender: broadcast::Sender<BookingEvent>,
    recent: Arc<RwLock<VecDeque<BookingEvent>>>,
}

impl BookingNotifier {
    /// Create a new notifier
    pub fn new(config: NotifierConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity);
        Self {
            config,
            sender,
            recent: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<BookingEvent> {
        self.sender.subscribe()
    }

    /// Recent events for a booking, oldest first
    pub async fn events_for(&self, booking_id: Uuid) -> Vec<BookingEvent> {
        self.recent
            .read()
            .await
            .iter()
            .filter(|e| e.booking_id == booking_id)
            .cloned()
            .collect()
    }

    async fn publish(&self, event: BookingEvent) {
        {
            let mut recent = self.recent.write().await;
            if recent.len() >= self.config.retained_events {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        // send only errors when there are no subscribers; reporting is
        // best-effort either way
        if self.sender.send(event.clone()).is_err() {
            debug!(
                "No subscribers for booking event {:?} on {}",
                event.kind, event.booking_id
            );
        }
    }

    /// Booking created
    pub async fn booking_created(&self, booking: &Booking) {
        self.publish(BookingEvent::from_booking(
            BookingEventKind::Created,
            booking,
            None,
        ))
        .await;
    }

    /// Payment confirmed and funds deposited
    pub async fn payment_confirmed(&self, booking: &Booking) {
        self.publish(BookingEvent::from_booking(
            BookingEventKind::PaymentConfirmed,
            booking,
            booking.on_chain_escrow_id.clone(),
        ))
        .await;
    }

    /// One party's feedback recorded
    pub async fn feedback_recorded(&self, booking: &Booking, role: FeedbackRole) {
        self.publish(BookingEvent::from_booking(
            BookingEventKind::FeedbackRecorded,
            booking,
            Some(format!("{role:?}")),
        ))
        .await;
    }

    /// Funds released to the seller
    pub async fn released(&self, booking: &Booking) {
        self.publish(BookingEvent::from_booking(
            BookingEventKind::Released,
            booking,
            None,
        ))
        .await;
    }

    /// Funds refunded to the buyer
    pub async fn refunded(&self, booking: &Booking, reason: RefundReason) {
        self.publish(BookingEvent::from_booking(
            BookingEventKind::Refunded,
            booking,
            Some(format!("{reason:?}")),
        ))
        .await;
    }

    /// Dispute raised; booking pending manual review
    pub async fn disputed(&self, booking: &Booking, initiator: &str) {
        self.publish(BookingEvent::from_booking(
            BookingEventKind::Disputed,
            booking,
            Some(initiator.to_string()),
        ))
        .await;
    }

    /// Dispute resolved by external adjudication
    pub async fn dispute_resolved(&self, booking: &Booking, resolution: DisputeResolution) {
        self.publish(BookingEvent::from_booking(
            BookingEventKind::DisputeResolved,
            booking,
            Some(format!("{resolution:?}")),
        ))
        .await;
    }

    /// Off-chain status repaired to match the ledger
    pub async fn reconciled(&self, booking: &Booking, detail: String) {
        self.publish(BookingEvent::from_booking(
            BookingEventKind::Reconciled,
            booking,
            Some(detail),
        ))
        .await;
    }

    /// Invariant violation detected; booking held for manual review
    pub async fn consistency_fault(&self, booking: &Booking, detail: String) {
        self.publish(BookingEvent::from_booking(
            BookingEventKind::ConsistencyFault,
            booking,
            Some(detail),
        ))
        .await;
    }
}

impl Default for BookingNotifier {
    fn default() -> Self {
        Self::new(NotifierConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Currency;
    use rust_decimal_macros::dec;

    fn booking() -> Booking {
        Booking::new(
            "buyer".into(),
            "seller".into(),
            dec!(50),
            Currency::TokenB,
            None,
            None,
        )
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let notifier = BookingNotifier::default();
        let mut rx = notifier.subscribe();
        let b = booking();

        notifier.booking_created(&b).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, BookingEventKind::Created);
        assert_eq!(event.booking_id, b.id);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_harmless() {
        let notifier = BookingNotifier::default();
        let b = booking();

        notifier.booking_created(&b).await;
        notifier.feedback_recorded(&b, FeedbackRole::Buyer).await;

        let events = notifier.events_for(b.id).await;
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_retained_buffer_is_bounded() {
        let notifier = BookingNotifier::new(NotifierConfig {
            channel_capacity: 16,
            retained_events: 3,
        });
        let b = booking();

        for _ in 0..5 {
            notifier.booking_created(&b).await;
        }

        assert_eq!(notifier.events_for(b.id).await.len(), 3);
    }
}
