//! Booking Store - persistent record of off-chain booking state
//!
//! The store's one non-obvious requirement is `update_guarded`: an atomic
//! status-compare-and-write. Every orchestrator finalization goes through it,
//! so two callers that both observed the same starting status cannot both
//! win the write.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    error::EscrowError,
    models::{Booking, BookingStatus},
    EscrowResult,
};

/// Storage interface for booking records
///
/// Bookings are never deleted; terminal statuses supersede them.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Insert a new booking; fails if the id already exists
    async fn insert(&self, booking: Booking) -> EscrowResult<()>;

    /// Read a booking by id
    async fn get(&self, booking_id: Uuid) -> EscrowResult<Option<Booking>>;

    /// Atomically replace a booking, but only while its stored status still
    /// equals `expected`. Returns the stored booking on success and a
    /// conflict carrying the current status when the guard fails.
    async fn update_guarded(
        &self,
        booking_id: Uuid,
        expected: BookingStatus,
        updated: Booking,
    ) -> EscrowResult<Booking>;

    /// All bookings currently in the given status
    async fn list_by_status(&self, status: BookingStatus) -> EscrowResult<Vec<Booking>>;

    /// All bookings a party participates in, as buyer or seller
    async fn list_for_user(&self, party: &str) -> EscrowResult<Vec<Booking>>;
}

/// In-memory booking store
pub struct MemoryBookingStore {
    bookings: Arc<RwLock<HashMap<Uuid, Booking>>>,
}

impl MemoryBookingStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            bookings: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryBookingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BookingStore for MemoryBookingStore {
    async fn insert(&self, booking: Booking) -> EscrowResult<()> {
        let mut bookings = self.bookings.write().await;
        if bookings.contains_key(&booking.id) {
            return Err(EscrowError::store(format!(
                "Booking {} already exists",
                booking.id
            )));
        }
        bookings.insert(booking.id, booking);
        Ok(())
    }

    async fn get(&self, booking_id: Uuid) -> EscrowResult<Option<Booking>> {
        Ok(self.bookings.read().await.get(&booking_id).cloned())
    }

    async fn update_guarded(
        &self,
        booking_id: Uuid,
        expected: BookingStatus,
        mut updated: Booking,
    ) -> EscrowResult<Booking> {
        let mut bookings = self.bookings.write().await;
        let current = bookings
            .get(&booking_id)
            .ok_or_else(|| EscrowError::not_found(format!("Booking {booking_id}")))?;

        if current.status != expected {
            return Err(EscrowError::conflict(
                current.status.to_string(),
                updated.status.to_string(),
                "booking changed concurrently".to_string(),
            ));
        }

        if updated.status != current.status {
            updated.status_updated_at = Utc::now();
        }
        bookings.insert(booking_id, updated.clone());
        Ok(updated)
    }

    async fn list_by_status(&self, status: BookingStatus) -> EscrowResult<Vec<Booking>> {
        let bookings = self.bookings.read().await;
        Ok(bookings
            .values()
            .filter(|b| b.status == status)
            .cloned()
            .collect())
    }

    async fn list_for_user(&self, party: &str) -> EscrowResult<Vec<Booking>> {
        let bookings = self.bookings.read().await;
        Ok(bookings
            .values()
            .filter(|b| b.buyer_id == party || b.seller_id == party)
            .cloned()
            .collect())
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
    async fn test_insert_rejects_duplicate_id() {
        let store = MemoryBookingStore::new();
        let b = booking();
        store.insert(b.clone()).await.unwrap();
        assert!(store.insert(b).await.is_err());
    }

    #[tokio::test]
    async fn test_guarded_update_enforces_expected_status() {
        let store = MemoryBookingStore::new();
        let b = booking();
        let id = b.id;
        store.insert(b.clone()).await.unwrap();

        let mut first = b.clone();
        first.status = BookingStatus::ConfirmingPayment;
        store
            .update_guarded(id, BookingStatus::Pending, first)
            .await
            .unwrap();

        // Second writer still holds the stale Pending view and must lose
        let mut second = b;
        second.status = BookingStatus::Cancelled;
        let err = store
            .update_guarded(id, BookingStatus::Pending, second)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Conflict { .. }));

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, BookingStatus::ConfirmingPayment);
    }

    #[tokio::test]
    async fn test_status_change_bumps_timestamp() {
        let store = MemoryBookingStore::new();
        let b = booking();
        let id = b.id;
        let before = b.status_updated_at;
        store.insert(b.clone()).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let mut updated = b;
        updated.status = BookingStatus::ConfirmingPayment;
        let stored = store
            .update_guarded(id, BookingStatus::Pending, updated)
            .await
            .unwrap();
        assert!(stored.status_updated_at > before);
    }
}
