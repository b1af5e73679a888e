//! Person directory seam - seller eligibility lookups
//!
//! Identity verification happens upstream; ids arrive here already verified.
//! This module only answers whether a seller is currently active and allowed
//! to take bookings.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::EscrowResult;

/// Directory interface consulted when a booking is created
#[async_trait]
pub trait PersonDirectory: Send + Sync {
    /// Check whether the seller is active and eligible to be booked
    async fn is_seller_eligible(&self, seller_id: &str) -> EscrowResult<bool>;
}

/// Static in-memory directory
///
/// Sellers are eligible unless suspended, or unless an explicit allow-list is
/// installed, in which case only listed sellers qualify.
pub struct StaticDirectory {
    allowed: Arc<RwLock<Option<HashSet<String>>>>,
    suspended: Arc<RwLock<HashSet<String>>>,
}

impl StaticDirectory {
    /// Create a directory that treats every non-suspended seller as eligible
    pub fn new() -> Self {
        Self {
            allowed: Arc::new(RwLock::new(None)),
            suspended: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Restrict eligibility to an explicit allow-list
    pub async fn set_allow_list<I: IntoIterator<Item = String>>(&self, sellers: I) {
        *self.allowed.write().await = Some(sellers.into_iter().collect());
    }

    /// Mark a seller as suspended
    pub async fn suspend(&self, seller_id: &str) {
        self.suspended.write().await.insert(seller_id.to_string());
    }

    /// Clear a seller's suspension
    pub async fn reinstate(&self, seller_id: &str) {
        self.suspended.write().await.remove(seller_id);
    }
}

impl Default for StaticDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersonDirectory for StaticDirectory {
    async fn is_seller_eligible(&self, seller_id: &str) -> EscrowResult<bool> {
        if self.suspended.read().await.contains(seller_id) {
            return Ok(false);
        }
        if let Some(allowed) = self.allowed.read().await.as_ref() {
            return Ok(allowed.contains(seller_id));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_suspension_overrides_default_eligibility() {
        let directory = StaticDirectory::new();
        assert!(directory.is_seller_eligible("seller").await.unwrap());

        directory.suspend("seller").await;
        assert!(!directory.is_seller_eligible("seller").await.unwrap());

        directory.reinstate("seller").await;
        assert!(directory.is_seller_eligible("seller").await.unwrap());
    }

    #[tokio::test]
    async fn test_allow_list_restricts() {
        let directory = StaticDirectory::new();
        directory.set_allow_list(vec!["alice".to_string()]).await;

        assert!(directory.is_seller_eligible("alice").await.unwrap());
        assert!(!directory.is_seller_eligible("bob").await.unwrap());
    }
}
