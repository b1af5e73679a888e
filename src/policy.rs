//! Feedback/Release Policy - when escrowed funds become releasable
//!
//! Pure predicates over a booking and the current time. The policy schedules
//! nothing; the background sweep asks it per booking.

use chrono::{DateTime, Duration, Utc};

use crate::models::Booking;

/// Configuration for the release policy
#[derive(Debug, Clone)]
pub struct ReleasePolicyConfig {
    /// Grace period after confirmation before funds auto-release without
    /// both-party feedback
    pub release_timeout: Duration,
}

impl Default for ReleasePolicyConfig {
    fn default() -> Self {
        Self {
            release_timeout: Duration::days(7),
        }
    }
}

/// Release eligibility policy
#[derive(Debug, Clone, Default)]
pub struct ReleasePolicy {
    config: ReleasePolicyConfig,
}

impl ReleasePolicy {
    /// Create a policy with the given configuration
    pub fn new(config: ReleasePolicyConfig) -> Self {
        Self { config }
    }

    /// Funds are eligible for automatic release once both parties have
    /// submitted feedback, or the grace period has elapsed since the booking
    /// last changed status.
    pub fn is_auto_release_eligible(&self, booking: &Booking, now: DateTime<Utc>) -> bool {
        if !booking.status.can_release() || booking.disputed || booking.consistency_fault.is_some()
        {
            return false;
        }

        booking.both_feedback_submitted()
            || now - booking.status_updated_at >= self.config.release_timeout
    }
}
